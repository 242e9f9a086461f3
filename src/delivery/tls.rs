//! rustls client configuration for the broker's mutual-TLS handshake.

use crate::delivery::certs::CertificatePaths;
use anyhow::{Context, Result};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

/// Build a TLS 1.2+ client config presenting the device certificate and
/// trusting only the configured CA root.
pub fn build_client_config(paths: &CertificatePaths) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    let ca_reader = &mut BufReader::new(
        File::open(&paths.ca).with_context(|| format!("open CA cert: {}", paths.ca.display()))?,
    );
    let ca_der = certs(ca_reader).context("parse CA certificates")?;
    let ca_certs: Vec<Certificate> = ca_der.into_iter().map(Certificate).collect();
    let (added, _) = root_store.add_parsable_certificates(&ca_certs);
    if added == 0 {
        anyhow::bail!("no CA certificates loaded from {}", paths.ca.display());
    }

    let chain_reader = &mut BufReader::new(
        File::open(&paths.chain)
            .with_context(|| format!("open device cert: {}", paths.chain.display()))?,
    );
    let chain = certs(chain_reader).context("parse device certificate chain")?;
    if chain.is_empty() {
        anyhow::bail!("no certificates found in {}", paths.chain.display());
    }
    let chain: Vec<Certificate> = chain.into_iter().map(Certificate).collect();

    let key = load_private_key(&paths.key)?;

    ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_client_auth_cert(chain, key)
        .context("build TLS client config")
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read key file: {}", path.display()))?;
    let mut cursor = Cursor::new(&bytes);

    if let Some(key) = pkcs8_private_keys(&mut cursor)
        .context("parse PKCS#8 private key")?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    cursor.set_position(0);
    if let Some(key) = rsa_private_keys(&mut cursor)
        .context("parse RSA private key")?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    cursor.set_position(0);
    if let Some(key) = ec_private_keys(&mut cursor)
        .context("parse EC private key")?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    anyhow::bail!("no supported private key found in {}", path.display());
}
