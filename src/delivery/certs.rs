//! Locates the mTLS artifacts the broker connection needs.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Default CA root file name shipped by the cloud provider.
pub const DEFAULT_CA_FILE: &str = "AmazonRootCA1.pem";

/// Which of the three artifacts is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    PrivateKey,
    CertificateChain,
    CaRoot,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::PrivateKey => f.write_str("KEY"),
            Artifact::CertificateChain => f.write_str("CERT"),
            Artifact::CaRoot => f.write_str("CA"),
        }
    }
}

/// A single absent artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingArtifact {
    pub artifact: Artifact,
    pub path: PathBuf,
}

impl fmt::Display for MissingArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.artifact, self.path.display())
    }
}

#[derive(Debug, Error)]
#[error("certificates missing: {}", render_missing(.missing))]
pub struct MissingCertificates {
    pub missing: Vec<MissingArtifact>,
}

fn render_missing(missing: &[MissingArtifact]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Resolved artifact paths, all present at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub key: PathBuf,
    pub chain: PathBuf,
    pub ca: PathBuf,
}

/// Computes and checks the expected artifact paths for one device identity.
#[derive(Debug, Clone)]
pub struct CertificateResolver {
    dir: PathBuf,
    device_id: String,
    ca_file: String,
}

impl CertificateResolver {
    pub fn new(dir: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            device_id: device_id.into(),
            ca_file: DEFAULT_CA_FILE.to_string(),
        }
    }

    pub fn with_ca_file(mut self, ca_file: impl Into<String>) -> Self {
        self.ca_file = ca_file.into();
        self
    }

    /// Paths the resolver expects, whether or not they exist.
    pub fn expected(&self) -> CertificatePaths {
        CertificatePaths {
            key: self.dir.join(format!("{}.key", self.device_id)),
            chain: self.dir.join(format!("{}Chain.crt", self.device_id)),
            ca: self.dir.join(&self.ca_file),
        }
    }

    /// Check the filesystem. Each missing artifact gets its own log line.
    pub fn resolve(&self) -> Result<CertificatePaths, MissingCertificates> {
        let expected = self.expected();
        let missing: Vec<MissingArtifact> = [
            (Artifact::PrivateKey, &expected.key),
            (Artifact::CertificateChain, &expected.chain),
            (Artifact::CaRoot, &expected.ca),
        ]
        .into_iter()
        .filter(|(_, path)| !path.exists())
        .map(|(artifact, path)| MissingArtifact {
            artifact,
            path: path.clone(),
        })
        .collect();

        if missing.is_empty() {
            debug!(
                key = %expected.key.display(),
                chain = %expected.chain.display(),
                ca = %expected.ca.display(),
                "certificates resolved"
            );
            return Ok(expected);
        }
        for item in &missing {
            warn!(artifact = %item.artifact, path = %item.path.display(), "certificate artifact missing");
        }
        Err(MissingCertificates { missing })
    }
}
