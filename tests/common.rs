//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Generating device TLS materials laid out the way the resolver expects
//! - A scriptable TLS MQTT broker for driving the real connection worker
//! - A scriptable broker link standing in for the connection worker
//! - An in-memory household store
//! - Sample events and household records

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use meterlink::delivery::acks::{AckRegistry, AckWait, CorrelationToken};
use meterlink::delivery::event::{Event, EventDetails, GuestStatus};
use meterlink::delivery::publisher::{BrokerLink, LinkError};
use meterlink::household::model::{GuestRecord, HouseholdSnapshot, MemberRecord};
use meterlink::household::store::{HouseholdStore, StoreError};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub const DEVICE_ID: &str = "IM1001";

/// Allocate an ephemeral loopback port that nothing listens on afterwards.
pub fn unused_port() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}

/// Poll `cond` every few milliseconds for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Device credential paths returned by [`write_device_certs`].
#[derive(Debug, Clone)]
pub struct DeviceCerts {
    pub key: PathBuf,
    pub chain: PathBuf,
    pub ca: PathBuf,
}

/// Server credentials for [`MqttStub`], issued by the same CA as the device.
#[derive(Debug, Clone)]
pub struct BrokerIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a CA and a device certificate signed by it, written as
/// `<device>.key`, `<device>Chain.crt` and `AmazonRootCA1.pem`.
pub fn write_device_certs(dir: &Path, device_id: &str) -> DeviceCerts {
    write_pki(dir, device_id).0
}

/// Device credentials as in [`write_device_certs`], plus a broker certificate
/// for `127.0.0.1` signed by the same CA.
pub fn write_pki(dir: &Path, device_id: &str) -> (DeviceCerts, BrokerIdentity) {
    let ca_key = KeyPair::generate().expect("generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "meterlink-test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");
    let ca_pem = ca_cert.pem();

    let leaf_key = KeyPair::generate().expect("generate device key");
    let mut leaf_params =
        CertificateParams::new(vec![device_id.to_lowercase()]).expect("device cert params");
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, device_id);
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("sign device cert");

    let broker_key = KeyPair::generate().expect("generate broker key");
    let mut broker_params =
        CertificateParams::new(vec!["127.0.0.1".to_string()]).expect("broker cert params");
    broker_params
        .distinguished_name
        .push(DnType::CommonName, "meterlink-test-broker");
    let broker_cert = broker_params
        .signed_by(&broker_key, &ca_cert, &ca_key)
        .expect("sign broker cert");

    let mut chain = leaf_cert.pem();
    chain.push_str(&ca_pem);

    fs::create_dir_all(dir).expect("create cert dir");
    let certs = DeviceCerts {
        key: dir.join(format!("{device_id}.key")),
        chain: dir.join(format!("{device_id}Chain.crt")),
        ca: dir.join("AmazonRootCA1.pem"),
    };
    fs::write(&certs.ca, &ca_pem).expect("write CA");
    fs::write(&certs.chain, &chain).expect("write chain");
    fs::write(&certs.key, leaf_key.serialize_pem()).expect("write key");
    let broker = BrokerIdentity {
        cert_pem: broker_cert.pem(),
        key_pem: broker_key.serialize_pem(),
    };
    (certs, broker)
}

// -----------------------------------------------------------------------------
// TLS MQTT broker stand-in
// -----------------------------------------------------------------------------

/// How the stand-in broker treats QoS 1 publishes.
#[derive(Debug, Clone, Copy)]
pub struct BrokerScript {
    /// Acknowledge this many publishes, then stop acknowledging.
    pub acks: usize,
    /// Close the session once this many publishes went unacknowledged.
    pub drop_after_unacked: Option<usize>,
}

impl BrokerScript {
    pub fn ack_all() -> Self {
        Self {
            acks: usize::MAX,
            drop_after_unacked: None,
        }
    }

    pub fn silent() -> Self {
        Self {
            acks: 0,
            drop_after_unacked: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl ReceivedPublish {
    pub fn event(&self) -> Event {
        serde_json::from_slice(&self.payload).expect("publish payload is an event")
    }
}

/// MQTT 3.1.1 broker over TLS that serves exactly one session. The listener
/// closes after the first accept, so reconnect attempts are refused.
pub struct MqttStub {
    pub port: u16,
    received: Arc<Mutex<Vec<ReceivedPublish>>>,
    task: JoinHandle<()>,
}

impl MqttStub {
    pub async fn start(identity: &BrokerIdentity, script: BrokerScript) -> Self {
        let certs = rustls_pemfile::certs(&mut identity.cert_pem.as_bytes())
            .expect("broker cert pem")
            .into_iter()
            .map(rustls::Certificate)
            .collect();
        let key = rustls_pemfile::pkcs8_private_keys(&mut identity.key_pem.as_bytes())
            .expect("broker key pem")
            .remove(0);
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, rustls::PrivateKey(key))
            .expect("broker tls config");
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind broker");
        let port = listener.local_addr().expect("broker addr").port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve_one(
            listener,
            acceptor,
            script,
            Arc::clone(&received),
        ));
        Self {
            port,
            received,
            task,
        }
    }

    pub fn received(&self) -> Vec<ReceivedPublish> {
        self.received.lock().clone()
    }

    /// Timestamps of the received events, in arrival order.
    pub fn received_stamps(&self) -> Vec<u64> {
        self.received().iter().map(|p| p.event().timestamp()).collect()
    }

    pub fn session_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MqttStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    script: BrokerScript,
    received: Arc<Mutex<Vec<ReceivedPublish>>>,
) {
    let Ok((tcp, _)) = listener.accept().await else {
        return;
    };
    drop(listener);
    let Ok(mut stream) = acceptor.accept(tcp).await else {
        return;
    };
    let mut acked = 0;
    let mut unacked = 0;
    while let Some((header, body)) = read_packet(&mut stream).await {
        let reply: Option<Vec<u8>> = match header >> 4 {
            // CONNECT
            1 => Some(vec![0x20, 0x02, 0x00, 0x00]),
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                let mut at = 2 + topic_len;
                let mut pkid = None;
                if qos > 0 {
                    pkid = Some([body[at], body[at + 1]]);
                    at += 2;
                }
                received.lock().push(ReceivedPublish {
                    topic,
                    payload: body[at..].to_vec(),
                });
                match pkid {
                    Some([hi, lo]) if acked < script.acks => {
                        acked += 1;
                        Some(vec![0x40, 0x02, hi, lo])
                    }
                    Some(_) => {
                        unacked += 1;
                        if Some(unacked) == script.drop_after_unacked {
                            break;
                        }
                        None
                    }
                    None => None,
                }
            }
            // PINGREQ
            12 => Some(vec![0xD0, 0x00]),
            // DISCONNECT
            14 => break,
            _ => None,
        };
        if let Some(reply) = reply {
            if stream.write_all(&reply).await.is_err() || stream.flush().await.is_err() {
                break;
            }
        }
    }
    let _ = stream.shutdown().await;
}

async fn read_packet<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return None;
        }
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

// -----------------------------------------------------------------------------
// Broker link double
// -----------------------------------------------------------------------------

#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    failing: AtomicBool,
    auto_ack: AtomicBool,
    sent: Mutex<Vec<Event>>,
    tracked: Mutex<Vec<(CorrelationToken, Event)>>,
}

/// Broker link whose connectivity and acknowledgments are driven by the test.
#[derive(Clone)]
pub struct FakeLink {
    state: Arc<LinkState>,
    acks: Arc<AckRegistry>,
}

impl FakeLink {
    pub fn connected() -> Self {
        let link = Self {
            state: Arc::new(LinkState::default()),
            acks: AckRegistry::new(),
        };
        link.set_connected(true);
        link
    }

    pub fn disconnected() -> Self {
        let link = Self::connected();
        link.set_connected(false);
        link
    }

    /// Acknowledge every tracked publish as soon as it is sent.
    pub fn acking() -> Self {
        let link = Self::connected();
        link.state.auto_ack.store(true, Ordering::SeqCst);
        link
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every send fail as if the worker were saturated.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Event> {
        self.state.sent.lock().clone()
    }

    pub fn tracked(&self) -> Vec<(CorrelationToken, Event)> {
        self.state.tracked.lock().clone()
    }

    /// Resolve a tracked publish the way a broker PubAck would.
    pub fn ack(&self, token: CorrelationToken, delivered: bool) -> bool {
        self.acks.resolve(token, delivered)
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.pending_len()
    }

    fn check(&self) -> Result<(), LinkError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(LinkError::Busy);
        }
        Ok(())
    }
}

impl BrokerLink for FakeLink {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn send(&self, event: Event) -> Result<(), LinkError> {
        self.check()?;
        self.state.sent.lock().push(event);
        Ok(())
    }

    fn send_tracked(&self, event: Event) -> Result<AckWait, LinkError> {
        self.check()?;
        let wait = self.acks.register();
        self.state.tracked.lock().push((wait.token(), event));
        if self.state.auto_ack.load(Ordering::SeqCst) {
            self.acks.resolve(wait.token(), true);
        }
        Ok(wait)
    }
}

// -----------------------------------------------------------------------------
// Household store double
// -----------------------------------------------------------------------------

/// Household store kept in memory; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    snapshot: Arc<Mutex<HouseholdSnapshot>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn with(snapshot: HouseholdSnapshot) -> Self {
        Self {
            snapshot: Arc::new(Mutex::new(snapshot)),
            saves: Arc::default(),
        }
    }

    pub fn current(&self) -> HouseholdSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl HouseholdStore for MemoryStore {
    fn load(&self) -> Result<HouseholdSnapshot, StoreError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &HouseholdSnapshot) -> Result<(), StoreError> {
        *self.snapshot.lock() = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Sample data
// -----------------------------------------------------------------------------

pub fn member(code: &str, dob: &str, gender: &str, active: bool) -> MemberRecord {
    MemberRecord {
        member_code: code.into(),
        dob: Some(dob.into()),
        gender: Some(gender.into()),
        created_at: None,
        active,
    }
}

pub fn guest(age: u32, gender: &str, active: bool) -> GuestRecord {
    GuestRecord {
        age: Some(age),
        gender: Some(gender.into()),
        active,
    }
}

/// Assigned household with two valid members, one incomplete member and one
/// guest, everything active.
pub fn household() -> HouseholdSnapshot {
    HouseholdSnapshot {
        meter_id: DEVICE_ID.into(),
        hhid: "HH77".into(),
        members: vec![
            member("M1", "1980-05-01", "F", true),
            member("M2", "2010-12-31", "M", true),
            MemberRecord {
                member_code: "M3".into(),
                dob: None,
                gender: Some("F".into()),
                created_at: None,
                active: true,
            },
        ],
        guests: vec![guest(35, "M", true)],
    }
}

/// A distinguishable event; `stamp` doubles as its timestamp.
pub fn stamped(stamp: u64) -> Event {
    Event::at(
        DEVICE_ID,
        stamp,
        EventDetails::Guests(vec![GuestStatus {
            age: 40,
            gender: "F".into(),
            active: true,
        }]),
    )
}

pub fn stamps(events: &[Event]) -> Vec<u64> {
    events.iter().map(Event::timestamp).collect()
}
