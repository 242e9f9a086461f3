//! Broker connection lifecycle.
//!
//! A single [`ConnectionManager`] task owns the MQTT client and event loop for
//! the life of the process. Each cycle re-resolves certificates, builds a
//! fresh client, flushes the outbound queue once the broker accepts the
//! session, and falls back to exponential backoff when the session ends.
//! Other tasks talk to it only through a [`ConnectionHandle`].
//!
//! On shutdown the worker restores every unacknowledged fire-and-forget
//! event and every publish request still waiting in its channel to the
//! queue before returning.

use crate::delivery::acks::{AckRegistry, AckWait, CorrelationToken};
use crate::delivery::backoff::Backoff;
use crate::delivery::certs::{CertificatePaths, CertificateResolver};
use crate::delivery::event::Event;
use crate::delivery::publisher::{BrokerLink, LinkError};
use crate::delivery::queue::OutboundQueue;
use crate::delivery::tls;
use crate::ops::observability::DeliveryMetrics;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event as MqttEvent, Incoming, MqttOptions,
    Outgoing, QoS, TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Connection parameters, already resolved from configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub request_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub cert_retry: Duration,
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A publish request travelling from a handle to the worker.
#[derive(Debug)]
struct Outbound {
    event: Event,
    token: Option<CorrelationToken>,
}

/// Cloneable, thread-safe view of the connection used by publishers.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Outbound>,
    acks: Arc<AckRegistry>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Confirm-waiters currently registered.
    pub fn pending_confirms(&self) -> usize {
        self.acks.pending_len()
    }

    fn submit(&self, outbound: Outbound) -> Result<(), LinkError> {
        self.commands.try_send(outbound).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => LinkError::Busy,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

impl BrokerLink for ConnectionHandle {
    fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    fn send(&self, event: Event) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.submit(Outbound { event, token: None })
    }

    fn send_tracked(&self, event: Event) -> Result<AckWait, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let wait = self.acks.register();
        self.submit(Outbound {
            event,
            token: Some(wait.token()),
        })?;
        Ok(wait)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tls setup failed: {0:#}")]
    Tls(anyhow::Error),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("broker closed the session")]
    BrokerDisconnect,
    #[error("transport error: {0}")]
    Transport(#[from] rumqttc::ConnectionError),
}

/// Why a connection cycle stopped.
#[derive(Debug)]
enum SessionEnd {
    /// The session closed; `connected` tells whether ConnAck was reached.
    Closed {
        connected: bool,
        reason: SessionError,
    },
    Shutdown,
}

#[derive(Debug, Error)]
enum SubmitError {
    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("client rejected publish: {0}")]
    Client(#[from] ClientError),
}

/// Owner of the broker connection. Consumed by [`ConnectionManager::run`].
pub struct ConnectionManager {
    settings: ConnectionSettings,
    resolver: CertificateResolver,
    queue: Arc<OutboundQueue>,
    metrics: Arc<DeliveryMetrics>,
    shared: Arc<Shared>,
    acks: Arc<AckRegistry>,
    commands: mpsc::Receiver<Outbound>,
    backoff: Backoff,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        resolver: CertificateResolver,
        queue: Arc<OutboundQueue>,
        metrics: Arc<DeliveryMetrics>,
    ) -> (Self, ConnectionHandle) {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        });
        let acks = AckRegistry::new();
        let (tx, rx) = mpsc::channel(settings.request_capacity.max(1));
        let backoff = Backoff::new(settings.reconnect_base, settings.reconnect_max);
        let handle = ConnectionHandle {
            shared: Arc::clone(&shared),
            commands: tx,
            acks: Arc::clone(&acks),
        };
        let manager = Self {
            settings,
            resolver,
            queue,
            metrics,
            shared,
            acks,
            commands: rx,
            backoff,
        };
        (manager, handle)
    }

    /// Run the worker until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Connect, serve, reconnect; returns only on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            host = %self.settings.host,
            port = self.settings.port,
            topic = %self.settings.topic,
            "connection manager started"
        );
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let paths = match self.resolver.resolve() {
                Ok(paths) => paths,
                Err(missing) => {
                    self.metrics.record_cert_missing();
                    warn!(
                        retry_in_ms = self.settings.cert_retry.as_millis() as u64,
                        "{missing}; waiting for provisioning"
                    );
                    if self.idle(self.settings.cert_retry, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.shared.set(ConnectionState::Connecting);
            info!(host = %self.settings.host, port = self.settings.port, "connecting");
            match self.run_session(&paths, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Closed {
                    connected: true,
                    reason,
                } => warn!("disconnected: {reason}"),
                SessionEnd::Closed {
                    connected: false,
                    reason,
                } => {
                    self.metrics.record_connect_failure();
                    warn!("connect failed: {reason}");
                }
            }

            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            if self.idle(delay, &mut shutdown).await {
                break;
            }
        }
        self.stop();
    }

    /// One connection cycle.
    async fn run_session(
        &mut self,
        paths: &CertificatePaths,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let tls_config = match tls::build_client_config(paths) {
            Ok(config) => config,
            Err(err) => {
                return SessionEnd::Closed {
                    connected: false,
                    reason: SessionError::Tls(err),
                }
            }
        };
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(self.settings.clean_session);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(tls_config),
        )));
        let (client, mut eventloop) =
            AsyncClient::new(options, self.settings.request_capacity.max(1));

        let mut inflight = Inflight::default();
        let mut connected = false;
        let mut flush_tick = tokio::time::interval(self.settings.flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ended = loop {
            tokio::select! {
                polled = eventloop.poll() => match polled {
                    Ok(MqttEvent::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            break SessionEnd::Closed {
                                connected,
                                reason: SessionError::Refused(format!("{:?}", ack.code)),
                            };
                        }
                        connected = true;
                        self.shared.set(ConnectionState::Connected);
                        self.backoff.reset();
                        self.metrics.record_connect();
                        info!(session_present = ack.session_present, "connected; flushing queue");
                        self.flush(&client, &mut inflight);
                    }
                    Ok(MqttEvent::Outgoing(Outgoing::Publish(pkid))) => inflight.assign(pkid),
                    Ok(MqttEvent::Incoming(Incoming::PubAck(ack))) => {
                        self.complete(&mut inflight, ack.pkid);
                        if inflight.is_empty() && !self.queue.is_empty() {
                            self.flush(&client, &mut inflight);
                        }
                    }
                    Ok(MqttEvent::Incoming(Incoming::Disconnect)) => {
                        break SessionEnd::Closed {
                            connected,
                            reason: SessionError::BrokerDisconnect,
                        };
                    }
                    Ok(_) => {}
                    Err(err) => {
                        break SessionEnd::Closed {
                            connected,
                            reason: SessionError::Transport(err),
                        };
                    }
                },
                Some(outbound) = self.commands.recv() => {
                    self.dispatch(&client, &mut inflight, outbound);
                }
                _ = flush_tick.tick(), if connected => {
                    self.flush(&client, &mut inflight);
                }
                stopping = wait_for_shutdown(shutdown) => {
                    if stopping {
                        info!(inflight = inflight.len(), "shutdown requested; closing session");
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        self.shared.set(ConnectionState::Disconnected);
        self.abandon(inflight);
        ended
    }

    /// Wait out `delay` while still answering publish requests that raced
    /// with the disconnect. Returns `true` when shutdown was requested.
    async fn idle(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                Some(outbound) = self.commands.recv() => self.reject(outbound),
                stopping = wait_for_shutdown(shutdown) => {
                    if stopping {
                        return true;
                    }
                }
            }
        }
    }

    /// Close the command channel and queue whatever was still in it.
    fn stop(&mut self) {
        self.shared.set(ConnectionState::Disconnected);
        self.commands.close();
        let mut pending = 0;
        while let Ok(outbound) = self.commands.try_recv() {
            self.reject(outbound);
            pending += 1;
        }
        info!(pending, queued = self.queue.len(), "connection manager stopped");
    }

    fn dispatch(&self, client: &AsyncClient, inflight: &mut Inflight, outbound: Outbound) {
        if self.shared.state() != ConnectionState::Connected {
            self.reject(outbound);
            return;
        }
        match self.submit(client, inflight, outbound.event.clone(), outbound.token) {
            Ok(()) => {}
            Err(SubmitError::Encode(err)) => {
                error!("dropping event that cannot be encoded: {err}");
                if let Some(token) = outbound.token {
                    self.acks.resolve(token, false);
                }
            }
            Err(err) => {
                warn!("direct publish failed: {err}");
                self.reject(outbound);
            }
        }
    }

    fn submit(
        &self,
        client: &AsyncClient,
        inflight: &mut Inflight,
        event: Event,
        token: Option<CorrelationToken>,
    ) -> Result<(), SubmitError> {
        let payload = event.to_payload()?;
        client.try_publish(self.settings.topic.clone(), QoS::AtLeastOnce, false, payload)?;
        debug!(kind = %event.kind(), ts = event.timestamp(), "publish handed to client");
        inflight.push(event, token);
        self.metrics.record_published();
        Ok(())
    }

    fn flush(&self, client: &AsyncClient, inflight: &mut Inflight) {
        if self.queue.is_empty() {
            return;
        }
        let report = self
            .queue
            .flush(|event| self.submit(client, inflight, event.clone(), None));
        self.metrics.record_flushed(report.delivered);
        if report.requeued > 0 {
            self.metrics.record_requeued(report.requeued);
        }
        info!(
            delivered = report.delivered,
            requeued = report.requeued,
            "queue flushed"
        );
    }

    fn complete(&self, inflight: &mut Inflight, pkid: u16) {
        let Some(pending) = inflight.complete(pkid) else {
            debug!(pkid, "ack for unknown packet id");
            return;
        };
        self.metrics.record_acked();
        if let Some(token) = pending.token {
            if !self.acks.resolve(token, true) {
                debug!(%token, "confirmation arrived after waiter gave up");
            }
        }
    }

    /// Publish request that cannot go out now: queue it, or tell its waiter.
    fn reject(&self, outbound: Outbound) {
        match outbound.token {
            Some(token) => {
                self.acks.resolve(token, false);
            }
            None => {
                self.queue.enqueue(outbound.event);
                self.metrics.record_queued();
            }
        }
    }

    /// Session ended: nothing unacknowledged may be lost.
    fn abandon(&self, inflight: Inflight) {
        let mut restore = Vec::new();
        for pending in inflight.entries {
            match pending.token {
                Some(token) => {
                    self.acks.resolve(token, false);
                }
                None => restore.push(pending.event),
            }
        }
        if !restore.is_empty() {
            info!(count = restore.len(), "restoring unacknowledged events to queue");
            self.metrics.record_requeued(restore.len());
            self.queue.restore_front(restore);
        }
    }
}

// -----------------------------------------------------------------------------
// In-flight correlation
// -----------------------------------------------------------------------------

/// Publishes handed to the client, in submission order. The event loop
/// reports outgoing packet ids in the same order, which is how each entry
/// learns its packet id before the broker acknowledges it.
#[derive(Debug, Default)]
struct Inflight {
    entries: VecDeque<PendingPublish>,
}

#[derive(Debug)]
struct PendingPublish {
    event: Event,
    token: Option<CorrelationToken>,
    pkid: Option<u16>,
}

impl Inflight {
    fn push(&mut self, event: Event, token: Option<CorrelationToken>) {
        self.entries.push_back(PendingPublish {
            event,
            token,
            pkid: None,
        });
    }

    fn assign(&mut self, pkid: u16) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pkid.is_none()) {
            entry.pkid = Some(pkid);
        }
    }

    fn complete(&mut self, pkid: u16) -> Option<PendingPublish> {
        let idx = self.entries.iter().position(|e| e.pkid == Some(pkid))?;
        self.entries.remove(idx)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Resolves on the next change of the shutdown flag, yielding whether it now
/// asks to stop. A dropped sender counts as a stop request.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) -> bool {
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow_and_update(),
        Err(_) => true,
    }
}
