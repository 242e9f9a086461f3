use crate::config::Config;
use crate::delivery::connection::{ConnectionHandle, ConnectionManager, ConnectionState};
use crate::delivery::publisher::Publisher;
use crate::delivery::queue::OutboundQueue;
use crate::household::boot::FileBootMarker;
use crate::household::reconcile::{BootOutcome, Reconciler};
use crate::household::service::HouseholdService;
use crate::household::store::JsonHouseholdStore;
use crate::ops::observability::DeliveryMetrics;
use crate::telemetry;
use crate::telemetry::LogHandle;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Read-only view of delivery health handed to the status endpoint.
#[derive(Debug, Clone)]
pub struct StatusView {
    link: ConnectionHandle,
    queue: Arc<OutboundQueue>,
    metrics: Arc<DeliveryMetrics>,
}

impl StatusView {
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_confirms(&self) -> usize {
        self.link.pending_confirms()
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }
}

/// Bound on how long shutdown waits for the connection worker to hand back
/// its unacknowledged events.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Asks a running [`Runtime`] to stop, as a signal would.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        let _ = self.tx.send(true);
    }
}

/// Wires the outbound queue, the connection worker, the publisher and the
/// household reconciler, then waits for shutdown.
pub struct Runtime {
    config: Config,
    device_id: String,
    queue: Arc<OutboundQueue>,
    metrics: Arc<DeliveryMetrics>,
    publisher: Publisher<ConnectionHandle>,
    manager: Option<ConnectionManager>,
    worker: Option<JoinHandle<()>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl Runtime {
    pub fn new(config: Config, log_handle: Option<LogHandle>) -> Result<Self> {
        config.validate()?;
        let device_id = config.resolve_device_id();
        let queue = Arc::new(match &config.delivery.spool_path {
            Some(path) => OutboundQueue::with_spool(path),
            None => OutboundQueue::new(),
        });
        let metrics = Arc::new(DeliveryMetrics::default());
        let (manager, handle) = ConnectionManager::new(
            config.connection_settings(&device_id),
            config.resolver_for(&device_id),
            Arc::clone(&queue),
            Arc::clone(&metrics),
        );
        let publisher = Publisher::new(handle, Arc::clone(&queue), Arc::clone(&metrics))
            .with_confirm_timeout(config.delivery.confirm_timeout());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tracing::info!(device_id = %device_id, queued = queue.len(), "runtime initialised");
        Ok(Self {
            config,
            device_id,
            queue,
            metrics,
            publisher,
            manager: Some(manager),
            worker: None,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            log_handle,
        })
    }

    /// Reconcile, start the connection worker and the status endpoint, then
    /// block until SIGINT/SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        let outcome = self.reconcile();
        tracing::info!(?outcome, "boot reconciliation finished");
        self.start_delivery();
        self.start_telemetry().await?;
        self.handle_shutdown().await
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn queue(&self) -> Arc<OutboundQueue> {
        Arc::clone(&self.queue)
    }

    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    pub fn status(&self) -> StatusView {
        StatusView {
            link: self.publisher.link().clone(),
            queue: Arc::clone(&self.queue),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn household_store(&self) -> JsonHouseholdStore {
        JsonHouseholdStore::new(
            &self.config.household.members_file,
            &self.config.household.guests_file,
            &self.device_id,
        )
    }

    /// Operations for the request layer, sharing this runtime's publisher.
    pub fn household(&self) -> HouseholdService<JsonHouseholdStore, ConnectionHandle> {
        HouseholdService::new(
            &self.device_id,
            self.household_store(),
            self.publisher.clone(),
        )
    }

    /// Boot-time reconciliation; must run before the request layer serves.
    pub fn reconcile(&self) -> BootOutcome {
        let marker = FileBootMarker::new(
            &self.config.boot.marker_path,
            &self.config.boot.boot_id_path,
        );
        Reconciler::new(
            &self.device_id,
            self.household_store(),
            marker,
            Arc::clone(&self.queue),
            Arc::clone(&self.metrics),
        )
        .reconcile_on_boot()
    }

    /// Spawn the connection worker. Later calls are no-ops.
    pub fn start_delivery(&mut self) {
        if let Some(manager) = self.manager.take() {
            self.worker = Some(manager.spawn(self.shutdown_rx.clone()));
        }
    }

    pub async fn start_telemetry(&self) -> Result<()> {
        if let Some(bind) = &self.config.telemetry.status_bind {
            telemetry::start_http(bind, self.status(), self.log_handle()).await?;
        }
        Ok(())
    }

    /// Handle that makes `run` return without waiting for a signal.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    async fn handle_shutdown(&mut self) -> Result<()> {
        tokio::select! {
            res = shutdown_signal() => {
                res?;
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        self.drain().await;
        Ok(())
    }

    async fn drain(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            match tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("connection worker ended abnormally: {err:?}"),
                Err(_) => {
                    tracing::warn!("connection worker did not stop in time; aborting");
                    worker.abort();
                }
            }
        }
        tracing::info!(
            queued = self.queue.len(),
            spooled = self.queue.spool_path().is_some(),
            "delivery stopped"
        );
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c"),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
