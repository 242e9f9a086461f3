use crate::delivery::connection::ConnectionState;
use crate::runtime::StatusView;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Start a minimal HTTP endpoint serving metrics, health, and loglevel controls.
/// Returns the bound address (useful when binding port 0).
pub async fn start_http(
    bind: &str,
    status: StatusView,
    log_handle: Option<LogHandle>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind status endpoint on {bind}"))?;
    let local = listener.local_addr()?;
    tracing::info!("status endpoint listening on {}", local);
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _addr)) => {
                    let status = status.clone();
                    let log_handle = log_handle.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(&mut socket, &status, log_handle).await {
                            tracing::warn!("status handler error: {err:?}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("status accept error: {err:?}");
                }
            }
        }
    });
    Ok(local)
}

async fn handle_conn(
    socket: &mut tokio::net::TcpStream,
    status: &StatusView,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let target = first.split_whitespace().nth(1).unwrap_or("/");
    let (route, query) = target.split_once('?').unwrap_or((target, ""));
    let (code, body, content_type) = match route {
        "/metrics" => (200, collect_metrics(status), "text/plain"),
        "/readyz" => readyz(status),
        "/livez" => livez(),
        "/v1/loglevel" => loglevel(query, log_handle.as_ref()),
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason(code),
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn collect_metrics(status: &StatusView) -> String {
    let mut body = status.metrics().snapshot().to_prometheus();
    let connected = u8::from(status.state() == ConnectionState::Connected);
    body.push_str(&format!(
        "meterlink_connected {}\nmeterlink_queue_depth {}\nmeterlink_pending_confirms {}\n",
        connected,
        status.queue_depth(),
        status.pending_confirms()
    ));
    body
}

pub fn readyz(status: &StatusView) -> (u16, String, &'static str) {
    let state = status.state();
    let ready = state == ConnectionState::Connected;
    let code = if ready { 200 } else { 503 };
    let body = format!(
        "{{\"ready\":{},\"state\":\"{}\",\"queue_depth\":{},\"pending_confirms\":{}}}",
        ready,
        state,
        status.queue_depth(),
        status.pending_confirms()
    );
    (code, body, "application/json")
}

pub fn livez() -> (u16, String, &'static str) {
    (200, "{\"live\":true}".to_string(), "application/json")
}

fn loglevel(query: &str, log_handle: Option<&LogHandle>) -> (u16, String, &'static str) {
    let Some(handle) = log_handle else {
        return (
            503,
            "{\"status\":\"log reload unavailable\"}".to_string(),
            "application/json",
        );
    };
    let Some(level) = query.split('&').find_map(|part| part.strip_prefix("level=")) else {
        return (
            400,
            "{\"status\":\"missing level\"}".to_string(),
            "application/json",
        );
    };
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(err) = handle.modify(|f| *f = filter) {
                tracing::warn!("log level reload failed: {err}");
                return (
                    503,
                    "{\"status\":\"reload failed\"}".to_string(),
                    "application/json",
                );
            }
            tracing::info!(level, "log level changed");
            (200, "{\"status\":\"ok\"}".to_string(), "application/json")
        }
        Err(_) => (
            400,
            "{\"status\":\"invalid level\"}".to_string(),
            "application/json",
        ),
    }
}
