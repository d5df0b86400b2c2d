//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Feed**: frames received by kind, decode errors, reconnects
//! - **Connections**: upstream connected flag, downstream client count
//! - **Delivery**: payloads sent and dropped, broadcast fan-out time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.
//! Recording before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "dhan_proxy_frames_received_total",
        "Frames received from the Dhan feed by kind"
    );
    describe_counter!(
        "dhan_proxy_decode_errors_total",
        "Binary feed frames that failed to decode"
    );
    describe_counter!(
        "dhan_proxy_reconnects_total",
        "Upstream reconnection attempts"
    );

    describe_gauge!(
        "dhan_proxy_upstream_connected",
        "1 while the upstream feed socket is live"
    );
    describe_gauge!(
        "dhan_proxy_upstream_subscriptions",
        "Instruments requested from the upstream feed"
    );
    describe_gauge!(
        "dhan_proxy_clients",
        "Connected downstream WebSocket clients"
    );

    describe_counter!(
        "dhan_proxy_payloads_sent_total",
        "Payloads queued to downstream clients"
    );
    describe_counter!(
        "dhan_proxy_payloads_dropped_total",
        "Payloads dropped because a client queue was full"
    );

    describe_histogram!(
        "dhan_proxy_broadcast_seconds",
        "Time to fan one event out to every client"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for upstream frame kinds.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    /// Binary ticker packet.
    Ticker,
    /// JSON status message.
    Status,
    /// Frame that was neither.
    Ignored,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Status => "status",
            Self::Ignored => "ignored",
        }
    }
}

/// Record a frame received from the feed.
pub fn record_frame_received(kind: FrameKind) {
    counter!("dhan_proxy_frames_received_total", "kind" => kind.as_str()).increment(1);
}

/// Record a feed frame that failed to decode.
pub fn record_decode_error() {
    counter!("dhan_proxy_decode_errors_total").increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("dhan_proxy_reconnects_total").increment(1);
}

/// Update the upstream connected flag.
pub fn set_upstream_connected(connected: bool) {
    gauge!("dhan_proxy_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the upstream subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_subscriptions(count: usize) {
    gauge!("dhan_proxy_upstream_subscriptions").set(count as f64);
}

/// Update the downstream client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(count: usize) {
    gauge!("dhan_proxy_clients").set(count as f64);
}

/// Record payloads queued to clients.
pub fn record_payloads_sent(count: u64) {
    counter!("dhan_proxy_payloads_sent_total").increment(count);
}

/// Record payloads dropped for slow clients.
pub fn record_payloads_dropped(count: u64) {
    counter!("dhan_proxy_payloads_dropped_total").increment(count);
}

/// Record how long one broadcast took.
pub fn record_broadcast_duration(duration: Duration) {
    histogram!("dhan_proxy_broadcast_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
