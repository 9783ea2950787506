use std::sync::Arc;

use overleash_lib::metrics::MetricsSink;
use overleash_lib::Overleash;
use tokio::sync::watch;

use super::config::ServeConfig;

/// Shared application state for the HTTP server.
pub struct AppState {
    pub overleash: Arc<Overleash>,
    /// Hands SDK metrics and registrations to the forwarding buffer.
    pub metrics_sink: MetricsSink,
    pub config: Arc<ServeConfig>,
    /// Flips to `true` when the server starts shutting down. Open SSE
    /// streams end on it.
    pub shutdown: watch::Receiver<bool>,
}
