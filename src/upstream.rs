//! Capability of talking to the upstream feature service.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::UpstreamError;
use crate::metrics::BulkMetrics;
use crate::model::FeatureFile;
use crate::token::EdgeToken;

/// Client spec version advertised to upstream.
pub const CLIENT_SPEC_VERSION: &str = "5.1.0";
/// Application name advertised to upstream.
pub const APP_NAME: &str = "Overleash";

/// Header that marks a streaming client as a privileged replica.
pub const OVERLEASH_HEADER: &str = "X-Overleash";

/// One message read from an upstream event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub event: String,
    pub data: String,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get_features(&self, token: &str) -> Result<FeatureFile, UpstreamError>;

    async fn register_client(&self, token: &EdgeToken) -> Result<(), UpstreamError>;

    /// Opens a long-lived delta stream. Reconnection is handled by the
    /// implementation; the channel closes when `shutdown` fires.
    async fn stream_features(
        &self,
        token: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<StreamMessage>, UpstreamError>;

    async fn bulk_metrics(&self, token: &str, metrics: &BulkMetrics) -> Result<(), UpstreamError>;
}
