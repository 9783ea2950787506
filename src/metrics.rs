//! Client usage metrics collected from SDKs and forwarded upstream in bulk.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::upstream::APP_NAME;

const SINK_CAPACITY: usize = 1024;

/// Metrics bucket posted by an SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub app_name: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub environment: String,
    pub bucket: Bucket,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(default)]
    pub toggles: BTreeMap<String, ToggleCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToggleCount {
    #[serde(default)]
    pub yes: i64,
    #[serde(default)]
    pub no: i64,
    #[serde(default)]
    pub variants: BTreeMap<String, i64>,
}

/// Registration posted by an SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    pub app_name: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub sdk_version: String,
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectVia {
    pub app_name: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientApplication {
    pub connect_via: Vec<ConnectVia>,
    #[serde(flatten)]
    pub client: ClientData,
}

/// One toggle of one bucket, flattened for the bulk endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEnv {
    pub feature_name: String,
    pub app_name: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    pub yes: i64,
    pub no: i64,
    pub variants: BTreeMap<String, i64>,
}

/// Body of the upstream bulk metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkMetrics {
    pub applications: Vec<ClientApplication>,
    pub metrics: Vec<MetricEnv>,
}

/// Metrics waiting to be forwarded.
#[derive(Debug, Default)]
pub struct MetricsBuffer {
    metrics: Vec<MetricsData>,
    clients: Vec<ClientData>,
}

impl MetricsBuffer {
    pub fn push(&mut self, item: Collected) {
        match item {
            Collected::Metrics(m) => self.metrics.push(m),
            Collected::Client(c) => self.clients.push(c),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.clients.is_empty()
    }

    pub fn clear(&mut self) {
        self.metrics.clear();
        self.clients.clear();
    }

    pub fn to_bulk(&self, instance_id: &str) -> BulkMetrics {
        let via = ConnectVia {
            app_name: APP_NAME.to_string(),
            instance_id: instance_id.to_string(),
        };

        let applications = self
            .clients
            .iter()
            .map(|c| ClientApplication {
                connect_via: vec![via.clone()],
                client: c.clone(),
            })
            .collect();

        let metrics = self
            .metrics
            .iter()
            .flat_map(|m| {
                m.bucket.toggles.iter().map(move |(name, toggle)| MetricEnv {
                    feature_name: name.clone(),
                    app_name: m.app_name.clone(),
                    environment: m.environment.clone(),
                    timestamp: m.bucket.start,
                    yes: toggle.yes,
                    no: toggle.no,
                    variants: toggle.variants.clone(),
                })
            })
            .collect();

        BulkMetrics {
            applications,
            metrics,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Collected {
    Metrics(MetricsData),
    Client(ClientData),
}

/// Cheap handle used by request handlers to hand metrics to the buffer.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<Collected>,
}

impl MetricsSink {
    pub fn channel() -> (Self, mpsc::Receiver<Collected>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn record_metrics(&self, metrics: MetricsData) {
        self.record(Collected::Metrics(metrics));
    }

    pub fn record_client(&self, client: ClientData) {
        self.record(Collected::Client(client));
    }

    fn record(&self, item: Collected) {
        if let Err(e) = self.tx.try_send(item) {
            warn!(error = %e, "metrics buffer unavailable, dropping client metrics");
        }
    }
}
