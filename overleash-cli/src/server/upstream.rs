use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use overleash_lib::metrics::{BulkMetrics, ClientData};
use overleash_lib::token::EdgeToken;
use overleash_lib::upstream::{StreamMessage, APP_NAME, CLIENT_SPEC_VERSION, OVERLEASH_HEADER};
use overleash_lib::{FeatureFile, Upstream, UpstreamError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{redirect, Client, RequestBuilder, StatusCode};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const STREAM_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn sdk_version() -> String {
    format!("overleash@{}", env!("CARGO_PKG_VERSION"))
}

/// Upstream client speaking the feature service's client API.
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
    base: String,
    connection_id: String,
    interval: u64,
}

impl HttpUpstream {
    /// `interval` is advertised to upstream as the polling period.
    pub fn new(base: &str, interval: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            interval: interval.as_secs(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn headers(&self, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.insert(name, v);
                }
                Err(_) => warn!(header = name, "dropping header with invalid characters"),
            }
        };
        insert("authorization", token);
        insert("unleash-client-spec", CLIENT_SPEC_VERSION);
        insert("unleash-appname", APP_NAME);
        insert("unleash-connection-id", &self.connection_id);
        insert("unleash-interval", &self.interval.to_string());
        insert("unleash-sdk", &sdk_version());
        headers
    }

    fn request(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder.headers(self.headers(token))
    }

    async fn expect_status(
        &self,
        builder: RequestBuilder,
        expected: StatusCode,
        url: &str,
    ) -> Result<(), UpstreamError> {
        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;
        if response.status() != expected {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn get_features(&self, token: &str) -> Result<FeatureFile, UpstreamError> {
        let url = self.url("/api/client/features");
        let response = self
            .request(self.client.get(&url), token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        response
            .json::<FeatureFile>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    async fn register_client(&self, token: &EdgeToken) -> Result<(), UpstreamError> {
        let url = self.url("/api/client/register");
        let body = ClientData {
            app_name: APP_NAME.to_string(),
            instance_id: self.connection_id.clone(),
            connection_id: self.connection_id.clone(),
            environment: token.environment.clone(),
            sdk_version: sdk_version(),
            strategies: Vec::new(),
            started: Some(Utc::now()),
            interval: self.interval as i64,
        };
        let builder = self
            .request(self.client.post(&url), &token.token)
            .header(ACCEPT, "application/json")
            .json(&body);
        self.expect_status(builder, StatusCode::OK, &url).await
    }

    async fn stream_features(
        &self,
        token: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<StreamMessage>, UpstreamError> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let this = self.clone();
        let token = token.to_string();
        tokio::spawn(async move { this.stream_loop(token, tx, shutdown).await });
        Ok(rx)
    }

    async fn bulk_metrics(&self, token: &str, metrics: &BulkMetrics) -> Result<(), UpstreamError> {
        let url = self.url("/api/client/metrics/bulk");
        let builder = self.request(self.client.post(&url), token).json(metrics);
        self.expect_status(builder, StatusCode::ACCEPTED, &url).await
    }
}

// ── Upstream delta stream ───────────────────────────────────

impl HttpUpstream {
    /// Keeps one delta stream open, reconnecting with exponential backoff.
    /// Ends when `shutdown` fires or the receiver is dropped.
    async fn stream_loop(
        self,
        token: String,
        tx: mpsc::Sender<StreamMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let url = self.url("/api/client/streaming");
        let mut backoff = INITIAL_BACKOFF;

        while !*shutdown.borrow() {
            let request = self
                .request(self.client.get(&url), &token)
                .header(ACCEPT, "text/event-stream")
                .header(OVERLEASH_HEADER, "yes");

            let response = tokio::select! {
                response = request.send() => response,
                _ = shutdown.changed() => break,
            };

            match response {
                Ok(response) if response.status().is_success() => {
                    backoff = INITIAL_BACKOFF;
                    info!(url = %url, "connected to upstream stream");

                    let mut stream = response.bytes_stream();
                    let mut parser = SseParser::default();
                    loop {
                        let chunk = tokio::select! {
                            chunk = stream.next() => chunk,
                            _ = shutdown.changed() => return,
                        };
                        let chunk = match chunk {
                            Some(Ok(chunk)) => chunk,
                            Some(Err(e)) => {
                                warn!(error = %e, "upstream stream error");
                                break;
                            }
                            None => break,
                        };
                        for message in parser.feed(&chunk) {
                            if tx.send(message).await.is_err() {
                                debug!("delta receiver dropped, closing upstream stream");
                                return;
                            }
                        }
                    }
                    warn!("upstream stream ended, reconnecting");
                }
                Ok(response) => {
                    warn!(status = %response.status(), retry_in = ?backoff, "upstream stream refused");
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "upstream stream connection failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        debug!("upstream stream stopped");
    }
}

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Consumes a chunk and returns every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(message) = self.dispatch() {
                    messages.push(message);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        messages
    }

    fn dispatch(&mut self) -> Option<StreamMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(StreamMessage {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}
