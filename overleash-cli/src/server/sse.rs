use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use overleash_lib::streamer::{SseEvent, SubscriberId};
use overleash_lib::upstream::OVERLEASH_HEADER;
use overleash_lib::Overleash;
use tracing::debug;

use super::metrics::metrics;
use super::state::AppState;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Removes the subscriber when the client goes away.
struct SubscriptionGuard {
    overleash: Arc<Overleash>,
    id: SubscriberId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        metrics().sse_active.dec();
        let overleash = Arc::clone(&self.overleash);
        let id = self.id;
        tokio::spawn(async move { overleash.unsubscribe(id).await });
    }
}

fn is_privileged(headers: &HeaderMap) -> bool {
    headers
        .get(OVERLEASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

fn to_event(event: &SseEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event)
        .data(&event.data)
}

/// GET /api/client/streaming
///
/// Streams delta events of the environment whose token the client sends.
/// Clients with an unknown token follow the active environment.
pub async fn handle_streaming(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let environment = state.overleash.environment_for_token(token).await;
    let privileged = is_privileged(&headers);

    let Some(subscription) = state.overleash.subscribe(environment, privileged).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "streaming unavailable").into_response();
    };
    debug!(
        subscriber = subscription.id,
        environment = subscription.environment,
        privileged,
        "streaming client connected"
    );

    let m = metrics();
    m.sse_active.inc();
    m.sse_total.inc();

    let guard = SubscriptionGuard {
        overleash: Arc::clone(&state.overleash),
        id: subscription.id,
    };
    let mut receiver = subscription.receiver;
    let mut shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            tokio::select! {
                event = receiver.recv() => match event {
                    Some(event) => {
                        metrics().sse_events.with_label_values(&[event.event]).inc();
                        yield Ok::<Event, Infallible>(to_event(&event));
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response()
}
