//! Fan-out of delta events to streaming subscribers of one environment.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::delta::{diff, Delta, Event};
use crate::model::{FeatureFile, Overrides};

/// Capacity of each subscriber queue. Events beyond it are dropped for that
/// subscriber only.
pub const SUBSCRIBER_QUEUE_SIZE: usize = 32;

pub const CONNECTED_EVENT: &str = "unleash-connected";
pub const UPDATED_EVENT: &str = "unleash-updated";

/// One message on the streaming wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub id: u64,
    pub event: &'static str,
    pub data: String,
    /// Carries override state and must only reach privileged subscribers.
    pub overleash_event: bool,
}

impl SseEvent {
    fn new(id: u64, event: &'static str, events: Vec<Event>, overleash_event: bool) -> Self {
        let data = serde_json::to_string(&Delta { events })
            .expect("delta events always serialize");
        Self {
            id,
            event,
            data,
            overleash_event,
        }
    }

    /// Text form: `id`, `event` and `data` lines followed by a blank line.
    pub fn to_wire(&self) -> String {
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.id, self.event, self.data)
    }
}

pub type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    privileged: bool,
    follow_active: bool,
    sender: mpsc::Sender<SseEvent>,
}

impl Subscriber {
    /// Creates a subscriber and the receiving half of its queue.
    ///
    /// `privileged` subscribers also receive override state. Subscribers
    /// that `follow_active` move along when the active environment changes.
    pub fn new(privileged: bool, follow_active: bool) -> (Self, mpsc::Receiver<SseEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        let subscriber = Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            privileged,
            follow_active,
            sender,
        };
        (subscriber, receiver)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn follows_active(&self) -> bool {
        self.follow_active
    }

    /// Returns `false` once the receiving side is gone.
    fn notify(&self, event: &SseEvent) -> bool {
        if event.overleash_event && !self.privileged {
            return !self.sender.is_closed();
        }
        match self.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = self.id, event_id = event.id, "subscriber queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = self.id, "subscriber gone");
                false
            }
        }
    }
}

/// State sent to a subscriber when it connects.
pub struct Snapshot<'a> {
    pub compiled: &'a FeatureFile,
    pub remote: &'a FeatureFile,
    pub overrides: &'a Overrides,
    pub paused: bool,
}

#[derive(Debug, Default)]
pub struct Streamer {
    subscribers: Mutex<Vec<Subscriber>>,
    counter: AtomicU64,
}

impl Streamer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Registers a subscriber and sends it the full current state.
    pub async fn add_subscriber(&self, subscriber: Subscriber, snapshot: &Snapshot<'_>) {
        let mut subscribers = self.subscribers.lock().await;
        self.attach(&mut subscribers, subscriber, snapshot);
    }

    fn attach(&self, subscribers: &mut Vec<Subscriber>, subscriber: Subscriber, snapshot: &Snapshot<'_>) {
        let id = self.next_id();
        let mut events = vec![Event::Hydration {
            event_id: id,
            features: snapshot.compiled.features.clone(),
            segments: snapshot.compiled.segments.clone(),
            original_features: Some(snapshot.remote.features.clone()),
        }];
        if subscriber.is_privileged() {
            events.push(Event::HydrationOverleash {
                event_id: self.next_id(),
                overrides: snapshot.overrides.clone(),
                paused: snapshot.paused,
            });
        }

        if subscriber.notify(&SseEvent::new(id, CONNECTED_EVENT, events, false)) {
            debug!(subscriber = subscriber.id(), "subscriber added");
            subscribers.push(subscriber);
        }
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub async fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id() != id);
        before != subscribers.len()
    }

    /// Diffs two compiled files and sends the result to every subscriber.
    pub async fn process_update(&self, old: &FeatureFile, new: &FeatureFile, remote: &FeatureFile) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.is_empty() {
            debug!("no subscribers, skipping diff");
            return;
        }

        let id = self.next_id();
        let events = diff(old, new, remote, || self.next_id());
        if events.is_empty() {
            return;
        }

        let message = SseEvent::new(id, UPDATED_EVENT, events, false);
        subscribers.retain(|s| s.notify(&message));
    }

    /// Sends current override state to privileged subscribers.
    pub async fn notify_control(&self, overrides: &Overrides, paused: bool) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.is_empty() {
            return;
        }

        let id = self.next_id();
        let events = vec![Event::HydrationOverleash {
            event_id: self.next_id(),
            overrides: overrides.clone(),
            paused,
        }];
        let message = SseEvent::new(id, UPDATED_EVENT, events, true);
        subscribers.retain(|s| s.notify(&message));
    }

    /// Moves every subscriber that follows the active environment from
    /// `from` to `to`, hydrating each one again.
    ///
    /// Both lists are locked, the lower environment index first.
    pub async fn migrate_following(
        from: (&Streamer, usize),
        to: (&Streamer, usize),
        snapshot: &Snapshot<'_>,
    ) -> usize {
        let (from, from_index) = from;
        let (to, to_index) = to;
        if std::ptr::eq(from, to) {
            return 0;
        }

        let (mut from_subs, mut to_subs) = if from_index < to_index {
            let f = from.subscribers.lock().await;
            let t = to.subscribers.lock().await;
            (f, t)
        } else {
            let t = to.subscribers.lock().await;
            let f = from.subscribers.lock().await;
            (f, t)
        };

        let (moving, staying): (Vec<_>, Vec<_>) =
            from_subs.drain(..).partition(Subscriber::follows_active);
        *from_subs = staying;

        let moved = moving.len();
        for subscriber in moving {
            to.attach(&mut to_subs, subscriber, snapshot);
        }
        moved
    }
}
