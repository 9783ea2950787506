use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::compile::{compile, Compiled};
use crate::engine::Engine;
use crate::error::CompileError;
use crate::model::{FeatureFile, Overrides};
use crate::streamer::{Snapshot, Streamer, Subscriber};
use crate::token::remote_name;

/// Everything served for one upstream token.
pub struct FeatureEnvironment {
    token: String,
    name: String,
    remote: FeatureFile,
    compiled: Compiled,
    engine: Box<dyn Engine>,
    streamer: Option<Arc<Streamer>>,
    stream_queue: Option<StreamQueue>,
}

/// Owned copy of the state a subscriber is hydrated with.
struct Hydration {
    compiled: FeatureFile,
    remote: FeatureFile,
    overrides: Overrides,
    paused: bool,
}

impl Hydration {
    fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            compiled: &self.compiled,
            remote: &self.remote,
            overrides: &self.overrides,
            paused: self.paused,
        }
    }
}

/// Work waiting to be broadcast to the subscribers of one environment.
enum StreamJob {
    Diff {
        previous: FeatureFile,
        compiled: FeatureFile,
        remote: FeatureFile,
    },
    Control {
        overrides: Overrides,
        paused: bool,
    },
    Attach {
        subscriber: Subscriber,
        state: Hydration,
    },
    Adopt {
        from: Arc<Streamer>,
        from_index: usize,
        to_index: usize,
        state: Hydration,
    },
}

struct QueuedJob {
    streamer: Arc<Streamer>,
    job: StreamJob,
}

/// Broadcast work of every environment that shares it, drained by a single
/// worker in the order it was queued.
///
/// Environments of one coordinator share a queue, so a subscriber is always
/// attached before it can be moved to another environment.
#[derive(Clone, Default)]
pub struct StreamQueue {
    sender: Arc<OnceLock<mpsc::UnboundedSender<QueuedJob>>>,
}

impl StreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&self, streamer: &Arc<Streamer>, job: StreamJob) -> bool {
        let sender = self.sender.get_or_init(spawn_stream_worker);
        sender
            .send(QueuedJob {
                streamer: Arc::clone(streamer),
                job,
            })
            .is_ok()
    }
}

fn spawn_stream_worker() -> mpsc::UnboundedSender<QueuedJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
    tokio::spawn(async move {
        while let Some(QueuedJob { streamer, job }) = rx.recv().await {
            match job {
                StreamJob::Diff {
                    previous,
                    compiled,
                    remote,
                } => streamer.process_update(&previous, &compiled, &remote).await,
                StreamJob::Control { overrides, paused } => {
                    streamer.notify_control(&overrides, paused).await
                }
                StreamJob::Attach { subscriber, state } => {
                    streamer.add_subscriber(subscriber, &state.snapshot()).await
                }
                StreamJob::Adopt {
                    from,
                    from_index,
                    to_index,
                    state,
                } => {
                    let moved = Streamer::migrate_following(
                        (&from, from_index),
                        (&streamer, to_index),
                        &state.snapshot(),
                    )
                    .await;
                    if moved > 0 {
                        debug!(from = from_index, to = to_index, moved, "moved subscribers to active environment");
                    }
                }
            }
        }
    });
    tx
}

impl FeatureEnvironment {
    /// Creates an environment. With `streaming` it gets a broadcast queue of
    /// its own.
    pub fn new(token: impl Into<String>, engine: Box<dyn Engine>, streaming: bool) -> Self {
        Self::with_stream_queue(token, engine, streaming.then(StreamQueue::new))
    }

    /// Creates an environment that streams through `queue`, or not at all
    /// when it is `None`.
    pub fn with_stream_queue(token: impl Into<String>, engine: Box<dyn Engine>, queue: Option<StreamQueue>) -> Self {
        let token = token.into();
        Self {
            name: remote_name(&token),
            token,
            remote: FeatureFile::default(),
            compiled: Compiled::default(),
            engine,
            streamer: queue.as_ref().map(|_| Arc::new(Streamer::new())),
            stream_queue: queue,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote(&self) -> &FeatureFile {
        &self.remote
    }

    pub fn compiled(&self) -> &FeatureFile {
        &self.compiled.file
    }

    pub fn cached_json(&self) -> &str {
        &self.compiled.json
    }

    pub fn etag(&self) -> &str {
        &self.compiled.etag
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn streamer(&self) -> Option<&Arc<Streamer>> {
        self.streamer.as_ref()
    }

    pub(crate) fn set_remote(&mut self, mut file: FeatureFile) {
        for feature in file.features.iter_mut() {
            feature.refresh_search_term();
        }
        self.remote = file;
    }

    /// Rebuilds the served artifact and hands it to the engine.
    ///
    /// With streaming enabled the previous and new artifacts are queued for a
    /// background diff, so this must run inside a tokio runtime.
    pub fn compile(&mut self, overrides: &Overrides, paused: bool) -> Result<(), CompileError> {
        let compiled = compile(&self.remote, overrides, paused)?;
        if compiled.etag == self.compiled.etag {
            debug!(environment = %self.name, "compiled feature file unchanged");
            return Ok(());
        }

        self.engine.take_state(&compiled.json);
        let previous = std::mem::replace(&mut self.compiled, compiled);
        debug!(environment = %self.name, etag = %self.compiled.etag, "compiled feature file");

        if self.streamer.is_some() {
            let job = StreamJob::Diff {
                previous: previous.file,
                compiled: self.compiled.file.clone(),
                remote: self.remote.clone(),
            };
            self.enqueue(job);
        }
        Ok(())
    }

    /// Queues the current override state for privileged subscribers.
    pub fn queue_control(&self, overrides: &Overrides, paused: bool) {
        if self.streamer.is_some() {
            self.enqueue(StreamJob::Control {
                overrides: overrides.clone(),
                paused,
            });
        }
    }

    /// Queues a new subscriber. It is hydrated with the current state once
    /// every earlier update has been delivered. Returns `false` when
    /// streaming is disabled.
    pub fn queue_subscriber(&self, subscriber: Subscriber, overrides: &Overrides, paused: bool) -> bool {
        if self.streamer.is_none() {
            return false;
        }
        let state = self.hydration(overrides, paused);
        self.enqueue(StreamJob::Attach { subscriber, state });
        true
    }

    /// Queues the move of subscribers following the active environment from
    /// `from` over to this environment. Both must share a stream queue for
    /// the move to run after every subscriber queued on `from` so far.
    pub fn queue_adoption(&self, from: &FeatureEnvironment, from_index: usize, to_index: usize, overrides: &Overrides, paused: bool) {
        let (Some(source), Some(_)) = (from.streamer(), self.streamer()) else {
            return;
        };
        let job = StreamJob::Adopt {
            from: Arc::clone(source),
            from_index,
            to_index,
            state: self.hydration(overrides, paused),
        };
        self.enqueue(job);
    }

    fn hydration(&self, overrides: &Overrides, paused: bool) -> Hydration {
        Hydration {
            compiled: self.compiled.file.clone(),
            remote: self.remote.clone(),
            overrides: overrides.clone(),
            paused,
        }
    }

    fn enqueue(&self, job: StreamJob) {
        let (Some(streamer), Some(queue)) = (&self.streamer, &self.stream_queue) else {
            return;
        };
        if !queue.send(streamer, job) {
            warn!(environment = %self.name, "stream worker stopped, event not delivered");
        }
    }
}
