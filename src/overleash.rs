//! The sync coordinator.
//!
//! [`Overleash`] owns every [`FeatureEnvironment`], the override map, the
//! pause flag and the active environment index behind one reader/writer
//! lock. Mutations take the writer lock, recompile, release it and then
//! persist. Diffing and fan-out run on per-environment workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::delta::{apply_events, decode_events, Event};
use crate::engine::{Engine, EvalContext, EvaluatedToggle};
use crate::environment::{FeatureEnvironment, StreamQueue};
use crate::error::{FetchFailure, OverleashError};
use crate::metrics::{Collected, MetricsBuffer, MetricsSink};
use crate::model::{Constraint, Feature, FeatureFile, Override, OverrideConstraint, Overrides};
use crate::storage::{backup_key, Store, StoreNotification, OVERRIDES_KEY, PAUSED_KEY, WEBHOOK_KEY};
use crate::streamer::{SseEvent, Subscriber, SubscriberId, CONNECTED_EVENT, UPDATED_EVENT};
use crate::token::EdgeToken;
use crate::upstream::Upstream;

/// Interval between client-metrics flushes.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound for the final metrics flush on shutdown.
pub const METRICS_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay between a webhook call and the refresh it triggers.
pub const WEBHOOK_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OverleashConfig {
    /// Polling period. Zero disables polling.
    pub reload: Duration,
    /// Serve the streaming endpoint.
    pub streamer: bool,
    /// Consume upstream deltas instead of polling.
    pub delta: bool,
    /// Register with upstream at startup.
    pub register: bool,
    /// Keep a copy of every fetched snapshot in the store.
    pub backup: bool,
}

impl Default for OverleashConfig {
    fn default() -> Self {
        Self {
            reload: Duration::ZERO,
            streamer: false,
            delta: false,
            register: false,
            backup: true,
        }
    }
}

struct State {
    environments: Vec<FeatureEnvironment>,
    overrides: Overrides,
    paused: bool,
    active: usize,
    last_sync: Option<DateTime<Utc>>,
}

impl State {
    fn active(&self) -> Option<&FeatureEnvironment> {
        self.environments.get(self.active)
    }

    fn compile_all(&mut self) {
        let State {
            environments,
            overrides,
            paused,
            ..
        } = self;
        for env in environments.iter_mut() {
            compile_or_abort(env, overrides, *paused);
        }
    }

    fn queue_control(&self) {
        for env in &self.environments {
            env.queue_control(&self.overrides, self.paused);
        }
    }
}

// A compiled file that cannot be serialized leaves nothing valid to serve.
fn compile_or_abort(env: &mut FeatureEnvironment, overrides: &Overrides, paused: bool) {
    if let Err(e) = env.compile(overrides, paused) {
        error!(environment = %env.name(), error = %e, "unable to compile feature file");
        panic!("{}", e);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Persist {
    Overrides,
    Paused,
    Nothing,
}

/// A live streaming subscription.
pub struct Subscription {
    pub id: SubscriberId,
    pub environment: usize,
    pub receiver: mpsc::Receiver<SseEvent>,
}

/// Cached artifact of the active environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedFeatures {
    pub json: String,
    pub etag: String,
}

pub struct Overleash {
    state: RwLock<State>,
    store: Arc<dyn Store>,
    upstream: Arc<dyn Upstream>,
    config: OverleashConfig,
    instance_id: String,
    refreshed: Notify,
    refreshing: Mutex<()>,
    webhook_pending: AtomicBool,
}

impl Overleash {
    pub fn new(
        tokens: Vec<String>,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn Store>,
        engine: impl Fn() -> Box<dyn Engine>,
        config: OverleashConfig,
    ) -> Self {
        let stream_queue = config.streamer.then(StreamQueue::new);
        let environments = tokens
            .into_iter()
            .map(|token| FeatureEnvironment::with_stream_queue(token, engine(), stream_queue.clone()))
            .collect();

        Self {
            state: RwLock::new(State {
                environments,
                overrides: Overrides::new(),
                paused: false,
                active: 0,
                last_sync: None,
            }),
            store,
            upstream,
            config,
            instance_id: uuid::Uuid::new_v4().to_string(),
            refreshed: Notify::new(),
            refreshing: Mutex::new(()),
            webhook_pending: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OverleashConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Loads persisted state, fetches every environment once and starts the
    /// background tasks. A fetch failure for some environments is returned
    /// after the others are loaded and the tasks are running.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), OverleashError> {
        self.load_persisted().await;
        let loaded = self.load_remotes(true).await;

        if let Some(events) = self.store.as_event_store() {
            match events.subscribe(shutdown.clone()).await {
                Ok(rx) => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.run_store_listener(rx).await });
                }
                Err(e) => warn!(error = %e, "unable to subscribe to store notifications"),
            }
        }

        if self.config.register {
            self.register_clients().await;
        }

        if self.config.delta {
            let count = self.state.read().await.environments.len();
            for index in 0..count {
                let this = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.run_stream(index, shutdown).await });
            }
            info!(environments = count, "consuming upstream deltas");
        } else if !self.config.reload.is_zero() {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.run_ticker(shutdown).await });
        } else {
            info!("periodic refresh disabled");
        }

        loaded
    }

    async fn load_persisted(&self) {
        let overrides = match self.store.read(OVERRIDES_KEY).await {
            Ok(data) => serde_json::from_slice::<Overrides>(&data)
                .map_err(|e| warn!(error = %e, "ignoring unreadable persisted overrides"))
                .ok(),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(error = %e, "unable to read persisted overrides");
                None
            }
        };
        let paused = match self.store.read(PAUSED_KEY).await {
            Ok(data) => serde_json::from_slice::<bool>(&data)
                .map_err(|e| warn!(error = %e, "ignoring unreadable persisted pause flag"))
                .ok(),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(error = %e, "unable to read persisted pause flag");
                None
            }
        };

        let mut state = self.state.write().await;
        if let Some(overrides) = overrides {
            info!(count = overrides.len(), "loaded persisted overrides");
            state.overrides = overrides;
        }
        if let Some(paused) = paused {
            state.paused = paused;
        }
    }

    /// Fetches every environment and recompiles. Failures are collected per
    /// environment; the environments that did load are still applied.
    ///
    /// Refreshes run one at a time so a slow fetch never replaces the result
    /// of a later one.
    async fn load_remotes(&self, initial: bool) -> Result<(), OverleashError> {
        let _refreshing = self.refreshing.lock().await;
        let environments: Vec<(String, String)> = {
            let state = self.state.read().await;
            state
                .environments
                .iter()
                .map(|env| (env.token().to_string(), env.name().to_string()))
                .collect()
        };

        let results = join_all(
            environments
                .iter()
                .map(|(token, _)| self.upstream.get_features(token)),
        )
        .await;

        let mut fetched = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (index, (result, (_, name))) in results.into_iter().zip(&environments).enumerate() {
            match result {
                Ok(file) => {
                    debug!(environment = %name, features = file.features.len(), "fetched feature file");
                    if self.config.backup {
                        self.write_backup(index, &file).await;
                    }
                    fetched.push(Some(file));
                }
                Err(e) => {
                    error!(environment = %name, error = %e, "error loading features");
                    let restored = if initial && self.config.backup {
                        self.read_backup(index).await
                    } else {
                        None
                    };
                    fetched.push(restored);
                    failures.push(FetchFailure {
                        environment: name.clone(),
                        source: e,
                    });
                }
            }
        }

        {
            let mut state = self.state.write().await;
            for (env, file) in state.environments.iter_mut().zip(fetched) {
                if let Some(file) = file {
                    env.set_remote(file);
                }
            }
            state.compile_all();
            if failures.len() < environments.len() {
                state.last_sync = Some(Utc::now());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OverleashError::Fetch(failures))
        }
    }

    async fn write_backup(&self, index: usize, file: &FeatureFile) {
        let data = match serde_json::to_vec(file) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "unable to encode snapshot backup");
                return;
            }
        };
        if let Err(e) = self.store.write(&backup_key(index), &data).await {
            warn!(environment = index, error = %e, "unable to write snapshot backup");
        }
    }

    async fn read_backup(&self, index: usize) -> Option<FeatureFile> {
        let data = self.store.read(&backup_key(index)).await.ok()?;
        match serde_json::from_slice::<FeatureFile>(&data) {
            Ok(file) => {
                info!(environment = index, "serving snapshot backup until upstream recovers");
                Some(file)
            }
            Err(e) => {
                warn!(environment = index, error = %e, "ignoring unreadable snapshot backup");
                None
            }
        }
    }

    /// Refetches every environment now and restarts the polling period.
    pub async fn refresh_feature_files(&self) -> Result<(), OverleashError> {
        let result = self.load_remotes(false).await;
        self.refreshed.notify_one();
        result
    }

    async fn run_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.reload;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?period, "periodic refresh enabled");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("reloading remotes");
                    if let Err(e) = self.load_remotes(false).await {
                        warn!(error = %e, "periodic refresh failed");
                    }
                }
                _ = self.refreshed.notified() => interval.reset(),
                _ = shutdown.changed() => break,
            }
        }
        debug!("periodic refresh stopped");
    }

    async fn register_clients(&self) {
        let tokens: Vec<String> = {
            let state = self.state.read().await;
            state.environments.iter().map(|e| e.token().to_string()).collect()
        };

        for token in tokens {
            let Some(edge_token) = EdgeToken::parse(&token) else {
                warn!("token is not in project:environment.secret form, skipping registration");
                continue;
            };
            match self.upstream.register_client(&edge_token).await {
                Ok(()) => info!(environment = %edge_token.environment, "registered with upstream"),
                Err(e) => warn!(environment = %edge_token.environment, error = %e, "unable to register with upstream"),
            }
        }
    }

    // ── Upstream deltas ─────────────────────────────────────────

    async fn run_stream(self: Arc<Self>, index: usize, shutdown: watch::Receiver<bool>) {
        let token = {
            let state = self.state.read().await;
            match state.environments.get(index) {
                Some(env) => env.token().to_string(),
                None => return,
            }
        };

        let mut rx = match self.upstream.stream_features(&token, shutdown).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(environment = index, error = %e, "unable to open upstream stream");
                return;
            }
        };

        while let Some(message) = rx.recv().await {
            if message.event != CONNECTED_EVENT && message.event != UPDATED_EVENT {
                warn!(event = %message.event, "unknown upstream event type");
                continue;
            }
            match decode_events(&message.data) {
                Ok(events) => self.apply_stream_events(index, events).await,
                Err(e) => error!(environment = index, error = %e, "unable to decode upstream delta"),
            }
        }
        debug!(environment = index, "upstream stream closed");
    }

    /// Merges upstream delta events into one environment's raw snapshot and
    /// recompiles. Override state carried by the primary environment's
    /// stream replaces the local state.
    pub async fn apply_stream_events(&self, index: usize, events: Vec<Event>) {
        let mut state = self.state.write().await;
        let Some(env) = state.environments.get(index) else {
            warn!(environment = index, "delta for unknown environment");
            return;
        };

        let applied = apply_events(env.remote(), events, index == 0);
        state.environments[index].set_remote(applied.file);

        match applied.control {
            Some((overrides, paused)) => {
                state.overrides = overrides;
                state.paused = paused;
                state.compile_all();
                state.queue_control();
            }
            None => {
                let State {
                    environments,
                    overrides,
                    paused,
                    ..
                } = &mut *state;
                compile_or_abort(&mut environments[index], overrides, *paused);
            }
        }
        state.last_sync = Some(Utc::now());
    }

    // ── Replicated store ────────────────────────────────────────

    async fn run_store_listener(self: Arc<Self>, mut rx: mpsc::Receiver<StoreNotification>) {
        while let Some(notification) = rx.recv().await {
            self.apply_store_notification(notification).await;
        }
        debug!("store listener stopped");
    }

    /// Applies a write made by another replica. Nothing is persisted again.
    pub async fn apply_store_notification(&self, notification: StoreNotification) {
        match notification.key.as_str() {
            OVERRIDES_KEY => match serde_json::from_slice::<Overrides>(&notification.data) {
                Ok(overrides) => {
                    debug!(count = overrides.len(), "overrides changed on another instance");
                    self.mutate(Persist::Nothing, |state| state.overrides = overrides)
                        .await;
                }
                Err(e) => warn!(error = %e, "ignoring unreadable replicated overrides"),
            },
            PAUSED_KEY => match serde_json::from_slice::<bool>(&notification.data) {
                Ok(paused) => self.mutate(Persist::Nothing, |state| state.paused = paused).await,
                Err(e) => warn!(error = %e, "ignoring unreadable replicated pause flag"),
            },
            WEBHOOK_KEY => {
                if let Err(e) = self.refresh_feature_files().await {
                    warn!(error = %e, "refresh after replicated webhook failed");
                }
            }
            other => debug!(key = %other, "ignoring store notification"),
        }
    }

    // ── Mutations ───────────────────────────────────────────────

    async fn mutate(&self, persist: Persist, f: impl FnOnce(&mut State)) {
        let snapshot = {
            let mut state = self.state.write().await;
            f(&mut state);
            state.compile_all();
            state.queue_control();
            (persist != Persist::Nothing).then(|| (state.overrides.clone(), state.paused))
        };

        if let Some((overrides, paused)) = snapshot {
            self.persist(persist, &overrides, paused).await;
        }
    }

    async fn persist(&self, persist: Persist, overrides: &Overrides, paused: bool) {
        let (key, encoded) = match persist {
            Persist::Overrides => (OVERRIDES_KEY, serde_json::to_vec(overrides)),
            Persist::Paused => (PAUSED_KEY, serde_json::to_vec(&paused)),
            Persist::Nothing => return,
        };
        let data = match encoded {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "unable to encode state");
                return;
            }
        };
        if let Err(e) = self.store.write(key, &data).await {
            warn!(key, error = %e, "unable to persist state");
        }
    }

    /// Forces a feature fully on or off.
    pub async fn add_override(&self, feature_flag: &str, enabled: bool) {
        let o = Override::global(feature_flag, enabled);
        self.mutate(Persist::Overrides, |state| {
            state.overrides.insert(feature_flag.to_string(), o);
        })
        .await;
    }

    /// Adds a constraint to the feature's constrained override, replacing
    /// a global override if one exists.
    pub async fn add_override_constraint(&self, feature_flag: &str, enabled: bool, constraint: Constraint) {
        self.mutate(Persist::Overrides, |state| {
            let entry = state
                .overrides
                .entry(feature_flag.to_string())
                .or_insert_with(|| Override::constrained(feature_flag));
            if entry.is_global {
                *entry = Override::constrained(feature_flag);
            }
            entry.constraints.push(OverrideConstraint { enabled, constraint });
        })
        .await;
    }

    pub async fn delete_override(&self, feature_flag: &str) {
        self.mutate(Persist::Overrides, |state| {
            state.overrides.remove(feature_flag);
        })
        .await;
    }

    pub async fn delete_all_overrides(&self) {
        self.mutate(Persist::Overrides, |state| state.overrides.clear())
            .await;
    }

    pub async fn set_paused(&self, paused: bool) {
        self.mutate(Persist::Paused, |state| state.paused = paused)
            .await;
    }

    /// Selects the environment served to clients and moves subscribers that
    /// follow the active environment over to it.
    pub async fn set_active_environment(&self, index: usize) -> Result<(), OverleashError> {
        let mut state = self.state.write().await;
        let count = state.environments.len();
        if index >= count {
            return Err(OverleashError::InvalidEnvironmentIndex { index, count });
        }

        state.active = index;
        state.compile_all();

        let target = &state.environments[index];
        for (from_index, env) in state.environments.iter().enumerate() {
            if from_index != index {
                target.queue_adoption(env, from_index, index, &state.overrides, state.paused);
            }
        }
        Ok(())
    }

    // ── Webhook ─────────────────────────────────────────────────

    /// Schedules a refresh after a short delay and tells sibling replicas
    /// to do the same. Calls arriving while a refresh is pending are merged.
    pub fn webhook_received(self: &Arc<Self>) {
        if self.webhook_pending.swap(true, Ordering::SeqCst) {
            debug!("refresh already scheduled");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(broadcast) = this.store.as_broadcast_store() {
                if let Err(e) = broadcast.broadcast(WEBHOOK_KEY, b"").await {
                    warn!(error = %e, "unable to broadcast webhook");
                }
            }
            tokio::time::sleep(WEBHOOK_DEBOUNCE).await;
            this.webhook_pending.store(false, Ordering::SeqCst);
            if let Err(e) = this.refresh_feature_files().await {
                warn!(error = %e, "refresh after webhook failed");
            }
        });
    }

    // ── Streaming subscribers ───────────────────────────────────

    /// Subscribes to an environment's deltas. `None` follows whichever
    /// environment is active. Returns `None` when streaming is disabled or
    /// the index is unknown.
    pub async fn subscribe(&self, environment: Option<usize>, privileged: bool) -> Option<Subscription> {
        let state = self.state.read().await;
        let index = environment.unwrap_or(state.active);
        let env = state.environments.get(index)?;

        let (subscriber, receiver) = Subscriber::new(privileged, environment.is_none());
        let id = subscriber.id();
        if !env.queue_subscriber(subscriber, &state.overrides, state.paused) {
            return None;
        }

        Some(Subscription {
            id,
            environment: index,
            receiver,
        })
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        let state = self.state.read().await;
        for env in &state.environments {
            if let Some(streamer) = env.streamer() {
                if streamer.remove_subscriber(id).await {
                    debug!(subscriber = id, "subscriber removed");
                }
            }
        }
    }

    // ── Client metrics ──────────────────────────────────────────

    /// Starts buffering client metrics. The buffer is sent every minute and
    /// once more when `shutdown` fires.
    pub fn start_metrics(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> (MetricsSink, JoinHandle<()>) {
        let (sink, rx) = MetricsSink::channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_metrics(rx, shutdown).await });
        (sink, handle)
    }

    async fn run_metrics(self: Arc<Self>, mut rx: mpsc::Receiver<Collected>, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = MetricsBuffer::default();
        let mut interval = tokio::time::interval_at(Instant::now() + METRICS_INTERVAL, METRICS_INTERVAL);

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => buffer.push(item),
                    None => break,
                },
                _ = interval.tick() => self.send_metrics(&mut buffer).await,
                _ = shutdown.changed() => break,
            }
        }

        while let Ok(item) = rx.try_recv() {
            buffer.push(item);
        }
        if tokio::time::timeout(METRICS_FLUSH_TIMEOUT, self.send_metrics(&mut buffer))
            .await
            .is_err()
        {
            warn!("final metrics flush timed out");
        }
    }

    async fn send_metrics(&self, buffer: &mut MetricsBuffer) {
        if buffer.is_empty() {
            debug!("no metrics to send");
            return;
        }
        let Some(token) = self.active_token().await else {
            return;
        };

        debug!("sending metrics");
        let bulk = buffer.to_bulk(&self.instance_id);
        match self.upstream.bulk_metrics(&token, &bulk).await {
            Ok(()) => buffer.clear(),
            Err(e) => error!(error = %e, "failed to send metrics to upstream"),
        }
    }

    // ── Reads ───────────────────────────────────────────────────

    pub async fn cached_features(&self) -> CachedFeatures {
        let state = self.state.read().await;
        state
            .active()
            .map(|env| CachedFeatures {
                json: env.cached_json().to_string(),
                etag: env.etag().to_string(),
            })
            .unwrap_or_default()
    }

    pub async fn cached_json(&self) -> String {
        self.cached_features().await.json
    }

    pub async fn etag(&self) -> String {
        let state = self.state.read().await;
        state.active().map(|env| env.etag().to_string()).unwrap_or_default()
    }

    /// Compiled feature file of the active environment.
    pub async fn feature_file(&self) -> FeatureFile {
        let state = self.state.read().await;
        state.active().map(|env| env.compiled().clone()).unwrap_or_default()
    }

    /// Upstream feature file of the active environment, without overrides.
    pub async fn remote_feature_file(&self) -> FeatureFile {
        let state = self.state.read().await;
        state.active().map(|env| env.remote().clone()).unwrap_or_default()
    }

    pub async fn feature(&self, name: &str) -> Option<Feature> {
        let state = self.state.read().await;
        state.active()?.compiled().feature(name).cloned()
    }

    pub async fn resolve(&self, context: &EvalContext, name: &str) -> Option<EvaluatedToggle> {
        let state = self.state.read().await;
        state.active()?.engine().resolve(context, name)
    }

    pub async fn resolve_all(&self, context: &EvalContext, include_all: bool) -> Vec<EvaluatedToggle> {
        let state = self.state.read().await;
        state
            .active()
            .map(|env| env.engine().resolve_all(context, include_all))
            .unwrap_or_default()
    }

    pub async fn overrides(&self) -> Overrides {
        self.state.read().await.overrides.clone()
    }

    /// `Some(enabled)` when the feature has an override.
    pub async fn has_override(&self, key: &str) -> Option<bool> {
        self.state.read().await.overrides.get(key).map(|o| o.enabled)
    }

    pub async fn get_override(&self, key: &str) -> Option<Override> {
        self.state.read().await.overrides.get(key).cloned()
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.paused
    }

    pub async fn active_environment_index(&self) -> usize {
        self.state.read().await.active
    }

    pub async fn active_token(&self) -> Option<String> {
        let state = self.state.read().await;
        state.active().map(|env| env.token().to_string())
    }

    /// Environment label of every configured token, in index order.
    pub async fn remotes(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.environments.iter().map(|e| e.name().to_string()).collect()
    }

    /// Index of the environment configured with `token`, if any.
    pub async fn environment_for_token(&self, token: &str) -> Option<usize> {
        let state = self.state.read().await;
        state.environments.iter().position(|e| e.token() == token)
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_sync
    }
}
