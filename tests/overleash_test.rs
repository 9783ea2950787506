use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use overleash_lib::compile::{compile, force_enable};
use overleash_lib::delta::{decode_events, Event};
use overleash_lib::metrics::{BulkMetrics, ClientData};
use overleash_lib::storage::{backup_key, MemoryStore, StoreNotification, OVERRIDES_KEY, PAUSED_KEY};
use overleash_lib::streamer::{SseEvent, CONNECTED_EVENT, UPDATED_EVENT};
use overleash_lib::token::EdgeToken;
use overleash_lib::upstream::StreamMessage;
use overleash_lib::{
    Constraint, Engine, Feature, FeatureFile, Overleash, OverleashConfig, OverleashError, Overrides, Segment,
    StaticEngine, Store, Strategy, Upstream, UpstreamError,
};
use tokio::sync::{mpsc, watch};

const DEV: &str = "*:development.secret";
const PROD: &str = "*:production.secret";

#[derive(Default)]
struct FakeUpstream {
    files: Mutex<HashMap<String, FeatureFile>>,
    fetches: AtomicUsize,
    registered: Mutex<Vec<String>>,
    bulk: Mutex<Vec<(String, BulkMetrics)>>,
    streams: Mutex<HashMap<String, mpsc::Sender<StreamMessage>>>,
}

impl FakeUpstream {
    fn with(files: &[(&str, FeatureFile)]) -> Arc<Self> {
        let upstream = Self::default();
        for (token, file) in files {
            upstream.set(token, file.clone());
        }
        Arc::new(upstream)
    }

    fn set(&self, token: &str, file: FeatureFile) {
        self.files.lock().unwrap().insert(token.to_string(), file);
    }

    fn stream(&self, token: &str) -> Option<mpsc::Sender<StreamMessage>> {
        self.streams.lock().unwrap().get(token).cloned()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn get_features(&self, token: &str) -> Result<FeatureFile, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| UpstreamError::Status {
                status: 401,
                url: "http://upstream/api/client/features".into(),
            })
    }

    async fn register_client(&self, token: &EdgeToken) -> Result<(), UpstreamError> {
        self.registered.lock().unwrap().push(token.environment.clone());
        Ok(())
    }

    async fn stream_features(
        &self,
        token: &str,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<StreamMessage>, UpstreamError> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().insert(token.to_string(), tx);
        Ok(rx)
    }

    async fn bulk_metrics(&self, token: &str, metrics: &BulkMetrics) -> Result<(), UpstreamError> {
        self.bulk
            .lock()
            .unwrap()
            .push((token.to_string(), metrics.clone()));
        Ok(())
    }
}

fn feature_with_strategy(name: &str, enabled: bool) -> Feature {
    let mut feature = Feature::new(name, enabled);
    feature.strategies.push(Strategy {
        name: "userWithId".into(),
        ..Default::default()
    });
    feature
}

fn remote() -> FeatureFile {
    FeatureFile {
        version: 2,
        features: vec![Feature::new("beta", false), feature_with_strategy("checkout", true)],
        segments: vec![Segment {
            id: 7,
            name: Some("eu".into()),
            constraints: vec![],
        }],
        ..Default::default()
    }
}

fn coordinator(
    tokens: &[&str],
    upstream: Arc<FakeUpstream>,
    store: Arc<dyn Store>,
    config: OverleashConfig,
) -> Arc<Overleash> {
    Arc::new(Overleash::new(
        tokens.iter().map(|t| t.to_string()).collect(),
        upstream,
        store,
        || Box::new(StaticEngine::new()) as Box<dyn Engine>,
        config,
    ))
}

fn streaming() -> OverleashConfig {
    OverleashConfig {
        streamer: true,
        ..Default::default()
    }
}

fn shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn next_event(rx: &mut mpsc::Receiver<SseEvent>) -> SseEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscriber channel closed")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_global_override_end_to_end() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let store = Arc::new(MemoryStore::new());
    let o = coordinator(&[DEV], upstream, store.clone(), OverleashConfig::default());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    let original_etag = o.etag().await;
    o.add_override("beta", true).await;

    let beta = o.feature("beta").await.unwrap();
    assert!(beta.enabled);
    assert_eq!(beta.strategies, vec![force_enable()]);
    assert_ne!(o.etag().await, original_etag);
    assert_eq!(o.has_override("beta").await, Some(true));

    let persisted: Overrides = serde_json::from_slice(&store.read(OVERRIDES_KEY).await.unwrap()).unwrap();
    assert!(persisted["beta"].is_global);

    // Pausing reverts to the upstream state without deleting the override.
    o.set_paused(true).await;
    assert!(!o.feature("beta").await.unwrap().enabled);
    assert_eq!(o.etag().await, original_etag);
    assert!(o.get_override("beta").await.is_some());
    assert_eq!(store.read(PAUSED_KEY).await.unwrap(), b"true".to_vec());

    o.set_paused(false).await;
    assert!(o.feature("beta").await.unwrap().enabled);

    o.delete_override("beta").await;
    assert_eq!(o.etag().await, original_etag);
    assert_eq!(o.has_override("beta").await, None);
}

#[tokio::test]
async fn test_disable_override_keeps_strategies() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream, Arc::new(MemoryStore::new()), OverleashConfig::default());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    o.add_override("checkout", false).await;
    let checkout = o.feature("checkout").await.unwrap();
    assert!(!checkout.enabled);
    assert_eq!(checkout.strategies, remote().feature("checkout").unwrap().strategies);
    assert!(o.remote_feature_file().await.feature("checkout").unwrap().enabled);
}

#[tokio::test]
async fn test_constraint_replaces_global_override() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream, Arc::new(MemoryStore::new()), OverleashConfig::default());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    o.add_override("checkout", true).await;
    let constraint = Constraint {
        context_name: "userId".into(),
        operator: "IN".into(),
        values: vec!["42".into()],
        ..Default::default()
    };
    o.add_override_constraint("checkout", true, constraint.clone()).await;
    o.add_override_constraint("checkout", false, constraint.clone()).await;

    let o_checkout = o.get_override("checkout").await.unwrap();
    assert!(!o_checkout.is_global);
    assert_eq!(o_checkout.constraints.len(), 2);

    let checkout = o.feature("checkout").await.unwrap();
    assert_eq!(checkout.strategies.len(), 2);
    assert_eq!(checkout.strategies[0].constraints.len(), 1);
    assert!(checkout.strategies[0].constraints[0].inverted);
    assert_eq!(checkout.strategies[1].constraints, vec![constraint]);

    o.delete_all_overrides().await;
    assert!(o.overrides().await.is_empty());
}

#[tokio::test]
async fn test_persisted_overrides_are_loaded() {
    let store = Arc::new(MemoryStore::new());
    store
        .write(
            OVERRIDES_KEY,
            br#"{"beta":{"FeatureFlag":"beta","Enabled":true,"IsGlobal":true,"Constraints":null}}"#,
        )
        .await
        .unwrap();

    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream, store, OverleashConfig::default());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    assert!(o.feature("beta").await.unwrap().enabled);
    assert!(!o.is_paused().await);
}

#[tokio::test]
async fn test_partial_fetch_failure() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV, PROD], upstream.clone(), Arc::new(MemoryStore::new()), OverleashConfig::default());
    let (_tx, rx) = shutdown();

    match o.start(rx).await {
        Err(OverleashError::Fetch(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].environment, "*:production");
        }
        other => panic!("expected fetch failure, got {:?}", other),
    }

    assert_eq!(o.feature_file().await.features.len(), 2);
    assert!(o.last_sync().await.is_some());
    assert_eq!(o.remotes().await, vec!["*:development".to_string(), "*:production".to_string()]);

    o.set_active_environment(1).await.unwrap();
    assert!(o.feature_file().await.features.is_empty());
    assert_eq!(o.active_token().await.as_deref(), Some(PROD));

    // Once upstream recovers the environment is filled in.
    upstream.set(PROD, remote());
    o.refresh_feature_files().await.unwrap();
    assert_eq!(o.feature_file().await.features.len(), 2);
}

#[tokio::test]
async fn test_invalid_environment_index() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream, Arc::new(MemoryStore::new()), OverleashConfig::default());

    let err = o.set_active_environment(3).await.unwrap_err();
    assert!(matches!(err, OverleashError::InvalidEnvironmentIndex { index: 3, count: 1 }));
    assert_eq!(o.active_environment_index().await, 0);
}

#[tokio::test]
async fn test_backup_served_when_upstream_down() {
    let store = Arc::new(MemoryStore::new());
    let first = coordinator(&[DEV], FakeUpstream::with(&[(DEV, remote())]), store.clone(), OverleashConfig::default());
    let (_tx, rx) = shutdown();
    first.start(rx.clone()).await.unwrap();
    assert!(store.read(&backup_key(0)).await.is_ok());

    let second = coordinator(&[DEV], FakeUpstream::with(&[]), store, OverleashConfig::default());
    assert!(second.start(rx).await.is_err());
    assert_eq!(second.feature_file().await.features.len(), 2);
    assert!(second.last_sync().await.is_none());
}

#[tokio::test]
async fn test_register_clients_at_startup() {
    let upstream = FakeUpstream::with(&[(DEV, remote()), (PROD, remote())]);
    let config = OverleashConfig {
        register: true,
        ..Default::default()
    };
    let o = coordinator(&[DEV, PROD], upstream.clone(), Arc::new(MemoryStore::new()), config);
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    assert_eq!(
        *upstream.registered.lock().unwrap(),
        vec!["development".to_string(), "production".to_string()]
    );
}

#[tokio::test]
async fn test_subscriber_receives_override_updates() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream, Arc::new(MemoryStore::new()), streaming());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    let mut plain = o.subscribe(None, false).await.unwrap();
    let mut privileged = o.subscribe(None, true).await.unwrap();

    let connect = next_event(&mut plain.receiver).await;
    assert_eq!(connect.event, CONNECTED_EVENT);
    let connect = next_event(&mut privileged.receiver).await;
    assert_eq!(decode_events(&connect.data).unwrap().len(), 2);

    o.add_override("beta", true).await;

    let update = next_event(&mut plain.receiver).await;
    assert_eq!(update.event, UPDATED_EVENT);
    let events = decode_events(&update.data).unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::FeatureUpdated {
            feature,
            original_feature,
            ..
        } => {
            assert_eq!(feature.name, "beta");
            assert!(feature.enabled);
            assert!(!original_feature.as_ref().unwrap().enabled);
        }
        other => panic!("unexpected {:?}", other),
    }

    // Privileged subscribers see the diff, then the override state.
    next_event(&mut privileged.receiver).await;
    let control = next_event(&mut privileged.receiver).await;
    assert!(control.overleash_event);
    assert!(matches!(
        &decode_events(&control.data).unwrap()[0],
        Event::HydrationOverleash { overrides, paused: false, .. } if overrides.contains_key("beta")
    ));

    // Ordinary subscribers never see override state.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(plain.receiver.try_recv().is_err());

    o.unsubscribe(plain.id).await;
    o.unsubscribe(plain.id).await;
}

#[tokio::test]
async fn test_removed_segment_is_streamed() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream.clone(), Arc::new(MemoryStore::new()), streaming());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    let mut sub = o.subscribe(Some(0), false).await.unwrap();
    next_event(&mut sub.receiver).await;

    let mut without_segment = remote();
    without_segment.segments.clear();
    upstream.set(DEV, without_segment);
    o.refresh_feature_files().await.unwrap();

    let events = decode_events(&next_event(&mut sub.receiver).await.data).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Event::SegmentRemoved { segment_id: 7, .. }));
}

#[tokio::test]
async fn test_refresh_without_changes_streams_nothing() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream.clone(), Arc::new(MemoryStore::new()), streaming());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    let mut sub = o.subscribe(None, false).await.unwrap();
    next_event(&mut sub.receiver).await;

    o.refresh_feature_files().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sub.receiver.try_recv().is_err());
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_followers_move_with_active_environment() {
    let mut prod = remote();
    prod.features.push(Feature::new("prod-only", true));
    let upstream = FakeUpstream::with(&[(DEV, remote()), (PROD, prod)]);
    let o = coordinator(&[DEV, PROD], upstream, Arc::new(MemoryStore::new()), streaming());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    let mut follower = o.subscribe(None, false).await.unwrap();
    let mut pinned = o.subscribe(Some(0), false).await.unwrap();
    next_event(&mut follower.receiver).await;
    next_event(&mut pinned.receiver).await;

    o.set_active_environment(1).await.unwrap();

    let rehydrate = next_event(&mut follower.receiver).await;
    assert_eq!(rehydrate.event, CONNECTED_EVENT);
    match &decode_events(&rehydrate.data).unwrap()[0] {
        Event::Hydration { features, .. } => assert_eq!(features.len(), 3),
        other => panic!("unexpected {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pinned.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_replicated_overrides_are_not_persisted_again() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let store = Arc::new(MemoryStore::new());
    let o = coordinator(&[DEV], upstream, store.clone(), OverleashConfig {
        backup: false,
        ..Default::default()
    });
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    let mut overrides = Overrides::new();
    overrides.insert("beta".into(), overleash_lib::Override::global("beta", true));
    o.apply_store_notification(StoreNotification {
        key: OVERRIDES_KEY.into(),
        data: serde_json::to_vec(&overrides).unwrap(),
    })
    .await;
    o.apply_store_notification(StoreNotification {
        key: PAUSED_KEY.into(),
        data: b"false".to_vec(),
    })
    .await;

    assert!(o.feature("beta").await.unwrap().enabled);
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn test_upstream_deltas_are_applied() {
    let upstream = FakeUpstream::with(&[(DEV, remote()), (PROD, remote())]);
    let config = OverleashConfig {
        delta: true,
        ..Default::default()
    };
    let o = coordinator(&[DEV, PROD], upstream.clone(), Arc::new(MemoryStore::new()), config);
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    eventually(|| {
        let upstream = upstream.clone();
        async move { upstream.stream(DEV).is_some() && upstream.stream(PROD).is_some() }
    })
    .await;

    let data = serde_json::json!({"events": [
        {"type": "feature-updated", "eventId": 10, "feature": {"name": "beta", "enabled": true}},
        {"type": "segment-removed", "eventId": 11, "segmentId": 7},
        {"type": "hydration-overleash", "eventId": 12, "overrides": {
            "checkout": {"featureFlag": "checkout", "enabled": false, "isGlobal": true, "constraints": []}
        }, "paused": false}
    ]})
    .to_string();
    let dev = upstream.stream(DEV).unwrap();
    dev.send(StreamMessage {
        event: UPDATED_EVENT.into(),
        data,
    })
    .await
    .unwrap();

    eventually(|| {
        let o = o.clone();
        async move { o.remote_feature_file().await.feature("beta").map(|f| f.enabled) == Some(true) }
    })
    .await;
    assert!(o.remote_feature_file().await.segments.is_empty());
    assert!(!o.feature("checkout").await.unwrap().enabled);

    // Override state on a secondary stream is ignored.
    let prod = upstream.stream(PROD).unwrap();
    prod.send(StreamMessage {
        event: UPDATED_EVENT.into(),
        data: r#"{"events":[{"type":"hydration-overleash","eventId":1,"overrides":{},"paused":true}]}"#.into(),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!o.is_paused().await);
    assert!(o.has_override("checkout").await.is_some());
}

#[tokio::test]
async fn test_metrics_flushed_on_shutdown() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream.clone(), Arc::new(MemoryStore::new()), OverleashConfig::default());
    let (tx, rx) = shutdown();
    o.start(rx.clone()).await.unwrap();

    let (sink, handle) = o.start_metrics(rx);
    sink.record_client(ClientData {
        app_name: "web".into(),
        instance_id: "i-1".into(),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tx.send(true).unwrap();
    handle.await.unwrap();

    let bulk = upstream.bulk.lock().unwrap();
    assert_eq!(bulk.len(), 1);
    assert_eq!(bulk[0].0, DEV);
    assert_eq!(bulk[0].1.applications[0].client.app_name, "web");
}

#[tokio::test]
async fn test_empty_metrics_are_not_sent() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream.clone(), Arc::new(MemoryStore::new()), OverleashConfig::default());
    let (tx, rx) = shutdown();

    let (_sink, handle) = o.start_metrics(rx);
    tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(upstream.bulk.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_triggers_single_refresh() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream.clone(), Arc::new(MemoryStore::new()), OverleashConfig::default());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 1);

    o.webhook_received();
    o.webhook_received();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_follower_moves_with_immediate_switch() {
    let mut prod = remote();
    prod.features.push(Feature::new("prod-only", true));

    for _ in 0..200 {
        let upstream = FakeUpstream::with(&[(DEV, remote()), (PROD, prod.clone())]);
        let o = coordinator(&[DEV, PROD], upstream, Arc::new(MemoryStore::new()), streaming());
        let (_tx, rx) = shutdown();
        o.start(rx).await.unwrap();

        let mut follower = o.subscribe(None, false).await.unwrap();
        o.set_active_environment(1).await.unwrap();

        assert_eq!(next_event(&mut follower.receiver).await.event, CONNECTED_EVENT);
        let moved = next_event(&mut follower.receiver).await;
        assert_eq!(moved.event, CONNECTED_EVENT);
        match &decode_events(&moved.data).unwrap()[0] {
            Event::Hydration { features, .. } => {
                assert!(features.iter().any(|f| f.name == "prod-only"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

/// Answers the first fetch slowly, every later one at once. Each answer
/// carries the call number as its version.
#[derive(Default)]
struct SlowFirstUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl Upstream for SlowFirstUpstream {
    async fn get_features(&self, _token: &str) -> Result<FeatureFile, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(FeatureFile {
            version: call as i64,
            ..remote()
        })
    }

    async fn register_client(&self, _token: &EdgeToken) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn stream_features(
        &self,
        _token: &str,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<StreamMessage>, UpstreamError> {
        Ok(mpsc::channel(1).1)
    }

    async fn bulk_metrics(&self, _token: &str, _metrics: &BulkMetrics) -> Result<(), UpstreamError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_overlapping_refreshes_keep_newest_fetch() {
    let upstream = Arc::new(SlowFirstUpstream::default());
    let o = Arc::new(Overleash::new(
        vec![DEV.to_string()],
        upstream.clone(),
        Arc::new(MemoryStore::new()),
        || Box::new(StaticEngine::new()) as Box<dyn Engine>,
        OverleashConfig::default(),
    ));

    let slow = {
        let o = Arc::clone(&o);
        tokio::spawn(async move { o.refresh_feature_files().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    o.refresh_feature_files().await.unwrap();
    slow.await.unwrap().unwrap();

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    assert_eq!(o.feature_file().await.version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_refresh_restarts_polling_period() {
    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream.clone(), Arc::new(MemoryStore::new()), OverleashConfig {
        reload: Duration::from_secs(10),
        ..Default::default()
    });
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    o.refresh_feature_files().await.unwrap();
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);

    // 11s: the tick that was due at 10s has been pushed back
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);

    // 17s: one full period after the manual refresh
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unreadable_pause_flag_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    store.write(PAUSED_KEY, b"maybe").await.unwrap();
    store
        .write(
            OVERRIDES_KEY,
            br#"{"beta":{"FeatureFlag":"beta","Enabled":true,"IsGlobal":true,"Constraints":null}}"#,
        )
        .await
        .unwrap();

    let upstream = FakeUpstream::with(&[(DEV, remote())]);
    let o = coordinator(&[DEV], upstream, store, OverleashConfig::default());
    let (_tx, rx) = shutdown();
    o.start(rx).await.unwrap();

    assert!(!o.is_paused().await);
    assert!(o.feature("beta").await.unwrap().enabled);
}

#[test]
fn test_paused_compile_matches_remote() {
    let mut overrides = Overrides::new();
    overrides.insert("beta".into(), overleash_lib::Override::global("beta", true));

    let paused = compile(&remote(), &overrides, true).unwrap();
    assert_eq!(paused.json, serde_json::to_string(&remote()).unwrap());
}
