mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use ulid::Ulid;

use common::{ScriptedTask, build_with, capacity, config, dyn_task};
use spindle_core::app::{App, EngineBuilder};
use spindle_core::domain::{EngineId, EngineRecord, TaskState};
use spindle_core::impls::{InMemoryStore, RecordingEventSink};
use spindle_core::ports::{Clock, FixedClock, TaskStore};

struct Harness {
    clock: Arc<FixedClock>,
    store: Arc<InMemoryStore>,
    events: Arc<RecordingEventSink>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        Self {
            store: Arc::new(InMemoryStore::with_clock(clock.clone())),
            events: Arc::new(RecordingEventSink::new()),
            clock,
        }
    }

    async fn app(&self, task: Arc<ScriptedTask>) -> App {
        build_with(
            EngineBuilder::new(self.store.clone(), config())
                .clock(self.clock.clone())
                .event_sink(self.events.clone()),
            vec![dyn_task(&task)],
        )
        .await
    }
}

#[tokio::test]
async fn crashed_engine_claims_are_returned_without_a_failure() {
    let h = Harness::new();
    let survivor = h.app(Arc::new(ScriptedTask::new("Work"))).await;
    let task_id = survivor
        .engine
        .add_task("Work")
        .unwrap()
        .create(json!({}))
        .await
        .unwrap();

    // an engine that claims the task and then disappears
    let crashed = EngineId::from_ulid(Ulid::new());
    h.store
        .upsert_engine(&EngineRecord {
            id: crashed,
            host: "gone".to_string(),
            capacity: capacity(),
            last_contact: h.clock.now(),
        })
        .await
        .unwrap();
    assert_eq!(h.store.claim(&[task_id], crashed).await.unwrap(), vec![task_id]);

    // nothing to reap while the lease is fresh
    assert!(survivor.reaper.reap_once().await.unwrap().is_empty());
    assert_eq!(survivor.engine.poll_once().await.unwrap(), 0);

    h.clock.advance(Duration::seconds(120));
    survivor.engine.heartbeat().await.unwrap();
    assert_eq!(survivor.reaper.reap_once().await.unwrap(), vec![task_id]);
    assert_eq!(h.events.count("lease_expired"), 1);

    let record = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Queued);
    assert_eq!(record.failures, 0);
    assert!(record.owner.is_none());

    common::drain(&survivor).await;
    let record = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.failures, 0);
}

#[tokio::test]
async fn heartbeating_engine_keeps_its_tasks() {
    let h = Harness::new();
    let gate = Arc::new(Semaphore::new(0));
    let app = h.app(Arc::new(ScriptedTask::new("Slow").gated(&gate))).await;
    let task_id = app
        .engine
        .add_task("Slow")
        .unwrap()
        .create(json!({}))
        .await
        .unwrap();

    assert_eq!(app.engine.poll_once().await.unwrap(), 1);
    for _ in 0..5 {
        h.clock.advance(Duration::seconds(30));
        app.engine.heartbeat().await.unwrap();
        assert!(app.reaper.reap_once().await.unwrap().is_empty());
    }

    let record = h.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Running);
    assert!(record.is_owned_by(app.engine.id()));

    gate.add_permits(1);
    app.engine.wait_idle().await;
    assert_eq!(
        h.store.get_task(task_id).await.unwrap().unwrap().state,
        TaskState::Succeeded
    );
    assert_eq!(h.events.count("lease_expired"), 0);
}

#[tokio::test]
async fn released_claims_are_visible_to_other_engines_at_once() {
    let h = Harness::new();
    let picky = h
        .app(Arc::new(ScriptedTask::new("Move").declining()))
        .await;
    let task_id = picky
        .engine
        .add_task("Move")
        .unwrap()
        .create(json!({}))
        .await
        .unwrap();

    assert_eq!(picky.engine.poll_once().await.unwrap(), 0);
    assert_eq!(
        h.store.unclaimed(&"Move".into(), 10).await.unwrap(),
        vec![task_id]
    );
}

#[tokio::test]
async fn draining_engine_keeps_its_lease_until_work_finishes() {
    let store = Arc::new(InMemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let slow = Arc::new(ScriptedTask::new("Slow").gated(&gate));
    let app = build_with(
        EngineBuilder::new(
            store.clone(),
            config().with_heartbeat_interval(StdDuration::from_millis(50)),
        ),
        vec![dyn_task(&slow)],
    )
    .await;
    let engine_id = app.engine.id();
    let runtime = app.start();

    let task_id = runtime
        .engine()
        .add_task("Slow")
        .unwrap()
        .create(json!({}))
        .await
        .unwrap();
    let started = tokio::time::timeout(StdDuration::from_secs(5), async {
        while slow.runs_of(task_id) == 0 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await;
    assert!(started.is_ok());

    // shutdown requested while the task is still inside do_task
    runtime.request_shutdown();
    tokio::time::sleep(StdDuration::from_millis(600)).await;
    assert!(
        store
            .reap_expired(StdDuration::from_millis(300))
            .await
            .unwrap()
            .is_empty()
    );
    let record = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Running);
    assert!(record.is_owned_by(engine_id));

    gate.add_permits(1);
    tokio::time::timeout(StdDuration::from_secs(5), runtime.shutdown_and_join())
        .await
        .unwrap();
    let record = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(record.failures, 0);
    assert_eq!(slow.runs_of(task_id), 1);
}
