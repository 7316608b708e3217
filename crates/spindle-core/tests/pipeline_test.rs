mod common;

use std::sync::Arc;

use serde_json::json;

use common::{ScriptedTask, build, build_with, config, dyn_task};
use spindle_core::app::{App, EngineBuilder, PollerConfig};
use spindle_core::domain::{
    Outcome, PipelineDefinition, StageState, TaskError, TaskState, TaskType,
};
use spindle_core::impls::InMemoryStore;
use spindle_core::ports::TaskStore;

fn pipeline() -> Arc<PipelineDefinition> {
    Arc::new(PipelineDefinition::new("sectors_test", &["sdr", "trees"]).unwrap())
}

fn sdr_task(pipeline: &Arc<PipelineDefinition>) -> Arc<ScriptedTask> {
    Arc::new(
        ScriptedTask::new("SDR")
            .for_stage(pipeline, "sdr")
            .always(Ok(Outcome::done().with_output(json!({ "ticket": "abc" })))),
    )
}

fn trees_task(pipeline: &Arc<PipelineDefinition>) -> Arc<ScriptedTask> {
    Arc::new(ScriptedTask::new("Trees").for_stage(pipeline, "trees"))
}

async fn finish_first_stage(app: &App) {
    assert_eq!(app.poller.poll_once().await.unwrap(), 1);
    assert_eq!(app.engine.poll_once().await.unwrap(), 1);
    app.engine.wait_idle().await;
}

#[tokio::test]
async fn finished_stage_yields_exactly_one_next_task() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    let a = build(
        store.clone(),
        vec![dyn_task(&sdr_task(&pipeline)), dyn_task(&trees_task(&pipeline))],
    )
    .await;
    let b = build(
        store.clone(),
        vec![dyn_task(&sdr_task(&pipeline)), dyn_task(&trees_task(&pipeline))],
    )
    .await;

    store
        .insert_entity(&pipeline, "1000-1", json!({ "sp_id": 1000 }))
        .await
        .unwrap();
    finish_first_stage(&a).await;

    let (created_a, created_b) = tokio::join!(a.poller.poll_once(), b.poller.poll_once());
    assert_eq!(created_a.unwrap() + created_b.unwrap(), 1);

    // a later pass finds nothing left to create
    assert_eq!(b.poller.poll_once().await.unwrap(), 0);

    let entity = store.entity(&pipeline, "1000-1").await.unwrap().unwrap();
    assert_eq!(
        entity.stage_states(),
        vec![StageState::Done, StageState::Running]
    );
    let trees_id = entity.stages[1].task_id.unwrap();
    let record = store.get_task(trees_id).await.unwrap().unwrap();
    assert_eq!(record.task_type, TaskType::new("Trees"));
    assert_eq!(record.state, TaskState::Queued);
    assert_eq!(store.counts_by_state().await.unwrap().queued, 1);
}

#[tokio::test]
async fn concurrent_enqueue_creates_one_task() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    store.ensure_pipeline(&pipeline).await.unwrap();
    store.insert_entity(&pipeline, "e1", json!({})).await.unwrap();

    let mut joins = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let pipeline = pipeline.clone();
        joins.push(tokio::spawn(async move {
            store
                .enqueue_stage(&pipeline, "e1", "sdr", &TaskType::new("SDR"))
                .await
                .unwrap()
        }));
    }
    let mut created = Vec::new();
    for join in joins {
        created.extend(join.await.unwrap());
    }
    assert_eq!(created.len(), 1);

    // the next stage is still blocked
    let blocked = store
        .enqueue_stage(&pipeline, "e1", "trees", &TaskType::new("Trees"))
        .await
        .unwrap();
    assert!(blocked.is_none());
}

#[tokio::test]
async fn stage_output_is_merged_into_the_payload() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    let app = build(store.clone(), vec![dyn_task(&sdr_task(&pipeline))]).await;

    store
        .insert_entity(&pipeline, "1000-2", json!({ "sp_id": 1000, "sector_number": 2 }))
        .await
        .unwrap();
    finish_first_stage(&app).await;

    let entity = store.entity(&pipeline, "1000-2").await.unwrap().unwrap();
    assert_eq!(
        entity.payload,
        json!({ "sp_id": 1000, "sector_number": 2, "ticket": "abc" })
    );
}

#[tokio::test]
async fn stage_without_local_type_is_left_for_other_engines() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    let sdr_only = build(store.clone(), vec![dyn_task(&sdr_task(&pipeline))]).await;

    store.insert_entity(&pipeline, "e1", json!({})).await.unwrap();
    common::drain(&sdr_only).await;

    let entity = store.entity(&pipeline, "e1").await.unwrap().unwrap();
    assert_eq!(entity.stage_states(), vec![StageState::Done, StageState::Ready]);

    let trees_only = build(store.clone(), vec![dyn_task(&trees_task(&pipeline))]).await;
    common::drain(&trees_only).await;

    let entity = store.entity(&pipeline, "e1").await.unwrap().unwrap();
    assert!(entity.is_finished());
}

#[tokio::test]
async fn stages_run_elsewhere_do_not_fill_the_poll_batch() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    let sdr_only = build(store.clone(), vec![dyn_task(&sdr_task(&pipeline))]).await;
    let trees_only = build_with(
        EngineBuilder::new(store.clone(), config()).poller_config(PollerConfig {
            batch_size: 2,
            ..PollerConfig::default()
        }),
        vec![dyn_task(&trees_task(&pipeline))],
    )
    .await;

    // older entities still waiting on sdr, more than one batch of them
    for key in ["a1", "a2", "a3"] {
        store.insert_entity(&pipeline, key, json!({})).await.unwrap();
    }
    store.insert_entity(&pipeline, "z", json!({})).await.unwrap();
    store
        .enqueue_stage(&pipeline, "z", "sdr", &TaskType::new("SDR"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sdr_only.engine.poll_once().await.unwrap(), 1);
    sdr_only.engine.wait_idle().await;

    assert_eq!(trees_only.poller.poll_once().await.unwrap(), 1);
    let entity = store.entity(&pipeline, "z").await.unwrap().unwrap();
    assert_eq!(
        entity.stage_states(),
        vec![StageState::Done, StageState::Running]
    );
    let waiting = store.entity(&pipeline, "a1").await.unwrap().unwrap();
    assert_eq!(
        waiting.stage_states(),
        vec![StageState::Ready, StageState::Blocked]
    );
}

#[tokio::test]
async fn dead_stage_halts_the_entity() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    let failing_sdr = Arc::new(
        ScriptedTask::new("SDR")
            .for_stage(&pipeline, "sdr")
            .always(Err(TaskError::permanent("corrupt layers"))),
    );
    let app = build(
        store.clone(),
        vec![dyn_task(&failing_sdr), dyn_task(&trees_task(&pipeline))],
    )
    .await;

    store.insert_entity(&pipeline, "e1", json!({})).await.unwrap();
    common::drain(&app).await;

    let entity = store.entity(&pipeline, "e1").await.unwrap().unwrap();
    let sdr_id = entity.stages[0].task_id.unwrap();
    assert_eq!(
        store.get_task(sdr_id).await.unwrap().unwrap().state,
        TaskState::Dead
    );
    assert_eq!(
        entity.stage_states(),
        vec![StageState::Running, StageState::Blocked]
    );
    assert_eq!(app.poller.poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn whole_pipeline_runs_to_the_end() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = pipeline();
    let app = build(
        store.clone(),
        vec![dyn_task(&sdr_task(&pipeline)), dyn_task(&trees_task(&pipeline))],
    )
    .await;

    for n in 0..5 {
        store
            .insert_entity(&pipeline, &format!("1000-{n}"), json!({}))
            .await
            .unwrap();
    }
    common::drain(&app).await;

    let entities = store.list_entities(&pipeline, 10).await.unwrap();
    assert_eq!(entities.len(), 5);
    assert!(entities.iter().all(|e| e.is_finished()));
    assert_eq!(store.counts_by_state().await.unwrap().succeeded, 10);
}
