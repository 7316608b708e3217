mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::{FakeSealCalls, RecordingSender, build};
use spindle_core::domain::{PipelineDefinition, StageState, TaskState};
use spindle_core::impls::InMemoryStore;
use spindle_core::ports::TaskStore;
use spindle_core::sealing::{
    FileType, LocalPathAllocator, LocalStorageInfo, MoveStorageTask, PathAllocator,
    PreCommitSendTask, SdrTask, SealProof, SectorRef, SendError, TreesTask, add_sector,
    sdr_pipeline,
};
use spindle_core::typed::{EngineHandle, TaskInterface};

struct Machine {
    dir: TempDir,
    calls: Arc<FakeSealCalls>,
    sender: Arc<RecordingSender>,
    pipeline: Arc<PipelineDefinition>,
}

impl Machine {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            calls: Arc::new(FakeSealCalls::default()),
            sender: Arc::new(RecordingSender::default()),
            pipeline: sdr_pipeline().unwrap(),
        }
    }

    fn root(&self, id: &str, can_seal: bool, can_store: bool) -> LocalStorageInfo {
        LocalStorageInfo {
            id: id.to_string(),
            root: self.dir.path().join(id),
            can_seal,
            can_store,
        }
    }

    fn allocator(&self, roots: Vec<LocalStorageInfo>) -> Arc<LocalPathAllocator> {
        Arc::new(LocalPathAllocator::new(roots))
    }

    fn tasks(&self, paths: Arc<LocalPathAllocator>) -> Vec<Arc<dyn TaskInterface>> {
        vec![
            Arc::new(SdrTask::new(
                self.pipeline.clone(),
                self.calls.clone(),
                paths.clone(),
                0,
            )),
            Arc::new(TreesTask::new(
                self.pipeline.clone(),
                self.calls.clone(),
                paths.clone(),
                0,
            )),
            Arc::new(PreCommitSendTask::new(
                self.pipeline.clone(),
                self.sender.clone(),
                0,
            )),
            Arc::new(MoveStorageTask::new(
                self.pipeline.clone(),
                self.calls.clone(),
                paths,
                0,
            )),
        ]
    }
}

fn sector(n: u64) -> SectorRef {
    SectorRef::new(1000, n, SealProof::StackedDrg2KiB)
}

async fn stage_task_state(store: &InMemoryStore, key: &str, stage: usize) -> TaskState {
    let pipeline = sdr_pipeline().unwrap();
    let entity = store.entity(&pipeline, key).await.unwrap().unwrap();
    let task_id = entity.stages[stage].task_id.unwrap();
    store.get_task(task_id).await.unwrap().unwrap().state
}

#[tokio::test]
async fn sector_goes_from_sdr_to_long_term_storage() {
    let m = Machine::new();
    let store = Arc::new(InMemoryStore::new());
    let paths = m.allocator(vec![m.root("seal", true, false), m.root("store", false, true)]);
    let app = build(store.clone(), m.tasks(paths.clone())).await;

    assert!(add_sector(store.as_ref(), &m.pipeline, &sector(1)).await.unwrap());
    assert!(!add_sector(store.as_ref(), &m.pipeline, &sector(1)).await.unwrap());
    common::drain(&app).await;

    let entity = store.entity(&m.pipeline, "1000-1").await.unwrap().unwrap();
    assert!(entity.is_finished());
    assert_eq!(entity.payload["comm_d"], json!("comm_d-1000-1"));
    assert_eq!(entity.payload["comm_r"], json!("comm_r-1000-1"));
    assert_eq!(entity.payload["precommit_msg_cid"], json!("bafy-1"));
    assert!(entity.payload["ticket"].as_str().is_some_and(|t| !t.is_empty()));

    for call in ["sdr", "tree_d", "tree_rc", "move_storage"] {
        assert_eq!(m.calls.count(call), 1, "{call}");
    }
    let sent = m.sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].sector, sector(1));
    assert_eq!(sent[0].comm_r, "comm_r-1000-1");

    let sealed_name = sector(1).to_string();
    assert!(m.dir.path().join("store/sealed").join(&sealed_name).exists());
    assert!(!m.dir.path().join("seal/sealed").join(&sealed_name).exists());
}

#[tokio::test]
async fn move_storage_waits_for_a_machine_with_storage() {
    let m = Machine::new();
    let store = Arc::new(InMemoryStore::new());

    // sealing-only machine runs everything but the move
    let seal_only = m.allocator(vec![m.root("seal", true, false)]);
    let sealer = build(store.clone(), m.tasks(seal_only)).await;
    add_sector(store.as_ref(), &m.pipeline, &sector(1)).await.unwrap();
    common::drain(&sealer).await;

    let entity = store.entity(&m.pipeline, "1000-1").await.unwrap().unwrap();
    assert_eq!(
        entity.stage_states(),
        vec![
            StageState::Done,
            StageState::Done,
            StageState::Done,
            StageState::Running
        ]
    );
    let move_id = entity.stages[3].task_id.unwrap();
    let record = store.get_task(move_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Queued);
    assert!(record.owner.is_none());
    assert_eq!(record.failures, 0);
    assert_eq!(m.calls.count("move_storage"), 0);

    // a machine that sees both roots picks it up
    let both = m.allocator(vec![m.root("seal", true, false), m.root("store", false, true)]);
    let mover = build(
        store.clone(),
        vec![Arc::new(MoveStorageTask::new(
            m.pipeline.clone(),
            m.calls.clone(),
            both,
            0,
        ))],
    )
    .await;
    common::drain(&mover).await;

    assert_eq!(
        stage_task_state(&store, "1000-1", 3).await,
        TaskState::Succeeded
    );
    assert_eq!(m.calls.count("move_storage"), 1);
}

#[tokio::test]
async fn trees_prefers_sectors_with_local_cache() {
    let m = Machine::new();
    let store = Arc::new(InMemoryStore::new());
    let paths = m.allocator(vec![m.root("seal", true, true)]);
    let sdr_only = build(
        store.clone(),
        vec![Arc::new(SdrTask::new(
            m.pipeline.clone(),
            m.calls.clone(),
            paths.clone(),
            0,
        ))],
    )
    .await;

    for n in 1..=2 {
        add_sector(store.as_ref(), &m.pipeline, &sector(n)).await.unwrap();
    }
    common::drain(&sdr_only).await;

    let mut trees_ids = Vec::new();
    for n in 1..=2 {
        let id = store
            .enqueue_stage(&m.pipeline, &sector(n).key(), "trees", &"SDRTrees".into())
            .await
            .unwrap()
            .unwrap();
        trees_ids.push(id);
    }

    // sector 1's layers were produced elsewhere
    std::fs::remove_dir_all(m.dir.path().join("seal/cache").join(sector(1).to_string())).unwrap();
    assert!(!paths.has_local(&sector(1), FileType::Cache));

    let trees = TreesTask::new(m.pipeline.clone(), m.calls.clone(), paths, 0);
    let store_dyn: Arc<dyn TaskStore> = store.clone();
    let handle = EngineHandle::new(
        sdr_only.engine.id(),
        "test",
        sdr_only.engine.ledger().snapshot(),
        store_dyn,
    );
    let accepted = trees.can_accept(&trees_ids, &handle).await.unwrap().unwrap();
    assert_eq!(accepted.task_id, trees_ids[1]);
}

#[tokio::test]
async fn rejected_precommit_is_not_retried() {
    let m = Machine::new();
    let store = Arc::new(InMemoryStore::new());
    *m.sender.fail_with.lock().unwrap() = Some(SendError::Rejected("bad ticket".to_string()));
    let paths = m.allocator(vec![m.root("seal", true, true)]);
    let app = build(store.clone(), m.tasks(paths)).await;

    add_sector(store.as_ref(), &m.pipeline, &sector(3)).await.unwrap();
    common::drain(&app).await;

    assert_eq!(
        stage_task_state(&store, "1000-3", 2).await,
        TaskState::Dead
    );
    let entity = store.entity(&m.pipeline, "1000-3").await.unwrap().unwrap();
    assert_eq!(entity.stage_states()[3], StageState::Blocked);
}
