//! End-to-end pipeline tests over the in-memory stores and broker.
//!
//! Each test claims a job the way the timer does, launches it into the
//! extraction queue, and drains the stage workers deterministically with
//! `process_next`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use sync_core::kernel::jobs::timer::JobLauncher;
use sync_core::JobStore;
use sync_core::kernel::pipeline::embed::{Embedder, EmbeddingHandler, VectorIndex};
use sync_core::kernel::pipeline::extract::{
    ExtractionHandler, SourceClient, SourceItem, SourcePage,
};
use sync_core::kernel::pipeline::transform::TransformHandler;
use sync_core::{
    EntityKind, InMemoryBroker, InMemoryJobStore, InMemoryUnitStore, JobStatus, PipelineLauncher,
    ServiceTier, StageMessage, StageType, StageWorker, StageWorkerConfig, StatusHub, SyncError,
    SyncJob, SyncKernel,
};

const COLLECTION: &str = "tracker_entities";

// ============================================================================
// Scripted external services
// ============================================================================

#[derive(Clone, Copy)]
enum Failure {
    Transient,
    RateLimited,
}

impl Failure {
    fn to_error(self) -> SyncError {
        match self {
            Failure::Transient => SyncError::Transient("injected".into()),
            Failure::RateLimited => SyncError::RateLimited("injected".into()),
        }
    }
}

/// Tracker API double scripted with pages keyed by cursor.
#[derive(Default)]
struct ScriptedSource {
    pages: Mutex<HashMap<Option<String>, SourcePage>>,
    details: Mutex<HashMap<String, serde_json::Value>>,
    fail_next_list: Mutex<Option<Failure>>,
    fail_detail_once: Mutex<HashMap<String, Failure>>,
    list_calls: AtomicUsize,
}

impl ScriptedSource {
    fn add_page(&self, cursor: Option<&str>, ids: &[&str], next_cursor: Option<&str>) {
        let page = SourcePage {
            items: ids
                .iter()
                .map(|id| SourceItem {
                    external_id: id.to_string(),
                    entity_kind: EntityKind::Issue,
                })
                .collect(),
            next_cursor: next_cursor.map(str::to_owned),
        };
        self.pages
            .lock()
            .unwrap()
            .insert(cursor.map(str::to_owned), page);
        for id in ids {
            self.details.lock().unwrap().insert(
                id.to_string(),
                serde_json::json!({"title": format!("title of {id}"), "description": "body"}),
            );
        }
    }

    fn remove_detail(&self, id: &str) {
        self.details.lock().unwrap().remove(id);
    }

    fn fail_next_list(&self, failure: Failure) {
        *self.fail_next_list.lock().unwrap() = Some(failure);
    }

    fn fail_detail_once(&self, id: &str, failure: Failure) {
        self.fail_detail_once
            .lock()
            .unwrap()
            .insert(id.to_string(), failure);
    }

    fn list_call_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SourceClient for ScriptedSource {
    async fn list(
        &self,
        _since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<SourcePage, SyncError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.fail_next_list.lock().unwrap().take() {
            return Err(failure.to_error());
        }
        self.pages
            .lock()
            .unwrap()
            .get(&cursor.map(str::to_owned))
            .cloned()
            .ok_or_else(|| SyncError::Transient(format!("no scripted page for {cursor:?}")))
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<serde_json::Value, SyncError> {
        if let Some(failure) = self.fail_detail_once.lock().unwrap().remove(external_id) {
            return Err(failure.to_error());
        }
        self.details
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(external_id.to_string()))
    }
}

struct StubEmbedder;

#[async_trait::async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SyncError> {
        Ok(vec![text.len() as f32, 1.0])
    }
}

#[derive(Default)]
struct RecordingIndex {
    points: Mutex<HashMap<Uuid, serde_json::Value>>,
    fail_next: Mutex<Option<Failure>>,
}

impl RecordingIndex {
    fn fail_next(&self, failure: Failure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }
}

#[async_trait::async_trait]
impl VectorIndex for RecordingIndex {
    async fn upsert(
        &self,
        _collection: &str,
        point_id: Uuid,
        _vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<(), SyncError> {
        if let Some(failure) = self.fail_next.lock().unwrap().take() {
            return Err(failure.to_error());
        }
        self.points.lock().unwrap().insert(point_id, payload);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    store: Arc<InMemoryJobStore>,
    units: Arc<InMemoryUnitStore>,
    broker: Arc<InMemoryBroker>,
    source: Arc<ScriptedSource>,
    index: Arc<RecordingIndex>,
    kernel: SyncKernel,
    extraction: StageWorker,
    transform: StageWorker,
    embedding: StageWorker,
    job: SyncJob,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let units = Arc::new(InMemoryUnitStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let hub = Arc::new(StatusHub::new());
        let kernel = SyncKernel::new(
            store.clone(),
            units.clone(),
            broker.clone(),
            hub,
        );

        let source = Arc::new(ScriptedSource::default());
        let index = Arc::new(RecordingIndex::default());

        let extraction = StageWorker::new(
            kernel.clone(),
            Arc::new(ExtractionHandler::new(kernel.clone(), source.clone())),
            StageWorkerConfig::new(ServiceTier::Free, StageType::Extraction),
        );
        let transform = StageWorker::new(
            kernel.clone(),
            Arc::new(TransformHandler::new(kernel.clone())),
            StageWorkerConfig::new(ServiceTier::Free, StageType::Transform),
        );
        let embedding = StageWorker::new(
            kernel.clone(),
            Arc::new(EmbeddingHandler::new(
                kernel.clone(),
                Arc::new(StubEmbedder),
                index.clone(),
                COLLECTION,
            )),
            StageWorkerConfig::new(ServiceTier::Free, StageType::Embedding),
        );

        let job = SyncJob::builder()
            .tenant_id(Uuid::new_v4())
            .job_name("tracker sync")
            .build();
        store.insert_job(job.clone());

        Self {
            store,
            units,
            broker,
            source,
            index,
            kernel,
            extraction,
            transform,
            embedding,
            job,
        }
    }

    /// Claim and launch the job the way the timer does. Returns the run
    /// start timestamp recorded on the claim.
    async fn launch(&self) -> DateTime<Utc> {
        let started_at = Utc::now();
        assert!(
            self.store
                .try_mark_running(self.job.job_id, self.job.tenant_id, started_at)
                .await
                .unwrap(),
            "job should be claimable"
        );
        let job = self.store.get(self.job.job_id, self.job.tenant_id).unwrap();
        PipelineLauncher::new(self.kernel.clone())
            .launch(&job)
            .await
            .unwrap();
        started_at
    }

    /// Drain all three stage workers until every queue is empty.
    async fn drain(&self) {
        for _ in 0..1000 {
            let mut progressed = false;
            progressed |= self.extraction.process_next().await.unwrap();
            progressed |= self.transform.process_next().await.unwrap();
            progressed |= self.embedding.process_next().await.unwrap();
            if !progressed && self.broker.total_len() == 0 {
                return;
            }
        }
        panic!("pipeline did not drain");
    }

    async fn drain_stage(&self, worker: &StageWorker) {
        while worker.process_next().await.unwrap() {}
    }

    fn job_row(&self) -> SyncJob {
        self.store.get(self.job.job_id, self.job.tenant_id).unwrap()
    }
}

fn decode_queue(harness: &Harness, queue: &str) -> Vec<StageMessage> {
    harness
        .broker
        .peek_all(queue)
        .iter()
        .map(|b| StageMessage::decode(b).unwrap())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn full_run_finishes_and_advances_the_sync_mark() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B"], Some("p2"));
    harness.source.add_page(Some("p2"), &["C"], None);

    let started_at = harness.launch().await;
    harness.drain().await;

    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.last_sync_date, Some(started_at));
    assert!(job.checkpoint.is_none());
    assert!(job.last_run_finished_at.is_some());

    assert_eq!(harness.units.raw_count(), 3);
    assert_eq!(harness.units.entity_count(), 3);
    assert_eq!(harness.index.points.lock().unwrap().len(), 3);

    let doc = job.status_document().unwrap();
    for stage in StageType::ALL {
        assert_eq!(
            doc.step(stage.as_str()),
            Some(sync_core::StepState::Finished),
            "stage {} should be finished",
            stage.as_str()
        );
    }
}

#[tokio::test]
async fn extraction_emits_exact_position_flags() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B", "C"], None);

    harness.launch().await;
    harness.drain_stage(&harness.extraction).await;

    let messages = decode_queue(&harness, "transform_queue_free");
    assert_eq!(messages.len(), 3);
    assert!(messages[0].first_item);
    assert!(!messages[0].last_item);
    assert!(!messages[1].first_item && !messages[1].last_item);
    assert!(messages[2].last_item);
    assert!(messages[2].last_job_item);
    assert!(messages.iter().all(|m| !m.rate_limited));
    // Exactly one message carries each terminal flag.
    assert_eq!(messages.iter().filter(|m| m.last_item).count(), 1);
    assert_eq!(messages.iter().filter(|m| m.last_job_item).count(), 1);
}

#[tokio::test]
async fn flags_propagate_verbatim_through_transform() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B"], None);

    harness.launch().await;
    harness.drain_stage(&harness.extraction).await;
    harness.drain_stage(&harness.transform).await;

    let messages = decode_queue(&harness, "embedding_queue_free");
    assert_eq!(messages.len(), 2);
    assert!(messages[0].first_item && !messages[0].last_item);
    assert!(messages[1].last_item && messages[1].last_job_item);
    assert!(messages.iter().all(|m| m.stage_type == StageType::Embedding));
}

#[tokio::test]
async fn zero_unit_window_finishes_via_sentinel() {
    let harness = Harness::new();
    harness.source.add_page(None, &[], None);

    let started_at = harness.launch().await;

    harness.drain_stage(&harness.extraction).await;
    let messages = decode_queue(&harness, "transform_queue_free");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_sentinel());
    assert!(messages[0].first_item && messages[0].last_item && messages[0].last_job_item);

    harness.drain().await;
    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.last_sync_date, Some(started_at));
}

#[tokio::test]
async fn rate_limit_preserves_the_incremental_window() {
    let harness = Harness::new();
    let previous_mark = Utc::now() - Duration::hours(6);
    let mut job = harness.job_row();
    job.last_sync_date = Some(previous_mark);
    harness.store.insert_job(job);

    harness.source.fail_next_list(Failure::RateLimited);
    harness.launch().await;
    harness.drain().await;

    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::RateLimited);
    // The high-water mark did not move: the next run retries this window.
    assert_eq!(job.last_sync_date, Some(previous_mark));
    assert!(job.checkpoint.is_none());
}

#[tokio::test]
async fn transient_failure_parks_the_job_with_its_checkpoint() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B", "C"], None);
    harness.source.fail_detail_once("B", Failure::Transient);

    harness.launch().await;
    harness.drain().await;

    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.error_message.is_some());
    let checkpoint = job.recovery_checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.queue.len(), 3);
    assert!(!checkpoint.is_complete());
}

#[tokio::test]
async fn resumed_run_skips_enumeration_and_finished_units() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B", "C"], None);
    harness.source.fail_detail_once("B", Failure::Transient);

    let started_at = harness.launch().await;
    harness.drain().await;
    assert_eq!(harness.job_row().status, JobStatus::Pending);
    let lists_before_resume = harness.source.list_call_count();

    // Next scheduling cycle: claim again and resume from the checkpoint.
    harness.launch().await;
    harness.drain_stage(&harness.extraction).await;

    // Completed pagination is not re-queried.
    assert_eq!(harness.source.list_call_count(), lists_before_resume);

    harness.drain().await;
    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    // The mark reflects where the interrupted run began, not the resume.
    assert_eq!(job.last_sync_date, Some(started_at));
    assert_eq!(harness.units.entity_count(), 3);
}

#[tokio::test]
async fn duplicate_terminal_sentinel_is_absorbed() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A"], None);

    harness.launch().await;
    harness.drain().await;
    let finished_at = harness.job_row().last_run_finished_at;

    // Redelivered terminal sentinel after the run already finalized.
    let duplicate = StageMessage {
        tenant_id: harness.job.tenant_id,
        job_id: harness.job.job_id,
        integration_id: harness.job.integration_id,
        stage_type: StageType::Embedding,
        entity_kind: EntityKind::Issue,
        unit_reference: None,
        old_checkpoint: None,
        new_checkpoint: Utc::now(),
        first_item: false,
        last_item: true,
        last_job_item: true,
        rate_limited: false,
    };
    harness
        .kernel
        .publish_message(&duplicate)
        .await
        .unwrap();
    harness.drain().await;

    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.last_run_finished_at, finished_at);
}

#[tokio::test]
async fn entity_deleted_before_embedding_is_skipped() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B"], None);

    harness.launch().await;
    harness.drain_stage(&harness.extraction).await;
    harness.drain_stage(&harness.transform).await;

    // Delete one entity between transform and embedding.
    let messages = decode_queue(&harness, "embedding_queue_free");
    let doomed: Uuid = messages[0].unit_reference.as_deref().unwrap().parse().unwrap();
    harness.units.remove_entity(doomed);

    harness.drain().await;
    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(harness.index.points.lock().unwrap().len(), 1);
    assert!(harness.units.bridge(doomed, COLLECTION).is_none());
}

#[tokio::test]
async fn unit_deleted_before_capture_still_finishes_the_run() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B"], None);
    harness.source.remove_detail("A");

    let started_at = harness.launch().await;
    harness.drain().await;

    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.last_sync_date, Some(started_at));
    assert_eq!(harness.units.entity_count(), 1);
}

#[tokio::test]
async fn all_units_deleted_finishes_via_sentinel() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A"], None);
    harness.source.remove_detail("A");

    harness.launch().await;
    harness.drain().await;

    assert_eq!(harness.job_row().status, JobStatus::Finished);
    assert_eq!(harness.units.entity_count(), 0);
}

#[tokio::test]
async fn downstream_unit_failure_does_not_abort_the_run() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A", "B"], None);
    harness.index.fail_next(Failure::Transient);

    let started_at = harness.launch().await;
    harness.drain().await;

    // The failed unit is skipped; the run still converges to FINISHED.
    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.last_sync_date, Some(started_at));
    assert_eq!(harness.index.points.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_vector_index_ends_the_run_rate_limited() {
    let harness = Harness::new();
    let previous_mark = Utc::now() - Duration::hours(6);
    let mut job = harness.job_row();
    job.last_sync_date = Some(previous_mark);
    harness.store.insert_job(job);

    harness.source.add_page(None, &["A"], None);
    harness.index.fail_next(Failure::RateLimited);

    harness.launch().await;
    harness.drain().await;

    // Throttling downstream is not an ordinary unit failure: the run ends
    // RATE_LIMITED and the window stays put so the next run retries it.
    let job = harness.job_row();
    assert_eq!(job.status, JobStatus::RateLimited);
    assert_eq!(job.last_sync_date, Some(previous_mark));
    assert_eq!(harness.index.points.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn status_updates_are_broadcast_per_stage() {
    let harness = Harness::new();
    harness.source.add_page(None, &["A"], None);

    let topic = sync_core::kernel::status_hub::topic(
        harness.job.tenant_id,
        harness.job.job_id,
        StageType::Embedding,
    );
    let mut updates = harness.kernel.hub.subscribe(&topic);

    harness.launch().await;
    harness.drain().await;

    let mut frames = Vec::new();
    while let Ok(frame) = updates.try_recv() {
        frames.push(frame);
    }
    assert!(!frames.is_empty());
    let last = frames.last().unwrap();
    assert_eq!(last["type"], "status_update");
    assert_eq!(last["status"]["overall"], "finished");
}

#[tokio::test]
async fn premium_tenants_route_to_their_own_queues() {
    let harness = Harness::new();
    harness
        .store
        .set_tenant_tier(harness.job.tenant_id, ServiceTier::Premium);
    harness.source.add_page(None, &["A"], None);

    harness.launch().await;

    assert_eq!(harness.broker.queue_len("extraction_queue_premium"), 1);
    assert_eq!(harness.broker.queue_len("extraction_queue_free"), 0);
}
