//! End-to-end job scenarios against in-memory providers.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use testmgmt_migrate::provider::MemoryAttachmentStore;
use testmgmt_migrate::{
    Config, ConnectionStatus, EndpointConfig, EntityType, FileJobStore, JobStatus, JobStore, JsonLayout,
    JsonMapper, MapperRegistry, MemoryJobStore, MemoryProvider, MigrateError, Orchestrator, ProviderCapabilities,
    ProviderCatalog, ProviderError, ProviderErrorKind, RateLimitConfig, RetryAfter, TransformationEngine,
};

fn caps(entity_types: &[EntityType]) -> ProviderCapabilities {
    ProviderCapabilities {
        can_be_source: true,
        can_be_target: true,
        entity_types: entity_types.to_vec(),
        supports_attachments: false,
        supports_execution_history: false,
        supports_test_steps: true,
        supports_custom_fields: true,
    }
}

fn test_cases(n: usize) -> Vec<Value> {
    (1..=n)
        .map(|i| {
            json!({
                "id": format!("TC-{}", i),
                "name": format!("Case {}", i),
                "status": "Approved",
                "steps": [{"sequence": 1, "action": "open the app"}],
                "custom_fields": {"component": "auth"}
            })
        })
        .collect()
}

fn mappers(types: &[EntityType]) -> MapperRegistry {
    let mut registry = MapperRegistry::new();
    for &entity_type in types {
        let mapper = Arc::new(JsonMapper::new(entity_type, JsonLayout::default()));
        registry.register("zephyr", entity_type, mapper.clone());
        registry.register("qtest", entity_type, mapper);
    }
    registry
}

struct Harness {
    source: Arc<MemoryProvider>,
    target: Arc<MemoryProvider>,
    orchestrator: Orchestrator,
}

fn harness_with(source: MemoryProvider, target: MemoryProvider, store: Arc<dyn JobStore>) -> Harness {
    let source = Arc::new(source);
    let target = Arc::new(target);
    let providers = ProviderCatalog::new().with(source.clone()).with(target.clone());
    let types = [EntityType::Folder, EntityType::TestCase];
    let orchestrator = Orchestrator::new(providers, TransformationEngine::new(mappers(&types)), store);
    Harness {
        source,
        target,
        orchestrator,
    }
}

fn harness(cases: usize) -> Harness {
    let source = MemoryProvider::new("zephyr", caps(&[EntityType::TestCase]))
        .with_records(EntityType::TestCase, test_cases(cases));
    let target = MemoryProvider::new("qtest", caps(&[EntityType::TestCase]));
    harness_with(source, target, Arc::new(MemoryJobStore::new()))
}

fn config(workers: usize) -> Config {
    let mut config = Config::new(EndpointConfig::new("zephyr", "ZP"), EndpointConfig::new("qtest", "QP"));
    config.project.status_mappings.insert("Approved".into(), "Ready".into());
    config.project.field_mappings.insert("component".into(), "module".into());
    config.migration.workers = Some(workers);
    config.migration.entity_types = Some(vec![EntityType::Folder, EntityType::TestCase]);
    let fast = RateLimitConfig::default().with_max_requests(10_000).with_delays(0, 1_000);
    config.rate_limits.insert("zephyr".into(), fast.clone());
    config.rate_limits.insert("qtest".into(), fast);
    config
}

fn pushed_ids(provider: &MemoryProvider, entity_type: EntityType) -> Vec<String> {
    provider
        .pushed(entity_type)
        .iter()
        .filter_map(|e| e["source_id"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_completes_and_maps_values() {
    let h = harness(10);
    let id = h.orchestrator.start(config(4)).await.unwrap();

    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);
    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.total, 10);
    assert_eq!(job.progress.processed, 10);
    assert_eq!(job.progress.failed, 0);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    let pushed = h.target.pushed(EntityType::TestCase);
    assert_eq!(pushed.len(), 10);
    assert!(pushed.iter().all(|e| e["status"] == "Ready"));
    assert!(pushed.iter().all(|e| e["custom_fields"]["module"] == "auth"));
    assert!(pushed.iter().all(|e| e["priority"] == "MEDIUM"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_push_failures_are_retried() {
    let h = harness(10);
    h.target.fail_push_times("TC-4", 2);

    let id = h.orchestrator.start(config(2)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 10);
    assert_eq!(job.progress.failed, 0);
    assert_eq!(h.target.push_attempts("TC-4"), 3);
    assert_eq!(h.target.pushed(EntityType::TestCase).len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_entity_failures_do_not_abort_the_job() {
    let h = harness(5);
    // Exhausts the default budget of three retries.
    h.target.fail_push_times("TC-2", 4);
    h.target.fail_push(
        "TC-3",
        vec![ProviderError::new("qtest", ProviderErrorKind::Rejected, "duplicate name")],
    );

    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 5);
    assert_eq!(job.progress.failed, 2);
    assert_eq!(job.progress.succeeded(), 3);

    let failures: Vec<(&str, u32)> = job
        .progress
        .failures
        .iter()
        .map(|f| (f.source_id.as_str(), f.attempts))
        .collect();
    assert_eq!(failures, vec![("TC-2", 4), ("TC-3", 1)]);
    assert!(job.progress.failures[1].error.contains("duplicate name"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_entities_beyond_failure_threshold_complete() {
    let h = harness(5);
    for key in ["TC-1", "TC-2", "TC-3"] {
        h.target.fail_push(
            key,
            vec![ProviderError::new("qtest", ProviderErrorKind::Rejected, "duplicate name")],
        );
    }

    let mut config = config(1);
    config.migration.max_consecutive_failures = Some(3);
    let id = h.orchestrator.start(config).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.error, None);
    assert_eq!(job.progress.processed, 5);
    assert_eq!(job.progress.failed, 3);
    assert_eq!(pushed_ids(&h.target, EntityType::TestCase), vec!["TC-4", "TC-5"]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_push_waits_for_reset() {
    let h = harness(1);
    h.target.fail_push(
        "TC-1",
        vec![ProviderError::rate_limited("qtest", RetryAfter::Millis(5_000))],
    );

    let started = tokio::time::Instant::now();
    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    assert!(started.elapsed() >= Duration::from_millis(5_000));
    assert_eq!(h.target.push_attempts("TC-1"), 2);
    assert_eq!(h.orchestrator.get_status(&id).await.unwrap().progress.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pause_then_resume_skips_processed_entities() {
    let h = harness(10);
    let gate = h.target.gate_push("TC-5");

    let id = h.orchestrator.start(config(1)).await.unwrap();
    gate.wait_reached().await;
    h.orchestrator.pause(&id).await.unwrap();
    gate.release();

    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Paused);
    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 5);
    assert_eq!(job.completed_at, None);
    // Pausing twice is harmless.
    h.orchestrator.pause(&id).await.unwrap();

    h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 10);
    let ids = pushed_ids(&h.target, EntityType::TestCase);
    let expected: Vec<String> = (1..=10).map(|i| format!("TC-{}", i)).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(start_paused = true)]
async fn test_resume_requires_paused_job() {
    let h = harness(2);
    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let err = h.orchestrator.resume(&id).await.unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTransition { .. }));
    let err = h.orchestrator.pause(&id).await.unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTransition { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_job() {
    let h = harness(10);
    let gate = h.target.gate_push("TC-3");

    let id = h.orchestrator.start(config(1)).await.unwrap();
    gate.wait_reached().await;
    h.orchestrator.cancel(&id).await.unwrap();
    gate.release();

    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Cancelled);
    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 3);
    assert_eq!(h.target.pushed(EntityType::TestCase).len(), 3);

    // Terminal: nothing more may happen.
    assert!(h.orchestrator.resume(&id).await.is_err());
    assert!(h.orchestrator.cancel(&id).await.is_err());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.target.pushed(EntityType::TestCase).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_paused_job() {
    let h = harness(4);
    let gate = h.target.gate_push("TC-2");

    let id = h.orchestrator.start(config(1)).await.unwrap();
    gate.wait_reached().await;
    h.orchestrator.pause(&id).await.unwrap();
    gate.release();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Paused);

    h.orchestrator.cancel(&id).await.unwrap();
    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress.processed, 2);
    assert!(job.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_lost_target_connectivity_fails_job() {
    let h = harness(10);
    h.target.set_unreachable(true);

    let mut config = config(1);
    config.migration.max_retries = Some(1);
    config.migration.max_consecutive_failures = Some(3);

    let id = h.orchestrator.start(config).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Failed);

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 3);
    assert_eq!(job.progress.failed, 3);
    assert!(job.error.unwrap_or_default().contains("consecutive"));
    assert!(h.target.pushed(EntityType::TestCase).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_revoked_credentials_fail_job() {
    let h = harness(5);
    h.target.fail_push("TC-2", vec![ProviderError::authentication("qtest", "token revoked")]);

    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Failed);

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 1);
    assert!(job.error.unwrap_or_default().contains("token revoked"));
    assert_eq!(h.target.push_attempts("TC-2"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_checks_connections() {
    let h = harness(1);
    h.target
        .set_connection(ConnectionStatus::failed("invalid API token", false));
    match h.orchestrator.start(config(1)).await {
        Err(MigrateError::Provider(e)) => assert_eq!(e.kind, ProviderErrorKind::Authentication),
        other => panic!("expected authentication error, got {:?}", other.map(|_| ())),
    }

    h.source
        .set_connection(ConnectionStatus::failed("503 from gateway", true));
    match h.orchestrator.start(config(1)).await {
        Err(MigrateError::Provider(e)) => {
            assert_eq!(e.kind, ProviderErrorKind::Transient);
            assert_eq!(e.provider, "zephyr");
        }
        other => panic!("expected transient error, got {:?}", other.map(|_| ())),
    }

    assert!(h.orchestrator.list_jobs().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_parent_ids_are_remapped() {
    let types = [EntityType::Folder, EntityType::TestCase];
    let source = MemoryProvider::new("zephyr", caps(&types))
        .with_records(EntityType::Folder, vec![json!({"id": "F-1", "name": "Regression"})])
        .with_records(
            EntityType::TestCase,
            vec![
                json!({"id": "TC-1", "name": "Login", "parent_id": "F-1"}),
                json!({"id": "TC-2", "name": "Logout", "parent_id": "F-404"}),
            ],
        );
    let target = MemoryProvider::new("qtest", caps(&types));
    let h = harness_with(source, target, Arc::new(MemoryJobStore::new()));

    let id = h.orchestrator.start(config(2)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let folders = h.target.pushed(EntityType::Folder);
    let folder_id = folders[0]["id"].as_str().unwrap().to_string();

    let cases = h.target.pushed(EntityType::TestCase);
    let login = cases.iter().find(|c| c["source_id"] == "TC-1").unwrap();
    let logout = cases.iter().find(|c| c["source_id"] == "TC-2").unwrap();
    assert_eq!(login["parent_id"], json!(folder_id));
    assert!(logout.get("parent_id").is_none());

    let job = h.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(job.checkpoint.target_id(EntityType::Folder, "F-1"), Some(folder_id.as_str()));
    assert_eq!(job.progress.processed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_nested_folders_keep_hierarchy_with_parallel_workers() {
    let types = [EntityType::Folder, EntityType::TestCase];
    let source = MemoryProvider::new("zephyr", caps(&types)).with_records(
        EntityType::Folder,
        vec![
            json!({"id": "F-3", "name": "Smoke", "parent_id": "F-2"}),
            json!({"id": "F-2", "name": "Checkout", "parent_id": "F-1"}),
            json!({"id": "F-1", "name": "Regression"}),
        ],
    );
    let h = harness_with(source, MemoryProvider::new("qtest", caps(&types)), Arc::new(MemoryJobStore::new()));
    let gate = h.target.gate_push("F-1");

    let id = h.orchestrator.start(config(4)).await.unwrap();
    gate.wait_reached().await;
    // Children wait for their parent even with idle workers.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.target.pushed(EntityType::Folder).is_empty());
    gate.release();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    assert_eq!(pushed_ids(&h.target, EntityType::Folder), vec!["F-1", "F-2", "F-3"]);
    let job = h.orchestrator.get_status(&id).await.unwrap();
    let folders = h.target.pushed(EntityType::Folder);
    let target_id = |source: &str| json!(job.checkpoint.target_id(EntityType::Folder, source).unwrap());
    assert!(folders[0].get("parent_id").is_none());
    assert_eq!(folders[1]["parent_id"], target_id("F-1"));
    assert_eq!(folders[2]["parent_id"], target_id("F-2"));
}

#[test]
fn test_value_as_id_is_public() {
    use testmgmt_migrate::model::value_as_id;
    assert_eq!(value_as_id(&json!("TC-1")).as_deref(), Some("TC-1"));
    assert_eq!(value_as_id(&json!(42)).as_deref(), Some("42"));
    assert_eq!(value_as_id(&json!("")), None);
}

#[tokio::test(start_paused = true)]
async fn test_target_capabilities_shape_payloads() {
    let source = MemoryProvider::new("zephyr", caps(&[EntityType::TestCase]))
        .with_records(EntityType::TestCase, test_cases(2));
    let mut target_caps = caps(&[EntityType::TestCase]);
    target_caps.supports_test_steps = false;
    target_caps.supports_custom_fields = false;
    let target = MemoryProvider::new("qtest", target_caps);
    let h = harness_with(source, target, Arc::new(MemoryJobStore::new()));

    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    for pushed in h.target.pushed(EntityType::TestCase) {
        assert!(pushed.get("steps").is_none());
        assert!(pushed.get("custom_fields").is_none());
        assert_eq!(pushed["status"], "Ready");
    }
}

#[tokio::test(start_paused = true)]
async fn test_attachments_are_copied() {
    let mut both = caps(&[EntityType::TestCase]);
    both.supports_attachments = true;
    let source = MemoryProvider::new("zephyr", both.clone()).with_records(
        EntityType::TestCase,
        vec![json!({
            "id": "TC-1",
            "name": "Upload avatar",
            "attachments": [{"file_name": "avatar.png", "storage_key": "blobs/1", "size_bytes": 3}]
        })],
    );
    source.put_blob("blobs/1", b"png".to_vec());
    let target = MemoryProvider::new("qtest", both);

    let store = Arc::new(MemoryAttachmentStore::new());
    let mut h = harness_with(source, target, Arc::new(MemoryJobStore::new()));
    h.orchestrator = h.orchestrator.with_attachment_worker(store.clone());

    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let pushed = h.target.pushed(EntityType::TestCase);
    assert_eq!(pushed[0]["attachments"][0]["storage_key"], "migrated/blobs/1");
    assert_eq!(store.get("migrated/blobs/1"), Some(b"png".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_attachments_dropped_without_worker() {
    let mut both = caps(&[EntityType::TestCase]);
    both.supports_attachments = true;
    let source = MemoryProvider::new("zephyr", both.clone()).with_records(
        EntityType::TestCase,
        vec![json!({
            "id": "TC-1",
            "name": "Upload avatar",
            "attachments": [{"file_name": "avatar.png", "storage_key": "blobs/1"}]
        })],
    );
    let h = harness_with(source, MemoryProvider::new("qtest", both), Arc::new(MemoryJobStore::new()));

    let id = h.orchestrator.start(config(1)).await.unwrap();
    assert_eq!(h.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Completed);
    assert!(h.target.pushed(EntityType::TestCase)[0].get("attachments").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_file_store_in_new_orchestrator() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = MemoryProvider::new("zephyr", caps(&[EntityType::TestCase]))
        .with_records(EntityType::TestCase, test_cases(6));
    let target = MemoryProvider::new("qtest", caps(&[EntityType::TestCase]));
    let first = harness_with(source, target, Arc::new(FileJobStore::open(dir.path()).unwrap()));

    let gate = first.target.gate_push("TC-2");
    let id = first.orchestrator.start(config(1)).await.unwrap();
    gate.wait_reached().await;
    first.orchestrator.pause(&id).await.unwrap();
    gate.release();
    assert_eq!(first.orchestrator.wait_settled(&id).await.unwrap(), JobStatus::Paused);

    // Same providers, fresh orchestrator and store handle.
    let providers = ProviderCatalog::new()
        .with(first.source.clone())
        .with(first.target.clone());
    let engine = TransformationEngine::new(mappers(&[EntityType::TestCase]));
    let second = Orchestrator::new(providers, engine, Arc::new(FileJobStore::open(dir.path()).unwrap()));

    assert!(matches!(second.resume(&id).await, Err(MigrateError::State(_))));

    let mut changed = config(1);
    changed.project.status_mappings.insert("Draft".into(), "New".into());
    assert!(matches!(
        second.resume_with_config(&id, changed).await,
        Err(MigrateError::ConfigChanged)
    ));

    second.resume_with_config(&id, config(1)).await.unwrap();
    assert_eq!(second.wait_settled(&id).await.unwrap(), JobStatus::Completed);

    let job = second.get_status(&id).await.unwrap();
    assert_eq!(job.progress.processed, 6);
    assert_eq!(pushed_ids(&first.target, EntityType::TestCase).len(), 6);
}

#[tokio::test]
async fn test_preview_transformation_touches_no_jobs() {
    let h = harness(1);
    let input = json!({"id": "TC-9", "name": "Preview me", "status": "Approved"});
    let preview = h
        .orchestrator
        .preview_transformation(&input, EntityType::TestCase, "zephyr", "qtest", &config(1).project_config())
        .unwrap();

    assert_eq!(preview.source_form, input);
    assert_eq!(preview.canonical_form.status.as_deref(), Some("Ready"));
    assert_eq!(preview.target_form["source_id"], "TC-9");
    assert!(h.orchestrator.list_jobs().await.unwrap().is_empty());
}
