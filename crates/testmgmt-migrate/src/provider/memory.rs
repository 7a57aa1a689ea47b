//! In-process provider adapter.
//!
//! Holds native entities in memory and records everything pushed to it.
//! Failure injection (queued errors, unreachable mode) and push gates make it
//! possible to drive the orchestrator through retry, systemic-failure and
//! pause scenarios deterministically.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::error::{MigrateError, ProviderError, ProviderErrorKind, Result};
use crate::model::{value_as_id, AttachmentRef, EntityType, NativeEntity};

use super::{AttachmentWorker, ConnectionStatus, FetchParams, ProviderAdapter, ProviderCapabilities};

/// Pauses a push until released, after signalling that it was reached.
#[derive(Debug)]
pub struct PushGate {
    reached: Notify,
    release: Semaphore,
}

impl PushGate {
    fn new() -> Self {
        Self {
            reached: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until the gated push has started.
    pub async fn wait_reached(&self) {
        self.reached.notified().await;
    }

    /// Let the gated push continue.
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

/// Provider adapter backed by in-memory maps.
pub struct MemoryProvider {
    name: String,
    capabilities: ProviderCapabilities,
    /// Field holding an entity's own id.
    id_field: String,
    /// Field on pushed entities used to address injected failures and gates.
    match_field: String,
    connection: Mutex<ConnectionStatus>,
    records: Mutex<HashMap<EntityType, Vec<NativeEntity>>>,
    pushed: Mutex<Vec<(EntityType, NativeEntity)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    push_failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    push_attempts: Mutex<HashMap<String, u32>>,
    gates: Mutex<HashMap<String, Arc<PushGate>>>,
    unreachable: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>, capabilities: ProviderCapabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            id_field: "id".to_string(),
            match_field: "source_id".to_string(),
            connection: Mutex::new(ConnectionStatus::connected()),
            records: Mutex::new(HashMap::new()),
            pushed: Mutex::new(Vec::new()),
            blobs: Mutex::new(HashMap::new()),
            push_failures: Mutex::new(HashMap::new()),
            push_attempts: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Use different field names for the entity id and the failure-matching key.
    pub fn with_fields(mut self, id_field: impl Into<String>, match_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self.match_field = match_field.into();
        self
    }

    pub fn with_records(self, entity_type: EntityType, records: Vec<NativeEntity>) -> Self {
        self.records.lock().entry(entity_type).or_default().extend(records);
        self
    }

    pub fn insert(&self, entity_type: EntityType, record: NativeEntity) {
        self.records.lock().entry(entity_type).or_default().push(record);
    }

    pub fn put_blob(&self, storage_key: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.lock().insert(storage_key.into(), bytes);
    }

    pub fn set_connection(&self, status: ConnectionStatus) {
        *self.connection.lock() = status;
    }

    /// Fail every fetch and push with a transient error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Queue errors returned by successive pushes of the entity matching `key`.
    pub fn fail_push(&self, key: impl Into<String>, errors: Vec<ProviderError>) {
        self.push_failures
            .lock()
            .entry(key.into())
            .or_default()
            .extend(errors);
    }

    /// Fail the next `times` pushes of `key` with transient errors.
    pub fn fail_push_times(&self, key: impl Into<String>, times: usize) {
        let errors = (0..times)
            .map(|i| ProviderError::transient(self.name.clone(), format!("injected failure #{}", i + 1)))
            .collect();
        self.fail_push(key, errors);
    }

    /// Gate the first push of `key`.
    pub fn gate_push(&self, key: impl Into<String>) -> Arc<PushGate> {
        let gate = Arc::new(PushGate::new());
        self.gates.lock().insert(key.into(), gate.clone());
        gate
    }

    /// Entities successfully pushed, in push order.
    pub fn pushed(&self, entity_type: EntityType) -> Vec<NativeEntity> {
        self.pushed
            .lock()
            .iter()
            .filter(|(t, _)| *t == entity_type)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Number of push attempts seen for `key`, successful or not.
    pub fn push_attempts(&self, key: &str) -> u32 {
        self.push_attempts.lock().get(key).copied().unwrap_or(0)
    }

    fn unreachable_error(&self) -> MigrateError {
        MigrateError::Provider(ProviderError::transient(self.name.clone(), "provider unreachable"))
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn test_connection(&self) -> ConnectionStatus {
        self.connection.lock().clone()
    }

    async fn fetch(&self, entity_type: EntityType, params: &FetchParams) -> Result<Vec<NativeEntity>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }

        let records = self.records.lock();
        let all = records.get(&entity_type).map(Vec::as_slice).unwrap_or_default();
        let found = match &params.entity_id {
            Some(id) => all
                .iter()
                .filter(|r| r.get(&self.id_field).and_then(value_as_id).as_deref() == Some(id.as_str()))
                .cloned()
                .collect(),
            None => all.to_vec(),
        };
        Ok(found)
    }

    async fn push(&self, entity_type: EntityType, entity: &NativeEntity) -> Result<String> {
        let key = entity
            .get(&self.match_field)
            .or_else(|| entity.get(&self.id_field))
            .and_then(value_as_id)
            .unwrap_or_default();

        *self.push_attempts.lock().entry(key.clone()).or_insert(0) += 1;

        let gate = self.gates.lock().remove(&key);
        if let Some(gate) = gate {
            debug!("{}: push of {} reached gate", self.name, key);
            gate.reached.notify_one();
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }

        let injected = self
            .push_failures
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        if let Some(err) = injected {
            return Err(MigrateError::Provider(err));
        }

        let id = format!("{}-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = entity.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.insert(self.id_field.clone(), serde_json::Value::String(id.clone()));
        }
        self.pushed.lock().push((entity_type, stored));
        Ok(id)
    }

    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(&attachment.storage_key)
            .cloned()
            .ok_or_else(|| {
                MigrateError::Provider(ProviderError::new(
                    self.name.clone(),
                    ProviderErrorKind::NotFound,
                    format!("no attachment stored at {}", attachment.storage_key),
                ))
            })
    }
}

/// Attachment worker that keeps migrated copies in memory.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, storage_key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(storage_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl AttachmentWorker for MemoryAttachmentStore {
    async fn migrate(&self, storage_key: &str, bytes: Vec<u8>) -> Result<String> {
        let new_key = format!("migrated/{}", storage_key);
        self.objects.lock().insert(new_key.clone(), bytes);
        Ok(new_key)
    }
}
