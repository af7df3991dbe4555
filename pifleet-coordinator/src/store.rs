/*!
Registry store adapter.

The durable store itself is an external collaborator; this module pins
down its contract (`upsert` / `insert` / `query_all`) and translates
registry and result events into calls against it. Two collections are
kept: the device registry (upsert, keyed by device id) and the results
log (insert-only, capped).

The bundled implementations are a JSON file store with an in-memory cache
and a pure in-memory store for tests and broker-less runs.
*/

use crate::models::ResultMsg;
use crate::registry::DeviceState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One persisted record. Keyed records belong to upsert collections,
/// keyless ones to insert-only logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub record: Value,
}

/// Contract of the external durable store.
pub trait RegistryStore: Send + Sync {
    /// Insert or replace the record with this key.
    fn upsert(&self, key: &str, record: Value) -> Result<(), StoreError>;
    /// Append a record, never replacing anything.
    fn insert(&self, record: Value) -> Result<(), StoreError>;
    /// All records, insertion order.
    fn query_all(&self) -> Result<Vec<Value>, StoreError>;
}

/// File-backed store: full collection cached in memory, rewritten on
/// every mutation. Inside a tokio runtime the rewrite goes through the
/// blocking pool; mutations are served from the cache immediately and
/// never stall the caller on disk.
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<Vec<StoredRecord>>,
    max_entries: Option<usize>,
    write_seq: AtomicU64,
    last_written: Arc<Mutex<u64>>,
}

impl JsonFileStore {
    pub fn open<P: Into<PathBuf>>(path: P, max_entries: Option<usize>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() { Vec::new() } else { serde_json::from_str(&content)? }
        } else {
            fs::write(&path, "[]")?;
            Vec::new()
        };
        eprintln!("[store] {} opened with {} records", path.display(), records.len());
        Ok(Self {
            path,
            cache: Mutex::new(records),
            max_entries,
            write_seq: AtomicU64::new(0),
            last_written: Arc::new(Mutex::new(0)),
        })
    }

    /// Persist a snapshot. Callers hold the cache lock, so sequence
    /// numbers follow snapshot recency; an older snapshot arriving late
    /// on the blocking pool never overwrites a newer one.
    fn save(&self, records: &[StoredRecord]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(records)?;
        let seq = self.write_seq.fetch_add(1, Ordering::SeqCst) + 1;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let path = self.path.clone();
                let last_written = self.last_written.clone();
                handle.spawn_blocking(move || {
                    let mut last = last_written.lock();
                    if seq <= *last {
                        return;
                    }
                    if let Err(e) = fs::write(&path, json) {
                        eprintln!("[store] failed to write {}: {}", path.display(), e);
                    } else {
                        *last = seq;
                    }
                });
                Ok(())
            }
            Err(_) => {
                let mut last = self.last_written.lock();
                fs::write(&self.path, json)?;
                *last = seq;
                Ok(())
            }
        }
    }
}

impl RegistryStore for JsonFileStore {
    fn upsert(&self, key: &str, record: Value) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        match cache.iter_mut().find(|r| r.key.as_deref() == Some(key)) {
            Some(existing) => existing.record = record,
            None => cache.push(StoredRecord { key: Some(key.to_string()), record }),
        }
        self.save(&cache)
    }

    fn insert(&self, record: Value) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        cache.push(StoredRecord { key: None, record });
        if let Some(cap) = self.max_entries {
            while cache.len() > cap {
                cache.remove(0);
            }
        }
        self.save(&cache)
    }

    fn query_all(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.cache.lock().iter().map(|r| r.record.clone()).collect())
    }
}

/// In-memory store with the same semantics, for tests and for running
/// without a writable data directory.
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
    max_entries: Option<usize>,
}

impl MemoryStore {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self { records: Mutex::new(Vec::new()), max_entries }
    }
}

impl RegistryStore for MemoryStore {
    fn upsert(&self, key: &str, record: Value) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.key.as_deref() == Some(key)) {
            Some(existing) => existing.record = record,
            None => records.push(StoredRecord { key: Some(key.to_string()), record }),
        }
        Ok(())
    }

    fn insert(&self, record: Value) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        records.push(StoredRecord { key: None, record });
        if let Some(cap) = self.max_entries {
            while records.len() > cap {
                records.remove(0);
            }
        }
        Ok(())
    }

    fn query_all(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.records.lock().iter().map(|r| r.record.clone()).collect())
    }
}

/// Entry of the results log as persisted and served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub result: String,
    pub received_ts: i64,
}

/// Translates coordinator events into store calls. Store failures are
/// logged, never propagated: persistence problems must not stop
/// ingestion.
#[derive(Clone)]
pub struct StoreWriter {
    devices: Arc<dyn RegistryStore>,
    results: Arc<dyn RegistryStore>,
}

impl StoreWriter {
    pub fn new(devices: Arc<dyn RegistryStore>, results: Arc<dyn RegistryStore>) -> Self {
        Self { devices, results }
    }

    pub fn record_device(&self, state: &DeviceState) {
        let record = match serde_json::to_value(state) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("[store] failed to serialize device {}: {}", state.device_id, e);
                return;
            }
        };
        if let Err(e) = self.devices.upsert(&state.device_id, record) {
            eprintln!("[store] failed to upsert device {}: {}", state.device_id, e);
        }
    }

    pub fn record_result(&self, msg: &ResultMsg, now: i64) {
        let entry = ResultEntry {
            device_id: msg.device_id.clone(),
            job_id: msg.job_id.clone(),
            result: msg.result.clone(),
            received_ts: now,
        };
        match serde_json::to_value(&entry) {
            Ok(record) => {
                if let Err(e) = self.results.insert(record) {
                    eprintln!("[store] failed to append result from {}: {}", msg.device_id, e);
                }
            }
            Err(e) => eprintln!("[store] failed to serialize result from {}: {}", msg.device_id, e),
        }
    }

    /// Results log, oldest first.
    pub fn results(&self) -> Vec<ResultEntry> {
        match self.results.query_all() {
            Ok(records) => records
                .into_iter()
                .filter_map(|r| serde_json::from_value(r).ok())
                .collect(),
            Err(e) => {
                eprintln!("[store] failed to read results: {}", e);
                Vec::new()
            }
        }
    }

    /// Device states persisted by a previous run.
    pub fn stored_devices(&self) -> Vec<DeviceState> {
        match self.devices.query_all() {
            Ok(records) => records
                .into_iter()
                .filter_map(|r| serde_json::from_value(r).ok())
                .collect(),
            Err(e) => {
                eprintln!("[store] failed to read devices: {}", e);
                Vec::new()
            }
        }
    }
}
