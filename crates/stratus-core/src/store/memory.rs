//! In-memory reference store backends.
//!
//! [`MemoryPersistentStore`] and [`MemoryEphemeralStore`] implement the store
//! traits over process-local state. They back the test suites and single-node
//! development runs; production deployments point the same traits at their
//! own SQL and key-value infrastructure.
//!
//! Every method takes its lock for the duration of one synchronous mutation
//! and never across an await point.

use super::{
    BaseField, DeviceField, EphemeralStore, ExpiredCaching, PersistentStore, Region, StoreError,
    WaitingTask,
};
use crate::types::{
    CarfileRecord, NodeRow, Registration, Replica, ValidationResultRow, ValidationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Default)]
struct PersistentState {
    nodes: HashMap<String, NodeRow>,
    registrations: HashMap<String, Registration>,
    validation_results: HashMap<(u64, String), ValidationResultRow>,
    fid_maps: HashMap<String, HashMap<u64, String>>,
    records: HashMap<String, CarfileRecord>,
    /// Insertion order of record keys; paging walks it newest-first.
    record_order: Vec<String>,
    /// carfile_hash → device_id → replica
    replicas: HashMap<String, HashMap<String, Replica>>,
}

/// In-memory durable store, scoped to one deployment region.
pub struct MemoryPersistentStore {
    region: Region,
    inner: RwLock<PersistentState>,
}

impl MemoryPersistentStore {
    #[must_use]
    pub fn new(region: Region) -> Self {
        Self { region, inner: RwLock::new(PersistentState::default()) }
    }

    /// Region this store's block maps are scoped to.
    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }
}

#[async_trait]
impl PersistentStore for MemoryPersistentStore {
    async fn upsert_node(&self, row: &NodeRow) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        state.nodes.insert(row.device_id.clone(), row.clone());
        Ok(())
    }

    async fn node(&self, device_id: &str) -> Result<NodeRow, StoreError> {
        self.inner
            .read()
            .nodes
            .get(device_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node {device_id}")))
    }

    async fn set_node_offline(
        &self,
        device_id: &str,
        last_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        match state.nodes.get_mut(device_id) {
            Some(row) => {
                row.is_online = false;
                row.last_time = last_time;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("node {device_id}"))),
        }
    }

    async fn set_all_offline(&self, server_name: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        for row in state.nodes.values_mut() {
            if row.server_name == server_name {
                row.is_online = false;
            }
        }
        Ok(())
    }

    async fn bind_registration(&self, reg: &Registration) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if state.registrations.contains_key(&reg.device_id) {
            return Err(StoreError::Conflict(format!(
                "device {} already registered",
                reg.device_id
            )));
        }
        state.registrations.insert(reg.device_id.clone(), reg.clone());
        Ok(())
    }

    async fn registration(&self, device_id: &str) -> Result<Registration, StoreError> {
        self.inner
            .read()
            .registrations
            .get(device_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("registration {device_id}")))
    }

    async fn insert_validation_result(&self, row: &ValidationResultRow) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let key = (row.round_id, row.device_id.clone());
        if state.validation_results.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "validation result ({}, {}) already exists",
                row.round_id, row.device_id
            )));
        }
        state.validation_results.insert(key, row.clone());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_validation_result(
        &self,
        round_id: u64,
        device_id: &str,
        status: ValidationStatus,
        msg: &str,
        block_count: u32,
        bandwidth: f64,
        duration: u64,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let row = state
            .validation_results
            .get_mut(&(round_id, device_id.to_string()))
            .ok_or_else(|| {
                StoreError::NotFound(format!("validation result ({round_id}, {device_id})"))
            })?;
        if row.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "validation result ({round_id}, {device_id}) already terminal"
            )));
        }
        row.status = status;
        row.msg = msg.to_string();
        row.block_count = block_count;
        row.bandwidth = bandwidth;
        row.duration = duration;
        row.end_time = Some(end_time);
        Ok(())
    }

    async fn validation_result(
        &self,
        round_id: u64,
        device_id: &str,
    ) -> Result<ValidationResultRow, StoreError> {
        self.inner
            .read()
            .validation_results
            .get(&(round_id, device_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("validation result ({round_id}, {device_id})"))
            })
    }

    async fn device_block_count(&self, device_id: &str) -> Result<u64, StoreError> {
        Ok(self.inner.read().fid_maps.get(device_id).map_or(0, |m| m.len() as u64))
    }

    async fn device_fid_map(&self, device_id: &str) -> Result<HashMap<u64, String>, StoreError> {
        Ok(self.inner.read().fid_maps.get(device_id).cloned().unwrap_or_default())
    }

    async fn set_device_fid(&self, device_id: &str, fid: u64, cid: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        state
            .fid_maps
            .entry(device_id.to_string())
            .or_default()
            .insert(fid, cid.to_string());
        Ok(())
    }

    async fn clear_device_fids(&self, device_id: &str) -> Result<(), StoreError> {
        self.inner.write().fid_maps.remove(device_id);
        Ok(())
    }

    async fn upsert_carfile_record(&self, record: &CarfileRecord) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if !state.records.contains_key(&record.carfile_hash) {
            state.record_order.push(record.carfile_hash.clone());
        }
        state.records.insert(record.carfile_hash.clone(), record.clone());
        Ok(())
    }

    async fn carfile_record(&self, carfile_hash: &str) -> Result<CarfileRecord, StoreError> {
        self.inner
            .read()
            .records
            .get(carfile_hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("carfile record {carfile_hash}")))
    }

    async fn carfile_records(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<CarfileRecord>, usize), StoreError> {
        if page_size == 0 {
            return Err(StoreError::Invalid("page_size must be > 0".into()));
        }
        let state = self.inner.read();
        let total = state.record_order.len();
        let page = page.max(1);
        let records = state
            .record_order
            .iter()
            .rev()
            .skip((page - 1) * page_size)
            .take(page_size)
            .filter_map(|hash| state.records.get(hash).cloned())
            .collect();
        Ok((records, total))
    }

    async fn undone_carfile_records(&self) -> Result<Vec<CarfileRecord>, StoreError> {
        let state = self.inner.read();
        let mut out: Vec<CarfileRecord> = state
            .records
            .values()
            .filter(|r| r.cur_reliability < r.need_reliability && !r.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.carfile_hash.cmp(&b.carfile_hash));
        Ok(out)
    }

    async fn running_carfile_records(&self) -> Result<Vec<CarfileRecord>, StoreError> {
        let state = self.inner.read();
        let mut out: Vec<CarfileRecord> = state
            .records
            .values()
            .filter(|r| r.status == crate::types::RecordStatus::Running)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.carfile_hash.cmp(&b.carfile_hash));
        Ok(out)
    }

    async fn remove_carfile_record(&self, carfile_hash: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        state.records.remove(carfile_hash);
        state.record_order.retain(|h| h != carfile_hash);
        state.replicas.remove(carfile_hash);
        Ok(())
    }

    async fn upsert_replica(&self, replica: &Replica) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        state
            .replicas
            .entry(replica.carfile_hash.clone())
            .or_default()
            .insert(replica.device_id.clone(), replica.clone());
        Ok(())
    }

    async fn replica(&self, carfile_hash: &str, device_id: &str) -> Result<Replica, StoreError> {
        self.inner
            .read()
            .replicas
            .get(carfile_hash)
            .and_then(|m| m.get(device_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("replica ({carfile_hash}, {device_id})"))
            })
    }

    async fn replicas_of(&self, carfile_hash: &str) -> Result<Vec<Replica>, StoreError> {
        let state = self.inner.read();
        let mut out: Vec<Replica> = state
            .replicas
            .get(carfile_hash)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(out)
    }

    async fn replicas_on_device(&self, device_id: &str) -> Result<Vec<Replica>, StoreError> {
        let state = self.inner.read();
        let mut out: Vec<Replica> = state
            .replicas
            .values()
            .filter_map(|m| m.get(device_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.carfile_hash.cmp(&b.carfile_hash));
        Ok(out)
    }

    async fn remove_replica(&self, carfile_hash: &str, device_id: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if let Some(m) = state.replicas.get_mut(carfile_hash) {
            m.remove(device_id);
            if m.is_empty() {
                state.replicas.remove(carfile_hash);
            }
        }
        Ok(())
    }

    async fn carfiles_with_replicas_on(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let state = self.inner.read();
        let mut out: Vec<String> = state
            .replicas
            .iter()
            .filter(|(_, devices)| device_ids.iter().any(|d| devices.contains_key(d)))
            .map(|(hash, _)| hash.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    async fn remove_replicas_on(&self, device_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        for devices in state.replicas.values_mut() {
            for id in device_ids {
                devices.remove(id);
            }
        }
        state.replicas.retain(|_, devices| !devices.is_empty());
        Ok(())
    }

    async fn succeeded_replica_count(&self, carfile_hash: &str) -> Result<u32, StoreError> {
        Ok(self.inner.read().replicas.get(carfile_hash).map_or(0, |m| {
            m.values().filter(|r| r.status == crate::types::ReplicaStatus::Succeeded).count() as u32
        }))
    }
}

#[derive(Default)]
struct EphemeralState {
    round_id: u64,
    verifying: BTreeSet<String>,
    validators: Vec<String>,
    validators_expire: Option<Instant>,
    max_fids: HashMap<String, u64>,
    caching_deadlines: HashMap<(String, String), Instant>,
    waiting: VecDeque<WaitingTask>,
    device_fields: HashMap<String, HashMap<&'static str, i64>>,
    disk_usage: HashMap<String, f64>,
    base_fields: HashMap<&'static str, i64>,
    download_serial: u64,
}

/// In-memory ephemeral store.
#[derive(Default)]
pub struct MemoryEphemeralStore {
    inner: Mutex<EphemeralState>,
}

impl MemoryEphemeralStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn incr_round_id(&self) -> Result<(u64, u64), StoreError> {
        let mut state = self.inner.lock();
        let previous = state.round_id;
        state.round_id += 1;
        Ok((previous, state.round_id))
    }

    async fn add_verifying(&self, device_id: &str) -> Result<(), StoreError> {
        self.inner.lock().verifying.insert(device_id.to_string());
        Ok(())
    }

    async fn remove_verifying(&self, device_id: &str) -> Result<(), StoreError> {
        self.inner.lock().verifying.remove(device_id);
        Ok(())
    }

    async fn verifying(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().verifying.iter().cloned().collect())
    }

    async fn clear_verifying(&self) -> Result<(), StoreError> {
        self.inner.lock().verifying.clear();
        Ok(())
    }

    async fn verifying_count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().verifying.len() as u64)
    }

    async fn set_validators(&self, device_ids: &[String], ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.validators = device_ids.to_vec();
        state.validators_expire = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn validators(&self) -> Result<Vec<String>, StoreError> {
        let state = self.inner.lock();
        match state.validators_expire {
            Some(expire) if expire > Instant::now() => Ok(state.validators.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn node_max_fid(&self, device_id: &str) -> Result<u64, StoreError> {
        self.inner
            .lock()
            .max_fids
            .get(device_id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("max fid for {device_id}")))
    }

    async fn set_node_max_fid(&self, device_id: &str, max_fid: u64) -> Result<(), StoreError> {
        self.inner.lock().max_fids.insert(device_id.to_string(), max_fid);
        Ok(())
    }

    async fn begin_caching(
        &self,
        device_id: &str,
        carfile_hash: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .caching_deadlines
            .insert((device_id.to_string(), carfile_hash.to_string()), Instant::now() + ttl);
        Ok(())
    }

    async fn end_caching(&self, device_id: &str, carfile_hash: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .caching_deadlines
            .remove(&(device_id.to_string(), carfile_hash.to_string()));
        Ok(())
    }

    async fn take_expired_caching(&self) -> Result<Vec<ExpiredCaching>, StoreError> {
        let mut state = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<(String, String)> = state
            .caching_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for key in expired {
            state.caching_deadlines.remove(&key);
            out.push(ExpiredCaching { device_id: key.0, carfile_hash: key.1 });
        }
        out.sort_by(|a, b| (&a.device_id, &a.carfile_hash).cmp(&(&b.device_id, &b.carfile_hash)));
        Ok(out)
    }

    async fn push_waiting(&self, task: &WaitingTask) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if state.waiting.iter().any(|t| t.carfile_hash == task.carfile_hash) {
            return Ok(());
        }
        state.waiting.push_back(task.clone());
        Ok(())
    }

    async fn pop_waiting(&self) -> Result<Option<WaitingTask>, StoreError> {
        Ok(self.inner.lock().waiting.pop_front())
    }

    async fn remove_waiting(&self, carfile_hash: &str) -> Result<(), StoreError> {
        self.inner.lock().waiting.retain(|t| t.carfile_hash != carfile_hash);
        Ok(())
    }

    async fn incr_device_field(
        &self,
        device_id: &str,
        field: DeviceField,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut state = self.inner.lock();
        let entry = state
            .device_fields
            .entry(device_id.to_string())
            .or_default()
            .entry(field.as_str())
            .or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn device_field(&self, device_id: &str, field: DeviceField) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .lock()
            .device_fields
            .get(device_id)
            .and_then(|m| m.get(field.as_str()))
            .copied()
            .unwrap_or(0))
    }

    async fn set_device_disk_usage(&self, device_id: &str, usage: f64) -> Result<(), StoreError> {
        self.inner.lock().disk_usage.insert(device_id.to_string(), usage);
        Ok(())
    }

    async fn device_disk_usage(&self, device_id: &str) -> Result<f64, StoreError> {
        Ok(self.inner.lock().disk_usage.get(device_id).copied().unwrap_or(0.0))
    }

    async fn incr_base_field(&self, field: BaseField, delta: i64) -> Result<i64, StoreError> {
        let mut state = self.inner.lock();
        let entry = state.base_fields.entry(field.as_str()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn base_field(&self, field: BaseField) -> Result<i64, StoreError> {
        Ok(self.inner.lock().base_fields.get(field.as_str()).copied().unwrap_or(0))
    }

    async fn next_download_serial(&self) -> Result<u64, StoreError> {
        let mut state = self.inner.lock();
        state.download_serial += 1;
        Ok(state.download_serial)
    }
}
