//! in-memory backend; everything is lost when the process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{DeviceRegistry, IngestionBuffer, StoreError, SummaryStore};
use crate::domain::{BufferedRecord, Device, DeviceStatus, Reading, SummaryRecord};

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    buffer: Vec<BufferedRecord>,
    summaries: Vec<SummaryRecord>,
    next_record_id: i64,
    next_summary_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn find(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.lock().devices.get(device_id).cloned())
    }

    async fn provision(&self, device_id: &str, secret: &str) -> Result<(), StoreError> {
        self.lock()
            .devices
            .entry(device_id.to_string())
            .and_modify(|d| d.secret = secret.to_string())
            .or_insert_with(|| Device::new(device_id, secret));
        Ok(())
    }

    async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::NotFound(format!("device {}", device_id)))?;
        device.status = status;
        Ok(())
    }

    async fn record_activity(&self, device_id: &str, at: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::NotFound(format!("device {}", device_id)))?;
        device.last_seen = Some(at);
        device.status = DeviceStatus::Active;
        Ok(())
    }

    async fn transition(
        &self,
        device_id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.devices.get_mut(device_id) {
            Some(device) if device.status == from => {
                device.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl IngestionBuffer for MemoryStore {
    async fn append(
        &self,
        device_id: &str,
        timestamp: i64,
        reading: &Reading,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        inner.next_record_id += 1;
        let id = inner.next_record_id;
        inner.buffer.push(BufferedRecord {
            id,
            device_id: device_id.to_string(),
            timestamp,
            reading: *reading,
            processed: false,
        });
        Ok(id)
    }

    async fn count_unprocessed(&self, device_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .buffer
            .iter()
            .filter(|r| r.device_id == device_id && !r.processed)
            .count() as u64)
    }

    async fn drain_unprocessed(&self, device_id: &str) -> Result<Vec<BufferedRecord>, StoreError> {
        Ok(self
            .lock()
            .buffer
            .iter()
            .filter(|r| r.device_id == device_id && !r.processed)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, device_id: &str, ids: &[i64]) -> Result<u64, StoreError> {
        let mut changed = 0;
        for record in self.lock().buffer.iter_mut() {
            if record.device_id == device_id && !record.processed && ids.contains(&record.id) {
                record.processed = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn purge_processed(&self, device_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.buffer.len();
        inner.buffer.retain(|r| !(r.device_id == device_id && r.processed));
        Ok((before - inner.buffer.len()) as u64)
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn insert(&self, summary: &SummaryRecord) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        inner.next_summary_id += 1;
        let id = inner.next_summary_id;
        let mut stored = summary.clone();
        stored.id = id;
        inner.summaries.push(stored);
        Ok(id)
    }

    async fn list(
        &self,
        device_id: &str,
        after: Option<i64>,
        before: Option<i64>,
    ) -> Result<Vec<SummaryRecord>, StoreError> {
        let mut found: Vec<_> = self
            .lock()
            .summaries
            .iter()
            .filter(|s| s.device_id == device_id)
            .filter(|s| after.map_or(true, |a| s.created_at > a))
            .filter(|s| before.map_or(true, |b| s.created_at < b))
            .cloned()
            .collect();
        found.sort_by_key(|s| (s.created_at, s.id));
        Ok(found)
    }
}
