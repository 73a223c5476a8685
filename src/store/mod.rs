//! ==============================================================================
//! store/mod.rs - persistence seams of the ingestion pipeline
//! ==============================================================================
//!
//! purpose:
//!     the pipeline talks to three traits and never to a database directly:
//!
//!     - DeviceRegistry   : device lookup, status and last-seen updates
//!     - IngestionBuffer  : durable append-only queue of accepted readings
//!     - SummaryStore     : append-only roll-up records
//!
//! backends:
//!     - memory.rs : process-local, for tests and throwaway runs
//!     - sqlite.rs : durable; `append` returns after the row is committed
//!
//! ==============================================================================

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::domain::{BufferedRecord, Device, DeviceStatus, Reading, SummaryRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// insert or update the secret of a device, keeping status and last-seen
    async fn provision(&self, device_id: &str, secret: &str) -> Result<(), StoreError>;

    async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<(), StoreError>;

    /// set last-seen and mark the device active
    async fn record_activity(&self, device_id: &str, at: i64) -> Result<(), StoreError>;

    /// change status only if it currently equals `from`; returns whether it changed
    async fn transition(
        &self,
        device_id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait IngestionBuffer: Send + Sync {
    /// store an unprocessed record, returning its id
    async fn append(
        &self,
        device_id: &str,
        timestamp: i64,
        reading: &Reading,
    ) -> Result<i64, StoreError>;

    async fn count_unprocessed(&self, device_id: &str) -> Result<u64, StoreError>;

    /// every unprocessed record of the device, oldest first; nothing is removed
    async fn drain_unprocessed(&self, device_id: &str) -> Result<Vec<BufferedRecord>, StoreError>;

    /// flip processed=true for exactly `ids`; returns the number of rows changed
    async fn mark_processed(&self, device_id: &str, ids: &[i64]) -> Result<u64, StoreError>;

    /// delete processed records of the device
    async fn purge_processed(&self, device_id: &str) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// persist a summary, returning its id
    async fn insert(&self, summary: &SummaryRecord) -> Result<i64, StoreError>;

    /// summaries of a device with `after < created_at < before`, oldest first
    async fn list(
        &self,
        device_id: &str,
        after: Option<i64>,
        before: Option<i64>,
    ) -> Result<Vec<SummaryRecord>, StoreError>;
}

/// the three stores, shared by the pipeline, the analyzer and the http layer
#[derive(Clone)]
pub struct Storage {
    pub devices: Arc<dyn DeviceRegistry>,
    pub buffer: Arc<dyn IngestionBuffer>,
    pub summaries: Arc<dyn SummaryStore>,
}

impl Storage {
    pub fn memory() -> Self {
        let store = Arc::new(memory::MemoryStore::new());
        Self {
            devices: store.clone(),
            buffer: store.clone(),
            summaries: store,
        }
    }

    pub fn sqlite(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let store = Arc::new(sqlite::SqliteStore::open(path)?);
        Ok(Self {
            devices: store.clone(),
            buffer: store.clone(),
            summaries: store,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StoreError> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Sqlite => Self::sqlite(&config.sqlite_path),
        }
    }
}
