//! ==============================================================================
//! pipeline.rs - per-upload orchestration
//! ==============================================================================
//!
//! purpose:
//!     takes one signed upload from "received" to "acknowledged", or to a
//!     terminal rejection. each step's failure aborts the upload:
//!
//!       1. resolve device            -> UnknownDevice
//!       2. freshness + signature     -> ExpiredRequest | InvalidSignature
//!       3. replay guard              -> ReplayDetected
//!       4. anomaly check             -> AnomalousReading (device marked anomalous)
//!       5. append to buffer          -> StorageFailure
//!       6. roll-up when the unprocessed count reaches the threshold
//!       7. re-arm idle timer, record last-seen, status active
//!
//! concurrency:
//!     steps 5-6 run under a per-device async mutex so two uploads of the same
//!     device never both see the threshold and aggregate the same rows, and a
//!     reading appended during a roll-up is not marked processed by it.
//!     different devices never wait on each other.
//!
//! relationships:
//!     - used by: server.rs (upload handler), main.rs (construction, shutdown)
//!     - uses: signature.rs, replay.rs, anomaly.rs, aggregator.rs, idle.rs, store/*
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregator;
use crate::anomaly::AnomalyChecker;
use crate::config::IngestConfig;
use crate::domain::{unix_now, DeviceStatus, UploadEnvelope};
use crate::error::{IngestError, IngestResult};
use crate::idle::IdleMonitor;
use crate::ranges::RangeTable;
use crate::replay::ReplayGuard;
use crate::signature::SignatureValidator;
use crate::store::Storage;

/// what an accepted upload produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    pub record_id: i64,
    /// set when this upload triggered a roll-up
    pub summary_id: Option<i64>,
}

pub struct Pipeline {
    storage: Storage,
    validator: SignatureValidator,
    replay: Arc<ReplayGuard>,
    anomaly: AnomalyChecker,
    idle: Arc<IdleMonitor>,
    threshold: u64,
    purge_after_aggregation: bool,
    device_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(config: &IngestConfig, storage: Storage, ranges: Arc<RangeTable>) -> Self {
        let idle = Arc::new(IdleMonitor::new(config.idle_after(), storage.devices.clone()));
        Self {
            validator: SignatureValidator::new(
                config.signature_scheme,
                config.freshness_seconds as i64,
            ),
            replay: Arc::new(ReplayGuard::new(config.replay_ttl())),
            anomaly: AnomalyChecker::new(ranges),
            idle,
            threshold: config.aggregation_threshold,
            purge_after_aggregation: config.purge_after_aggregation,
            device_locks: std::sync::Mutex::new(HashMap::new()),
            storage,
        }
    }

    pub fn replay_guard(&self) -> Arc<ReplayGuard> {
        self.replay.clone()
    }

    pub fn idle_monitor(&self) -> Arc<IdleMonitor> {
        self.idle.clone()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub async fn ingest(&self, upload: &UploadEnvelope) -> IngestResult<UploadOutcome> {
        self.ingest_at(upload, unix_now()).await
    }

    /// run the pipeline with an explicit hub clock (unix seconds)
    pub async fn ingest_at(
        &self,
        upload: &UploadEnvelope,
        now: i64,
    ) -> IngestResult<UploadOutcome> {
        let device = self
            .storage
            .devices
            .find(&upload.device_id)
            .await?
            .ok_or(IngestError::UnknownDevice)?;

        self.validator.validate(&device, upload.timestamp, &upload.signature, now)?;
        self.replay.check_and_record(&upload.signature)?;

        let check = self.anomaly.check(&upload.data, &upload.scene, &upload.season);
        if !check.is_normal {
            tracing::warn!(
                device_id = %device.device_id,
                fields = ?check.anomaly_fields,
                "anomalous reading rejected"
            );
            self.storage
                .devices
                .set_status(&device.device_id, DeviceStatus::Anomalous)
                .await?;
            return Err(IngestError::AnomalousReading(check));
        }

        let (record_id, summary_id) = {
            let lock = self.device_lock(&device.device_id);
            let _guard = lock.lock().await;

            let record_id = self
                .storage
                .buffer
                .append(&device.device_id, upload.timestamp, &upload.data)
                .await?;
            let summary_id = self.roll_up_if_due(&device.device_id, now).await?;
            (record_id, summary_id)
        };

        // re-arm before recording activity: a timer that is already firing
        // finishes first, so it cannot overwrite the fresh `active` status
        self.idle.touch(&device.device_id).await;
        self.storage.devices.record_activity(&device.device_id, now).await?;

        tracing::debug!(device_id = %device.device_id, record_id, "upload accepted");
        Ok(UploadOutcome { record_id, summary_id })
    }

    /// aggregate the device's unprocessed readings once enough have piled up.
    /// caller holds the device lock.
    async fn roll_up_if_due(&self, device_id: &str, now: i64) -> IngestResult<Option<i64>> {
        let buffer = &self.storage.buffer;
        if buffer.count_unprocessed(device_id).await? < self.threshold {
            return Ok(None);
        }

        let batch = buffer.drain_unprocessed(device_id).await?;
        let summary = aggregator::aggregate(device_id, &batch, now)?;
        let summary_id = self.storage.summaries.insert(&summary).await?;

        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        buffer.mark_processed(device_id, &ids).await?;
        if self.purge_after_aggregation {
            buffer.purge_processed(device_id).await?;
        }

        tracing::info!(device_id, summary_id, readings = batch.len(), "readings rolled up");
        Ok(Some(summary_id))
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .device_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(device_id.to_string()).or_default().clone()
    }
}
