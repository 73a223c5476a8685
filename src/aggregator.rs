//! ==============================================================================
//! aggregator.rs - per-field roll-up of a buffered batch
//! ==============================================================================
//!
//! for each field independently: max, min, arithmetic mean and population
//! variance (divisor n). sums are accumulated in f64 in input order, so a
//! fixed input order always yields the same f32 results; reordering the
//! batch may change the last bits.
//!
//! ==============================================================================

use crate::domain::{BufferedRecord, Field, Reading, SummaryRecord};
use crate::error::{IngestError, IngestResult};

pub fn aggregate(
    device_id: &str,
    records: &[BufferedRecord],
    now: i64,
) -> IngestResult<SummaryRecord> {
    if records.is_empty() {
        return Err(IngestError::EmptyBatch);
    }
    let n = records.len() as f64;

    let mut max = records[0].reading;
    let mut min = records[0].reading;
    let mut avg = Reading::default();
    let mut var = Reading::default();

    for field in Field::ALL {
        let mut sum = 0.0f64;
        for record in records {
            let v = record.reading.get(field);
            if v > max.get(field) {
                max.set(field, v);
            }
            if v < min.get(field) {
                min.set(field, v);
            }
            sum += v as f64;
        }
        let mean = sum / n;

        let mut squares = 0.0f64;
        for record in records {
            let d = record.reading.get(field) as f64 - mean;
            squares += d * d;
        }

        avg.set(field, mean as f32);
        var.set(field, (squares / n) as f32);
    }

    Ok(SummaryRecord {
        id: 0,
        device_id: device_id.to_string(),
        created_at: now,
        sample_count: records.len() as u32,
        max,
        min,
        avg,
        var,
    })
}
