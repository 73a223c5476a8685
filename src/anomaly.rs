//! ==============================================================================
//! anomaly.rs - range check of a reading against its scene/season envelope
//! ==============================================================================
//!
//! fails closed: an unknown scene or season marks the whole reading anomalous.
//! otherwise every field is checked (no short-circuit) so simultaneous
//! violations are all reported.
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{Field, Reading};
use crate::ranges::{MissingContext, RangeTable};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_normal: bool,
    /// offending fields in canonical order ("scene" / "season" when the
    /// envelope itself is missing)
    pub anomaly_fields: Vec<String>,
    pub anomaly_details: BTreeMap<String, String>,
}

impl AnomalyResult {
    fn normal() -> Self {
        Self {
            is_normal: true,
            anomaly_fields: Vec::new(),
            anomaly_details: BTreeMap::new(),
        }
    }

    fn flag(&mut self, name: &str, detail: String) {
        self.is_normal = false;
        self.anomaly_fields.push(name.to_string());
        self.anomaly_details.insert(name.to_string(), detail);
    }
}

#[derive(Clone)]
pub struct AnomalyChecker {
    table: Arc<RangeTable>,
}

impl AnomalyChecker {
    pub fn new(table: Arc<RangeTable>) -> Self {
        Self { table }
    }

    pub fn check(&self, reading: &Reading, scene: &str, season: &str) -> AnomalyResult {
        let mut result = AnomalyResult::normal();

        let ranges = match self.table.lookup(scene, season) {
            Ok(ranges) => ranges,
            Err(MissingContext::Scene) => {
                result.flag("scene", format!("unknown scene '{}'", scene));
                return result;
            }
            Err(MissingContext::Season) => {
                result.flag("season", format!("unknown season '{}' for scene '{}'", season, scene));
                return result;
            }
        };

        for field in Field::ALL {
            let value = reading.get(field);
            let interval = ranges.get(field);
            if !interval.contains(value) {
                result.flag(
                    field.name(),
                    format!(
                        "value {:.3} outside normal range [{:.3}, {:.3}]",
                        value, interval.min, interval.max
                    ),
                );
            }
        }
        result
    }
}
