//! ==============================================================================
//! ranges.rs - acceptable sensor-value envelopes per (scene, season)
//! ==============================================================================
//!
//! purpose:
//!     static lookup of the inclusive [min, max] interval every field must fall
//!     in, keyed by the deployment scene and the season. loaded once at startup
//!     and shared read-only afterwards.
//!
//! sources:
//!     - built-in table (family / lab / greenhouse x winter / summer)
//!     - optional toml override, `ranges.path` in host.toml:
//!
//!         [lab.winter]
//!         temperature = [15.0, 20.0]
//!         humidity    = [40.0, 55.0]
//!         ...         (all ten fields required)
//!
//! ==============================================================================

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::domain::Field;

/// inclusive interval
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval {
    pub min: f32,
    pub max: f32,
}

impl Interval {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// the ten intervals for one (scene, season), indexed in `Field::ALL` order
#[derive(Clone, Debug, PartialEq)]
pub struct SeasonRanges([Interval; 10]);

impl SeasonRanges {
    pub fn get(&self, field: Field) -> Interval {
        self.0[field as usize]
    }
}

/// which half of the key was not found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingContext {
    Scene,
    Season,
}

#[derive(Clone, Debug, Default)]
pub struct RangeTable {
    scenes: HashMap<String, HashMap<String, SeasonRanges>>,
}

impl RangeTable {
    /// look up the envelope; the scene is resolved before the season
    pub fn lookup(&self, scene: &str, season: &str) -> Result<&SeasonRanges, MissingContext> {
        let seasons = self.scenes.get(scene).ok_or(MissingContext::Scene)?;
        seasons.get(season).ok_or(MissingContext::Season)
    }

    pub fn insert(&mut self, scene: &str, season: &str, ranges: SeasonRanges) {
        self.scenes
            .entry(scene.to_string())
            .or_default()
            .insert(season.to_string(), ranges);
    }

    /// (scene, season) pairs, sorted
    pub fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self
            .scenes
            .iter()
            .flat_map(|(scene, seasons)| {
                seasons.keys().map(move |season| (scene.clone(), season.clone()))
            })
            .collect();
        keys.sort();
        keys
    }

    /// the table shipped with the hub
    pub fn builtin() -> Self {
        let mut table = RangeTable::default();
        for (scene, season, ranges) in BUILTIN {
            table.insert(scene, season, SeasonRanges(*ranges));
        }
        table
    }

    /// load a toml override file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read range table {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid range table {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        type Raw = HashMap<String, HashMap<String, HashMap<String, [f32; 2]>>>;
        let raw: Raw = toml::from_str(content)?;

        let mut table = RangeTable::default();
        for (scene, seasons) in raw {
            for (season, fields) in seasons {
                let mut intervals = [Interval::new(0.0, 0.0); 10];
                for field in Field::ALL {
                    let [min, max] = fields
                        .get(field.name())
                        .copied()
                        .ok_or_else(|| anyhow!("{}.{}: missing field {}", scene, season, field))?;
                    if !(min <= max) {
                        bail!("{}.{}.{}: min {} exceeds max {}", scene, season, field, min, max);
                    }
                    intervals[field as usize] = Interval::new(min, max);
                }
                if let Some(unknown) = fields.keys().find(|k| Field::from_name(k).is_none()) {
                    bail!("{}.{}: unknown field {}", scene, season, unknown);
                }
                table.insert(&scene, &season, SeasonRanges(intervals));
            }
        }
        if table.scenes.is_empty() {
            bail!("range table is empty");
        }
        Ok(table)
    }
}

const fn iv(min: f32, max: f32) -> Interval {
    Interval::new(min, max)
}

// field order: temperature, humidity, fresh_air, ozone, nitro_dio,
// methanal, pm2_5, carb_momo, bacteria, radon
const BUILTIN: &[(&str, &str, [Interval; 10])] = &[
    ("family", "winter", [
        iv(16.0, 22.0), iv(30.0, 50.0), iv(0.5, 1.0), iv(0.019, 0.031), iv(0.017, 0.032),
        iv(0.021, 0.085), iv(15.214, 40.032), iv(0.601, 4.054), iv(120.0, 800.0), iv(1.245, 3.519),
    ]),
    ("family", "summer", [
        iv(24.0, 28.0), iv(40.0, 70.0), iv(1.0, 1.5), iv(0.028, 0.054), iv(0.021, 0.051),
        iv(0.032, 0.112), iv(10.012, 45.564), iv(0.512, 3.521), iv(100.0, 600.0), iv(1.065, 3.041),
    ]),
    ("lab", "winter", [
        iv(15.0, 20.0), iv(40.0, 55.0), iv(2.0, 3.0), iv(0.005, 0.015), iv(0.005, 0.015),
        iv(0.014, 0.049), iv(6.140, 15.001), iv(0.122, 1.575), iv(60.0, 400.0), iv(0.654, 1.525),
    ]),
    ("lab", "summer", [
        iv(20.0, 24.0), iv(45.0, 60.0), iv(2.5, 4.0), iv(0.018, 0.028), iv(0.017, 0.028),
        iv(0.014, 0.055), iv(5.235, 18.002), iv(0.185, 1.810), iv(50.0, 350.0), iv(0.540, 1.800),
    ]),
    ("greenhouse", "winter", [
        iv(15.0, 25.0), iv(45.0, 75.0), iv(1.0, 2.0), iv(0.015, 0.034), iv(0.019, 0.031),
        iv(0.010, 0.041), iv(12.201, 35.203), iv(0.201, 2.530), iv(120.0, 700.0), iv(0.650, 2.510),
    ]),
    ("greenhouse", "summer", [
        iv(20.0, 30.0), iv(50.0, 80.0), iv(1.5, 3.0), iv(0.011, 0.041), iv(0.019, 0.041),
        iv(0.015, 0.052), iv(10.325, 38.914), iv(0.284, 2.857), iv(100.0, 750.0), iv(0.549, 2.875),
    ]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_three_scenes_two_seasons() {
        let table = RangeTable::builtin();
        assert_eq!(table.keys().len(), 6);
        let lab = table.lookup("lab", "winter").unwrap();
        assert_eq!(lab.get(Field::Temperature), Interval::new(15.0, 20.0));
        assert_eq!(lab.get(Field::Radon), Interval::new(0.654, 1.525));
    }

    #[test]
    fn scene_is_resolved_before_season() {
        let table = RangeTable::builtin();
        assert_eq!(table.lookup("office", "autumn"), Err(MissingContext::Scene));
        assert_eq!(table.lookup("lab", "autumn"), Err(MissingContext::Season));
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        let iv = Interval::new(1.0, 2.0);
        assert!(iv.contains(1.0));
        assert!(iv.contains(2.0));
        assert!(!iv.contains(2.0001));
        assert!(!iv.contains(f32::NAN));
    }

    #[test]
    fn toml_override_requires_every_field() {
        let partial = "[office.autumn]\ntemperature = [18.0, 24.0]\n";
        let err = RangeTable::from_toml(partial).unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }

    #[test]
    fn toml_override_parses_full_season() {
        let mut content = String::from("[office.autumn]\n");
        for field in Field::ALL {
            content.push_str(&format!("{} = [1.0, 2.0]\n", field.name()));
        }
        let table = RangeTable::from_toml(&content).unwrap();
        let ranges = table.lookup("office", "autumn").unwrap();
        assert_eq!(ranges.get(Field::Pm25), Interval::new(1.0, 2.0));
    }

    #[test]
    fn toml_override_rejects_inverted_interval() {
        let mut content = String::from("[office.autumn]\n");
        for field in Field::ALL {
            content.push_str(&format!("{} = [3.0, 2.0]\n", field.name()));
        }
        assert!(RangeTable::from_toml(&content).is_err());
    }
}
