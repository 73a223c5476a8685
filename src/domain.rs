//! ==============================================================================
//! domain.rs - telemetry records shared by every pipeline stage
//! ==============================================================================
//!
//! purpose:
//!     the wire and storage shapes of a device reading, the signed upload that
//!     carries it, the buffered copy awaiting roll-up, and the summary produced
//!     by the aggregator.
//!
//! relationships:
//!     - used by: anomaly.rs, aggregator.rs, store/*, pipeline.rs, server.rs
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};

/// one of the ten measured quantities of a reading
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "temperature")]
    Temperature,
    #[serde(rename = "humidity")]
    Humidity,
    #[serde(rename = "fresh_air")]
    FreshAir,
    #[serde(rename = "ozone")]
    Ozone,
    #[serde(rename = "nitro_dio")]
    NitroDio,
    #[serde(rename = "methanal")]
    Methanal,
    #[serde(rename = "pm2_5")]
    Pm25,
    #[serde(rename = "carb_momo")]
    CarbMomo,
    #[serde(rename = "bacteria")]
    Bacteria,
    #[serde(rename = "radon")]
    Radon,
}

impl Field {
    /// canonical field order, used for iteration, reporting and storage columns
    pub const ALL: [Field; 10] = [
        Field::Temperature,
        Field::Humidity,
        Field::FreshAir,
        Field::Ozone,
        Field::NitroDio,
        Field::Methanal,
        Field::Pm25,
        Field::CarbMomo,
        Field::Bacteria,
        Field::Radon,
    ];

    /// wire name (matches the json keys of `Reading`)
    pub fn name(self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
            Field::FreshAir => "fresh_air",
            Field::Ozone => "ozone",
            Field::NitroDio => "nitro_dio",
            Field::Methanal => "methanal",
            Field::Pm25 => "pm2_5",
            Field::CarbMomo => "carb_momo",
            Field::Bacteria => "bacteria",
            Field::Radon => "radon",
        }
    }

    /// human label used in analysis prompts
    pub fn label(self) -> &'static str {
        match self {
            Field::Temperature => "Temperature",
            Field::Humidity => "Humidity",
            Field::FreshAir => "FreshAir",
            Field::Ozone => "Ozone",
            Field::NitroDio => "NO2",
            Field::Methanal => "Formaldehyde",
            Field::Pm25 => "PM2.5",
            Field::CarbMomo => "CO",
            Field::Bacteria => "Bacteria",
            Field::Radon => "Radon",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// a single sensor sample
///
/// every field is required on the wire; serde rejects a payload missing any
/// of them, so a partial reading never reaches the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub fresh_air: f32,
    pub ozone: f32,
    pub nitro_dio: f32,
    pub methanal: f32,
    pub pm2_5: f32,
    pub carb_momo: f32,
    pub bacteria: f32,
    pub radon: f32,
}

impl Reading {
    pub fn get(&self, field: Field) -> f32 {
        match field {
            Field::Temperature => self.temperature,
            Field::Humidity => self.humidity,
            Field::FreshAir => self.fresh_air,
            Field::Ozone => self.ozone,
            Field::NitroDio => self.nitro_dio,
            Field::Methanal => self.methanal,
            Field::Pm25 => self.pm2_5,
            Field::CarbMomo => self.carb_momo,
            Field::Bacteria => self.bacteria,
            Field::Radon => self.radon,
        }
    }

    pub fn set(&mut self, field: Field, value: f32) {
        let slot = match field {
            Field::Temperature => &mut self.temperature,
            Field::Humidity => &mut self.humidity,
            Field::FreshAir => &mut self.fresh_air,
            Field::Ozone => &mut self.ozone,
            Field::NitroDio => &mut self.nitro_dio,
            Field::Methanal => &mut self.methanal,
            Field::Pm25 => &mut self.pm2_5,
            Field::CarbMomo => &mut self.carb_momo,
            Field::Bacteria => &mut self.bacteria,
            Field::Radon => &mut self.radon,
        };
        *slot = value;
    }

    /// build a reading by evaluating `f` once per field, in canonical order
    #[cfg(test)]
    pub fn from_fn(mut f: impl FnMut(Field) -> f32) -> Self {
        let mut reading = Reading::default();
        for field in Field::ALL {
            reading.set(field, f(field));
        }
        reading
    }
}

/// a signed upload as posted by a device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadEnvelope {
    pub device_id: String,
    /// claimed submission time, unix seconds
    pub timestamp: i64,
    pub data: Reading,
    /// context tags selecting the acceptable-value envelope; never persisted
    pub scene: String,
    pub season: String,
    /// hex digest of "device_id:timestamp:secret"
    pub signature: String,
}

/// an accepted reading waiting in the ingestion buffer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    /// store-assigned, increasing with insertion order
    pub id: i64,
    pub device_id: String,
    pub timestamp: i64,
    pub reading: Reading,
    pub processed: bool,
}

/// per-field statistics over one batch of buffered readings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// store-assigned; 0 until persisted
    pub id: i64,
    pub device_id: String,
    /// unix seconds
    pub created_at: i64,
    pub sample_count: u32,
    pub max: Reading,
    pub min: Reading,
    pub avg: Reading,
    pub var: Reading,
}

/// operational status of a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Idle,
    Active,
    Anomalous,
}

impl DeviceStatus {
    /// integer code kept in storage
    pub fn code(self) -> i64 {
        match self {
            DeviceStatus::Idle => 0,
            DeviceStatus::Active => 1,
            DeviceStatus::Anomalous => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DeviceStatus::Idle),
            1 => Some(DeviceStatus::Active),
            3 => Some(DeviceStatus::Anomalous),
            _ => None,
        }
    }
}

/// a registered device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub status: DeviceStatus,
    /// unix seconds of the last accepted upload
    pub last_seen: Option<i64>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            secret: secret.into(),
            status: DeviceStatus::Idle,
            last_seen: None,
        }
    }
}

/// current wall-clock time, unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
