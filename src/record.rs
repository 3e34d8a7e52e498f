//! Constants and small helpers shared across every component boundary: the
//! record identity fields stamped on all persisted output, the stream format
//! and sensor type enums, and the UTC timestamp conventions used in filenames.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column names for the record identity fields carried in every output
/// filename or tabular row.
pub mod record_id {
    pub const VERSION: &str = "version_id";
    pub const DATA_TYPE_ID: &str = "data_type_id";
    pub const DEVICE_ID: &str = "device_id";
    pub const SENSOR_INDEX: &str = "sensor_index";
    pub const STREAM_INDEX: &str = "stream_index";
    pub const TIMESTAMP: &str = "timestamp";
    pub const END_TIME: &str = "end_time";
    pub const OFFSET: &str = "primary_offset_index";
    pub const SECONDARY_OFFSET: &str = "secondary_offset_index";
    pub const SUFFIX: &str = "file_suffix";
    pub const INCREMENT: &str = "increment";
}

/// The fields that must be present on every persisted record.
pub const REQD_RECORD_ID_FIELDS: [&str; 6] = [
    record_id::VERSION,
    record_id::DATA_TYPE_ID,
    record_id::DEVICE_ID,
    record_id::SENSOR_INDEX,
    record_id::STREAM_INDEX,
    record_id::TIMESTAMP,
];

/// Record format version encoded in filenames and rows.
pub const RECORD_VERSION: &str = "V3";

/// Physical interface class of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorType {
    I2c,
    Usb,
    Camera,
    /// Internal system sensors (device health, self-telemetry).
    Sys,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::I2c => "I2C",
            SensorType::Usb => "USB",
            SensorType::Camera => "CAMERA",
            SensorType::Sys => "SYS",
        }
    }
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data format of a stream's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Df,
    Csv,
    Log,
    Jpg,
    Png,
    Mp4,
    Avi,
    H264,
    Wav,
    Txt,
    Yaml,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Df => "df",
            Format::Csv => "csv",
            Format::Log => "log",
            Format::Jpg => "jpg",
            Format::Png => "png",
            Format::Mp4 => "mp4",
            Format::Avi => "avi",
            Format::H264 => "h264",
            Format::Wav => "wav",
            Format::Txt => "txt",
            Format::Yaml => "yaml",
        }
    }

    /// Tabular formats are routed through DataFrame-style row processing;
    /// everything else is handed to processors as whole files.
    pub fn is_tabular(&self) -> bool {
        matches!(self, Format::Df | Format::Csv | Format::Log)
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Blob storage tier requested for uploaded records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    #[default]
    Hot,
    Cool,
    Cold,
}

/// File naming convention used by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNaming {
    #[default]
    Default,
    /// Drops the timestamp fields so each write overwrites the previous one;
    /// used for near-real-time manual inspection in review mode.
    ReviewMode,
}

/// System stream type ids produced by the runtime itself.
pub const HEART_TYPE_ID: &str = "HEART";
pub const WARNING_TYPE_ID: &str = "WARNING";
pub const SCORE_TYPE_ID: &str = "SCORE";
pub const SCORP_TYPE_ID: &str = "SCORP";

pub const SYSTEM_TYPE_IDS: [&str; 4] = [
    HEART_TYPE_ID,
    WARNING_TYPE_ID,
    SCORE_TYPE_ID,
    SCORP_TYPE_ID,
];

pub const SCORP_STREAM_INDEX: u32 = 0;
pub const SCORE_STREAM_INDEX: u32 = 1;

/// Timestamp format used inside filenames: UTC, millisecond precision,
/// no separators so names stay glob-friendly.
const FNAME_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for use in a filename.
pub fn utc_to_fname_str(t: DateTime<Utc>) -> String {
    t.format(FNAME_TIME_FORMAT).to_string()
}

/// Format a timestamp as ISO 8601 with millisecond precision.
pub fn utc_to_iso_str(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a filename timestamp back into a UTC datetime.
pub fn utc_from_fname_str(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, FNAME_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
