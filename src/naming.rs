//! Canonical record filename construction and parsing.
//!
//! The filename format is the interface contract between sensor threads and
//! worker threads: sensors stage files under names built here, and workers
//! discover them by the same convention. Treat it as a stable wire format.
//!
//! Layout: `V3_<TYPE>_<device>_<sensor>_<stream>_<timestamp>[_<end>][_<suffix>].<ext>`

use crate::error::{EdgekitError, Result};
use crate::record::{self, FileNaming, Format};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Marker used in place of the timestamp for review-mode output so each write
/// overwrites the previous one.
const REVIEW_MARKER: &str = "LATEST";

/// Parsed identity of a record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordName {
    pub version: String,
    pub type_id: String,
    pub device_id: String,
    pub sensor_index: u32,
    pub stream_index: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub suffix: Option<String>,
    pub format: Format,
}

/// The identity prefix shared by all files of one stream on one device.
/// Used by workers to glob for staged input.
pub fn data_id(type_id: &str, device_id: &str, sensor_index: u32, stream_index: u32) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        record::RECORD_VERSION,
        type_id,
        device_id,
        sensor_index,
        stream_index
    )
}

/// Build the canonical filename for a record.
#[allow(clippy::too_many_arguments)]
pub fn record_filename(
    type_id: &str,
    device_id: &str,
    sensor_index: u32,
    stream_index: u32,
    timestamp: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    suffix: Option<&str>,
    format: Format,
    naming: FileNaming,
) -> String {
    let mut name = data_id(type_id, device_id, sensor_index, stream_index);
    match naming {
        FileNaming::Default => {
            name.push('_');
            name.push_str(&record::utc_to_fname_str(timestamp));
            if let Some(end) = end_time {
                name.push('_');
                name.push_str(&record::utc_to_fname_str(end));
            }
        }
        FileNaming::ReviewMode => {
            name.push('_');
            name.push_str(REVIEW_MARKER);
        }
    }
    if let Some(suffix) = suffix {
        name.push('_');
        name.push_str(suffix);
    }
    format!("{}.{}", name, format.extension())
}

/// Parse a record filename back into its identity fields.
pub fn parse_record_filename(file_name: &str) -> Result<RecordName> {
    let (stem, ext) = file_name
        .rsplit_once('.')
        .ok_or_else(|| EdgekitError::invalid_config(format!("no extension in {file_name}")))?;

    let format = parse_format(ext)
        .ok_or_else(|| EdgekitError::invalid_config(format!("unknown format .{ext}")))?;

    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 6 {
        return Err(EdgekitError::invalid_config(format!(
            "record filename has too few fields: {file_name}"
        )));
    }

    let sensor_index: u32 = parts[3].parse().map_err(|_| {
        EdgekitError::invalid_config(format!("bad sensor index in {file_name}"))
    })?;
    let stream_index: u32 = parts[4].parse().map_err(|_| {
        EdgekitError::invalid_config(format!("bad stream index in {file_name}"))
    })?;

    let timestamp = if parts[5] == REVIEW_MARKER {
        None
    } else {
        Some(record::utc_from_fname_str(parts[5]).ok_or_else(|| {
            EdgekitError::invalid_config(format!("bad timestamp in {file_name}"))
        })?)
    };

    let mut end_time = None;
    let mut suffix_parts: Vec<&str> = Vec::new();
    for part in &parts[6..] {
        if end_time.is_none() && suffix_parts.is_empty() {
            if let Some(t) = record::utc_from_fname_str(part) {
                end_time = Some(t);
                continue;
            }
        }
        suffix_parts.push(part);
    }
    let suffix = if suffix_parts.is_empty() {
        None
    } else {
        Some(suffix_parts.join("_"))
    };

    Ok(RecordName {
        version: parts[0].to_string(),
        type_id: parts[1].to_string(),
        device_id: parts[2].to_string(),
        sensor_index,
        stream_index,
        timestamp,
        end_time,
        suffix,
        format,
    })
}

/// Extract the record timestamp from a blob or file name, if present.
/// Used for recency filtering of cloud listings.
pub fn file_datetime(file_name: &str) -> Option<DateTime<Utc>> {
    parse_record_filename(file_name).ok().and_then(|r| r.timestamp)
}

/// True if the file name belongs to the given stream identity and has the
/// expected extension.
pub fn matches_stream(
    file_name: &str,
    type_id: &str,
    device_id: &str,
    sensor_index: u32,
    stream_index: u32,
    format: Format,
) -> bool {
    file_name.starts_with(&format!(
        "{}_",
        data_id(type_id, device_id, sensor_index, stream_index)
    )) && file_name.ends_with(&format!(".{}", format.extension()))
}

/// Filename for a FAIR provenance record.
pub fn fair_filename(device_id: &str, sensor_type_id: &str, sensor_index: u32) -> String {
    format!(
        "{}_FAIR-{}_{}_{}_{}.yaml",
        record::RECORD_VERSION,
        sensor_type_id,
        device_id,
        sensor_index,
        record::utc_to_fname_str(record::utc_now())
    )
}

/// Filename for a diagnostics bundle.
pub fn diags_filename(device_id: &str) -> String {
    format!(
        "{}_DIAGS_{}_{}.txt.gz",
        record::RECORD_VERSION,
        device_id,
        record::utc_to_fname_str(record::utc_now())
    )
}

/// A scratch file name that will not collide with other writers.
pub fn temporary_filename(dir: &Path, format: Format) -> PathBuf {
    dir.join(format!("tmp_{}.{}", Uuid::new_v4().simple(), format.extension()))
}

/// A private scratch directory; the caller is responsible for removing it.
pub fn temporary_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join(format!("tmp_{}", Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn parse_format(ext: &str) -> Option<Format> {
    match ext {
        "df" => Some(Format::Df),
        "csv" => Some(Format::Csv),
        "log" => Some(Format::Log),
        "jpg" => Some(Format::Jpg),
        "png" => Some(Format::Png),
        "mp4" => Some(Format::Mp4),
        "avi" => Some(Format::Avi),
        "h264" => Some(Format::H264),
        "wav" => Some(Format::Wav),
        "txt" => Some(Format::Txt),
        "yaml" => Some(Format::Yaml),
        _ => None,
    }
}
