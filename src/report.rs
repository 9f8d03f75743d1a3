// JSON report model.
//
// Measurements serialize rounded to four decimal digits; serde_json
// already trims trailing zeros from the shortest representation, which
// matches the fixed-point-then-trim convention of the report format.

use std::path::Path;
use std::time::Instant;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::coefficients::REFERENCE_OFFSET_DB;
use crate::gating::LkfsResult;

/// A reported floating-point value, rounded to 4 decimals on output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement(pub f64);

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rounded = (self.0 * 1e4).round() / 1e4;
        serializer.serialize_f64(rounded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub file: String,
    pub original_sample_rate: u32,
    pub effective_sample_rate: u32,
    pub channels: usize,
    pub frames: u64,
    pub duration_seconds: Measurement,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMeasurements {
    pub leq_m: Measurement,
    pub leq_no_weight: Measurement,
    pub mean_power: Measurement,
    pub mean_power_weighted: Measurement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lkfs: Option<LkfsField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub true_peak_db: Option<Measurement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allen: Option<Measurement>,
}

/// LKFS serializes as a number, or the literal string "below_floor"
/// when gating left no surviving blocks.
#[derive(Debug, Clone, Copy)]
pub struct LkfsField(pub LkfsResult);

impl Serialize for LkfsField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            LkfsResult::Value(v) => Measurement(v).serialize(serializer),
            LkfsResult::BelowFloor => serializer.serialize_str("below_floor"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStat {
    pub channel: usize,
    pub peak_db: Measurement,
    pub average_db: Measurement,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionInfo {
    pub binary_path: String,
    pub binary_version: String,
    pub execution_seconds: Measurement,
    pub speed_index: Measurement,
    pub mbps: Measurement,
}

impl ExecutionInfo {
    /// Wall-clock figures for the finished run; the speed index is
    /// audio seconds per wall second.
    pub fn gather(input_path: &Path, start: Instant, audio_seconds: f64) -> Self {
        let binary_path = std::env::current_exe()
            .ok()
            .and_then(|p| p.canonicalize().ok())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| std::env::args().next().unwrap_or_default());

        let execution_seconds = start.elapsed().as_secs_f64();
        let speed_index = if execution_seconds > 0.0 {
            audio_seconds / execution_seconds
        } else {
            0.0
        };
        let mbps = match std::fs::metadata(input_path) {
            Ok(meta) if execution_seconds > 0.0 => {
                (meta.len() as f64 / 1_000_000.0) / execution_seconds
            }
            _ => 0.0,
        };

        Self {
            binary_path,
            binary_version: env!("CARGO_PKG_VERSION").to_string(),
            execution_seconds: Measurement(execution_seconds),
            speed_index: Measurement(speed_index),
            mbps: Measurement(mbps),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub measurements: ReportMeasurements,
    pub reference_offset_db: f64,
    pub channel_stats: Vec<ChannelStat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processing_notes: Vec<String>,
}

impl Report {
    pub fn reference_offset() -> f64 {
        REFERENCE_OFFSET_DB
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("report serialization cannot fail")
    }
}

/// `{"error":{"kind":...,"detail":...}}` for the failure path.
pub struct ErrorRecord<'a>(pub &'a crate::MeterError);

impl Serialize for ErrorRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Inner {
            kind: &'static str,
            detail: String,
        }
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(
            "error",
            &Inner {
                kind: self.0.kind(),
                detail: self.0.to_string(),
            },
        )?;
        map.end()
    }
}

pub fn error_json(err: &crate::MeterError) -> String {
    serde_json::to_string(&ErrorRecord(err)).expect("error serialization cannot fail")
}
