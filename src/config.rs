// Measurement configuration: the library-side equivalent of the CLI
// flags. main.rs builds one of these from clap; tests build them
// directly.

use std::thread::available_parallelism;

use crate::scheduler::Strategy;
use crate::{MeterError, MeterResult};

/// Which gate supplements the BS.1770 relative gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    #[default]
    None,
    /// Fixed user-supplied Leq(M) threshold replaces the relative gate.
    Level,
    /// Relative gate plus a speech-probability requirement.
    Dialogue,
}

#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Ungated block duration in milliseconds. 750 is recommended when
    /// the Allen metric is wanted; 850 is the general default.
    pub buffer_ms: u32,
    /// Worker count cap; the effective count is min(CPUs, this).
    pub num_cpus: Option<usize>,
    /// FIR convolution point count; `None` keeps the recursive filter.
    pub conv_points: Option<usize>,
    /// Per-channel calibration in dB, applied before weighting.
    pub cal_gains_db: Vec<f64>,
    /// Also log the unweighted Leq line.
    pub emit_unweighted: bool,
    /// Emit the per-block Leq(M) series log.
    pub log_leqm: bool,
    /// Emit the sliding long-window series and the Allen metric.
    pub log_leqm10: bool,
    /// Long-window duration in minutes.
    pub long_period_min: f64,
    /// Allen metric threshold in dB.
    pub allen_threshold_db: f64,
    /// Measure gated LKFS per BS.1770-4.
    pub lkfs: bool,
    /// Dialogue-gated measurement (implies the gated pipeline).
    pub dialogue: bool,
    pub gate_mode: GateMode,
    /// Speech probability threshold for the dialogue gate.
    pub speech_threshold: f64,
    /// Threshold for GateMode::Level, in Leq(M) dB.
    pub level_gate_db: Option<f64>,
    pub true_peak: bool,
    /// Oversampling factor for the true-peak estimator.
    pub oversampling: u32,
    /// Report execution timing.
    pub timing: bool,
    /// Override for the BS.1770 channel power weights.
    pub channel_gains: Option<Vec<f64>>,
    /// Gating hop as a fraction of the 400 ms gating block.
    pub hop_ratio: f64,
    /// Pin the partitioning strategy instead of the heuristic. Mostly
    /// for reproducibility comparisons; per-channel is bit-exact across
    /// worker counts, per-time trades warm-up transients for speed.
    pub partition_strategy: Option<Strategy>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 850,
            num_cpus: None,
            conv_points: None,
            cal_gains_db: Vec::new(),
            emit_unweighted: false,
            log_leqm: false,
            log_leqm10: false,
            long_period_min: 10.0,
            allen_threshold_db: 80.0,
            lkfs: false,
            dialogue: false,
            gate_mode: GateMode::None,
            speech_threshold: 0.33,
            level_gate_db: None,
            true_peak: false,
            oversampling: 4,
            timing: false,
            channel_gains: None,
            hop_ratio: 0.25,
            partition_strategy: None,
        }
    }
}

impl MeterConfig {
    pub fn validate(&self) -> MeterResult<()> {
        if !(10..=60_000).contains(&self.buffer_ms) {
            return Err(MeterError::InvalidArgument(format!(
                "block size {} ms outside 10..=60000",
                self.buffer_ms
            )));
        }
        if let Some(taps) = self.conv_points {
            if taps < 2 {
                return Err(MeterError::InvalidArgument(
                    "convolution needs at least 2 points".to_string(),
                ));
            }
        }
        if self.long_period_min <= 0.0 {
            return Err(MeterError::InvalidArgument(
                "long period must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speech_threshold) {
            return Err(MeterError::InvalidArgument(format!(
                "speech threshold {} outside 0..=1",
                self.speech_threshold
            )));
        }
        if self.gate_mode == GateMode::Level && self.level_gate_db.is_none() {
            return Err(MeterError::InvalidArgument(
                "level gating requires a threshold".to_string(),
            ));
        }
        if !(0.05..=1.0).contains(&self.hop_ratio) {
            return Err(MeterError::InvalidArgument(format!(
                "hop ratio {} outside 0.05..=1",
                self.hop_ratio
            )));
        }
        if self.true_peak && !(2..=16).contains(&self.oversampling) {
            return Err(MeterError::InvalidArgument(format!(
                "oversampling factor {} outside 2..=16",
                self.oversampling
            )));
        }
        Ok(())
    }

    /// Effective worker count: min(CPU count, override), at least one.
    pub fn workers(&self) -> usize {
        let avail = available_parallelism().map(|n| n.get()).unwrap_or(1);
        match self.num_cpus {
            Some(n) if n >= 1 => n.min(avail).max(1),
            _ => avail,
        }
    }

    /// Whether the 400 ms gated pipeline has to run at all.
    pub fn gating_active(&self) -> bool {
        self.lkfs || self.dialogue || self.gate_mode != GateMode::None
    }

    /// Linear calibration gain for a channel (1.0 when unconfigured).
    pub fn cal_gain(&self, channel: usize) -> f64 {
        self.cal_gains_db
            .get(channel)
            .map(|db| 10.0f64.powf(db / 20.0))
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(MeterConfig::default().validate().is_ok());
    }

    #[test]
    fn level_gate_needs_threshold() {
        let cfg = MeterConfig {
            gate_mode: GateMode::Level,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = MeterConfig {
            gate_mode: GateMode::Level,
            level_gate_db: Some(70.0),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn cal_gain_converts_decibels() {
        let cfg = MeterConfig {
            cal_gains_db: vec![0.0, -6.0205999132796239],
            ..Default::default()
        };
        assert!((cfg.cal_gain(0) - 1.0).abs() < 1e-12);
        assert!((cfg.cal_gain(1) - 0.5).abs() < 1e-9);
        // Channels beyond the vector are unity.
        assert_eq!(cfg.cal_gain(5), 1.0);
    }

    #[test]
    fn gating_active_flags() {
        assert!(!MeterConfig::default().gating_active());
        assert!(MeterConfig {
            lkfs: true,
            ..Default::default()
        }
        .gating_active());
        assert!(MeterConfig {
            dialogue: true,
            ..Default::default()
        }
        .gating_active());
    }
}
