// Squared-sample energy accounting.
//
// Workers accumulate privately for a whole block and commit once; the
// ledger merges under a single mutex. Partials are kept per partition
// so the final reduction can sum them in partition-index order, which
// keeps results reproducible regardless of worker completion order.

use std::sync::Mutex;

use crate::coefficients::REFERENCE_OFFSET_DB;
use crate::{MeterError, MeterResult};

/// Per-channel running sums for one partition (or one block, while a
/// worker is accumulating locally).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelEnergy {
    pub sum_weighted: f64,
    pub sum_unweighted: f64,
    pub peak_abs: f64,
    pub n_samples: u64,
}

impl ChannelEnergy {
    #[inline]
    pub fn add_sample(&mut self, raw: f64, weighted: f64) {
        self.sum_weighted += weighted * weighted;
        self.sum_unweighted += raw * raw;
        let abs = raw.abs();
        if abs > self.peak_abs {
            self.peak_abs = abs;
        }
        self.n_samples += 1;
    }

    pub fn merge(&mut self, other: &ChannelEnergy) {
        self.sum_weighted += other.sum_weighted;
        self.sum_unweighted += other.sum_unweighted;
        if other.peak_abs > self.peak_abs {
            self.peak_abs = other.peak_abs;
        }
        self.n_samples += other.n_samples;
    }

    fn is_finite(&self) -> bool {
        self.sum_weighted.is_finite() && self.sum_unweighted.is_finite()
    }
}

/// One slot per partition; each partition contributes to exactly one
/// channel (partitions are single-channel time slices).
struct PartitionSlot {
    channel: usize,
    energy: ChannelEnergy,
}

pub struct GlobalEnergy {
    slots: Vec<PartitionSlot>,
    truncated: bool,
}

impl GlobalEnergy {
    /// Fold partition partials into per-channel totals, in partition
    /// index order.
    pub fn channel_totals(&self, channels: usize) -> Vec<ChannelEnergy> {
        let mut totals = vec![ChannelEnergy::default(); channels];
        for slot in &self.slots {
            totals[slot.channel].merge(&slot.energy);
        }
        totals
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// Mutex-guarded commit point shared by all workers.
pub struct EnergyLedger {
    inner: Mutex<GlobalEnergy>,
}

impl EnergyLedger {
    pub fn new(partition_channels: &[usize]) -> Self {
        let slots = partition_channels
            .iter()
            .map(|&channel| PartitionSlot {
                channel,
                energy: ChannelEnergy::default(),
            })
            .collect();
        Self {
            inner: Mutex::new(GlobalEnergy {
                slots,
                truncated: false,
            }),
        }
    }

    /// Merge a worker's block-local delta. One short critical section
    /// per block; NaN or infinity in the delta aborts the measurement.
    pub fn commit(&self, partition: usize, delta: &ChannelEnergy) -> MeterResult<()> {
        if !delta.is_finite() {
            return Err(MeterError::NumericFailure(format!(
                "non-finite energy in partition {partition}"
            )));
        }
        let mut global = self.inner.lock().expect("energy ledger poisoned");
        global.slots[partition].energy.merge(delta);
        Ok(())
    }

    pub fn mark_truncated(&self) {
        self.inner.lock().expect("energy ledger poisoned").truncated = true;
    }

    pub fn into_global(self) -> GlobalEnergy {
        self.inner.into_inner().expect("energy ledger poisoned")
    }
}

/// Convert a mean power into dB SPL with the ISO reference offset.
/// Zero or negative power reports 0.0 rather than diverging; the
/// caller notes silence separately.
pub fn level_db(mean_power: f64) -> f64 {
    if mean_power <= 0.0 {
        return 0.0;
    }
    let level = 20.0 * mean_power.sqrt().log10() + REFERENCE_OFFSET_DB;
    if level < 0.0 {
        0.0
    } else {
        level
    }
}

/// Final numbers produced by the reducer.
#[derive(Debug, Clone, Copy)]
pub struct LoudnessSummary {
    pub leq_m: f64,
    pub leq_no_weight: f64,
    pub mean_power: f64,
    pub mean_power_weighted: f64,
    pub n_mono_samples: u64,
    pub silent: bool,
}

/// Reduce channel totals to the program numbers. `n_mono_samples` is
/// frames times channels; both Leq variants average over it.
pub fn reduce(totals: &[ChannelEnergy]) -> MeterResult<LoudnessSummary> {
    let n_mono_samples: u64 = totals.iter().map(|t| t.n_samples).sum();
    if n_mono_samples == 0 {
        return Err(MeterError::InsufficientData);
    }

    let csum: f64 = totals.iter().map(|t| t.sum_weighted).sum();
    let sum: f64 = totals.iter().map(|t| t.sum_unweighted).sum();
    if !csum.is_finite() || !sum.is_finite() {
        return Err(MeterError::NumericFailure(
            "non-finite global accumulator".to_string(),
        ));
    }

    let mean_power_weighted = csum / n_mono_samples as f64;
    let mean_power = sum / n_mono_samples as f64;

    Ok(LoudnessSummary {
        leq_m: level_db(mean_power_weighted),
        leq_no_weight: level_db(mean_power),
        mean_power,
        mean_power_weighted,
        n_mono_samples,
        silent: sum == 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_order_independent() {
        let mut a = ChannelEnergy::default();
        a.add_sample(0.5, 0.4);
        a.add_sample(-0.25, -0.2);
        let mut b = ChannelEnergy::default();
        b.add_sample(0.9, 0.7);

        let mut ab = a;
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);

        assert_eq!(ab.sum_weighted, ba.sum_weighted);
        assert_eq!(ab.sum_unweighted, ba.sum_unweighted);
        assert_eq!(ab.peak_abs, ba.peak_abs);
        assert_eq!(ab.n_samples, 3);
    }

    #[test]
    fn ledger_rejects_nan() {
        let ledger = EnergyLedger::new(&[0]);
        let delta = ChannelEnergy {
            sum_weighted: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(
            ledger.commit(0, &delta),
            Err(MeterError::NumericFailure(_))
        ));
    }

    #[test]
    fn reduce_is_linear_in_amplitude() {
        // Doubling every sample must add exactly 20*log10(2) dB.
        let mut quiet = ChannelEnergy::default();
        let mut loud = ChannelEnergy::default();
        for i in 0..1000 {
            let s = ((i as f64) * 0.013).sin() * 0.1;
            quiet.add_sample(s, s);
            loud.add_sample(2.0 * s, 2.0 * s);
        }
        let a = reduce(&[quiet]).unwrap();
        let b = reduce(&[loud]).unwrap();
        assert!((b.leq_m - a.leq_m - 20.0 * 2.0f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn reduce_averages_over_mono_samples() {
        // A -20 dBFS sine has mean power 0.005; Leq(noW) = 85.0 exactly.
        let mut l = ChannelEnergy::default();
        let mut r = ChannelEnergy::default();
        for i in 0..48_000 {
            let s = 0.1 * (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 48_000.0).sin();
            l.add_sample(s, s);
            r.add_sample(s, s);
        }
        let summary = reduce(&[l, r]).unwrap();
        assert_eq!(summary.n_mono_samples, 96_000);
        assert!((summary.leq_no_weight - 85.0).abs() < 1e-3);
    }

    #[test]
    fn silence_reduces_to_floor_not_nan() {
        let mut e = ChannelEnergy::default();
        for _ in 0..100 {
            e.add_sample(0.0, 0.0);
        }
        let summary = reduce(&[e]).unwrap();
        assert!(summary.silent);
        assert_eq!(summary.leq_m, 0.0);
        assert_eq!(summary.leq_no_weight, 0.0);
    }

    #[test]
    fn zero_frames_is_insufficient_data() {
        assert!(matches!(
            reduce(&[ChannelEnergy::default()]),
            Err(MeterError::InsufficientData)
        ));
    }
}
