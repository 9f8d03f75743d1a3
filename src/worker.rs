// Block workers.
//
// Each worker pulls descriptors from its bounded queue in arrival
// order. Filter state lives with the worker, one bank per partition it
// owns, created from zero history the first time a partition's block
// arrives. Accumulation is block-local; the only shared writes are the
// per-block commit and the end-of-partition peak merge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;

use crate::energy::{ChannelEnergy, EnergyLedger};
use crate::gating::WindowCollector;
use crate::k_weighting::KWeightingBank;
use crate::m_weighting::WeightingBank;
use crate::scheduler::{
    BlockDescriptor, FaultCell, Partition, PartitionTracker, ProgressSink,
};
use crate::series::SeriesCollector;
use crate::true_peak::{TruePeakCollector, TruePeakMeter};
use crate::MeterResult;

pub(crate) struct UngatedParams<'a> {
    pub samples: &'a [f64],
    pub channels: usize,
    pub sample_rate: u32,
    pub block_frames: usize,
    pub conv_points: Option<usize>,
    /// `Some(factor)` when the true-peak estimator is active.
    pub oversampling: Option<u32>,
    pub cal_gains: &'a [f64],
    pub partitions: &'a [Partition],
    pub ledger: &'a EnergyLedger,
    pub series: Option<&'a SeriesCollector>,
    pub peaks: Option<&'a TruePeakCollector>,
    pub cancel: &'a AtomicBool,
    pub fault: &'a FaultCell,
    pub tracker: &'a PartitionTracker,
    pub progress: &'a ProgressSink<'a>,
}

struct UngatedPartitionState {
    partition: usize,
    bank: WeightingBank,
    peak: Option<TruePeakMeter>,
}

pub(crate) fn run_ungated_worker(rx: Receiver<BlockDescriptor>, params: UngatedParams<'_>) {
    let mut states: Vec<UngatedPartitionState> = Vec::new();

    for descriptor in rx.iter() {
        if params.fault.is_set() {
            break;
        }

        // The fault cell, not the user cancel flag, stops the other
        // workers: the flag may be shared by concurrent measurements.
        if let Err(err) = process_ungated_block(&descriptor, &mut states, &params) {
            params.fault.set(err);
            break;
        }

        // Drain the in-flight block, then stop pulling.
        if params.cancel.load(Ordering::Relaxed) {
            break;
        }
    }

    if let Some(peaks) = params.peaks {
        for state in &states {
            if let Some(meter) = &state.peak {
                peaks.merge(params.partitions[state.partition].channel, meter.peak());
            }
        }
    }
}

fn process_ungated_block(
    descriptor: &BlockDescriptor,
    states: &mut Vec<UngatedPartitionState>,
    params: &UngatedParams<'_>,
) -> MeterResult<()> {
    let partition = &params.partitions[descriptor.partition];
    let channel = partition.channel;
    let cal = params.cal_gains[channel];

    if !states.iter().any(|s| s.partition == descriptor.partition) {
        let peak = match params.oversampling {
            Some(factor) => Some(TruePeakMeter::new(factor)?),
            None => None,
        };
        states.push(UngatedPartitionState {
            partition: descriptor.partition,
            // One channel per partition, so the bank is single-lane.
            bank: WeightingBank::new(params.sample_rate, 1, params.conv_points)?,
            peak,
        });
    }
    let state = states
        .iter_mut()
        .find(|s| s.partition == descriptor.partition)
        .expect("partition state just inserted");

    let mut local = ChannelEnergy::default();
    for f in 0..descriptor.frames {
        let idx = (descriptor.start_frame + f as u64) as usize * params.channels + channel;
        let raw = params.samples[idx];
        let weighted = state.bank.process(0, raw * cal);
        local.add_sample(raw, weighted);
        if let Some(meter) = &mut state.peak {
            meter.process_sample(raw);
        }
    }

    params.ledger.commit(descriptor.partition, &local)?;
    params.tracker.block_committed(descriptor.partition);

    if let Some(series) = params.series {
        let block_index = (descriptor.start_frame / params.block_frames as u64) as usize;
        series.contribute(block_index, local.sum_weighted, local.n_samples);
    }
    params.progress.bump();
    Ok(())
}

pub(crate) struct GatedParams<'a> {
    pub samples: &'a [f64],
    pub channels: usize,
    pub sample_rate: u32,
    /// Hop size in frames; one descriptor covers one hop window.
    pub block_frames: usize,
    pub channel_gains: Option<&'a [f64]>,
    pub cal_gains: &'a [f64],
    pub partitions: &'a [Partition],
    pub windows: &'a WindowCollector,
    pub cancel: &'a AtomicBool,
    pub fault: &'a FaultCell,
    pub tracker: &'a PartitionTracker,
    pub progress: &'a ProgressSink<'a>,
}

struct GatedPartitionState {
    partition: usize,
    bank: KWeightingBank,
}

pub(crate) fn run_gated_worker(rx: Receiver<BlockDescriptor>, params: GatedParams<'_>) {
    let mut states: Vec<GatedPartitionState> = Vec::new();

    for descriptor in rx.iter() {
        if params.fault.is_set() {
            break;
        }
        if let Err(err) = process_gated_block(&descriptor, &mut states, &params) {
            params.fault.set(err);
            break;
        }
        if params.cancel.load(Ordering::Relaxed) {
            break;
        }
    }
}

fn process_gated_block(
    descriptor: &BlockDescriptor,
    states: &mut Vec<GatedPartitionState>,
    params: &GatedParams<'_>,
) -> MeterResult<()> {
    let partition = &params.partitions[descriptor.partition];
    let channel = partition.channel;
    let cal = params.cal_gains[channel];

    if !states.iter().any(|s| s.partition == descriptor.partition) {
        // The bank carries the full gain table but filters one lane.
        let bank = KWeightingBank::new(params.sample_rate, params.channels, params.channel_gains);
        states.push(GatedPartitionState {
            partition: descriptor.partition,
            bank,
        });
    }
    let state = states
        .iter_mut()
        .find(|s| s.partition == descriptor.partition)
        .expect("partition state just inserted");

    let mut energy = 0.0f64;
    for f in 0..descriptor.frames {
        let idx = (descriptor.start_frame + f as u64) as usize * params.channels + channel;
        let z = state.bank.process(channel, params.samples[idx] * cal);
        energy += z * z;
    }
    if !energy.is_finite() {
        return Err(crate::MeterError::NumericFailure(format!(
            "non-finite gating energy in partition {}",
            descriptor.partition
        )));
    }

    let window_index = (descriptor.start_frame / params.block_frames as u64) as usize;
    params.windows.contribute(
        window_index,
        state.bank.gain(channel) * energy,
        descriptor.frames as u64,
    );
    params.tracker.block_committed(descriptor.partition);
    params.progress.bump();
    Ok(())
}
