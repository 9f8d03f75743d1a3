// Block scheduling and dispatch.
//
// The stream is cut into single-channel partitions: per-channel when
// there are at least as many channels as workers (one sequential
// filter stream per channel, no boundary transients), otherwise each
// channel is additionally split into workers/channels contiguous time
// slices, each starting from zero filter history. Partition boundaries
// land on block boundaries so series cells line up across strategies.
//
// Dispatch is a bounded channel of block descriptors per worker
// (capacity 2, so at most 2*W descriptors are in flight); a partition
// is consumed by exactly one worker, in stream order. Workers borrow
// the shared sample buffer through the descriptors and commit energy
// deltas once per block.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, Sender, SyncSender};
use std::sync::Mutex;
use std::thread;

use log::trace;

use crate::config::MeterConfig;
use crate::energy::EnergyLedger;
use crate::gating::WindowCollector;
use crate::series::SeriesCollector;
use crate::true_peak::TruePeakCollector;
use crate::worker::{self, GatedParams, UngatedParams};
use crate::{MeterError, MeterResult, ProgressUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PerChannel,
    PerTime,
}

/// Contiguous single-channel time range owned by one worker.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub index: usize,
    pub channel: usize,
    pub start_frame: u64,
    pub end_frame: u64,
}

impl Partition {
    pub fn frames(&self) -> u64 {
        self.end_frame - self.start_frame
    }
}

/// Lifecycle of a partition as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Ready,
    Filling,
    Full,
    Dispatched,
    Processed,
    Committed,
    Done,
}

/// One block's worth of work. Workers resolve the frame range against
/// the shared buffer; the descriptor itself is trivially copyable.
#[derive(Debug, Clone, Copy)]
pub struct BlockDescriptor {
    pub sequence: usize,
    pub partition: usize,
    pub start_frame: u64,
    pub frames: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub strategy: Strategy,
    pub partitions: Vec<Partition>,
    pub workers: usize,
    pub block_frames: usize,
    pub blocks_per_partition: Vec<usize>,
    pub total_blocks: usize,
    /// Number of distinct time blocks (series cells span channels).
    pub time_blocks: usize,
}

/// Partition the stream. `workers` is the configured thread count; the
/// effective worker count never exceeds the partition count.
pub fn plan(
    frames: u64,
    channels: usize,
    workers: usize,
    block_frames: usize,
    force: Option<Strategy>,
) -> SchedulePlan {
    debug_assert!(block_frames > 0 && channels > 0);
    let time_blocks = frames.div_ceil(block_frames as u64) as usize;

    let strategy = force.unwrap_or(if channels >= workers {
        Strategy::PerChannel
    } else {
        Strategy::PerTime
    });
    let slices = match strategy {
        Strategy::PerChannel => 1,
        Strategy::PerTime => (workers / channels).max(1).min(time_blocks.max(1)),
    };
    let blocks_per_slice = time_blocks.div_ceil(slices).max(1);

    let mut partitions = Vec::with_capacity(channels * slices);
    let mut blocks_per_partition = Vec::with_capacity(channels * slices);
    for channel in 0..channels {
        for slice in 0..slices {
            let start_frame = (slice * blocks_per_slice * block_frames) as u64;
            let end_frame = ((slice + 1) * blocks_per_slice * block_frames) as u64;
            let end_frame = end_frame.min(frames);
            if start_frame >= end_frame {
                continue;
            }
            partitions.push(Partition {
                index: partitions.len(),
                channel,
                start_frame,
                end_frame,
            });
            blocks_per_partition
                .push(((end_frame - start_frame).div_ceil(block_frames as u64)) as usize);
        }
    }

    let total_blocks = blocks_per_partition.iter().sum();
    let effective_workers = workers.max(1).min(partitions.len().max(1));
    SchedulePlan {
        strategy,
        partitions,
        workers: effective_workers,
        block_frames,
        blocks_per_partition,
        total_blocks,
        time_blocks,
    }
}

impl SchedulePlan {
    /// Channel owned by each partition, in partition-index order (the
    /// ledger layout).
    pub fn partition_channels(&self) -> Vec<usize> {
        self.partitions.iter().map(|p| p.channel).collect()
    }
}

/// First error raised by any worker; set-once, later faults lose.
pub struct FaultCell {
    slot: Mutex<Option<MeterError>>,
}

impl FaultCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn set(&self, err: MeterError) {
        let mut slot = self.slot.lock().expect("fault cell poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().expect("fault cell poisoned").is_some()
    }

    pub fn take(&self) -> Option<MeterError> {
        self.slot.lock().expect("fault cell poisoned").take()
    }
}

impl Default for FaultCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Commit-count progress shared by the workers of one pass. Percent is
/// scaled into [base, base+span] so a gated second pass can continue
/// where the ungated pass stopped.
pub struct ProgressSink<'a> {
    sender: Option<&'a Sender<ProgressUpdate>>,
    base: f64,
    span: f64,
    total: usize,
    done: AtomicUsize,
}

impl<'a> ProgressSink<'a> {
    pub fn new(
        sender: Option<&'a Sender<ProgressUpdate>>,
        base: f64,
        span: f64,
        total: usize,
    ) -> Self {
        Self {
            sender,
            base,
            span,
            total: total.max(1),
            done: AtomicUsize::new(0),
        }
    }

    pub fn bump(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(sender) = self.sender {
            let percent = self.base + self.span * done as f64 / self.total as f64;
            let _ = sender.send(ProgressUpdate { percent });
        }
    }

    pub fn finish(&self) {
        if let Some(sender) = self.sender {
            let _ = sender.send(ProgressUpdate {
                percent: self.base + self.span,
            });
        }
    }
}

/// Per-partition commit counters; partitions reach `Committed` when
/// every dispatched block has been merged, and `Done` after the
/// end-of-stream barrier.
pub struct PartitionTracker {
    committed: Vec<AtomicUsize>,
    expected: Vec<usize>,
}

impl PartitionTracker {
    pub fn new(blocks_per_partition: &[usize]) -> Self {
        Self {
            committed: blocks_per_partition
                .iter()
                .map(|_| AtomicUsize::new(0))
                .collect(),
            expected: blocks_per_partition.to_vec(),
        }
    }

    pub fn block_committed(&self, partition: usize) {
        self.committed[partition].fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self, partition: usize, barrier_passed: bool) -> PartitionState {
        let committed = self.committed[partition].load(Ordering::Relaxed);
        if committed >= self.expected[partition] {
            if barrier_passed {
                PartitionState::Done
            } else {
                PartitionState::Committed
            }
        } else if committed > 0 {
            PartitionState::Processed
        } else {
            PartitionState::Ready
        }
    }

    pub fn all_done(&self) -> bool {
        self.committed
            .iter()
            .zip(&self.expected)
            .all(|(c, e)| c.load(Ordering::Relaxed) >= *e)
    }
}

/// Outcome of one pipeline pass.
pub struct PassOutcome {
    /// False when the cancel flag cut the pass short.
    pub completed: bool,
}

fn dispatch(
    plan: &SchedulePlan,
    senders: &[SyncSender<BlockDescriptor>],
    cancel: &AtomicBool,
    fault: &FaultCell,
) {
    let mut states = vec![PartitionState::Ready; plan.partitions.len()];
    let mut sequence = 0usize;
    let max_blocks = plan.blocks_per_partition.iter().copied().max().unwrap_or(0);

    'rows: for row in 0..max_blocks {
        for partition in &plan.partitions {
            if row >= plan.blocks_per_partition[partition.index] {
                continue;
            }
            if cancel.load(Ordering::Relaxed) || fault.is_set() {
                break 'rows;
            }

            states[partition.index] = PartitionState::Filling;
            let start_frame = partition.start_frame + (row * plan.block_frames) as u64;
            let frames = (partition.end_frame - start_frame).min(plan.block_frames as u64) as usize;
            let descriptor = BlockDescriptor {
                sequence,
                partition: partition.index,
                start_frame,
                frames,
            };
            sequence += 1;
            states[partition.index] = PartitionState::Full;

            // Bounded send: blocks here when the worker queue is full.
            let worker = partition.index % senders.len();
            if senders[worker].send(descriptor).is_err() {
                // Worker bailed out on a fault; stop feeding.
                break 'rows;
            }
            states[partition.index] = PartitionState::Dispatched;
            trace!(
                "partition {} (channel {}) block {}: {:?}",
                partition.index,
                partition.channel,
                row,
                states[partition.index]
            );
        }
    }
}

fn spawn_queues(workers: usize) -> (Vec<SyncSender<BlockDescriptor>>, Vec<Receiver<BlockDescriptor>>) {
    let mut senders = Vec::with_capacity(workers);
    let mut receivers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = sync_channel(2);
        senders.push(tx);
        receivers.push(rx);
    }
    (senders, receivers)
}

/// Run the ungated pipeline to completion (or cancellation).
#[allow(clippy::too_many_arguments)]
pub fn run_ungated(
    samples: &[f64],
    channels: usize,
    sample_rate: u32,
    plan: &SchedulePlan,
    config: &MeterConfig,
    ledger: &EnergyLedger,
    series: Option<&SeriesCollector>,
    peaks: Option<&TruePeakCollector>,
    cancel: &AtomicBool,
    progress: &ProgressSink<'_>,
) -> MeterResult<PassOutcome> {
    let fault = FaultCell::new();
    let tracker = PartitionTracker::new(&plan.blocks_per_partition);
    let cal_gains: Vec<f64> = (0..channels).map(|ch| config.cal_gain(ch)).collect();

    thread::scope(|scope| {
        let (senders, receivers) = spawn_queues(plan.workers);
        for rx in receivers {
            let params = UngatedParams {
                samples,
                channels,
                sample_rate,
                block_frames: plan.block_frames,
                conv_points: config.conv_points,
                oversampling: if peaks.is_some() {
                    Some(config.oversampling)
                } else {
                    None
                },
                cal_gains: &cal_gains,
                partitions: &plan.partitions,
                ledger,
                series,
                peaks,
                cancel,
                fault: &fault,
                tracker: &tracker,
                progress,
            };
            scope.spawn(move || worker::run_ungated_worker(rx, params));
        }

        dispatch(plan, &senders, cancel, &fault);
        drop(senders);
    });

    if let Some(err) = fault.take() {
        return Err(err);
    }
    let cancelled = cancel.load(Ordering::Relaxed);
    if cancelled {
        ledger.mark_truncated();
    } else {
        debug_assert!(tracker.all_done());
    }
    progress.finish();
    Ok(PassOutcome {
        completed: !cancelled,
    })
}

/// Run the gated (K-weighted) pipeline over hop-sized blocks.
#[allow(clippy::too_many_arguments)]
pub fn run_gated(
    samples: &[f64],
    channels: usize,
    sample_rate: u32,
    plan: &SchedulePlan,
    config: &MeterConfig,
    windows: &WindowCollector,
    cancel: &AtomicBool,
    progress: &ProgressSink<'_>,
) -> MeterResult<PassOutcome> {
    let fault = FaultCell::new();
    let tracker = PartitionTracker::new(&plan.blocks_per_partition);
    let cal_gains: Vec<f64> = (0..channels).map(|ch| config.cal_gain(ch)).collect();

    thread::scope(|scope| {
        let (senders, receivers) = spawn_queues(plan.workers);
        for rx in receivers {
            let params = GatedParams {
                samples,
                channels,
                sample_rate,
                block_frames: plan.block_frames,
                channel_gains: config.channel_gains.as_deref(),
                cal_gains: &cal_gains,
                partitions: &plan.partitions,
                windows,
                cancel,
                fault: &fault,
                tracker: &tracker,
                progress,
            };
            scope.spawn(move || worker::run_gated_worker(rx, params));
        }

        dispatch(plan, &senders, cancel, &fault);
        drop(senders);
    });

    if let Some(err) = fault.take() {
        return Err(err);
    }
    progress.finish();
    Ok(PassOutcome {
        completed: !cancel.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_channel_when_channels_cover_workers() {
        let plan = plan(480_000, 6, 4, 40_800, None);
        assert_eq!(plan.strategy, Strategy::PerChannel);
        assert_eq!(plan.partitions.len(), 6);
        for p in &plan.partitions {
            assert_eq!(p.start_frame, 0);
            assert_eq!(p.end_frame, 480_000);
        }
    }

    #[test]
    fn per_time_slices_each_channel() {
        let plan = plan(480_000, 2, 8, 40_800, None);
        assert_eq!(plan.strategy, Strategy::PerTime);
        // 4 slices per channel.
        assert_eq!(plan.partitions.len(), 8);
        // Slice boundaries land on block boundaries.
        for p in &plan.partitions {
            assert_eq!(p.start_frame % 40_800, 0);
        }
        // Every frame of every channel is covered exactly once.
        for ch in 0..2 {
            let mut covered: u64 = 0;
            for p in plan.partitions.iter().filter(|p| p.channel == ch) {
                assert_eq!(p.start_frame, covered);
                covered = p.end_frame;
            }
            assert_eq!(covered, 480_000);
        }
    }

    #[test]
    fn forced_strategy_wins_over_heuristic() {
        let plan = plan(480_000, 2, 16, 40_800, Some(Strategy::PerChannel));
        assert_eq!(plan.strategy, Strategy::PerChannel);
        assert_eq!(plan.partitions.len(), 2);
    }

    #[test]
    fn short_streams_do_not_produce_empty_partitions() {
        // One block of audio, many workers: slices collapse.
        let plan = plan(1_000, 1, 16, 40_800, None);
        assert_eq!(plan.partitions.len(), 1);
        assert_eq!(plan.total_blocks, 1);
        assert_eq!(plan.blocks_per_partition, vec![1]);
    }

    #[test]
    fn block_counts_add_up() {
        let plan = plan(100_000, 2, 4, 9_600, None);
        assert_eq!(plan.time_blocks, 11);
        let per_channel: usize = plan
            .partitions
            .iter()
            .filter(|p| p.channel == 0)
            .map(|p| plan.blocks_per_partition[p.index])
            .sum();
        assert_eq!(per_channel, 11);
        assert_eq!(plan.total_blocks, 22);
    }

    #[test]
    fn tracker_walks_the_lifecycle() {
        let tracker = PartitionTracker::new(&[2]);
        assert_eq!(tracker.state(0, false), PartitionState::Ready);
        tracker.block_committed(0);
        assert_eq!(tracker.state(0, false), PartitionState::Processed);
        tracker.block_committed(0);
        assert_eq!(tracker.state(0, false), PartitionState::Committed);
        assert_eq!(tracker.state(0, true), PartitionState::Done);
        assert!(tracker.all_done());
    }

    #[test]
    fn fault_cell_keeps_first_error() {
        let fault = FaultCell::new();
        fault.set(MeterError::InsufficientData);
        fault.set(MeterError::CancelledByUser);
        assert!(matches!(fault.take(), Some(MeterError::InsufficientData)));
        assert!(fault.take().is_none());
    }
}
