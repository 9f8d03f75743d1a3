// Measurement orchestration: decode, partition, run the worker passes,
// reduce, and assemble the report. The CLI owns argument parsing and
// progress display; everything in here is driven by a MeterConfig.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::time::Instant;

use log::{info, warn};

use crate::coefficients::{self, REFERENCE_OFFSET_DB};
use crate::config::{GateMode, MeterConfig};
use crate::energy::{self, ChannelEnergy, EnergyLedger, LoudnessSummary};
use crate::gating::{
    self, GatingConfig, GatingOutcome, NoSpeechClassifier, SpeechClassifier, WindowCollector,
    GATING_BLOCK_SECONDS,
};
use crate::input::{self, AudioMetadata};
use crate::report::{
    ChannelStat, ExecutionInfo, LkfsField, Measurement, Report, ReportMeasurements,
    ReportMetadata,
};
use crate::scheduler::{self, ProgressSink};
use crate::series::{self, LeqSeries, SeriesCollector, SeriesPoint};
use crate::true_peak::{self, TruePeakCollector};
use crate::{MeterError, MeterResult, ProgressUpdate};

/// Everything a measurement produced, before report formatting.
pub struct Measured {
    pub summary: LoudnessSummary,
    pub channel_totals: Vec<ChannelEnergy>,
    pub series: Option<LeqSeries>,
    pub long_window: Option<Vec<SeriesPoint>>,
    pub allen: Option<f64>,
    pub gating: Option<GatingOutcome>,
    pub channel_true_peaks: Option<Vec<f64>>,
    pub truncated: bool,
}

pub struct MeterContext {
    config: MeterConfig,
    classifier: Box<dyn SpeechClassifier>,
    default_classifier: bool,
}

impl MeterContext {
    pub fn new(config: MeterConfig) -> MeterResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier: Box::new(NoSpeechClassifier),
            default_classifier: true,
        })
    }

    /// Wire up an external speech classifier for the dialogue gate.
    pub fn with_classifier(
        config: MeterConfig,
        classifier: Box<dyn SpeechClassifier>,
    ) -> MeterResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier,
            default_classifier: false,
        })
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Measure a decoded stream. The sample rate must have an
    /// M-weighting table; resampling is the caller's business.
    pub fn measure(
        &self,
        samples: &[f64],
        metadata: &AudioMetadata,
        cancel: &AtomicBool,
        progress: Option<&Sender<ProgressUpdate>>,
    ) -> MeterResult<Measured> {
        let channels = metadata.channels;
        let sample_rate = metadata.sample_rate;
        coefficients::m_weighting(sample_rate)?;

        if channels == 0 || samples.is_empty() {
            return Err(MeterError::InsufficientData);
        }
        if samples.len() % channels != 0 {
            return Err(MeterError::InvalidArgument(
                "sample data not divisible by channel count".to_string(),
            ));
        }
        if !self.config.cal_gains_db.is_empty() && self.config.cal_gains_db.len() != channels {
            return Err(MeterError::ChannelCountMismatch {
                expected: channels,
                actual: self.config.cal_gains_db.len(),
            });
        }
        if let Some(gains) = &self.config.channel_gains {
            if gains.len() != channels {
                return Err(MeterError::ChannelCountMismatch {
                    expected: channels,
                    actual: gains.len(),
                });
            }
        }

        let frames = (samples.len() / channels) as u64;
        let block_frames =
            ((self.config.buffer_ms as u64 * sample_rate as u64) / 1000).max(1) as usize;
        let workers = self.config.workers();
        let gating_active = self.config.gating_active();

        let plan = scheduler::plan(
            frames,
            channels,
            workers,
            block_frames,
            self.config.partition_strategy,
        );
        info!(
            "partitioning: {:?}, {} partitions, {} workers, {} blocks",
            plan.strategy,
            plan.partitions.len(),
            plan.workers,
            plan.total_blocks
        );

        let ledger = EnergyLedger::new(&plan.partition_channels());
        let want_series = self.config.log_leqm || self.config.log_leqm10;
        let series_collector = if want_series {
            Some(SeriesCollector::new(
                plan.time_blocks,
                channels,
                block_frames as f64 / sample_rate as f64,
            ))
        } else {
            None
        };
        let peak_collector = if self.config.true_peak {
            Some(TruePeakCollector::new(channels))
        } else {
            None
        };

        let ungated_span = if gating_active { 60.0 } else { 100.0 };
        let sink = ProgressSink::new(progress, 0.0, ungated_span, plan.total_blocks);
        let outcome = scheduler::run_ungated(
            samples,
            channels,
            sample_rate,
            &plan,
            &self.config,
            &ledger,
            series_collector.as_ref(),
            peak_collector.as_ref(),
            cancel,
            &sink,
        )?;
        let mut truncated = !outcome.completed;

        let global = ledger.into_global();
        let channel_totals = global.channel_totals(channels);
        let summary = match energy::reduce(&channel_totals) {
            Ok(summary) => summary,
            Err(MeterError::InsufficientData) if truncated => {
                return Err(MeterError::CancelledByUser)
            }
            Err(err) => return Err(err),
        };

        // Gated pipeline: hop-sized blocks, assembled into overlapping
        // 400 ms gating blocks after the barrier.
        let gating = if gating_active && !truncated {
            let hop_frames = ((GATING_BLOCK_SECONDS * self.config.hop_ratio)
                * sample_rate as f64)
                .round()
                .max(1.0) as usize;
            let windows_per_block = (1.0 / self.config.hop_ratio).round().max(1.0) as usize;
            let gated_plan = scheduler::plan(
                frames,
                channels,
                workers,
                hop_frames,
                self.config.partition_strategy,
            );
            let windows = WindowCollector::new(gated_plan.time_blocks);
            let sink = ProgressSink::new(progress, 60.0, 40.0, gated_plan.total_blocks);
            let gated_outcome = scheduler::run_gated(
                samples,
                channels,
                sample_rate,
                &gated_plan,
                &self.config,
                &windows,
                cancel,
                &sink,
            )?;
            truncated = truncated || !gated_outcome.completed;

            let powers = windows.finalize();
            let pool = gating::assemble_blocks(
                &powers,
                windows_per_block,
                hop_frames as u64,
                self.classifier.as_ref(),
                sample_rate,
            );
            let gating_config = GatingConfig {
                mode: self.config.gate_mode,
                level_gate_db: self.config.level_gate_db,
                speech_threshold: self.config.speech_threshold,
                ..Default::default()
            };
            Some(gating::integrated_lkfs(&pool, &gating_config))
        } else {
            None
        };

        let series = series_collector.map(|c| c.finalize());
        let (long_window, allen) = match (&series, self.config.log_leqm10) {
            (Some(series), true) => {
                let window_blocks = ((self.config.long_period_min * 60_000.0)
                    / self.config.buffer_ms as f64)
                    .round()
                    .max(1.0) as usize;
                let long = series.long_window(window_blocks);
                let allen = series::allen_metric(
                    &long,
                    self.config.allen_threshold_db,
                    series.blocks_per_minute(),
                    series.total_minutes(),
                );
                (Some(long), Some(allen))
            }
            _ => (None, None),
        };

        Ok(Measured {
            summary,
            channel_totals,
            series,
            long_window,
            allen,
            gating,
            channel_true_peaks: peak_collector.map(|c| c.into_channel_peaks()),
            truncated,
        })
    }

    /// Decode, measure, write the series logs, and build the report.
    pub fn measure_file(
        &self,
        path: &Path,
        cancel: &AtomicBool,
        progress: Option<&Sender<ProgressUpdate>>,
    ) -> MeterResult<Report> {
        let start = Instant::now();
        input::validate_extension(path)?;

        let decoded = input::decode_wav(path)?;
        let original_sample_rate = decoded.metadata.sample_rate;
        let mut notes = Vec::new();

        let (samples, metadata) = if coefficients::is_tabulated(original_sample_rate) {
            (decoded.samples, decoded.metadata)
        } else {
            // Fallback path for rates without a table: trivial linear
            // interpolation to 48 kHz, noted in the report.
            let resampled = input::resample_linear(
                &decoded.samples,
                original_sample_rate,
                48_000,
                decoded.metadata.channels,
            )?;
            let frames = (resampled.len() / decoded.metadata.channels) as u64;
            notes.push(format!(
                "resampled from {original_sample_rate} Hz to 48000 Hz for M-weighting filter"
            ));
            (
                resampled,
                AudioMetadata {
                    sample_rate: 48_000,
                    channels: decoded.metadata.channels,
                    frames,
                    duration_seconds: frames as f64 / 48_000.0,
                },
            )
        };

        if self.config.gate_mode == GateMode::Dialogue && self.default_classifier {
            warn!("dialogue gating without an external speech classifier treats all blocks as speech");
        }

        let measured = self.measure(&samples, &metadata, cancel, progress)?;

        if measured.summary.silent {
            notes.push("silent".to_string());
        }
        if measured.truncated {
            notes.push("truncated".to_string());
        }

        if let Some(series) = &measured.series {
            if self.config.log_leqm {
                let log_path = sibling_log(path, "leqm");
                series::write_logfile(&log_path, &series.points)?;
                info!("wrote per-block series: {}", log_path.display());
            }
        }
        if let Some(long) = &measured.long_window {
            let log_path = sibling_log(path, "leqm10");
            series::write_logfile(&log_path, long)?;
            info!("wrote long-window series: {}", log_path.display());
        }

        let frame_count = measured.summary.n_mono_samples / metadata.channels as u64;
        let channel_stats = measured
            .channel_totals
            .iter()
            .enumerate()
            .map(|(channel, total)| ChannelStat {
                channel,
                peak_db: Measurement(energy::level_db(total.peak_abs * total.peak_abs)),
                average_db: Measurement(if total.n_samples > 0 {
                    energy::level_db(total.sum_unweighted / total.n_samples as f64)
                } else {
                    0.0
                }),
            })
            .collect();

        if self.config.emit_unweighted {
            info!(
                "Leq(noW) = {:.4} dB",
                measured.summary.leq_no_weight
            );
        }

        let execution = ExecutionInfo::gather(path, start, metadata.duration_seconds);
        if self.config.timing {
            info!(
                "execution: {:.3} s ({:.2}x realtime)",
                execution.execution_seconds.0, execution.speed_index.0
            );
        }

        Ok(Report {
            metadata: ReportMetadata {
                file: path.to_string_lossy().into_owned(),
                original_sample_rate,
                effective_sample_rate: metadata.sample_rate,
                channels: metadata.channels,
                frames: frame_count,
                duration_seconds: Measurement(metadata.duration_seconds),
                truncated: measured.truncated,
            },
            measurements: ReportMeasurements {
                leq_m: Measurement(measured.summary.leq_m),
                leq_no_weight: Measurement(measured.summary.leq_no_weight),
                mean_power: Measurement(measured.summary.mean_power),
                mean_power_weighted: Measurement(measured.summary.mean_power_weighted),
                lkfs: measured.gating.map(|g| LkfsField(g.lkfs)),
                true_peak_db: measured
                    .channel_true_peaks
                    .as_deref()
                    .map(|peaks| Measurement(true_peak::true_peak_db(peaks))),
                allen: measured.allen.map(Measurement),
            },
            reference_offset_db: REFERENCE_OFFSET_DB,
            channel_stats,
            execution: Some(execution),
            processing_notes: notes,
        })
    }
}

fn sibling_log(input: &Path, tag: &str) -> PathBuf {
    let mut name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    name.push('.');
    name.push_str(tag);
    name.push_str(".log");
    input.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gating::LkfsResult;
    use crate::scheduler::Strategy;
    use std::sync::atomic::Ordering;

    const FS: u32 = 48_000;

    fn meta(channels: usize, frames: u64, sample_rate: u32) -> AudioMetadata {
        AudioMetadata {
            sample_rate,
            channels,
            frames,
            duration_seconds: frames as f64 / sample_rate as f64,
        }
    }

    fn sine_mono(freq: f64, sample_rate: u32, amplitude: f64, seconds: f64) -> Vec<f64> {
        let n = (seconds * sample_rate as f64) as usize;
        (0..n)
            .map(|i| {
                amplitude
                    * (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin()
            })
            .collect()
    }

    fn interleave_stereo(mono: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(mono.len() * 2);
        for &s in mono {
            out.push(s);
            out.push(s);
        }
        out
    }

    fn run(config: MeterConfig, samples: &[f64], metadata: &AudioMetadata) -> Measured {
        let context = MeterContext::new(config).unwrap();
        let cancel = AtomicBool::new(false);
        context.measure(samples, metadata, &cancel, None).unwrap()
    }

    #[test]
    fn full_scale_sine_pins_reference_level() {
        // Known-good reference: 1 kHz 0 dBFS at 48 kHz measures
        // 98.9339 dB through the tabulated M curve (-6.07 dB at 1 kHz
        // plus the 108.0103 offset).
        let samples = sine_mono(1_000.0, FS, 1.0, 10.0);
        let m = run(MeterConfig::default(), &samples, &meta(1, samples.len() as u64, FS));
        assert!((m.summary.leq_m - 98.9339).abs() < 0.05, "got {}", m.summary.leq_m);
    }

    #[test]
    fn minus_twenty_sine_tracks_exactly() {
        let loud = sine_mono(1_000.0, FS, 1.0, 4.0);
        let quiet = sine_mono(1_000.0, FS, 0.1, 4.0);
        let a = run(MeterConfig::default(), &loud, &meta(1, loud.len() as u64, FS));
        let b = run(MeterConfig::default(), &quiet, &meta(1, quiet.len() as u64, FS));
        // Pure gain scaling shifts the result by exactly 20 dB.
        assert!((a.summary.leq_m - b.summary.leq_m - 20.0).abs() < 1e-6);
    }

    #[test]
    fn stereo_minus_twenty_sine_scenario() {
        let samples = interleave_stereo(&sine_mono(1_000.0, FS, 0.1, 2.0));
        let m = run(MeterConfig::default(), &samples, &meta(2, samples.len() as u64 / 2, FS));
        assert!((m.summary.leq_m - 78.9336).abs() < 0.1, "got {}", m.summary.leq_m);
        assert!((m.summary.leq_no_weight - 85.0).abs() < 0.01);
    }

    #[test]
    fn fortyfour_one_tracks_fortyeight() {
        let a = sine_mono(1_000.0, 48_000, 1.0, 5.0);
        let b = sine_mono(1_000.0, 44_100, 1.0, 5.0);
        let ra = run(MeterConfig::default(), &a, &meta(1, a.len() as u64, 48_000));
        let rb = run(MeterConfig::default(), &b, &meta(1, b.len() as u64, 44_100));
        // Open question in the source: the 44.1 kHz table differs by a
        // fraction of a dB at 1 kHz. Both are kept verbatim.
        assert!((ra.summary.leq_m - rb.summary.leq_m).abs() < 0.2);
    }

    #[test]
    fn white_noise_lands_in_sane_band() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let samples: Vec<f64> = (0..5 * FS as usize)
            .map(|_| rng.gen_range(-1.0..1.0) * 0.01)
            .collect();
        let m = run(MeterConfig::default(), &samples, &meta(1, samples.len() as u64, FS));
        assert!(
            m.summary.leq_m > 60.0 && m.summary.leq_m < 75.0,
            "-40 dBFS noise measured {}",
            m.summary.leq_m
        );
        // Broadband content: weighting never moves the figure by more
        // than 20 dB in either direction.
        assert!((m.summary.leq_no_weight - m.summary.leq_m).abs() < 20.0);
    }

    #[test]
    fn silence_is_floor_with_note_not_nan() {
        let samples = vec![0.0f64; FS as usize];
        let m = run(MeterConfig::default(), &samples, &meta(1, FS as u64, FS));
        assert!(m.summary.silent);
        assert_eq!(m.summary.leq_m, 0.0);
        assert!(m.summary.leq_m.is_finite());
    }

    #[test]
    fn per_channel_partitioning_is_worker_count_invariant() {
        let samples = interleave_stereo(&sine_mono(330.0, FS, 0.4, 2.0));
        let metadata = meta(2, samples.len() as u64 / 2, FS);

        let single = run(
            MeterConfig {
                num_cpus: Some(1),
                partition_strategy: Some(Strategy::PerChannel),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        let many = run(
            MeterConfig {
                num_cpus: Some(16),
                partition_strategy: Some(Strategy::PerChannel),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        // Identical partitions, identical partition-ordered reduction.
        assert!((single.summary.leq_m - many.summary.leq_m).abs() < 1e-9);
    }

    #[test]
    fn per_time_warmup_costs_at_most_two_hundredths() {
        let samples = sine_mono(1_000.0, FS, 0.5, 4.0);
        let metadata = meta(1, samples.len() as u64, FS);

        let exact = run(
            MeterConfig {
                num_cpus: Some(1),
                partition_strategy: Some(Strategy::PerChannel),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        let sliced = run(
            MeterConfig {
                num_cpus: Some(8),
                partition_strategy: Some(Strategy::PerTime),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        assert!((exact.summary.leq_m - sliced.summary.leq_m).abs() < 0.02);
    }

    #[test]
    fn block_size_does_not_move_the_number() {
        // Under per-channel scheduling the filter runs continuously, so
        // the block boundary is pure bookkeeping. (Per-time slicing
        // moves with the block size by construction; that cost is
        // covered by the warm-up test above.)
        let samples = sine_mono(777.0, FS, 0.3, 3.0);
        let metadata = meta(1, samples.len() as u64, FS);

        let small = run(
            MeterConfig {
                buffer_ms: 100,
                num_cpus: Some(2),
                partition_strategy: Some(Strategy::PerChannel),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        let large = run(
            MeterConfig {
                buffer_ms: 2_000,
                num_cpus: Some(2),
                partition_strategy: Some(Strategy::PerChannel),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        assert!((small.summary.leq_m - large.summary.leq_m).abs() < 1e-6);
    }

    #[test]
    fn fir_mode_matches_iir_mode() {
        let samples = sine_mono(1_000.0, FS, 0.1, 2.0);
        let metadata = meta(1, samples.len() as u64, FS);
        let iir = run(MeterConfig::default(), &samples, &metadata);
        let fir = run(
            MeterConfig {
                conv_points: Some(21),
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        assert!((iir.summary.leq_m - fir.summary.leq_m).abs() < 0.01);
    }

    #[test]
    fn unknown_rate_is_rejected_up_front() {
        let context = MeterContext::new(MeterConfig::default()).unwrap();
        let cancel = AtomicBool::new(false);
        let samples = vec![0.1f64; 1000];
        let result = context.measure(&samples, &meta(1, 1000, 96_000), &cancel, None);
        assert!(matches!(result, Err(MeterError::UnsupportedSampleRate(96_000))));
    }

    #[test]
    fn calibration_vector_length_is_checked() {
        let context = MeterContext::new(MeterConfig {
            cal_gains_db: vec![0.0, 0.0, 0.0],
            ..Default::default()
        })
        .unwrap();
        let cancel = AtomicBool::new(false);
        let samples = vec![0.1f64; 2000];
        let result = context.measure(&samples, &meta(2, 1000, FS), &cancel, None);
        assert!(matches!(
            result,
            Err(MeterError::ChannelCountMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn calibration_shifts_the_weighted_level_only() {
        let samples = sine_mono(1_000.0, FS, 0.1, 2.0);
        let metadata = meta(1, samples.len() as u64, FS);
        let plain = run(MeterConfig::default(), &samples, &metadata);
        let boosted = run(
            MeterConfig {
                cal_gains_db: vec![6.0],
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        assert!((boosted.summary.leq_m - plain.summary.leq_m - 6.0).abs() < 1e-6);
        // Unweighted stats stay on the raw signal.
        assert!((boosted.summary.leq_no_weight - plain.summary.leq_no_weight).abs() < 1e-9);
    }

    #[test]
    fn ebu_tech_3341_case_one() {
        // Stereo 1 kHz sine at -23 dBFS for 20 s: integrated LKFS must
        // read -23.0 within a tenth.
        let amplitude = 10.0f64.powf(-23.0 / 20.0);
        let samples = interleave_stereo(&sine_mono(1_000.0, FS, amplitude, 20.0));
        let m = run(
            MeterConfig {
                lkfs: true,
                ..Default::default()
            },
            &samples,
            &meta(2, samples.len() as u64 / 2, FS),
        );
        match m.gating.expect("gating ran").lkfs {
            LkfsResult::Value(v) => assert!((v + 23.0).abs() < 0.1, "got {v}"),
            LkfsResult::BelowFloor => panic!("tone should survive gating"),
        }
    }

    #[test]
    fn lkfs_of_silence_is_below_floor() {
        let samples = vec![0.0f64; 2 * FS as usize];
        let m = run(
            MeterConfig {
                lkfs: true,
                ..Default::default()
            },
            &samples,
            &meta(1, 2 * FS as u64, FS),
        );
        assert_eq!(m.gating.unwrap().lkfs, LkfsResult::BelowFloor);
    }

    #[test]
    fn true_peak_bounds_sample_peak() {
        let samples = interleave_stereo(&sine_mono(997.0, FS, 0.5, 1.0));
        let m = run(
            MeterConfig {
                true_peak: true,
                ..Default::default()
            },
            &samples,
            &meta(2, samples.len() as u64 / 2, FS),
        );
        let peaks = m.channel_true_peaks.expect("true peak ran");
        let tp_db = true_peak::true_peak_db(&peaks);
        for total in &m.channel_totals {
            let sample_peak_db = energy::level_db(total.peak_abs * total.peak_abs);
            assert!(tp_db >= sample_peak_db - 0.1);
        }
    }

    #[test]
    fn series_covers_every_block() {
        let samples = sine_mono(1_000.0, FS, 0.1, 3.0);
        let m = run(
            MeterConfig {
                log_leqm: true,
                buffer_ms: 750,
                num_cpus: Some(4),
                ..Default::default()
            },
            &samples,
            &meta(1, samples.len() as u64, FS),
        );
        let series = m.series.expect("series logged");
        assert_eq!(series.points.len(), 4);
        assert!((series.points[1].seconds - 0.75).abs() < 1e-12);
        // Steady tone: every full block reads the same level.
        assert!((series.points[0].db - series.points[2].db).abs() < 0.05);
    }

    #[test]
    fn long_window_and_allen_come_from_the_flag() {
        let samples = sine_mono(1_000.0, FS, 0.1, 3.0);
        let metadata = meta(1, samples.len() as u64, FS);
        let without = run(
            MeterConfig {
                log_leqm: true,
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        assert!(without.long_window.is_none());
        assert!(without.allen.is_none());

        let with = run(
            MeterConfig {
                log_leqm10: true,
                buffer_ms: 750,
                ..Default::default()
            },
            &samples,
            &metadata,
        );
        assert!(with.long_window.is_some());
        assert!(with.allen.is_some());
    }

    #[test]
    fn pre_cancelled_run_reports_cancellation() {
        let context = MeterContext::new(MeterConfig::default()).unwrap();
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Relaxed);
        let samples = sine_mono(1_000.0, FS, 0.1, 1.0);
        let result = context.measure(&samples, &meta(1, samples.len() as u64, FS), &cancel, None);
        assert!(matches!(result, Err(MeterError::CancelledByUser)));
    }
}
