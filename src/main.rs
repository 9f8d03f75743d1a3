/*
 Copyright (c) 2026 leqm contributors

 This file is part of leqm

 leqm is free software: you can redistribute it and/or modify it
 under the terms of the GNU General Public License as published by the
 Free Software Foundation, either version 3 of the License, or
 (at your option) any later version.

 leqm is distributed in the hope that it will be useful, but
 WITHOUT ANY WARRANTY; without even the implied warranty of
 MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 GNU General Public License for more details.
 You should have received a copy of the GNU General Public License
 along with leqm. If not, see <https://www.gnu.org/licenses/>.
*/

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Instant;

use clap::Parser;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use log::{info, warn};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use leqm::config::GateMode;
use leqm::report::error_json;
use leqm::{
    ColorLogger, MeterConfig, MeterContext, MeterError, ProgressUpdate, TermResult,
    ONE_HUNDRED_PERCENT,
};

static CANCEL_FLAG: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(
    name = "leqm",
    about = "Measure Leq(M) loudness of motion picture audio (ISO 21727)",
    version
)]
struct Cli {
    /// One or more WAV input files
    #[arg(name = "FILES", required = true)]
    files: Vec<PathBuf>,

    /// Use FIR convolution with N points instead of the recursive
    /// filter
    #[arg(long = "convpoints", value_name = "N")]
    conv_points: Option<usize>,

    /// Worker thread count [default: CPU count]
    #[arg(long = "numcpus", value_name = "N")]
    num_cpus: Option<usize>,

    /// Per-channel calibration gain in dB, one value per channel
    #[arg(long = "chconfcal", value_name = "DB", num_args = 1.., allow_negative_numbers = true)]
    cal_gains_db: Vec<f64>,

    /// Also log the unweighted Leq
    #[arg(long = "leqnw")]
    leqnw: bool,

    /// Write the per-block Leq(M) series log
    #[arg(long = "logleqm")]
    log_leqm: bool,

    /// Write the sliding long-window series and the Allen metric
    #[arg(long = "logleqm10")]
    log_leqm10: bool,

    /// Long-window duration in minutes
    #[arg(long = "longperiod", value_name = "M", default_value = "10")]
    long_period: f64,

    /// Block size in ms (750 recommended with --logleqm10)
    #[arg(long = "buffersize", value_name = "MS", default_value = "850")]
    buffer_ms: u32,

    /// Allen metric threshold in dB
    #[arg(long = "threshold", value_name = "DB", default_value = "80")]
    threshold: f64,

    /// Measure gated LKFS per ITU-R BS.1770-4
    #[arg(long = "lkfs")]
    lkfs: bool,

    /// Dialogue-gated measurement
    #[arg(long = "dolbydi")]
    dolbydi: bool,

    /// Gating mode: 0 none, 1 level, 2 dialogue
    #[arg(long = "chgateconf", value_name = "MODE", default_value = "0")]
    chgateconf: u8,

    /// Speech probability threshold for the dialogue gate
    #[arg(long = "agsthreshold", value_name = "P", default_value = "0.33")]
    speech_threshold: f64,

    /// Force level gating at the given Leq(M) threshold
    #[arg(long = "levelgate", value_name = "DB", allow_negative_numbers = true)]
    level_gate: Option<f64>,

    /// Measure oversampled true peak
    #[arg(long = "truepeak")]
    true_peak: bool,

    /// True-peak oversampling factor
    #[arg(long = "oversampling", value_name = "N", default_value = "4")]
    oversampling: u32,

    /// Report execution timing
    #[arg(long = "timing")]
    timing: bool,

    /// Print diagnostic messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Suppress everything except the JSON report
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

impl Cli {
    fn to_config(&self) -> Result<MeterConfig, MeterError> {
        let gate_mode = match self.chgateconf {
            0 if self.level_gate.is_some() => GateMode::Level,
            0 if self.dolbydi => GateMode::Dialogue,
            0 => GateMode::None,
            1 => GateMode::Level,
            2 => GateMode::Dialogue,
            other => {
                return Err(MeterError::InvalidArgument(format!(
                    "invalid gating mode {other}: must be 0, 1 or 2"
                )))
            }
        };

        Ok(MeterConfig {
            buffer_ms: self.buffer_ms,
            num_cpus: self.num_cpus,
            conv_points: self.conv_points,
            cal_gains_db: self.cal_gains_db.clone(),
            emit_unweighted: self.leqnw,
            log_leqm: self.log_leqm,
            log_leqm10: self.log_leqm10,
            long_period_min: self.long_period,
            allen_threshold_db: self.threshold,
            lkfs: self.lkfs,
            dialogue: self.dolbydi,
            gate_mode,
            speech_threshold: self.speech_threshold,
            level_gate_db: self.level_gate,
            true_peak: self.true_peak,
            oversampling: self.oversampling,
            timing: self.timing,
            ..Default::default()
        })
    }
}

fn main() -> TermResult {
    match run() {
        Ok(()) => TermResult(Ok(())),
        Err(e) => TermResult(Err(e)),
    }
}

fn run() -> Result<(), MeterError> {
    let cli = Cli::parse();
    let logger = ColorLogger::new(cli.quiet, cli.verbose);
    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger)
        .try_init()
        .map_err(|e| MeterError::InvalidArgument(format!("logger init failed: {e}")))?;
    log::set_max_level(if cli.quiet {
        log::LevelFilter::Off
    } else if cli.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    });

    let config = cli.to_config()?;
    let context = MeterContext::new(config)?;

    // Size the Rayon pool for per-file parallelism. Each file spawns
    // its own block workers, so the file-level pool only gets the CPUs
    // the block pipeline leaves over.
    let avail = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let file_threads = (avail / context.config().workers())
        .max(1)
        .min(cli.files.len().max(1));
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(file_threads)
        .build_global()
    {
        warn!(
            "Rayon pool initialization error ({} threads). Details: {:?}",
            file_threads, e
        );
    }

    let mut inputs = cli.files.clone();
    inputs.sort();
    inputs.dedup();
    let total_inputs = inputs.len();

    let wall_start = Instant::now();
    let stdout_lock = Mutex::new(());

    let first_error: Option<MeterError> = inputs
        .into_par_iter()
        .filter_map(|path| {
            match check_file(&path, &context, &multi, &stdout_lock) {
                Ok(()) => None,
                Err(err) => {
                    // Report the failure record on stdout next to the
                    // successful reports, keep the first error for the
                    // exit code.
                    let guard = stdout_lock.lock().expect("stdout lock poisoned");
                    println!("{}", error_json(&err));
                    drop(guard);
                    Some(err)
                }
            }
        })
        .reduce_with(|first, _later| first);

    let total_secs = wall_start.elapsed().as_secs();
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    info!(
        "Analyzed {} inputs in {:02}:{:02}:{:02}",
        total_inputs, h, m, s
    );

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn check_file(
    path: &PathBuf,
    context: &MeterContext,
    multi: &MultiProgress,
    stdout_lock: &Mutex<()>,
) -> Result<(), MeterError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MeterError::InvalidArgument(format!("invalid file path: {}", path.display())))?;

    let (sender, receiver) = mpsc::channel::<ProgressUpdate>();

    let style = ProgressStyle::with_template("{prefix} {bar:20.cyan/blue} {percent}{msg}")
        .map_err(|e| MeterError::InvalidArgument(e.to_string()))?;
    let pg = multi
        .add(ProgressBar::new(100))
        .with_style(style)
        .with_prefix(format!("{} {}", "[Measuring]".bold(), file_name.bold()))
        .with_message("%");

    // Measure on this Rayon worker; drive the bar on a lightweight
    // OS thread.
    let progress_handle = std::thread::spawn(move || {
        while let Ok(progress) = receiver.recv() {
            pg.set_position(progress.percent.floor() as u64);
            if progress.percent >= ONE_HUNDRED_PERCENT {
                break;
            }
        }
        pg.finish_and_clear();
    });

    let result = context.measure_file(path, &CANCEL_FLAG, Some(&sender));
    drop(sender);

    if let Err(e) = progress_handle.join() {
        return Err(MeterError::Io(format!("progress thread panicked: {e:?}")));
    }

    let report = result?;
    info!(
        "{}: Leq(M) = {} dB",
        file_name,
        format!("{:.4}", report.measurements.leq_m.0).bold()
    );

    let guard = stdout_lock.lock().expect("stdout lock poisoned");
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", report.to_json()).map_err(|e| MeterError::Io(e.to_string()))?;
    out.flush().map_err(|e| MeterError::Io(e.to_string()))?;
    drop(guard);

    Ok(())
}
