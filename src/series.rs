// Time-series logging: per-block Leq(M), the sliding long window, and
// the Allen metric.
//
// Workers contribute per-channel energy for each time block; a cell is
// complete once every channel has reported, which makes the series
// identical no matter how the stream was partitioned.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::energy::level_db;

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    csum: f64,
    n_mono: u64,
    contributions: usize,
}

/// Shared collector for the per-block series.
pub struct SeriesCollector {
    cells: Mutex<Vec<Cell>>,
    channels: usize,
    block_seconds: f64,
}

impl SeriesCollector {
    pub fn new(total_blocks: usize, channels: usize, block_seconds: f64) -> Self {
        Self {
            cells: Mutex::new(vec![Cell::default(); total_blocks]),
            channels,
            block_seconds,
        }
    }

    /// Add one channel's weighted energy for a time block.
    pub fn contribute(&self, block_index: usize, csum: f64, n_mono: u64) {
        let mut cells = self.cells.lock().expect("series collector poisoned");
        let cell = &mut cells[block_index];
        cell.csum += csum;
        cell.n_mono += n_mono;
        cell.contributions += 1;
        debug_assert!(cell.contributions <= self.channels);
    }

    pub fn finalize(self) -> LeqSeries {
        let cells = self.cells.into_inner().expect("series collector poisoned");
        let points = cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.n_mono > 0)
            .map(|(i, c)| SeriesPoint {
                seconds: i as f64 * self.block_seconds,
                db: level_db(c.csum / c.n_mono as f64),
            })
            .collect();
        LeqSeries {
            block_seconds: self.block_seconds,
            points,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub seconds: f64,
    pub db: f64,
}

/// Finished per-block Leq(M) series.
#[derive(Debug, Clone)]
pub struct LeqSeries {
    pub block_seconds: f64,
    pub points: Vec<SeriesPoint>,
}

impl LeqSeries {
    /// Sliding mean over `window_blocks` values; the tail windows
    /// shrink as the program runs out.
    pub fn long_window(&self, window_blocks: usize) -> Vec<SeriesPoint> {
        if self.points.is_empty() || window_blocks == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.points.len());
        for j in 0..self.points.len() {
            let end = (j + window_blocks).min(self.points.len());
            let window = &self.points[j..end];
            let mean = window.iter().map(|p| p.db).sum::<f64>() / window.len() as f64;
            out.push(SeriesPoint {
                seconds: self.points[j].seconds,
                db: mean,
            });
        }
        out
    }

    /// Blocks per minute at this block duration.
    pub fn blocks_per_minute(&self) -> f64 {
        60.0 / self.block_seconds
    }

    pub fn total_minutes(&self) -> f64 {
        self.points.len() as f64 * self.block_seconds / 60.0
    }
}

/// Allen metric: thresholded long-window values, normalized to the
/// per-minute value count, divided by program duration in minutes. A
/// 30-minute program with 5 minutes of windows at 85 dB and the rest
/// below an 80 dB threshold yields 85 * 5 / 30.
pub fn allen_metric(
    long_window: &[SeriesPoint],
    threshold_db: f64,
    blocks_per_minute: f64,
    total_minutes: f64,
) -> f64 {
    if total_minutes <= 0.0 || blocks_per_minute <= 0.0 {
        return 0.0;
    }
    let sum: f64 = long_window
        .iter()
        .filter(|p| p.db >= threshold_db)
        .map(|p| p.db)
        .sum();
    sum / blocks_per_minute / total_minutes
}

/// Two-column series log: seconds and dB.
pub fn write_logfile(path: &Path, points: &[SeriesPoint]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for p in points {
        writeln!(out, "{:.4}\t{:.4}", p.seconds, p.db)?;
    }
    out.flush()
}
