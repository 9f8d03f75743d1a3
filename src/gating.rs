// Gated loudness per ITU-R BS.1770-4, with the level- and
// dialogue-gated variants layered on top.
//
// The gated workers deliver K-weighted hop-window powers; after the
// end-of-stream barrier those are assembled into overlapping 400 ms
// gating blocks and the gate stages run over the pool.

use std::sync::Mutex;

use crate::config::GateMode;

/// Gating block duration fixed by BS.1770.
pub const GATING_BLOCK_SECONDS: f64 = 0.4;

/// Fixed loudness floor below which blocks never count.
pub const ABSOLUTE_GATE_LUFS: f64 = -70.0;

/// Relative gate offset below the first-pass mean.
pub const RELATIVE_GATE_LU: f64 = 10.0;

/// One 400 ms gating block.
#[derive(Debug, Clone, Copy)]
pub struct GatedBlock {
    pub start_frame: u64,
    pub mean_square: f64,
    pub speech_prob: f64,
}

impl GatedBlock {
    /// Block loudness: -0.691 + 10*log10(z_b).
    pub fn loudness(&self) -> f64 {
        if self.mean_square <= 0.0 {
            return f64::NEG_INFINITY;
        }
        -0.691 + 10.0 * self.mean_square.log10()
    }
}

/// Ordered collection of gating blocks for one program.
#[derive(Debug, Default)]
pub struct GatingPool {
    blocks: Vec<GatedBlock>,
}

impl GatingPool {
    pub fn push(&mut self, block: GatedBlock) {
        self.blocks.push(block);
    }

    /// Readers run after the barrier; ordering by start frame makes the
    /// pool deterministic regardless of collection order.
    pub fn sort(&mut self) {
        self.blocks.sort_by_key(|b| b.start_frame);
    }

    pub fn blocks(&self) -> &[GatedBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowCell {
    /// Channel-weighted sum of squared K-weighted samples.
    zsum: f64,
    /// Frames per channel in this window (identical across channels).
    frames: u64,
}

/// Shared collector for hop-window powers. Each channel contributes
/// its gain-weighted energy; a window's mean square is the BS.1770
/// channel-weighted sum once every channel has reported.
pub struct WindowCollector {
    cells: Mutex<Vec<WindowCell>>,
}

impl WindowCollector {
    pub fn new(windows: usize) -> Self {
        Self {
            cells: Mutex::new(vec![WindowCell::default(); windows]),
        }
    }

    pub fn contribute(&self, window_index: usize, gained_energy: f64, frames: u64) {
        let mut cells = self.cells.lock().expect("window collector poisoned");
        let cell = &mut cells[window_index];
        cell.zsum += gained_energy;
        cell.frames = cell.frames.max(frames);
    }

    /// Mean-square power per window, in stream order.
    pub fn finalize(self) -> Vec<f64> {
        self.cells
            .into_inner()
            .expect("window collector poisoned")
            .iter()
            .map(|c| if c.frames > 0 { c.zsum / c.frames as f64 } else { 0.0 })
            .collect()
    }
}

/// Assemble overlapping gating blocks from consecutive hop windows.
/// `windows_per_block` is 1/hop_ratio (4 for the default 100 ms hop);
/// block `j` starts at window `j` and averages the next
/// `windows_per_block` window powers.
pub fn assemble_blocks(
    window_powers: &[f64],
    windows_per_block: usize,
    hop_frames: u64,
    classifier: &dyn SpeechClassifier,
    sample_rate: u32,
) -> GatingPool {
    let mut pool = GatingPool::default();
    if window_powers.len() < windows_per_block || windows_per_block == 0 {
        return pool;
    }
    for j in 0..=(window_powers.len() - windows_per_block) {
        let window = &window_powers[j..j + windows_per_block];
        let mean_square = window.iter().sum::<f64>() / windows_per_block as f64;
        let start_frame = j as u64 * hop_frames;
        let start_seconds = start_frame as f64 / sample_rate as f64;
        pool.push(GatedBlock {
            start_frame,
            mean_square,
            speech_prob: classifier.probability(start_seconds, GATING_BLOCK_SECONDS),
        });
    }
    pool.sort();
    pool
}

/// Provides the opaque per-block speech probability. Classification
/// itself lives outside the core; this seam only carries its output.
pub trait SpeechClassifier: Send + Sync {
    fn probability(&self, start_seconds: f64, duration_seconds: f64) -> f64;
}

/// Classifier used when no external one is wired up: everything is
/// speech, so the dialogue gate reduces to the plain gates.
pub struct NoSpeechClassifier;

impl SpeechClassifier for NoSpeechClassifier {
    fn probability(&self, _start_seconds: f64, _duration_seconds: f64) -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatingConfig {
    pub absolute_gate_lufs: f64,
    pub relative_gate_lu: f64,
    pub mode: GateMode,
    pub level_gate_db: Option<f64>,
    pub speech_threshold: f64,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            absolute_gate_lufs: ABSOLUTE_GATE_LUFS,
            relative_gate_lu: RELATIVE_GATE_LU,
            mode: GateMode::None,
            level_gate_db: None,
            speech_threshold: 0.33,
        }
    }
}

/// Integrated gated loudness, or the floor marker when nothing
/// survives the gates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LkfsResult {
    Value(f64),
    BelowFloor,
}

#[derive(Debug, Clone, Copy)]
pub struct GatingOutcome {
    pub lkfs: LkfsResult,
    pub surviving_blocks: usize,
    pub total_blocks: usize,
}

/// Apply the gate stages and reduce the pool.
pub fn integrated_lkfs(pool: &GatingPool, config: &GatingConfig) -> GatingOutcome {
    let total_blocks = pool.len();

    // Absolute gate.
    let mut survivors: Vec<&GatedBlock> = pool
        .blocks()
        .iter()
        .filter(|b| b.loudness() >= config.absolute_gate_lufs)
        .collect();

    if survivors.is_empty() {
        return GatingOutcome {
            lkfs: LkfsResult::BelowFloor,
            surviving_blocks: 0,
            total_blocks,
        };
    }

    // Second stage: relative gate, or a fixed level gate replacing it.
    match config.mode {
        GateMode::Level => {
            let threshold = config
                .level_gate_db
                .expect("level gating validated to carry a threshold");
            survivors.retain(|b| b.loudness() >= threshold);
        }
        GateMode::None | GateMode::Dialogue => {
            let mean: f64 = survivors.iter().map(|b| b.mean_square).sum::<f64>()
                / survivors.len() as f64;
            let relative_threshold =
                -0.691 + 10.0 * mean.log10() - config.relative_gate_lu;
            survivors.retain(|b| b.loudness() >= relative_threshold);
        }
    }

    if config.mode == GateMode::Dialogue {
        survivors.retain(|b| b.speech_prob >= config.speech_threshold);
    }

    if survivors.is_empty() {
        return GatingOutcome {
            lkfs: LkfsResult::BelowFloor,
            surviving_blocks: 0,
            total_blocks,
        };
    }

    let mean: f64 =
        survivors.iter().map(|b| b.mean_square).sum::<f64>() / survivors.len() as f64;
    GatingOutcome {
        lkfs: LkfsResult::Value(-0.691 + 10.0 * mean.log10()),
        surviving_blocks: survivors.len(),
        total_blocks,
    }
}
