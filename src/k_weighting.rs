// BS.1770 pre-filter: high shelf into high pass, one cascade per
// channel, plus the per-channel power weights applied by the gated
// worker when it sums channels.

use crate::coefficients::{self, BiquadCoefficients};

#[derive(Clone)]
struct Biquad {
    c: BiquadCoefficients,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn new(c: BiquadCoefficients) -> Self {
        Self {
            c,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    #[inline]
    fn apply(&mut self, x0: f64) -> f64 {
        let y0 = self.c.b0 * x0 + self.c.b1 * self.x1 + self.c.b2 * self.x2
            - self.c.a1 * self.y1
            - self.c.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x0;
        self.y2 = self.y1;
        self.y1 = y0;

        y0
    }
}

pub struct KWeightingBank {
    shelf: Vec<Biquad>,
    highpass: Vec<Biquad>,
    gains: Vec<f64>,
}

impl KWeightingBank {
    /// `gains` overrides the per-channel power weights; `None` picks the
    /// BS.1770 defaults for the channel count.
    pub fn new(sample_rate: u32, channels: usize, gains: Option<&[f64]>) -> Self {
        let (shelf_coeffs, hp_coeffs) = coefficients::k_weighting(sample_rate);
        let gains = match gains {
            Some(g) => g.to_vec(),
            None => coefficients::default_channel_gains(channels),
        };
        Self {
            shelf: (0..channels).map(|_| Biquad::new(shelf_coeffs)).collect(),
            highpass: (0..channels).map(|_| Biquad::new(hp_coeffs)).collect(),
            gains,
        }
    }

    #[inline]
    pub fn process(&mut self, channel: usize, sample: f64) -> f64 {
        let y = self.shelf[channel].apply(sample);
        self.highpass[channel].apply(y)
    }

    /// Power weight for a channel (applied to mean squares, not samples).
    #[inline]
    pub fn gain(&self, channel: usize) -> f64 {
        self.gains[channel]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate).sin())
            .collect()
    }

    fn mean_square(values: &[f64]) -> f64 {
        values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64
    }

    #[test]
    fn low_frequencies_are_attenuated() {
        let mut bank = KWeightingBank::new(48_000, 1, None);
        let input = sine(25.0, 48_000.0, 96_000);
        let output: Vec<f64> = input.iter().map(|&x| bank.process(0, x)).collect();
        // Skip the settling of the 38 Hz high pass.
        let gain_db =
            10.0 * (mean_square(&output[48_000..]) / mean_square(&input[48_000..])).log10();
        assert!(gain_db < -6.0, "25 Hz should be well below unity, got {gain_db}");
    }

    #[test]
    fn high_shelf_boosts_treble() {
        let mut bank = KWeightingBank::new(48_000, 1, None);
        let input = sine(10_000.0, 48_000.0, 48_000);
        let output: Vec<f64> = input.iter().map(|&x| bank.process(0, x)).collect();
        let gain_db = 10.0 * (mean_square(&output) / mean_square(&input)).log10();
        assert!(
            gain_db > 3.0 && gain_db < 5.0,
            "shelf should add ~4 dB at 10 kHz, got {gain_db}"
        );
    }

    #[test]
    fn surround_gains_apply() {
        let bank = KWeightingBank::new(48_000, 6, None);
        assert_eq!(bank.gain(0), 1.0);
        assert_eq!(bank.gain(3), 0.0);
        assert_eq!(bank.gain(5), 1.41);

        let custom = [0.5, 0.5];
        let bank = KWeightingBank::new(48_000, 2, Some(&custom));
        assert_eq!(bank.gain(1), 0.5);
    }
}
