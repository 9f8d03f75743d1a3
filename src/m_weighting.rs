// Per-channel stateful M-weighting.
//
// Direct-Form-I recurrence over the tabulated 6-tap coefficient sets,
// or convolution with the derived FIR kernel. Filter history is a
// fixed-capacity ring with a head index; nothing allocates per sample.
// All history starts at zero and the initial transient is accepted.

use crate::coefficients::{self, IirCoefficients};
use crate::MeterResult;

/// Input/output history for one channel of the recursive filter.
/// `x[(head_x + k) % 6]` holds `x[n-k]`, likewise for `y`.
#[derive(Clone)]
struct FilterState {
    x: [f64; 6],
    y: [f64; 5],
    head_x: usize,
    head_y: usize,
}

impl FilterState {
    fn new() -> Self {
        Self {
            x: [0.0; 6],
            y: [0.0; 5],
            head_x: 0,
            head_y: 0,
        }
    }
}

/// One recursive M-weighting filter per channel.
pub struct MWeightingBank {
    coeffs: &'static IirCoefficients,
    states: Vec<FilterState>,
}

impl MWeightingBank {
    pub fn new(sample_rate: u32, channels: usize) -> MeterResult<Self> {
        let coeffs = coefficients::m_weighting(sample_rate)?;
        Ok(Self {
            coeffs,
            states: (0..channels).map(|_| FilterState::new()).collect(),
        })
    }

    /// y[n] = sum b_k * x[n-k] - sum_{k>=1} a_k * y[n-k], then shift.
    #[inline]
    pub fn process(&mut self, channel: usize, sample: f64) -> f64 {
        let state = &mut self.states[channel];

        state.head_x = (state.head_x + state.x.len() - 1) % state.x.len();
        state.x[state.head_x] = sample;

        let mut y = 0.0;
        for k in 0..self.coeffs.b.len() {
            y += self.coeffs.b[k] * state.x[(state.head_x + k) % state.x.len()];
        }
        for k in 1..self.coeffs.a.len() {
            y -= self.coeffs.a[k] * state.y[(state.head_y + k - 1) % state.y.len()];
        }

        state.head_y = (state.head_y + state.y.len() - 1) % state.y.len();
        state.y[state.head_y] = y;

        y
    }
}

/// Per-channel convolution state for the FIR branch. The ring retains
/// the tail of the previous block so block boundaries are seamless.
#[derive(Clone)]
struct ConvState {
    history: Vec<f64>,
    head: usize,
}

pub struct FirBank {
    kernel: Vec<f64>,
    states: Vec<ConvState>,
}

impl FirBank {
    pub fn new(sample_rate: u32, channels: usize, taps: usize) -> MeterResult<Self> {
        let kernel = coefficients::m_weighting_fir(sample_rate, taps)?;
        let states = (0..channels)
            .map(|_| ConvState {
                history: vec![0.0; kernel.len()],
                head: 0,
            })
            .collect();
        Ok(Self { kernel, states })
    }

    #[inline]
    pub fn process(&mut self, channel: usize, sample: f64) -> f64 {
        let state = &mut self.states[channel];
        let n = state.history.len();

        state.head = (state.head + n - 1) % n;
        state.history[state.head] = sample;

        let mut acc = 0.0;
        for (k, &h) in self.kernel.iter().enumerate() {
            acc += h * state.history[(state.head + k) % n];
        }
        acc
    }
}

/// The weighting stage a worker drives: recursive by default, FIR when
/// a convolution point count was configured.
pub enum WeightingBank {
    Iir(MWeightingBank),
    Fir(FirBank),
}

impl WeightingBank {
    pub fn new(
        sample_rate: u32,
        channels: usize,
        conv_points: Option<usize>,
    ) -> MeterResult<Self> {
        match conv_points {
            Some(taps) => Ok(WeightingBank::Fir(FirBank::new(sample_rate, channels, taps)?)),
            None => Ok(WeightingBank::Iir(MWeightingBank::new(sample_rate, channels)?)),
        }
    }

    #[inline]
    pub fn process(&mut self, channel: usize, sample: f64) -> f64 {
        match self {
            WeightingBank::Iir(bank) => bank.process(channel, sample),
            WeightingBank::Fir(bank) => bank.process(channel, sample),
        }
    }
}
