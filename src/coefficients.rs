// Static filter coefficient tables and derived kernels.
//
// M-weighting (ISO 21727) is a 6-tap recursive filter tabulated per
// sample rate; the two mandatory rates are hard reference values and
// must never be substituted for one another. K-weighting (ITU-R
// BS.1770-4) is a two-stage biquad cascade: Table 1 values for 48 kHz,
// bilinear design for everything else.

use crate::{MeterError, MeterResult};

/// Converts normalized digital RMS to dB SPL at the ISO calibration
/// point (20 uPa reference plus calibration).
pub const REFERENCE_OFFSET_DB: f64 = 108.010299957;

/// Default tap count for the FIR rendition of the M-weighting filter.
pub const DEFAULT_FIR_TAPS: usize = 21;

#[derive(Debug, Clone, Copy)]
pub struct IirCoefficients {
    pub a: [f64; 6],
    pub b: [f64; 6],
}

static M_WEIGHTING_48000: IirCoefficients = IirCoefficients {
    a: [
        1.0,
        -1.6391291074367320,
        1.5160386192837869,
        -0.8555167646249104,
        0.2870466545317107,
        -0.0428951718612053,
    ],
    b: [
        0.31837346242469328,
        0.10800452155339044,
        -0.21106344349319428,
        -0.15438275853192485,
        -0.05130596901975942,
        -0.00518224535906041,
    ],
};

static M_WEIGHTING_44100: IirCoefficients = IirCoefficients {
    a: [
        1.0,
        -1.5224995723629664,
        1.3617953870010380,
        -0.7794603877415162,
        0.2773974331876455,
        -0.0477648119172564,
    ],
    b: [
        0.4034108659797224,
        0.0675046624145518,
        -0.3122917473135974,
        -0.1471391464872613,
        -0.0173711282192394,
        0.0101026340442429,
    ],
};

/// Look up the M-weighting table for a sample rate. Rates without a
/// table are a hard error; the caller decides whether to resample.
pub fn m_weighting(sample_rate: u32) -> MeterResult<&'static IirCoefficients> {
    match sample_rate {
        48_000 => Ok(&M_WEIGHTING_48000),
        44_100 => Ok(&M_WEIGHTING_44100),
        other => Err(MeterError::UnsupportedSampleRate(other)),
    }
}

pub fn is_tabulated(sample_rate: u32) -> bool {
    m_weighting(sample_rate).is_ok()
}

/// Derive an N-tap FIR kernel equivalent to the tabulated M-weighting
/// filter by collecting its impulse response. The response decays below
/// 1e-9 within roughly 20 samples at both mandatory rates, so the
/// default 21-tap kernel reproduces the recursive filter to well under
/// 0.001 dB.
pub fn m_weighting_fir(sample_rate: u32, taps: usize) -> MeterResult<Vec<f64>> {
    let coeffs = m_weighting(sample_rate)?;
    let mut x_hist = [0.0f64; 6];
    let mut y_hist = [0.0f64; 5];
    let mut kernel = Vec::with_capacity(taps);

    for n in 0..taps {
        let x = if n == 0 { 1.0 } else { 0.0 };
        for i in (1..x_hist.len()).rev() {
            x_hist[i] = x_hist[i - 1];
        }
        x_hist[0] = x;

        let mut y = 0.0;
        for i in 0..coeffs.b.len() {
            y += coeffs.b[i] * x_hist[i];
        }
        for i in 1..coeffs.a.len() {
            y -= coeffs.a[i] * y_hist[i - 1];
        }

        for i in (1..y_hist.len()).rev() {
            y_hist[i] = y_hist[i - 1];
        }
        y_hist[0] = y;
        kernel.push(y);
    }

    Ok(kernel)
}

/// One biquad stage, `a0` normalized to 1.
#[derive(Debug, Clone, Copy)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

// BS.1770-4 Table 1 (48 kHz reference values).
static K_SHELF_48000: BiquadCoefficients = BiquadCoefficients {
    b0: 1.53512485958697,
    b1: -2.69169618940638,
    b2: 1.19839281085285,
    a1: -1.69065929318241,
    a2: 0.73248077421585,
};

static K_HIGHPASS_48000: BiquadCoefficients = BiquadCoefficients {
    b0: 1.0,
    b1: -2.0,
    b2: 1.0,
    a1: -1.99004745483398,
    a2: 0.99007225036621,
};

/// K-weighting cascade (high shelf, then high pass) for a sample rate.
/// 48 kHz uses the published table; other rates are designed with the
/// bilinear transform, which reproduces the table to 1e-6.
pub fn k_weighting(sample_rate: u32) -> (BiquadCoefficients, BiquadCoefficients) {
    if sample_rate == 48_000 {
        (K_SHELF_48000, K_HIGHPASS_48000)
    } else {
        (
            design_k_shelf(sample_rate as f64),
            design_k_highpass(sample_rate as f64),
        )
    }
}

fn design_k_shelf(sample_rate: f64) -> BiquadCoefficients {
    let gain_db = 3.99984385397;
    let q = 0.7071752369554193;
    let center_hz = 1681.9744509555319;

    let k = (std::f64::consts::PI * center_hz / sample_rate).tan();
    let vh = 10.0f64.powf(gain_db / 20.0);
    let vb = vh.powf(0.499666774155);
    let a0 = 1.0 + k / q + k * k;
    BiquadCoefficients {
        b0: (vh + vb * k / q + k * k) / a0,
        b1: 2.0 * (k * k - vh) / a0,
        b2: (vh - vb * k / q + k * k) / a0,
        a1: 2.0 * (k * k - 1.0) / a0,
        a2: (1.0 - k / q + k * k) / a0,
    }
}

fn design_k_highpass(sample_rate: f64) -> BiquadCoefficients {
    let q = 0.5003270373253953;
    let center_hz = 38.13547087613982;

    let k = (std::f64::consts::PI * center_hz / sample_rate).tan();
    let a0 = 1.0 + k / q + k * k;
    BiquadCoefficients {
        b0: 1.0,
        b1: -2.0,
        b2: 1.0,
        a1: 2.0 * (k * k - 1.0) / a0,
        a2: (1.0 - k / q + k * k) / a0,
    }
}

/// BS.1770 channel weights by layout. 5.1 order is L R C LFE Ls Rs;
/// LFE does not contribute. Layouts the table does not know get unity
/// gains and can be overridden through the config.
pub fn default_channel_gains(channels: usize) -> Vec<f64> {
    match channels {
        6 => vec![1.0, 1.0, 1.0, 0.0, 1.41, 1.41],
        n => vec![1.0; n],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_rates_resolve() {
        assert!(m_weighting(48_000).is_ok());
        assert!(m_weighting(44_100).is_ok());
    }

    #[test]
    fn unknown_rate_is_refused() {
        match m_weighting(96_000) {
            Err(MeterError::UnsupportedSampleRate(96_000)) => {}
            other => panic!("expected UnsupportedSampleRate, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fir_kernel_starts_with_b0_and_decays() {
        let kernel = m_weighting_fir(48_000, DEFAULT_FIR_TAPS).unwrap();
        assert_eq!(kernel.len(), DEFAULT_FIR_TAPS);
        assert!((kernel[0] - 0.31837346242469328).abs() < 1e-15);
        // Tail of the impulse response is negligible by tap 20.
        assert!(kernel[DEFAULT_FIR_TAPS - 1].abs() < 1e-6);
    }

    #[test]
    fn k_design_matches_table_at_48k() {
        // The bilinear design must reproduce BS.1770-4 Table 1.
        let shelf = design_k_shelf(48_000.0);
        assert!((shelf.b0 - K_SHELF_48000.b0).abs() < 1e-6);
        assert!((shelf.b1 - K_SHELF_48000.b1).abs() < 1e-6);
        assert!((shelf.b2 - K_SHELF_48000.b2).abs() < 1e-6);
        assert!((shelf.a1 - K_SHELF_48000.a1).abs() < 1e-6);
        assert!((shelf.a2 - K_SHELF_48000.a2).abs() < 1e-6);

        let hp = design_k_highpass(48_000.0);
        assert!((hp.a1 - K_HIGHPASS_48000.a1).abs() < 1e-6);
        assert!((hp.a2 - K_HIGHPASS_48000.a2).abs() < 1e-6);
    }

    #[test]
    fn five_one_gains_zero_the_lfe() {
        let gains = default_channel_gains(6);
        assert_eq!(gains[3], 0.0);
        assert_eq!(gains[4], 1.41);
        assert_eq!(default_channel_gains(2), vec![1.0, 1.0]);
    }
}
