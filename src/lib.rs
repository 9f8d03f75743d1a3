use core::fmt;
use std::process::{ExitCode, Termination};

use log::error;

pub mod coefficients;
pub mod color_logger;
pub mod config;
pub mod energy;
pub mod gating;
pub mod input;
pub mod k_weighting;
pub mod m_weighting;
pub mod meter_context;
pub mod report;
pub mod scheduler;
pub mod series;
pub mod true_peak;
mod worker;

pub use color_logger::ColorLogger;
pub use config::{GateMode, MeterConfig};
pub use meter_context::MeterContext;

pub const ONE_HUNDRED_PERCENT: f64 = 100.0;

/// Progress message sent while a file is being measured.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub percent: f64,
}

/// Everything that can go wrong while measuring. The kind string and
/// exit code are part of the tool's contract.
#[derive(Debug)]
pub enum MeterError {
    UnsupportedSampleRate(u32),
    ChannelCountMismatch { expected: usize, actual: usize },
    DecoderFailure(String),
    InsufficientData,
    NumericFailure(String),
    CancelledByUser,
    InvalidArgument(String),
    Io(String),
}

impl MeterError {
    pub fn kind(&self) -> &'static str {
        match self {
            MeterError::UnsupportedSampleRate(_) => "unsupported_sample_rate",
            MeterError::ChannelCountMismatch { .. } => "channel_count_mismatch",
            MeterError::DecoderFailure(_) => "decoder_failure",
            MeterError::InsufficientData => "insufficient_data",
            MeterError::NumericFailure(_) => "numeric_failure",
            MeterError::CancelledByUser => "cancelled_by_user",
            MeterError::InvalidArgument(_) => "invalid_argument",
            MeterError::Io(_) => "io_error",
        }
    }

    /// Process exit code: 1 invalid argument or unsupported input,
    /// 2 decoding failure, 3 processing error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MeterError::UnsupportedSampleRate(_)
            | MeterError::ChannelCountMismatch { .. }
            | MeterError::InsufficientData
            | MeterError::InvalidArgument(_) => 1,
            MeterError::DecoderFailure(_) => 2,
            MeterError::NumericFailure(_) | MeterError::Io(_) | MeterError::CancelledByUser => 3,
        }
    }
}

impl fmt::Display for MeterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterError::UnsupportedSampleRate(rate) => {
                write!(f, "no M-weighting table for sample rate {rate} Hz")
            }
            MeterError::ChannelCountMismatch { expected, actual } => {
                write!(f, "expected {expected} channels, got {actual}")
            }
            MeterError::DecoderFailure(detail) => write!(f, "decoder failure: {detail}"),
            MeterError::InsufficientData => write!(f, "audio stream contains no frames"),
            MeterError::NumericFailure(detail) => write!(f, "numeric failure: {detail}"),
            MeterError::CancelledByUser => write!(f, "cancelled by user"),
            MeterError::InvalidArgument(detail) => write!(f, "{detail}"),
            MeterError::Io(detail) => write!(f, "i/o error: {detail}"),
        }
    }
}

impl std::error::Error for MeterError {}

impl From<std::io::Error> for MeterError {
    fn from(err: std::io::Error) -> Self {
        MeterError::Io(err.to_string())
    }
}

pub type MeterResult<T> = Result<T, MeterError>;

/// Maps the error taxonomy onto process exit codes at the end of main.
pub struct TermResult(pub MeterResult<()>);

impl Termination for TermResult {
    fn report(self) -> ExitCode {
        match self.0 {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{}", err);
                ExitCode::from(err.exit_code())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        assert_eq!(MeterError::UnsupportedSampleRate(96_000).exit_code(), 1);
        assert_eq!(MeterError::InsufficientData.exit_code(), 1);
        assert_eq!(MeterError::DecoderFailure("x".into()).exit_code(), 2);
        assert_eq!(MeterError::NumericFailure("x".into()).exit_code(), 3);
    }

    #[test]
    fn kinds_are_stable_strings() {
        assert_eq!(
            MeterError::UnsupportedSampleRate(1).kind(),
            "unsupported_sample_rate"
        );
        assert_eq!(MeterError::CancelledByUser.kind(), "cancelled_by_user");
    }
}
