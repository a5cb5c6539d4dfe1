use thiserror::Error;

/// Errors raised by the analysis core.
///
/// Degenerate audio never ends up here; those cases resolve to fallbacks
/// inside each stage. Only contract violations and I/O surface as errors.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("transform size {0} is not a power of two")]
    TransformSize(usize),

    #[error("transform buffers differ in length (re={re}, im={im}, plan={plan})")]
    LengthMismatch { re: usize, im: usize, plan: usize },

    #[error("invalid waveform: {0}")]
    InvalidWaveform(String),

    #[error("invalid analysis settings: {0}")]
    InvalidSettings(String),

    #[error("pattern catalog: {0}")]
    Pattern(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
