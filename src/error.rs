use thiserror::Error;

// ---------------------------------------------------------------------------
// DoseError – typed failures surfaced by the library
// ---------------------------------------------------------------------------

/// Errors raised while loading, configuring or fitting dose-response data.
///
/// Loader and CLI glue wrap these in `anyhow` with context; `main` downcasts
/// back to `DoseError` to pick an exit code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DoseError {
    /// A header or data row that does not follow the measurement layout.
    #[error("malformed input at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{group}: only {found} concentrations, at least {required} are needed for a 4PL fit")]
    TooFewPoints {
        group: String,
        found: usize,
        required: usize,
    },

    #[error("{group}: concentration {value} is not positive")]
    NonPositiveConcentration { group: String, value: f64 },

    #[error("{group}: {reason}")]
    NonFiniteData { group: String, reason: String },
}

impl DoseError {
    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        DoseError::Malformed {
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        DoseError::InvalidConfig(reason.into())
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            DoseError::InvalidConfig(_) => 2,
            DoseError::Malformed { .. } | DoseError::UnsupportedFormat(_) => 3,
            DoseError::TooFewPoints { .. }
            | DoseError::NonPositiveConcentration { .. }
            | DoseError::NonFiniteData { .. } => 1,
        }
    }
}

pub type DoseResult<T> = Result<T, DoseError>;
