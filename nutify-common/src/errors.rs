//! Error handling for the supervisory core.

use std::error::Error;
use std::fmt::{self, Display};
use std::num;

use backtrace::Backtrace;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NutifyError>;

/// The main error wrapper, carrying a backtrace next to the kind.
#[derive(Debug)]
pub struct NutifyError {
    pub kind: NutifyErrorKind,
    pub backtrace: Backtrace,
}

impl Display for NutifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        // Go down the chain of errors
        let mut error: &dyn Error = &self.kind;
        while let Some(source) = error.source() {
            write!(f, "\n\nCaused by: {source}")?;
            error = source;
        }

        Ok(())
    }
}

impl Error for NutifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.kind.source()
    }
}

// Forward From impls to NutifyError from NutifyErrorKind. Because From is
// reflexive, this impl also takes care of From<NutifyErrorKind>.
impl<T> From<T> for NutifyError
where
    NutifyErrorKind: From<T>,
{
    fn from(item: T) -> Self {
        NutifyError {
            kind: NutifyErrorKind::from(item),
            backtrace: Backtrace::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NutifyErrorKind {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ParseIntError(#[from] num::ParseIntError),

    #[error(transparent)]
    ParseFloatError(#[from] num::ParseFloatError),

    #[error(transparent)]
    ConfigError(#[from] config::ConfigError),

    #[error(transparent)]
    MetricError(#[from] cadence::MetricError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] crate::db::error::DbError),

    #[error(transparent)]
    SecretError(#[from] crate::secret::SecretError),

    #[error("NUT command failed: {0}")]
    NutCommand(String),

    #[error("NUT command timed out: {0}")]
    NutTimeout(String),

    #[error("UPS communication lost: {0}")]
    UsbLost(String),

    #[error("Unparseable NUT event: {0:?}")]
    UnparseableEvent(String),

    #[error("Invalid timezone: {0:?}")]
    InvalidTimezone(String),

    #[error("General error: {0}")]
    GeneralError(String),
}

impl NutifyErrorKind {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::ParseIntError(_) => "parse_int_error",
            Self::ParseFloatError(_) => "parse_float_error",
            Self::ConfigError(_) => "config_error",
            Self::MetricError(_) => "metric_error",
            Self::DatabaseError(_) => "database_error",
            Self::SecretError(_) => "secret_error",
            Self::NutCommand(_) => "nut_command_error",
            Self::NutTimeout(_) => "nut_timeout",
            Self::UsbLost(_) => "usb_lost",
            Self::UnparseableEvent(_) => "unparseable_event",
            Self::InvalidTimezone(_) => "invalid_timezone",
            Self::GeneralError(_) => "general_error",
        }
    }
}

impl From<&str> for NutifyError {
    fn from(message: &str) -> Self {
        NutifyErrorKind::GeneralError(message.to_owned()).into()
    }
}
