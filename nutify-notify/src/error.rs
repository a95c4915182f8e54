//! Error types for the pipeline and the notifier binary.

use std::error::Error;
use std::fmt::{self, Display};

use backtrace::Backtrace;
use thiserror::Error;

use crate::channels::ChannelError;

pub type ApiResult<T> = Result<T, ApiError>;

/// The main error type for event processing.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub backtrace: Backtrace,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        let mut error: &dyn Error = &self.kind;
        while let Some(source) = error.source() {
            write!(f, "\n\nCaused by: {source}")?;
            error = source;
        }

        Ok(())
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.kind.source()
    }
}

// Forward From impls to ApiError from ApiErrorKind. Because From is
// reflexive, this impl also takes care of From<ApiErrorKind>.
impl<T> From<T> for ApiError
where
    ApiErrorKind: From<T>,
{
    fn from(item: T) -> Self {
        ApiError {
            kind: ApiErrorKind::from(item),
            backtrace: Backtrace::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiErrorKind {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ConfigError(#[from] config::ConfigError),

    #[error(transparent)]
    Common(#[from] nutify_common::errors::NutifyError),

    #[error("Database error: {0}")]
    Database(#[from] nutify_common::db::DbError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Cannot parse notifier arguments: {0:?}")]
    ArgumentParse(String),

    #[error("Dispatch timed out on channel {0}")]
    DispatchTimeout(&'static str),

    #[error("General error: {0}")]
    General(String),
}

impl ApiErrorKind {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::ConfigError(_) => "config_error",
            Self::Common(_) => "common_error",
            Self::Database(_) => "database_error",
            Self::Channel(_) => "channel_error",
            Self::Template(_) => "template_error",
            Self::ArgumentParse(_) => "argument_parse",
            Self::DispatchTimeout(_) => "dispatch_timeout",
            Self::General(_) => "general_error",
        }
    }
}
