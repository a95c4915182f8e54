use thiserror::Error;

#[derive(Debug, Error)]
pub enum NtfyError {
    #[error("Error while connecting to the ntfy server")]
    Connect(#[source] reqwest::Error),

    #[error("ntfy request timed out")]
    RequestTimeout,

    #[error("ntfy server answered {status}: {message}")]
    Upstream { status: String, message: String },

    #[error("Ntfy config {0} is disabled")]
    Disabled(i64),

    #[error("Invalid ntfy server URL: {0}")]
    InvalidServer(String),
}

impl NtfyError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Connect(_) => "ntfy.connect",
            Self::RequestTimeout => "ntfy.timeout",
            Self::Upstream { .. } => "ntfy.upstream",
            Self::Disabled(_) => "ntfy.disabled",
            Self::InvalidServer(_) => "ntfy.invalid_server",
        }
    }
}

impl From<reqwest::Error> for NtfyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::RequestTimeout
        } else {
            Self::Connect(err)
        }
    }
}
