use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Error while connecting to the webhook endpoint")]
    Connect(#[source] reqwest::Error),

    #[error("Webhook request timed out")]
    RequestTimeout,

    #[error("Webhook endpoint answered {status}: {message}")]
    Upstream { status: String, message: String },

    #[error("Webhook config {0} is disabled")]
    Disabled(i64),

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Could not build the HTTP client: {0}")]
    ClientBuild(String),
}

impl WebhookError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Connect(_) => "webhook.connect",
            Self::RequestTimeout => "webhook.timeout",
            Self::Upstream { .. } => "webhook.upstream",
            Self::Disabled(_) => "webhook.disabled",
            Self::InvalidUrl(_) => "webhook.invalid_url",
            Self::ClientBuild(_) => "webhook.client_build",
        }
    }
}

impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::RequestTimeout
        } else {
            Self::Connect(err)
        }
    }
}
