use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("SMTP client not found at {0}")]
    TransportMissing(String),

    #[error("SMTP client failed: {0}")]
    TransportFailed(String),

    #[error("SMTP client timed out")]
    TransportTimeout,

    #[error("This provider requires an explicit sender address; set From Email")]
    SenderRequired,

    #[error("server_name is not configured; complete the initial setup")]
    MissingServerName,

    #[error("Mail config {0} is disabled")]
    Disabled(i64),

    #[error("Template render failed: {0}")]
    Template(#[from] tera::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EmailError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::TransportMissing(_) => "email.transport_missing",
            Self::TransportFailed(_) => "email.transport_failed",
            Self::TransportTimeout => "email.transport_timeout",
            Self::SenderRequired => "email.sender_required",
            Self::MissingServerName => "email.missing_server_name",
            Self::Disabled(_) => "email.disabled",
            Self::Template(_) => "email.template",
            Self::Io(_) => "email.io",
        }
    }
}
