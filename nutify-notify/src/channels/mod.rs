//! Channels dispatch enriched events to their transports.

use async_trait::async_trait;
use thiserror::Error;

use nutify_common::notification::EnrichedEvent;

use crate::channels::email::error::EmailError;
use crate::channels::ntfy::error::NtfyError;
use crate::channels::webhook::error::WebhookError;
use crate::error::ApiResult;

mod common;
pub mod email;
pub mod ntfy;
pub mod webhook;

#[async_trait(?Send)]
pub trait Channel {
    /// Stable channel tag used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Deliver one enriched event. `is_test` bypasses the per-event
    /// enablement check and marks the rendered content as a test.
    async fn send(&self, event: &EnrichedEvent, is_test: bool) -> ApiResult<ChannelResponse>;
}

/// The response returned when a channel delivers a notification.
#[derive(Debug, PartialEq)]
pub struct ChannelResponse {
    pub ok: bool,
    pub message: String,
}

impl ChannelResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Email(#[from] EmailError),

    #[error(transparent)]
    Ntfy(#[from] NtfyError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("password cannot be decrypted — re-enter the credential")]
    CredentialUnusable,

    #[error("No recipients survived validation")]
    NoValidRecipients,
}

impl ChannelError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Email(e) => e.metric_label(),
            Self::Ntfy(e) => e.metric_label(),
            Self::Webhook(e) => e.metric_label(),
            Self::CredentialUnusable => "channel.credential_unusable",
            Self::NoValidRecipients => "channel.no_valid_recipients",
        }
    }
}

pub use common::{decrypt_credential, validate_recipients};
