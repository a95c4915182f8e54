//! The email channel: template rendering plus msmtp delivery.

use std::sync::Arc;

use async_trait::async_trait;

use nutify_common::db::models::MailConfig;
use nutify_common::notification::EnrichedEvent;
use nutify_common::secret::SecretStore;

use crate::channels::{
    decrypt_credential, validate_recipients, Channel, ChannelError, ChannelResponse,
};
use crate::error::ApiResult;
use crate::templates;

use super::client::{build_message, timeout_for, SmtpOptions, SmtpTransport};
use super::error::EmailError;
use super::provider;

pub struct EmailChannel {
    config: MailConfig,
    secret: Option<Arc<SecretStore>>,
    transport: Arc<dyn SmtpTransport>,
    base_timeout: std::time::Duration,
}

impl EmailChannel {
    pub fn new(
        config: MailConfig,
        secret: Option<Arc<SecretStore>>,
        transport: Arc<dyn SmtpTransport>,
        base_timeout: std::time::Duration,
    ) -> Self {
        Self {
            config,
            secret,
            transport,
            base_timeout,
        }
    }

    /// Transport options after provider presets and port TLS defaults.
    fn smtp_options(&self, password: Option<String>) -> Result<SmtpOptions, EmailError> {
        let preset = self.config.provider.as_deref().and_then(provider::preset);

        let host = if self.config.smtp_server.is_empty() {
            preset
                .map(|p| p.smtp_server.to_owned())
                .unwrap_or_default()
        } else {
            self.config.smtp_server.clone()
        };
        let port = if self.config.smtp_port == 0 {
            preset.map(|p| p.smtp_port).unwrap_or(25)
        } else {
            self.config.smtp_port
        };
        let (tls, tls_starttls) =
            SmtpOptions::resolve_tls(port, self.config.tls, self.config.tls_starttls);

        let from = match self.config.from_email.as_deref().filter(|f| !f.is_empty()) {
            Some(from) => from.to_owned(),
            None if provider::requires_sender_email(self.config.provider.as_deref()) => {
                return Err(EmailError::SenderRequired)
            }
            None => self
                .config
                .username
                .clone()
                .unwrap_or_else(|| "nutify@localhost".to_owned()),
        };

        Ok(SmtpOptions {
            host,
            port,
            username: self.config.username.clone(),
            password,
            from,
            tls,
            tls_starttls,
        })
    }

    fn subject(&self, event: &EnrichedEvent, is_test: bool) -> Result<String, EmailError> {
        // Email hard-requires the configured server name.
        let server_name = event
            .server_name
            .as_deref()
            .ok_or(EmailError::MissingServerName)?;
        Ok(if is_test {
            format!("{server_name} - UPS Test Email")
        } else {
            format!("{server_name} - UPS Event: {}", event.event_type)
        })
    }
}

#[async_trait(?Send)]
impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, event: &EnrichedEvent, is_test: bool) -> ApiResult<ChannelResponse> {
        if !self.config.enabled && !is_test {
            return Err(ChannelError::Email(EmailError::Disabled(self.config.id)).into());
        }

        let subject = self.subject(event, is_test).map_err(ChannelError::Email)?;
        let recipients = validate_recipients(
            self.config
                .to_email
                .as_deref()
                .unwrap_or_default()
                .split(','),
        )?;

        let password = decrypt_credential(
            self.secret.as_deref(),
            self.config.password_enc.as_deref(),
        )?;
        let options = self.smtp_options(password).map_err(ChannelError::Email)?;

        let body = templates::render_email(event, is_test)?;
        let message = build_message(&options.from, &recipients, &subject, &body);
        let send_timeout = timeout_for(message.len(), self.base_timeout);

        debug!(
            "📧 email -> {} via {}:{} (tls={}, starttls={})",
            recipients.join(", "),
            options.host,
            options.port,
            options.tls,
            options.tls_starttls
        );
        self.transport
            .send(&options, &recipients, &message, send_timeout)
            .await
            .map_err(ChannelError::Email)?;

        Ok(ChannelResponse::success(format!(
            "sent to {}",
            recipients.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::email::client::MockSmtpTransport;
    use crate::error::ApiErrorKind;
    use std::time::Duration;

    fn config() -> MailConfig {
        MailConfig {
            id: 1,
            smtp_server: "smtp.example.com".to_owned(),
            smtp_port: 587,
            username: Some("user@example.com".to_owned()),
            from_email: Some("ups@example.com".to_owned()),
            to_email: Some("ops@example.com".to_owned()),
            enabled: true,
            ..Default::default()
        }
    }

    fn event() -> EnrichedEvent {
        EnrichedEvent {
            ups_name: "ups@localhost".to_owned(),
            event_type: "ONBATT".to_owned(),
            server_name: Some("rack-4".to_owned()),
            ..Default::default()
        }
    }

    fn channel_with(config: MailConfig, transport: MockSmtpTransport) -> EmailChannel {
        EmailChannel::new(config, None, Arc::new(transport), Duration::from_secs(30))
    }

    #[actix_rt::test]
    async fn test_send_builds_subject_and_recipients() {
        let mut transport = MockSmtpTransport::new();
        transport
            .expect_send()
            .withf(|options, recipients, message, _| {
                let text = String::from_utf8_lossy(message);
                options.host == "smtp.example.com"
                    && options.tls
                    && options.tls_starttls
                    && recipients.len() == 1
                    && recipients[0] == "ops@example.com"
                    && text.contains("Subject: rack-4 - UPS Event: ONBATT")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let response = channel_with(config(), transport)
            .send(&event(), false)
            .await
            .unwrap();
        assert!(response.ok);
    }

    #[actix_rt::test]
    async fn test_missing_server_name_is_hard_error() {
        let transport = MockSmtpTransport::new();
        let mut event = event();
        event.server_name = None;
        let err = channel_with(config(), transport)
            .send(&event, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ApiErrorKind::Channel(ChannelError::Email(EmailError::MissingServerName))
        ));
    }

    #[actix_rt::test]
    async fn test_ses_requires_sender() {
        let transport = MockSmtpTransport::new();
        let mut config = config();
        config.provider = Some("amazon".to_owned());
        config.from_email = None;
        let err = channel_with(config, transport)
            .send(&event(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ApiErrorKind::Channel(ChannelError::Email(EmailError::SenderRequired))
        ));
    }

    #[actix_rt::test]
    async fn test_invalid_recipients_fail_dispatch() {
        let transport = MockSmtpTransport::new();
        let mut config = config();
        config.to_email = Some("not-an-address".to_owned());
        let err = channel_with(config, transport)
            .send(&event(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ApiErrorKind::Channel(ChannelError::NoValidRecipients)
        ));
    }

    #[actix_rt::test]
    async fn test_undecryptable_password_fails() {
        let transport = MockSmtpTransport::new();
        let store_a = SecretStore::new("a");
        let store_b = Arc::new(SecretStore::new("b"));
        let mut config = config();
        config.password_enc = Some(store_a.encrypt("hunter2"));
        let channel = EmailChannel::new(
            config,
            Some(store_b),
            Arc::new(transport),
            Duration::from_secs(30),
        );
        let err = channel.send(&event(), false).await.unwrap_err();
        assert!(matches!(
            err.kind,
            ApiErrorKind::Channel(ChannelError::CredentialUnusable)
        ));
    }

    #[actix_rt::test]
    async fn test_test_email_bypasses_disabled() {
        let mut transport = MockSmtpTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut config = config();
        config.enabled = false;
        let response = channel_with(config, transport)
            .send(&event(), true)
            .await
            .unwrap();
        assert!(response.ok);
    }
}
