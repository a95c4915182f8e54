//! The webhook channel: a JSON envelope POSTed to the configured URL.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use url::Url;

use nutify_common::db::models::WebhookConfig;
use nutify_common::notification::EnrichedEvent;
use nutify_common::secret::SecretStore;

use crate::channels::{decrypt_credential, Channel, ChannelError, ChannelResponse};
use crate::error::ApiResult;

use super::error::WebhookError;

pub struct WebhookChannel {
    config: WebhookConfig,
    secret: Option<Arc<SecretStore>>,
    http: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(
        config: WebhookConfig,
        secret: Option<Arc<SecretStore>>,
    ) -> Result<Self, WebhookError> {
        // verify_ssl=false deployments post to self-signed internal hosts.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| WebhookError::ClientBuild(e.to_string()))?;
        Ok(Self {
            config,
            secret,
            http,
        })
    }

    /// The JSON envelope: identity fields at the top, full enrichment under
    /// `data`.
    pub fn envelope(event: &EnrichedEvent, is_test: bool) -> serde_json::Value {
        json!({
            "event": event.event_type,
            "ups": event.ups_name,
            "timestamp": format!("{} {}", event.event_date, event.event_time),
            "server_name": event.server_name_or_default(),
            "is_test": is_test,
            "data": event,
        })
    }
}

#[async_trait(?Send)]
impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, event: &EnrichedEvent, is_test: bool) -> ApiResult<ChannelResponse> {
        if !self.config.enabled && !is_test {
            return Err(ChannelError::Webhook(WebhookError::Disabled(self.config.id)).into());
        }
        let url = Url::parse(&self.config.url)
            .map_err(|_| ChannelError::Webhook(WebhookError::InvalidUrl(self.config.url.clone())))?;

        let mut request = self.http.post(url.clone()).json(&Self::envelope(event, is_test));
        let token = decrypt_credential(
            self.secret.as_deref(),
            self.config.auth_token_enc.as_deref(),
        )?;
        request = match (self.config.auth_type.as_deref(), &self.config.auth_user, token) {
            (Some("basic"), Some(user), password) => request.basic_auth(user, password),
            (Some("bearer"), _, Some(token)) => request.bearer_auth(token),
            _ => request,
        };

        let response = request
            .send()
            .await
            .map_err(WebhookError::from)
            .map_err(ChannelError::Webhook)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChannelError::Webhook(WebhookError::Upstream {
                status: status.to_string(),
                message,
            })
            .into());
        }
        Ok(ChannelResponse::success(format!(
            "delivered to {} ({})",
            self.config.name, url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> EnrichedEvent {
        EnrichedEvent {
            ups_name: "ups@localhost".to_owned(),
            event_type: "COMMBAD".to_owned(),
            event_date: "2024-06-01".to_owned(),
            event_time: "12:00:02".to_owned(),
            battery_charge: Some("97%".to_owned()),
            ..Default::default()
        }
    }

    fn config(url: &str) -> WebhookConfig {
        WebhookConfig {
            id: 1,
            name: "monitoring".to_owned(),
            url: url.to_owned(),
            verify_ssl: true,
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = WebhookChannel::envelope(&event(), false);
        assert_eq!(envelope["event"], "COMMBAD");
        assert_eq!(envelope["ups"], "ups@localhost");
        assert_eq!(envelope["server_name"], "UPS Monitor");
        assert_eq!(envelope["data"]["battery_charge"], "97%");
    }

    #[actix_rt::test]
    async fn test_send_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .with_status(204)
            .create_async()
            .await;

        let channel =
            WebhookChannel::new(config(&format!("{}/hook", server.url())), None).unwrap();
        let response = channel.send(&event(), false).await.unwrap();
        assert!(response.ok);
        mock.assert_async().await;
    }

    #[actix_rt::test]
    async fn test_upstream_failure_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(503)
            .create_async()
            .await;
        let channel =
            WebhookChannel::new(config(&format!("{}/hook", server.url())), None).unwrap();
        assert!(channel.send(&event(), false).await.is_err());
    }

    #[test]
    fn test_invalid_url() {
        let channel = WebhookChannel::new(config("not a url"), None).unwrap();
        // Error surfaces at send time, keeping construction infallible for
        // bad rows.
        futures::executor::block_on(async {
            assert!(channel.send(&event(), false).await.is_err());
        });
    }
}
