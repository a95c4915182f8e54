//! The ntfy channel: one HTTP POST per notification to `{server}/{topic}`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use nutify_common::db::models::NtfyConfig;
use nutify_common::events::EventType;
use nutify_common::notification::EnrichedEvent;
use nutify_common::secret::SecretStore;

use crate::channels::{decrypt_credential, Channel, ChannelError, ChannelResponse};
use crate::error::ApiResult;

use super::error::NtfyError;

pub struct NtfyChannel {
    config: NtfyConfig,
    secret: Option<Arc<SecretStore>>,
    http: reqwest::Client,
}

impl NtfyChannel {
    pub fn new(
        config: NtfyConfig,
        secret: Option<Arc<SecretStore>>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            secret,
            http,
        }
    }

    fn publish_url(&self) -> Result<Url, NtfyError> {
        let base = self.config.server.trim_end_matches('/');
        Url::parse(&format!("{}/{}", base, self.config.topic))
            .map_err(|_| NtfyError::InvalidServer(self.config.server.clone()))
    }
}

/// Per-event delivery priority (1-5).
pub fn priority_for(event_type: &str) -> u8 {
    match EventType::from_str(event_type) {
        Ok(EventType::Lowbatt | EventType::Shutdown | EventType::Fsd) => 5,
        Ok(EventType::Onbatt
        | EventType::Commbad
        | EventType::Nocomm
        | EventType::Replbatt
        | EventType::Overload
        | EventType::Nobatt) => 4,
        _ => 3,
    }
}

/// ntfy tag list per event type.
pub fn tags_for(event_type: &str) -> &'static str {
    match EventType::from_str(event_type) {
        Ok(EventType::Online) => "electric_plug,white_check_mark",
        Ok(EventType::Onbatt) => "battery,warning",
        Ok(EventType::Lowbatt) => "battery,rotating_light",
        Ok(EventType::Commbad | EventType::Nocomm) => "no_mobile_phones",
        Ok(EventType::Commok) => "mobile_phone,white_check_mark",
        Ok(EventType::Shutdown | EventType::Fsd) => "rotating_light",
        Ok(EventType::Replbatt) => "wrench",
        _ => "zap",
    }
}

/// Notification title. ASCII only: Unicode in HTTP headers trips encoding
/// on some ntfy deployments.
pub fn title_for(event: &EnrichedEvent, is_test: bool) -> String {
    let server_name = event.server_name_or_default();
    let title = if is_test {
        format!("{server_name}: UPS test notification")
    } else {
        match EventType::from_str(&event.event_type) {
            Ok(EventType::Online) => format!("{server_name}: UPS back online"),
            Ok(EventType::Onbatt) => format!("{server_name}: UPS on battery"),
            Ok(EventType::Lowbatt) => format!("{server_name}: UPS battery low"),
            Ok(EventType::Commbad) => format!("{server_name}: UPS communication lost"),
            Ok(EventType::Commok) => format!("{server_name}: UPS communication restored"),
            Ok(EventType::Nocomm) => format!("{server_name}: UPS unavailable"),
            Ok(EventType::Shutdown) => format!("{server_name}: system shutdown"),
            Ok(EventType::Fsd) => format!("{server_name}: UPS forced shutdown"),
            Ok(EventType::Replbatt) => format!("{server_name}: UPS battery needs replacing"),
            _ => format!("{server_name}: UPS event {}", event.event_type),
        }
    };
    title.chars().filter(char::is_ascii).collect()
}

/// Plain-text body from the enriched snapshot.
pub fn body_for(event: &EnrichedEvent) -> String {
    let mut lines = vec![format!("UPS: {}", event.ups_name)];
    if let Some(model) = &event.ups_model {
        lines.push(format!("Model: {model}"));
    }
    if let Some(status) = &event.ups_status {
        lines.push(format!("Status: {status}"));
    }
    if let Some(charge) = &event.battery_charge {
        lines.push(format!("Battery: {charge}"));
    }
    if let Some(runtime) = event.runtime_minutes {
        lines.push(format!("Runtime: {runtime} min"));
    }
    if let Some(load) = event.ups_load {
        lines.push(format!("Load: {load}%"));
    }
    if let Some(duration) = &event.battery_duration {
        lines.push(format!("Time on battery: {duration}"));
    }
    if let Some(duration) = &event.comm_duration {
        lines.push(format!("Outage length: {duration}"));
    }
    lines.push(format!("At: {} {}", event.event_date, event.event_time));
    lines
        .join("\n")
        .chars()
        .filter(char::is_ascii)
        .collect()
}

#[async_trait(?Send)]
impl Channel for NtfyChannel {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    async fn send(&self, event: &EnrichedEvent, is_test: bool) -> ApiResult<ChannelResponse> {
        if !self.config.enabled && !is_test {
            return Err(ChannelError::Ntfy(NtfyError::Disabled(self.config.id)).into());
        }

        let url = self.publish_url().map_err(ChannelError::Ntfy)?;
        let mut request = self
            .http
            .post(url.clone())
            .header("Title", title_for(event, is_test))
            .header("Priority", priority_for(&event.event_type).to_string())
            .header("Tags", tags_for(&event.event_type))
            .body(body_for(event));

        if self.config.use_auth {
            let token = decrypt_credential(
                self.secret.as_deref(),
                self.config.auth_token_enc.as_deref(),
            )?;
            request = match (&self.config.auth_user, token) {
                (Some(user), Some(password)) => request.basic_auth(user, Some(password)),
                (None, Some(token)) => request.bearer_auth(token),
                _ => request,
            };
        }

        let response = request.send().await.map_err(NtfyError::from).map_err(ChannelError::Ntfy)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChannelError::Ntfy(NtfyError::Upstream {
                status: status.to_string(),
                message,
            })
            .into());
        }
        Ok(ChannelResponse::success(format!("published to {url}")))
    }
}
