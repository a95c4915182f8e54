//! The event pipeline: close paired opens, persist, enrich, fan out.

use std::str::FromStr;
use std::sync::Arc;

use cadence::StatsdClient;
use chrono_tz::Tz;
use tokio::time::timeout;

use nutify_common::db::models::NewEvent;
use nutify_common::db::DbClient;
use nutify_common::events::{EventType, ParsedEvent};
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;
use nutify_common::notification::EnrichedEvent;
use nutify_common::secret::SecretStore;
use nutify_common::util::{parse_timezone, utc_now_secs};

use crate::channels::email::{EmailChannel, MsmtpTransport, SmtpTransport};
use crate::channels::ntfy::NtfyChannel;
use crate::channels::webhook::WebhookChannel;
use crate::channels::Channel;
use crate::enrich;
use crate::error::{ApiErrorKind, ApiResult};
use crate::settings::Settings;

/// Outcome of one channel dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    pub channel: &'static str,
    pub target: String,
    pub ok: bool,
    pub message: String,
}

/// What one processed event did.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub event_id: i64,
    pub closed: usize,
    pub results: Vec<DispatchResult>,
}

impl DispatchSummary {
    pub fn sent(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }
}

pub struct EventPipeline {
    db: Arc<dyn DbClient>,
    secret: Option<Arc<SecretStore>>,
    settings: Settings,
    metrics: Arc<StatsdClient>,
    http: reqwest::Client,
    transport: Arc<dyn SmtpTransport>,
    /// Serializes close+insert so pairings for the same UPS never race.
    write_order: tokio::sync::Mutex<()>,
}

impl EventPipeline {
    pub fn new(
        db: Arc<dyn DbClient>,
        secret: Option<Arc<SecretStore>>,
        settings: Settings,
        metrics: Arc<StatsdClient>,
    ) -> Self {
        let transport = Arc::new(MsmtpTransport::new(settings.msmtp_path.clone()));
        Self::with_transport(db, secret, settings, metrics, transport)
    }

    pub fn with_transport(
        db: Arc<dyn DbClient>,
        secret: Option<Arc<SecretStore>>,
        settings: Settings,
        metrics: Arc<StatsdClient>,
        transport: Arc<dyn SmtpTransport>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.dispatch_timeout())
            .build()
            .unwrap_or_default();
        Self {
            db,
            secret,
            settings,
            metrics,
            http,
            transport,
            write_order: tokio::sync::Mutex::new(()),
        }
    }

    /// The display timezone: initial-setup row first, settings fallback.
    async fn timezone(&self) -> Tz {
        let name = match self.db.get_initial_setup().await {
            Ok(Some(setup)) if !setup.timezone.is_empty() => setup.timezone,
            _ => self.settings.timezone.clone(),
        };
        parse_timezone(&name).unwrap_or(chrono_tz::UTC)
    }

    async fn server_name(&self) -> Option<String> {
        self.db
            .get_initial_setup()
            .await
            .ok()
            .flatten()
            .map(|setup| setup.server_name)
            .filter(|name| !name.is_empty())
    }

    /// Process one event end to end. Returns the dispatch summary; storage
    /// failures abort, channel failures do not.
    pub async fn process(
        &self,
        parsed: &ParsedEvent,
        raw_message: &str,
        source_ip: Option<String>,
    ) -> ApiResult<DispatchSummary> {
        let now = utc_now_secs();
        let known = parsed.known_type();

        let mut summary = DispatchSummary::default();
        {
            let _order = self.write_order.lock().await;
            if let Some(event_type) = known {
                let closes: Vec<String> =
                    event_type.closes().iter().map(|t| t.to_string()).collect();
                summary.closed = self
                    .db
                    .close_events(&parsed.ups_name, &closes, now)
                    .await?;
                if summary.closed > 0 {
                    debug!(
                        "Closed {} open event(s) paired with {}",
                        summary.closed, parsed.event_type
                    );
                }
            }

            summary.event_id = self
                .db
                .insert_event(&NewEvent {
                    timestamp_utc: now,
                    ups_name: parsed.ups_name.clone(),
                    event_type: parsed.event_type.clone(),
                    event_message: Some(raw_message.to_owned()),
                    source_ip: source_ip.clone(),
                })
                .await?;
        }
        self.metrics.incr_with_tags(MetricName::EventProcessed).send();

        let tz = self.timezone().await;
        let server_name = self.server_name().await;
        let enriched = enrich::enrich(
            self.db.as_ref(),
            summary.event_id,
            &parsed.ups_name,
            &parsed.event_type,
            raw_message,
            source_ip,
            now,
            tz,
            server_name,
        )
        .await?;

        self.dispatch(&enriched, &mut summary).await;
        info!(
            "Event {} ({}) processed: {} sent, {} failed",
            summary.event_id,
            parsed.event_type,
            summary.sent(),
            summary.failed()
        );
        Ok(summary)
    }

    /// Send a test notification on one channel, bypassing the per-event
    /// enablement matrices. `config_id` selects the transport row; absent,
    /// the first configured one is used.
    pub async fn send_test(
        &self,
        channel_name: &str,
        config_id: Option<i64>,
    ) -> ApiResult<DispatchSummary> {
        let now = utc_now_secs();
        let tz = self.timezone().await;
        let server_name = self.server_name().await;
        let event = enrich::enrich(
            self.db.as_ref(),
            0,
            "test",
            "TEST",
            "Test notification",
            None,
            now,
            tz,
            server_name,
        )
        .await?;

        let mut summary = DispatchSummary::default();
        match channel_name {
            "email" => {
                let config = match config_id {
                    Some(id) => self.db.get_mail_config(id).await?,
                    None => self.db.list_mail_configs().await?.into_iter().next(),
                }
                .ok_or_else(|| ApiErrorKind::General("no mail config".to_owned()))?;
                let target = format!("mail:{}", config.id);
                let channel = EmailChannel::new(
                    config,
                    self.secret.clone(),
                    Arc::clone(&self.transport),
                    self.settings.dispatch_timeout(),
                );
                self.run_test_channel(&channel, target, &event, &mut summary)
                    .await;
            }
            "ntfy" => {
                let config = self
                    .db
                    .list_ntfy_configs()
                    .await?
                    .into_iter()
                    .find(|c| config_id.map(|id| c.id == id).unwrap_or(true))
                    .ok_or_else(|| ApiErrorKind::General("no ntfy config".to_owned()))?;
                let target = format!("ntfy:{}/{}", config.server, config.topic);
                let channel = NtfyChannel::new(config, self.secret.clone(), self.http.clone());
                self.run_test_channel(&channel, target, &event, &mut summary)
                    .await;
            }
            "webhook" => {
                let config = self
                    .db
                    .list_webhook_configs()
                    .await?
                    .into_iter()
                    .find(|c| config_id.map(|id| c.id == id).unwrap_or(true))
                    .ok_or_else(|| ApiErrorKind::General("no webhook config".to_owned()))?;
                let target = format!("webhook:{}", config.name);
                let channel = WebhookChannel::new(config, self.secret.clone())
                    .map_err(|e| ApiErrorKind::General(e.to_string()))?;
                self.run_test_channel(&channel, target, &event, &mut summary)
                    .await;
            }
            other => {
                return Err(ApiErrorKind::General(format!("unknown channel {other:?}")).into())
            }
        }
        Ok(summary)
    }

    async fn run_test_channel(
        &self,
        channel: &dyn Channel,
        target: String,
        event: &EnrichedEvent,
        summary: &mut DispatchSummary,
    ) {
        let name = channel.name();
        let result = match timeout(self.settings.dispatch_timeout(), channel.send(event, true))
            .await
        {
            Ok(Ok(response)) => DispatchResult {
                channel: name,
                target,
                ok: response.ok,
                message: response.message,
            },
            Ok(Err(e)) => DispatchResult {
                channel: name,
                target,
                ok: false,
                message: e.to_string(),
            },
            Err(_) => DispatchResult {
                channel: name,
                target,
                ok: false,
                message: ApiErrorKind::DispatchTimeout(name).to_string(),
            },
        };
        summary.results.push(result);
    }

    /// Fan out to every enabled (event, config) pair. A failure in one
    /// channel never aborts the others.
    async fn dispatch(&self, event: &EnrichedEvent, summary: &mut DispatchSummary) {
        self.dispatch_email(event, summary).await;
        self.dispatch_ntfy(event, summary).await;
        self.dispatch_webhooks(event, summary).await;
    }

    async fn run_channel(
        &self,
        channel: &dyn Channel,
        target: String,
        cap: std::time::Duration,
        event: &EnrichedEvent,
        summary: &mut DispatchSummary,
    ) {
        let name = channel.name();
        let result = match timeout(cap, channel.send(event, false)).await {
            Ok(Ok(response)) => DispatchResult {
                channel: name,
                target,
                ok: response.ok,
                message: response.message,
            },
            Ok(Err(e)) => {
                warn!("{} dispatch failed: {}", name, e);
                DispatchResult {
                    channel: name,
                    target,
                    ok: false,
                    message: e.to_string(),
                }
            }
            Err(_) => {
                let e = ApiErrorKind::DispatchTimeout(name);
                warn!("{}", e);
                DispatchResult {
                    channel: name,
                    target,
                    ok: false,
                    message: e.to_string(),
                }
            }
        };
        let metric = if result.ok {
            MetricName::NotifySent
        } else {
            MetricName::NotifyError
        };
        self.metrics
            .incr_with_tags(metric)
            .with_tag("channel", name)
            .send();
        summary.results.push(result);
    }

    async fn dispatch_email(&self, event: &EnrichedEvent, summary: &mut DispatchSummary) {
        let setting = match self.db.get_notification_setting(&event.event_type).await {
            Ok(Some(setting)) if setting.enabled => setting,
            Ok(_) => return,
            Err(e) => {
                warn!("Cannot read email notification setting: {}", e);
                return;
            }
        };
        let Some(config_id) = setting.id_email else {
            debug!("Email enabled for {} but no mail config set", event.event_type);
            return;
        };
        let config = match self.db.get_mail_config(config_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("Mail config {} not found", config_id);
                return;
            }
            Err(e) => {
                warn!("Cannot read mail config {}: {}", config_id, e);
                return;
            }
        };
        let target = format!("mail:{}", config.id);
        let channel = EmailChannel::new(
            config,
            self.secret.clone(),
            Arc::clone(&self.transport),
            self.settings.dispatch_timeout(),
        );
        // Large bodies get an extended transport timeout; the outer cap
        // must not undercut it.
        let cap = self
            .settings
            .dispatch_timeout()
            .max(crate::channels::email::client::EXTENDED_TIMEOUT)
            + std::time::Duration::from_secs(5);
        self.run_channel(&channel, target, cap, event, summary).await;
    }

    async fn dispatch_ntfy(&self, event: &EnrichedEvent, summary: &mut DispatchSummary) {
        let configs = match self.db.list_ntfy_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Cannot list ntfy configs: {}", e);
                return;
            }
        };
        for config in configs {
            if !config.enabled
                || !config
                    .event_matrix
                    .get(&event.event_type)
                    .copied()
                    .unwrap_or(false)
            {
                continue;
            }
            let target = format!("ntfy:{}/{}", config.server, config.topic);
            let channel = NtfyChannel::new(config, self.secret.clone(), self.http.clone());
            self.run_channel(&channel, target, self.settings.dispatch_timeout(), event, summary)
                .await;
        }
    }

    async fn dispatch_webhooks(&self, event: &EnrichedEvent, summary: &mut DispatchSummary) {
        let configs = match self.db.list_webhook_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Cannot list webhook configs: {}", e);
                return;
            }
        };
        let mut attempted = false;
        for config in configs {
            if !config.enabled
                || !config
                    .event_matrix
                    .get(&event.event_type)
                    .copied()
                    .unwrap_or(false)
            {
                continue;
            }
            let target = format!("webhook:{}", config.name);
            match WebhookChannel::new(config, self.secret.clone()) {
                Ok(channel) => {
                    attempted = true;
                    self.run_channel(
                        &channel,
                        target,
                        self.settings.dispatch_timeout(),
                        event,
                        summary,
                    )
                    .await;
                }
                Err(e) => {
                    warn!("Cannot build webhook channel: {}", e);
                }
            }
        }
        // Communication events are always surfaced to external monitors;
        // an unconfigured deployment just notes the absence.
        if !attempted && is_comm_event(&event.event_type) {
            info!(
                "No webhook configured for communication event {}; none dispatched",
                event.event_type
            );
        }
    }
}

fn is_comm_event(event_type: &str) -> bool {
    matches!(
        EventType::from_str(event_type),
        Ok(EventType::Commbad | EventType::Commok | EventType::Nocomm)
    )
}
