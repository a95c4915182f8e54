//! The command executor: instant commands and variable writes, with audit
//! rows and live-bus notifications.

use std::sync::Arc;
use std::time::Duration;

use cadence::StatsdClient;
use tokio::time::sleep;

use nutify_common::db::models::{CommandLog, VariableLog};
use nutify_common::db::DbClient;
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;
use nutify_common::nut::{NutClient, NutConfigStore};
use nutify_common::util::utc_now_secs;

use crate::bus::{BusEvent, BusHub};

/// UI-facing outcome envelope; the executor never throws to the caller.
#[derive(Debug, Clone, serde_derive::Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl CommandOutcome {
    fn ok(output: Option<String>) -> Self {
        Self {
            success: true,
            error: None,
            output,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            output: None,
        }
    }
}

pub struct CommandExecutor {
    db: Arc<dyn DbClient>,
    nut: Arc<NutClient>,
    nut_config: Arc<NutConfigStore>,
    bus: Arc<BusHub>,
    metrics: Arc<StatsdClient>,
}

impl CommandExecutor {
    pub fn new(
        db: Arc<dyn DbClient>,
        nut: Arc<NutClient>,
        nut_config: Arc<NutConfigStore>,
        bus: Arc<BusHub>,
        metrics: Arc<StatsdClient>,
    ) -> Self {
        Self {
            db,
            nut,
            nut_config,
            bus,
            metrics,
        }
    }

    async fn target(&self) -> String {
        self.nut_config
            .get()
            .await
            .target()
            .unwrap_or_else(|| "ups@localhost".to_owned())
    }

    async fn credentials(&self) -> (String, String) {
        let config = self.nut_config.get().await;
        (
            config.admin_user.unwrap_or_default(),
            config.admin_password.unwrap_or_default(),
        )
    }

    /// Instant commands the device supports.
    pub async fn list_commands(&self) -> CommandOutcome {
        match self.nut.list_commands(&self.target().await).await {
            Ok(commands) => {
                let listing = commands
                    .iter()
                    .map(|(name, description)| format!("{name} - {description}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                CommandOutcome::ok(Some(listing))
            }
            Err(e) => CommandOutcome::err(e.to_string()),
        }
    }

    /// Execute one instant command; the stored log row carries a
    /// human-readable "what changed" block read one second later.
    pub async fn execute(&self, command: &str) -> CommandOutcome {
        let target = self.target().await;
        let (user, password) = self.credentials().await;
        let result = self
            .nut
            .instant_command(&target, command, &user, &password)
            .await;

        let (success, mut output) = match result {
            Ok(outcome) if outcome.ok => (true, outcome.stdout),
            Ok(outcome) => (false, outcome.stderr),
            Err(e) => (false, e.to_string()),
        };

        if success {
            sleep(Duration::from_secs(1)).await;
            if let Ok(vars) = self.nut.query(&target).await {
                let mut changed = vec![format!("Command {command} accepted.")];
                if let Some(status) = vars.get("ups.status") {
                    changed.push(format!("UPS status now: {status}"));
                }
                if let Some(beeper) = vars.get("ups.beeper.status") {
                    changed.push(format!("Beeper: {beeper}"));
                }
                if let Some(test) = vars.get("ups.test.result") {
                    changed.push(format!("Last test result: {test}"));
                }
                output = changed.join("\n");
            }
        }

        let log = CommandLog {
            id: 0,
            timestamp_utc: utc_now_secs(),
            command: command.to_owned(),
            success,
            output: Some(output.clone()).filter(|o| !o.is_empty()),
        };
        if let Err(e) = self.db.insert_command_log(&log).await {
            warn!("cannot store command log: {}", e);
        }
        self.metrics
            .incr_with_tags(MetricName::CommandExecuted)
            .with_tag("success", if success { "true" } else { "false" })
            .send();

        self.bus.publish(BusEvent::CommandExecuted {
            command: command.to_owned(),
            success,
            output: log.output.clone(),
        });
        self.publish_command_feeds().await;

        if success {
            CommandOutcome::ok(log.output)
        } else {
            CommandOutcome::err(output)
        }
    }

    /// Writable variables with their current values.
    pub async fn list_variables(&self) -> CommandOutcome {
        match self.nut.list_variables(&self.target().await).await {
            Ok(variables) => {
                let listing = variables
                    .iter()
                    .map(|v| {
                        format!(
                            "{} = {} ({})",
                            v.name,
                            v.value.as_deref().unwrap_or("?"),
                            v.description
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                CommandOutcome::ok(Some(listing))
            }
            Err(e) => CommandOutcome::err(e.to_string()),
        }
    }

    /// Write a variable; the audit row records old and new values.
    pub async fn set_variable(&self, name: &str, value: &str) -> CommandOutcome {
        let target = self.target().await;
        let (user, password) = self.credentials().await;

        let old_value = self
            .nut
            .query(&target)
            .await
            .ok()
            .and_then(|vars| vars.get(name).cloned());

        let result = self
            .nut
            .set_variable(&target, name, value, &user, &password)
            .await;
        let (success, message) = match result {
            Ok(outcome) => (outcome.ok, outcome.message),
            Err(e) => (false, e.to_string()),
        };

        let log = VariableLog {
            id: 0,
            timestamp_utc: utc_now_secs(),
            name: name.to_owned(),
            old_value: old_value.clone(),
            new_value: value.to_owned(),
            success,
        };
        if let Err(e) = self.db.insert_variable_log(&log).await {
            warn!("cannot store variable log: {}", e);
        }
        self.metrics
            .incr_with_tags(MetricName::CommandVariableSet)
            .with_tag("success", if success { "true" } else { "false" })
            .send();

        self.bus.publish(BusEvent::VariableUpdate {
            name: name.to_owned(),
            old_value,
            new_value: value.to_owned(),
            success,
        });
        self.publish_command_feeds().await;

        if success {
            CommandOutcome::ok(Some(message))
        } else {
            CommandOutcome::err(message)
        }
    }

    /// Push refreshed stats and recent logs after any execution.
    async fn publish_command_feeds(&self) {
        if let Ok(stats) = self.db.command_stats().await {
            self.bus.publish(BusEvent::CommandStatsUpdate { stats });
        }
        if let Ok(logs) = self.db.recent_command_logs(20).await {
            self.bus.publish(BusEvent::CommandLogsUpdate { logs });
        }
    }
}
