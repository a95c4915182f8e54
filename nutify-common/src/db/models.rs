//! Row types for the persisted entities.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device identity captured from a single `upsc` snapshot at startup.
/// Immutable for the process lifetime after the first populate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticData {
    pub device_model: Option<String>,
    pub device_serial: Option<String>,
    pub device_mfr: Option<String>,
    pub device_location: Option<String>,
    pub ups_firmware: Option<String>,
    pub battery_type: Option<String>,
    pub battery_voltage_nominal: Option<f64>,
    pub input_voltage_nominal: Option<f64>,
    pub output_voltage_nominal: Option<f64>,
    pub ups_power_nominal: Option<f64>,
    pub ups_realpower_nominal: Option<f64>,
}

/// One poll tick of telemetry.
///
/// Well-known NUT variables land in typed columns; anything the device
/// reports beyond the dictionary rides in the `extra` JSON bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicSample {
    pub id: Option<i64>,
    /// Naïve UTC, truncated to whole seconds; strictly monotonic per UPS.
    pub timestamp_utc: NaiveDateTime,
    pub numeric: BTreeMap<String, f64>,
    pub text: BTreeMap<String, String>,
    pub extra: Map<String, Value>,
    /// Wh integrated over the hour this row closes; null on raw samples.
    pub ups_realpower_hrs: Option<f64>,
    /// Wh summed over the day this row closes; null on raw samples.
    pub ups_realpower_days: Option<f64>,
}

impl DynamicSample {
    pub fn numeric_value(&self, column: &str) -> Option<f64> {
        self.numeric.get(column).copied()
    }

    pub fn text_value(&self, column: &str) -> Option<&str> {
        self.text.get(column).map(String::as_str)
    }
}

/// Fill `ups_realpower` when the device does not report it (or reports 0):
/// `nominal × load / 100` to two decimals, nominal resolved from the sample,
/// then the static row, then the configured default.
pub fn derive_realpower(
    numeric: &mut BTreeMap<String, f64>,
    static_nominal: Option<f64>,
    default_nominal: f64,
) {
    let reported = numeric.get("ups_realpower").copied();
    if matches!(reported, Some(value) if value != 0.0) {
        return;
    }
    let Some(load) = numeric.get("ups_load").copied() else {
        return;
    };
    let nominal = numeric
        .get("ups_realpower_nominal")
        .copied()
        .or(static_nominal)
        .unwrap_or(default_nominal);
    let derived = (nominal * load / 100.0 * 100.0).round() / 100.0;
    numeric.insert("ups_realpower".to_owned(), derived);
}

/// A discrete UPS state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsEvent {
    pub id: i64,
    pub timestamp_utc: NaiveDateTime,
    pub timestamp_utc_begin: NaiveDateTime,
    pub timestamp_utc_end: Option<NaiveDateTime>,
    pub ups_name: String,
    pub event_type: String,
    pub event_message: Option<String>,
    pub source_ip: Option<String>,
    pub acknowledged: bool,
}

/// Fields for inserting a new event; ids and the open end are assigned by
/// the storage layer.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub timestamp_utc: NaiveDateTime,
    pub ups_name: String,
    pub event_type: String,
    pub event_message: Option<String>,
    pub source_ip: Option<String>,
}

/// SMTP transport record. `password_enc` is Fernet ciphertext.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailConfig {
    pub id: i64,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password_enc: Option<String>,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    pub provider: Option<String>,
    pub tls: Option<bool>,
    pub tls_starttls: Option<bool>,
    pub enabled: bool,
}

/// Per-event enablement matrix used by the ntfy and webhook channels.
pub type EventMatrix = BTreeMap<String, bool>;

/// Ntfy transport record; `auth_token_enc` is ciphertext.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NtfyConfig {
    pub id: i64,
    pub server: String,
    pub topic: String,
    pub use_auth: bool,
    pub auth_user: Option<String>,
    pub auth_token_enc: Option<String>,
    pub enabled: bool,
    pub event_matrix: EventMatrix,
}

/// Webhook transport record; `auth_token_enc` is ciphertext.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub auth_type: Option<String>,
    pub auth_user: Option<String>,
    pub auth_token_enc: Option<String>,
    pub verify_ssl: bool,
    pub enabled: bool,
    pub event_matrix: EventMatrix,
}

/// Email enablement per event type, with the mail config to use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSetting {
    pub id: i64,
    pub event_type: String,
    pub enabled: bool,
    pub id_email: Option<i64>,
}

/// Installation-wide tunables read by reports and the poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub currency: String,
    pub price_per_kwh: f64,
    pub co2_factor: f64,
    pub polling_interval_secs: Option<u64>,
}

impl Default for VariableConfig {
    fn default() -> Self {
        Self {
            currency: "EUR".to_owned(),
            price_per_kwh: crate::DEFAULT_PRICE_PER_KWH,
            co2_factor: 0.4,
            polling_interval_secs: None,
        }
    }
}

/// A scheduled report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSchedule {
    pub id: i64,
    /// 5-field POSIX cron expression, evaluated in the configured timezone.
    pub cron_expression: String,
    /// daily | weekly | monthly | range
    pub period_type: String,
    /// Comma list of section tags (energy, battery, power, voltage, events).
    pub sections: String,
    /// Comma list of recipient addresses; a mail config's to_email wins.
    pub recipients: String,
    pub mail_config_id: Option<i64>,
    pub last_run: Option<NaiveDateTime>,
    pub enabled: bool,
}

impl ReportSchedule {
    pub fn section_tags(&self) -> Vec<&str> {
        self.sections
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn recipient_list(&self) -> Vec<&str> {
        self.recipients
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// First-boot identity record; the source of `server_name` and the display
/// timezone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialSetup {
    pub server_name: String,
    pub timezone: String,
    pub is_configured: bool,
}

/// Login credentials for the browser UI (model only; session handling is
/// out of scope here).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginAuth {
    pub username: String,
    pub password_hash: String,
    pub totp_secret_enc: Option<String>,
    pub totp_enabled: bool,
}

/// Audit row for an executed instant command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLog {
    pub id: i64,
    pub timestamp_utc: NaiveDateTime,
    pub command: String,
    pub success: bool,
    pub output: Option<String>,
}

/// Audit row for a variable write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableLog {
    pub id: i64,
    pub timestamp_utc: NaiveDateTime,
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub success: bool,
}

/// Success/failure counters over the command audit table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CommandStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Per-table record count for the maintenance view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStats {
    pub name: String,
    pub record_count: u64,
    pub last_write: Option<NaiveDateTime>,
}

/// Database file statistics for the maintenance view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub size_bytes: u64,
    pub total_records: u64,
    pub last_write: Option<NaiveDateTime>,
    pub tables: Vec<TableStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_schedule_lists() {
        let schedule = ReportSchedule {
            sections: "energy, battery,,events ".to_owned(),
            recipients: "ops@example.com, , second@example.com".to_owned(),
            ..Default::default()
        };
        assert_eq!(schedule.section_tags(), vec!["energy", "battery", "events"]);
        assert_eq!(
            schedule.recipient_list(),
            vec!["ops@example.com", "second@example.com"]
        );
    }

    #[test]
    fn test_variable_config_defaults() {
        let config = VariableConfig::default();
        assert_eq!(config.price_per_kwh, 0.25);
        assert!(config.polling_interval_secs.is_none());
    }
}
