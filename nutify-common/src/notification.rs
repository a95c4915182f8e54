//! The enriched-event content model shared by every notification channel.
//!
//! This is the template contract: field names are stable across email, ntfy
//! and webhook payloads.

use serde_derive::{Deserialize, Serialize};

/// A persisted UPS event enriched with a telemetry snapshot and duration
/// metrics, ready for rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichedEvent {
    /// Row id of the persisted event.
    pub event_id: i64,
    pub ups_name: String,
    /// Raw event type string (members of the closed set when recognized).
    pub event_type: String,
    /// Free-form message as received from upsmon.
    pub event_message: String,

    /// Name this installation reports itself as; required for email,
    /// defaulted to "UPS Monitor" by ntfy/webhook.
    pub server_name: Option<String>,

    // Device identity, from the static row.
    pub ups_model: Option<String>,
    pub ups_serial: Option<String>,
    pub ups_firmware: Option<String>,
    pub ups_manufacturer: Option<String>,
    pub ups_location: Option<String>,

    // Telemetry snapshot at enrichment time.
    pub ups_status: Option<String>,
    /// Formatted as `N%`.
    pub battery_charge: Option<String>,
    /// Volts.
    pub battery_voltage: Option<f64>,
    pub input_voltage: Option<f64>,
    pub output_voltage: Option<f64>,
    pub ups_load: Option<f64>,
    pub ups_realpower: Option<f64>,
    /// Estimated runtime in whole minutes.
    pub runtime_minutes: Option<i64>,

    /// Humanized length of the battery interval an ONLINE event closed.
    pub battery_duration: Option<String>,
    /// Humanized length of the outage interval a COMMOK event closed.
    pub comm_duration: Option<String>,

    /// Event date and time rendered in the configured timezone.
    pub event_date: String,
    pub event_time: String,

    pub source_ip: Option<String>,
}

impl EnrichedEvent {
    /// The server name as shown by channels that tolerate a missing setup
    /// record.
    pub fn server_name_or_default(&self) -> &str {
        self.server_name.as_deref().unwrap_or("UPS Monitor")
    }
}

/// Render a duration in seconds the way notifications show it
/// (`45 sec`, `2 min`, `1 h 05 min`).
pub fn humanize_duration(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    if total_secs < 60 {
        format!("{total_secs} sec")
    } else if total_secs < 3600 {
        format!("{} min", total_secs / 60)
    } else {
        format!("{} h {:02} min", total_secs / 3600, (total_secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humanize_duration() {
        assert_eq!(humanize_duration(45), "45 sec");
        assert_eq!(humanize_duration(120), "2 min");
        assert_eq!(humanize_duration(3900), "1 h 05 min");
        assert_eq!(humanize_duration(-5), "0 sec");
    }

    #[test]
    fn test_server_name_default() {
        let mut event = EnrichedEvent::default();
        assert_eq!(event.server_name_or_default(), "UPS Monitor");
        event.server_name = Some("rack-4".to_owned());
        assert_eq!(event.server_name_or_default(), "rack-4");
    }

    #[test]
    fn test_serializes_flat_envelope() {
        let event = EnrichedEvent {
            event_id: 7,
            ups_name: "ups@localhost".into(),
            event_type: "ONBATT".into(),
            battery_charge: Some("98%".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "ONBATT");
        assert_eq!(value["battery_charge"], "98%");
        assert_eq!(value["ups_name"], "ups@localhost");
    }
}
