//! Declared table shapes and the schema-drift comparison.
//!
//! Every table the application owns is declared here as a [TableSpec]; the
//! drift detector compares these declarations with the live database at
//! startup and recreates any optional table that no longer matches.
//! `ups_static_data` and `ups_dynamic_data` are protected: the storage
//! engine manages their shape directly and never drops them.

use std::collections::HashMap;

/// SQLite storage classes used in declarations and drift comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn col(name: &'static str, column_type: ColumnType) -> ColumnSpec {
    ColumnSpec { name, column_type }
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    /// Protected tables are never dropped by the drift detector.
    pub protected: bool,
    /// Extra DDL fragments (constraints) appended to CREATE TABLE.
    pub constraints: &'static [&'static str],
}

impl TableSpec {
    /// Full CREATE TABLE statement, with the synthetic id key first.
    pub fn create_sql(&self) -> String {
        let mut parts = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_owned()];
        parts.extend(
            self.columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.column_type.sql())),
        );
        parts.extend(self.constraints.iter().map(|s| s.to_string()));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            parts.join(", ")
        )
    }

    /// Compare a live column listing (name -> declared type) to this spec.
    ///
    /// The synthetic `id` column is implied; anything else missing, extra,
    /// or of a different type counts as drift.
    pub fn drifted(&self, live: &HashMap<String, String>) -> bool {
        let mut expected: HashMap<&str, &str> = self
            .columns
            .iter()
            .map(|c| (c.name, c.column_type.sql()))
            .collect();
        expected.insert("id", "INTEGER");

        if live.len() != expected.len() {
            return true;
        }
        for (name, live_type) in live {
            match expected.get(name.as_str()) {
                Some(&expected_type)
                    if live_type.eq_ignore_ascii_case(expected_type) => {}
                _ => return true,
            }
        }
        false
    }
}

pub const TABLE_STATIC: &str = "ups_static_data";
pub const TABLE_DYNAMIC: &str = "ups_dynamic_data";
pub const TABLE_EVENTS: &str = "ups_events";
pub const TABLE_MAIL_CONFIG: &str = "ups_opt_mail_config";
pub const TABLE_NTFY: &str = "ups_opt_ntfy";
pub const TABLE_WEBHOOK: &str = "ups_opt_webhook";
pub const TABLE_NOTIFICATION: &str = "ups_opt_notification";
pub const TABLE_VARIABLE_CONFIG: &str = "ups_opt_variable_config";
pub const TABLE_COMMANDS: &str = "ups_commands";
pub const TABLE_VARIABLES: &str = "ups_variables";
pub const TABLE_REPORT_SCHEDULES: &str = "ups_report_schedules";
pub const TABLE_INITIAL_SETUP: &str = "ups_initial_setup";
pub const TABLE_LOGIN_AUTH: &str = "ups_login_auth";

/// Static identity columns, mirroring [crate::db::models::StaticData].
pub static STATIC_COLUMNS: &[ColumnSpec] = &[
    col("device_model", ColumnType::Text),
    col("device_serial", ColumnType::Text),
    col("device_mfr", ColumnType::Text),
    col("device_location", ColumnType::Text),
    col("ups_firmware", ColumnType::Text),
    col("battery_type", ColumnType::Text),
    col("battery_voltage_nominal", ColumnType::Real),
    col("input_voltage_nominal", ColumnType::Real),
    col("output_voltage_nominal", ColumnType::Real),
    col("ups_power_nominal", ColumnType::Real),
    col("ups_realpower_nominal", ColumnType::Real),
];

/// The documented NUT variable dictionary, normalized (`.` -> `_`), for the
/// typed dynamic columns. Values NUT reports that are not listed here ride
/// in the `extra` JSON bag instead of mutating the table.
pub static DYNAMIC_NUMERIC_COLUMNS: &[&str] = &[
    "battery_charge",
    "battery_charge_low",
    "battery_charge_warning",
    "battery_current",
    "battery_runtime",
    "battery_runtime_low",
    "battery_temperature",
    "battery_voltage",
    "battery_voltage_nominal",
    "input_current",
    "input_frequency",
    "input_frequency_nominal",
    "input_transfer_high",
    "input_transfer_low",
    "input_voltage",
    "input_voltage_maximum",
    "input_voltage_minimum",
    "input_voltage_nominal",
    "output_current",
    "output_frequency",
    "output_frequency_nominal",
    "output_voltage",
    "output_voltage_nominal",
    "ups_delay_shutdown",
    "ups_delay_start",
    "ups_load",
    "ups_power",
    "ups_power_nominal",
    "ups_realpower",
    "ups_realpower_nominal",
    "ups_temperature",
    "ups_timer_reboot",
    "ups_timer_shutdown",
    "ups_timer_start",
];

pub static DYNAMIC_TEXT_COLUMNS: &[&str] = &[
    "battery_date",
    "battery_mfr_date",
    "input_sensitivity",
    "input_transfer_reason",
    "ups_alarm",
    "ups_beeper_status",
    "ups_status",
    "ups_test_interval",
    "ups_test_result",
];

/// Aggregate columns filled by the aggregation pass; null on raw samples.
pub static DYNAMIC_AGGREGATE_COLUMNS: &[&str] = &["ups_realpower_hrs", "ups_realpower_days"];

/// CREATE TABLE for the dynamic table; built by hand because of the large
/// generated column set and the per-second uniqueness constraint.
pub fn dynamic_create_sql() -> String {
    let mut parts = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_owned(),
        "timestamp_utc TIMESTAMP NOT NULL UNIQUE".to_owned(),
    ];
    parts.extend(
        DYNAMIC_NUMERIC_COLUMNS
            .iter()
            .chain(DYNAMIC_AGGREGATE_COLUMNS)
            .map(|c| format!("{c} REAL")),
    );
    parts.extend(DYNAMIC_TEXT_COLUMNS.iter().map(|c| format!("{c} TEXT")));
    parts.push("extra TEXT".to_owned());
    format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_DYNAMIC} ({})",
        parts.join(", ")
    )
}

pub static EVENT_COLUMNS: &[ColumnSpec] = &[
    col("timestamp_utc", ColumnType::Timestamp),
    col("timestamp_utc_begin", ColumnType::Timestamp),
    col("timestamp_utc_end", ColumnType::Timestamp),
    col("ups_name", ColumnType::Text),
    col("event_type", ColumnType::Text),
    col("event_message", ColumnType::Text),
    col("source_ip", ColumnType::Text),
    col("acknowledged", ColumnType::Integer),
];

pub static MAIL_CONFIG_COLUMNS: &[ColumnSpec] = &[
    col("smtp_server", ColumnType::Text),
    col("smtp_port", ColumnType::Integer),
    col("username", ColumnType::Text),
    col("password_enc", ColumnType::Text),
    col("from_name", ColumnType::Text),
    col("from_email", ColumnType::Text),
    col("to_email", ColumnType::Text),
    col("provider", ColumnType::Text),
    col("tls", ColumnType::Integer),
    col("tls_starttls", ColumnType::Integer),
    col("enabled", ColumnType::Integer),
];

pub static NTFY_COLUMNS: &[ColumnSpec] = &[
    col("server", ColumnType::Text),
    col("topic", ColumnType::Text),
    col("use_auth", ColumnType::Integer),
    col("auth_user", ColumnType::Text),
    col("auth_token_enc", ColumnType::Text),
    col("enabled", ColumnType::Integer),
    col("event_matrix", ColumnType::Text),
];

pub static WEBHOOK_COLUMNS: &[ColumnSpec] = &[
    col("name", ColumnType::Text),
    col("url", ColumnType::Text),
    col("auth_type", ColumnType::Text),
    col("auth_user", ColumnType::Text),
    col("auth_token_enc", ColumnType::Text),
    col("verify_ssl", ColumnType::Integer),
    col("enabled", ColumnType::Integer),
    col("event_matrix", ColumnType::Text),
];

pub static NOTIFICATION_COLUMNS: &[ColumnSpec] = &[
    col("event_type", ColumnType::Text),
    col("enabled", ColumnType::Integer),
    col("id_email", ColumnType::Integer),
];

pub static VARIABLE_CONFIG_COLUMNS: &[ColumnSpec] = &[
    col("currency", ColumnType::Text),
    col("price_per_kwh", ColumnType::Real),
    col("co2_factor", ColumnType::Real),
    col("polling_interval_secs", ColumnType::Integer),
];

pub static COMMANDS_COLUMNS: &[ColumnSpec] = &[
    col("timestamp_utc", ColumnType::Timestamp),
    col("command", ColumnType::Text),
    col("success", ColumnType::Integer),
    col("output", ColumnType::Text),
];

pub static VARIABLES_COLUMNS: &[ColumnSpec] = &[
    col("timestamp_utc", ColumnType::Timestamp),
    col("name", ColumnType::Text),
    col("old_value", ColumnType::Text),
    col("new_value", ColumnType::Text),
    col("success", ColumnType::Integer),
];

pub static REPORT_SCHEDULE_COLUMNS: &[ColumnSpec] = &[
    col("cron_expression", ColumnType::Text),
    col("period_type", ColumnType::Text),
    col("sections", ColumnType::Text),
    col("recipients", ColumnType::Text),
    col("mail_config_id", ColumnType::Integer),
    col("last_run", ColumnType::Timestamp),
    col("enabled", ColumnType::Integer),
];

pub static INITIAL_SETUP_COLUMNS: &[ColumnSpec] = &[
    col("server_name", ColumnType::Text),
    col("timezone", ColumnType::Text),
    col("is_configured", ColumnType::Integer),
];

pub static LOGIN_AUTH_COLUMNS: &[ColumnSpec] = &[
    col("username", ColumnType::Text),
    col("password_hash", ColumnType::Text),
    col("totp_secret_enc", ColumnType::Text),
    col("totp_enabled", ColumnType::Integer),
];

/// Every declared optional table, in creation order.
pub fn optional_tables() -> Vec<TableSpec> {
    vec![
        TableSpec {
            name: TABLE_EVENTS,
            columns: EVENT_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_MAIL_CONFIG,
            columns: MAIL_CONFIG_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_NTFY,
            columns: NTFY_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_WEBHOOK,
            columns: WEBHOOK_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_NOTIFICATION,
            columns: NOTIFICATION_COLUMNS,
            protected: false,
            constraints: &["UNIQUE (event_type)"],
        },
        TableSpec {
            name: TABLE_VARIABLE_CONFIG,
            columns: VARIABLE_CONFIG_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_COMMANDS,
            columns: COMMANDS_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_VARIABLES,
            columns: VARIABLES_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_REPORT_SCHEDULES,
            columns: REPORT_SCHEDULE_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_INITIAL_SETUP,
            columns: INITIAL_SETUP_COLUMNS,
            protected: false,
            constraints: &[],
        },
        TableSpec {
            name: TABLE_LOGIN_AUTH,
            columns: LOGIN_AUTH_COLUMNS,
            protected: false,
            constraints: &[],
        },
    ]
}

/// The protected static table spec.
pub fn static_table() -> TableSpec {
    TableSpec {
        name: TABLE_STATIC,
        columns: STATIC_COLUMNS,
        protected: true,
        constraints: &[],
    }
}

/// True when the normalized key is a typed numeric dynamic column.
pub fn is_dynamic_numeric(column: &str) -> bool {
    DYNAMIC_NUMERIC_COLUMNS.binary_search(&column).is_ok()
}

/// True when the normalized key is a typed text dynamic column.
pub fn is_dynamic_text(column: &str) -> bool {
    DYNAMIC_TEXT_COLUMNS.binary_search(&column).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionaries_are_sorted_for_binary_search() {
        let mut numeric = DYNAMIC_NUMERIC_COLUMNS.to_vec();
        numeric.sort_unstable();
        assert_eq!(numeric, DYNAMIC_NUMERIC_COLUMNS);

        let mut text = DYNAMIC_TEXT_COLUMNS.to_vec();
        text.sort_unstable();
        assert_eq!(text, DYNAMIC_TEXT_COLUMNS);
    }

    #[test]
    fn test_dictionary_lookup() {
        assert!(is_dynamic_numeric("battery_charge"));
        assert!(is_dynamic_numeric("ups_realpower"));
        assert!(!is_dynamic_numeric("ups_status"));
        assert!(is_dynamic_text("ups_status"));
        assert!(!is_dynamic_text("vendor_specific_thing"));
    }

    #[test]
    fn test_create_sql_shape() {
        let spec = static_table();
        let sql = spec.create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS ups_static_data"));
        assert!(sql.contains("device_model TEXT"));
        assert!(sql.contains("ups_realpower_nominal REAL"));

        let dynamic = dynamic_create_sql();
        assert!(dynamic.contains("timestamp_utc TIMESTAMP NOT NULL UNIQUE"));
        assert!(dynamic.contains("ups_realpower_hrs REAL"));
        assert!(dynamic.contains("extra TEXT"));
    }

    #[test]
    fn test_drift_comparison() {
        let spec = TableSpec {
            name: TABLE_NOTIFICATION,
            columns: NOTIFICATION_COLUMNS,
            protected: false,
            constraints: &[],
        };

        let mut live: HashMap<String, String> = HashMap::new();
        live.insert("id".into(), "INTEGER".into());
        live.insert("event_type".into(), "TEXT".into());
        live.insert("enabled".into(), "INTEGER".into());
        live.insert("id_email".into(), "INTEGER".into());
        assert!(!spec.drifted(&live));

        // Missing column
        live.remove("id_email");
        assert!(spec.drifted(&live));

        // Extra column
        live.insert("id_email".into(), "INTEGER".into());
        live.insert("stray".into(), "TEXT".into());
        assert!(spec.drifted(&live));

        // Type change
        live.remove("stray");
        live.insert("enabled".into(), "TEXT".into());
        assert!(spec.drifted(&live));
    }
}
