//! The storage access trait.
//!
//! Database access is abstracted into a DbClient impl which contains the
//! required trait functions the application needs to perform in the
//! database; `SqliteDb` is the production implementation, and the mock
//! generated here backs unit tests of the loops and the pipeline.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::error::DbResult;
use super::models::{
    CommandLog, CommandStats, DatabaseStats, DynamicSample, InitialSetup, LoginAuth, MailConfig,
    NewEvent, NotificationSetting, NtfyConfig, ReportSchedule, StaticData, UpsEvent,
    VariableConfig, VariableLog, WebhookConfig,
};

/// Summary of what the startup schema pass did.
#[derive(Debug, Clone, Default)]
pub struct SchemaReport {
    pub created: Vec<String>,
    pub recreated: Vec<String>,
    /// Report schedules deleted by the mail-config cascade.
    pub cascaded_schedules: usize,
    /// Notification settings whose id_email was reset by the cascade.
    pub cascaded_notifications: usize,
}

#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
#[async_trait]
pub trait DbClient: Send + Sync {
    /// Create missing tables and recreate drifted ones.
    async fn ensure_schema(&self) -> DbResult<SchemaReport>;

    // Static data
    async fn get_static_data(&self) -> DbResult<Option<StaticData>>;
    /// First populate only; the row is process-lifetime immutable.
    async fn insert_static_data(&self, data: &StaticData) -> DbResult<()>;

    // Dynamic samples
    /// The only write path for samples. Rejects duplicate seconds.
    async fn append_dynamic(&self, sample: &DynamicSample) -> DbResult<i64>;
    async fn latest_sample(&self) -> DbResult<Option<DynamicSample>>;
    /// Range query over `timestamp_utc ∈ [from, to)`, ordered ascending.
    async fn samples_in_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> DbResult<Vec<DynamicSample>>;
    /// Write aggregate energy onto an existing bucket row.
    async fn set_sample_aggregates(
        &self,
        row_id: i64,
        hourly_wh: Option<f64>,
        daily_wh: Option<f64>,
    ) -> DbResult<()>;

    // Events
    async fn insert_event(&self, event: &NewEvent) -> DbResult<i64>;
    /// Close open events of the given types for a UPS; returns closed count.
    async fn close_events(
        &self,
        ups_name: &str,
        event_types: &[String],
        end: NaiveDateTime,
    ) -> DbResult<usize>;
    async fn get_event(&self, id: i64) -> DbResult<Option<UpsEvent>>;
    async fn open_event(&self, ups_name: &str, event_type: &str) -> DbResult<Option<UpsEvent>>;
    /// Most recent closed event of a type with begin >= since.
    async fn recent_closed_event(
        &self,
        ups_name: &str,
        event_type: &str,
        since: NaiveDateTime,
    ) -> DbResult<Option<UpsEvent>>;
    async fn events_in_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> DbResult<Vec<UpsEvent>>;
    async fn acknowledge_event(&self, id: i64) -> DbResult<()>;

    // Mail configs
    async fn list_mail_configs(&self) -> DbResult<Vec<MailConfig>>;
    async fn get_mail_config(&self, id: i64) -> DbResult<Option<MailConfig>>;
    async fn insert_mail_config(&self, config: &MailConfig) -> DbResult<i64>;
    async fn update_mail_config(&self, config: &MailConfig) -> DbResult<()>;
    async fn delete_mail_config(&self, id: i64) -> DbResult<()>;

    // Ntfy / webhook configs
    async fn list_ntfy_configs(&self) -> DbResult<Vec<NtfyConfig>>;
    async fn insert_ntfy_config(&self, config: &NtfyConfig) -> DbResult<i64>;
    async fn update_ntfy_config(&self, config: &NtfyConfig) -> DbResult<()>;
    async fn delete_ntfy_config(&self, id: i64) -> DbResult<()>;
    async fn list_webhook_configs(&self) -> DbResult<Vec<WebhookConfig>>;
    async fn insert_webhook_config(&self, config: &WebhookConfig) -> DbResult<i64>;
    async fn update_webhook_config(&self, config: &WebhookConfig) -> DbResult<()>;
    async fn delete_webhook_config(&self, id: i64) -> DbResult<()>;

    // Email notification matrix
    async fn list_notification_settings(&self) -> DbResult<Vec<NotificationSetting>>;
    async fn get_notification_setting(
        &self,
        event_type: &str,
    ) -> DbResult<Option<NotificationSetting>>;
    async fn upsert_notification_setting(&self, setting: &NotificationSetting) -> DbResult<()>;

    // Variable config
    async fn get_variable_config(&self) -> DbResult<VariableConfig>;
    async fn save_variable_config(&self, config: &VariableConfig) -> DbResult<()>;

    // Report schedules
    async fn list_report_schedules(&self) -> DbResult<Vec<ReportSchedule>>;
    async fn get_report_schedule(&self, id: i64) -> DbResult<Option<ReportSchedule>>;
    async fn insert_report_schedule(&self, schedule: &ReportSchedule) -> DbResult<i64>;
    async fn update_report_schedule(&self, schedule: &ReportSchedule) -> DbResult<()>;
    async fn delete_report_schedule(&self, id: i64) -> DbResult<()>;
    async fn set_schedule_last_run(&self, id: i64, last_run: NaiveDateTime) -> DbResult<()>;

    // Initial setup
    async fn get_initial_setup(&self) -> DbResult<Option<InitialSetup>>;
    async fn save_initial_setup(&self, setup: &InitialSetup) -> DbResult<()>;

    // Login auth (model only)
    async fn get_login_auth(&self) -> DbResult<Option<LoginAuth>>;
    async fn save_login_auth(&self, auth: &LoginAuth) -> DbResult<()>;

    // Command / variable audit
    async fn insert_command_log(&self, log: &CommandLog) -> DbResult<i64>;
    async fn recent_command_logs(&self, limit: u32) -> DbResult<Vec<CommandLog>>;
    async fn command_stats(&self) -> DbResult<CommandStats>;
    async fn insert_variable_log(&self, log: &VariableLog) -> DbResult<i64>;
    async fn recent_variable_logs(&self, limit: u32) -> DbResult<Vec<VariableLog>>;

    // Maintenance
    async fn database_stats(&self) -> DbResult<DatabaseStats>;
    /// ANALYZE + VACUUM.
    async fn optimize(&self) -> DbResult<()>;
    /// Copy the database file into `backup_dir`; returns the backup path.
    async fn backup_to(&self, backup_dir: &str) -> DbResult<String>;
}
