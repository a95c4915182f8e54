//! The application settings, read from CLI, environment or settings file,
//! for the supervisor daemon.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde_derive::Deserialize;

use nutify_common::nut::{NutBinaryPaths, DEFAULT_USB_ERROR_MARKERS};

pub const ENV_PREFIX: &str = "nutify";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The application host/port to listen on
    pub host: String,
    pub port: u16,
    /// Path of the SQLite database file.
    pub db_path: String,
    /// Directory holding the NUT configuration files.
    pub nut_conf_dir: String,
    /// NUT binary locations; plain names resolve through PATH.
    pub upsc_path: String,
    pub upscmd_path: String,
    pub upsrw_path: String,
    pub upsdrvctl_path: String,
    pub upsd_path: String,
    pub upsmon_path: String,
    pub nut_scanner_path: String,
    pub lsusb_path: String,
    /// External SMTP client used for email delivery.
    pub msmtp_path: String,

    /// Seconds between poll ticks; changes take effect on the next tick.
    pub poll_interval_secs: u64,
    /// Seconds between aggregation sweeps.
    pub aggregation_check_secs: u64,

    // Connection monitor tunables.
    pub monitor_connected_secs: u64,
    pub monitor_initial_retry_secs: u64,
    pub monitor_extended_retry_secs: u64,
    pub monitor_usb_scan_secs: u64,
    pub monitor_initial_retries: u32,
    pub monitor_restart_wait_secs: u64,
    /// stderr substrings classified as a lost USB link.
    pub usb_error_markers: Vec<String>,
    /// Best-effort status files consumed by the UI.
    pub usb_status_file: String,
    pub container_restart_file: String,

    /// Consecutive sample-write failures before storage is flagged
    /// unhealthy on the bus.
    pub storage_unhealthy_threshold: u32,
    /// Bounded per-hub broadcast buffer; laggards are dropped forward.
    pub bus_capacity: usize,

    /// Ceiling for one notification dispatch, seconds.
    pub dispatch_timeout_secs: u64,
    /// Fallback IANA timezone when no initial-setup row exists.
    pub timezone: String,
    /// Process secret for credential encryption (usually set via
    /// NUTIFY__ENCRYPTION_KEY).
    pub encryption_key: Option<String>,
    /// Default nominal power when the device reports none, W.
    pub default_nominal_power: f64,
    /// Graceful-shutdown drain budget, seconds.
    pub shutdown_grace_secs: u64,

    /// Use human readable (simplified, non-JSON) logs.
    pub human_logs: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 5050,
            db_path: "/opt/nutify/nutify.db".to_owned(),
            nut_conf_dir: "/etc/nut".to_owned(),
            upsc_path: "upsc".to_owned(),
            upscmd_path: "upscmd".to_owned(),
            upsrw_path: "upsrw".to_owned(),
            upsdrvctl_path: "upsdrvctl".to_owned(),
            upsd_path: "upsd".to_owned(),
            upsmon_path: "upsmon".to_owned(),
            nut_scanner_path: "nut-scanner".to_owned(),
            lsusb_path: "lsusb".to_owned(),
            msmtp_path: "msmtp".to_owned(),
            poll_interval_secs: 1,
            aggregation_check_secs: 60,
            monitor_connected_secs: 30,
            monitor_initial_retry_secs: 5,
            monitor_extended_retry_secs: 60,
            monitor_usb_scan_secs: 10,
            monitor_initial_retries: 5,
            monitor_restart_wait_secs: 3,
            usb_error_markers: DEFAULT_USB_ERROR_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            usb_status_file: "/tmp/ups_usb_status.json".to_owned(),
            container_restart_file: "/tmp/container_restart_needed.json".to_owned(),
            storage_unhealthy_threshold: 10,
            bus_capacity: 256,
            dispatch_timeout_secs: 30,
            timezone: "UTC".to_owned(),
            encryption_key: None,
            default_nominal_power: nutify_common::DEFAULT_NOMINAL_POWER_W,
            shutdown_grace_secs: 5,
            human_logs: false,
            statsd_host: None,
            statsd_port: 8125,
            statsd_label: "nutify".to_owned(),
        }
    }
}

impl Settings {
    /// Load the settings from the config files in order first then the
    /// environment.
    pub fn with_env_and_config_files(filenames: &[String]) -> Result<Self, ConfigError> {
        let mut s = Config::builder();
        for filename in filenames {
            s = s.add_source(File::with_name(filename));
        }
        s = s.add_source(Environment::with_prefix(&ENV_PREFIX.to_uppercase()).separator("__"));
        let built = s.build()?;
        let settings = built.try_deserialize::<Settings>()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = |value: u64, name: &str| {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "Invalid {}_{}: cannot be 0",
                    ENV_PREFIX, name
                )));
            }
            Ok(())
        };
        non_zero(self.poll_interval_secs, "POLL_INTERVAL_SECS")?;
        non_zero(self.monitor_connected_secs, "MONITOR_CONNECTED_SECS")?;
        non_zero(self.monitor_usb_scan_secs, "MONITOR_USB_SCAN_SECS")?;
        non_zero(self.monitor_initial_retries as u64, "MONITOR_INITIAL_RETRIES")?;
        if self.bus_capacity == 0 {
            return Err(ConfigError::Message(format!(
                "Invalid {ENV_PREFIX}_BUS_CAPACITY: cannot be 0"
            )));
        }
        Ok(())
    }

    pub fn nut_binary_paths(&self) -> NutBinaryPaths {
        NutBinaryPaths {
            upsc: self.upsc_path.clone(),
            upscmd: self.upscmd_path.clone(),
            upsrw: self.upsrw_path.clone(),
            upsdrvctl: self.upsdrvctl_path.clone(),
            upsd: self.upsd_path.clone(),
            upsmon: self.upsmon_path.clone(),
            nut_scanner: self.nut_scanner_path.clone(),
            lsusb: self.lsusb_path.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs.max(1))
    }

    /// Settings handed to the notifier library for synthetic events.
    pub fn notify_settings(&self) -> nutify_notify::Settings {
        nutify_notify::Settings {
            db_path: self.db_path.clone(),
            nut_conf_dir: self.nut_conf_dir.clone(),
            upsc_path: self.upsc_path.clone(),
            upscmd_path: self.upscmd_path.clone(),
            upsrw_path: self.upsrw_path.clone(),
            upsdrvctl_path: self.upsdrvctl_path.clone(),
            upsd_path: self.upsd_path.clone(),
            upsmon_path: self.upsmon_path.clone(),
            nut_scanner_path: self.nut_scanner_path.clone(),
            lsusb_path: self.lsusb_path.clone(),
            msmtp_path: self.msmtp_path.clone(),
            dispatch_timeout_secs: self.dispatch_timeout_secs,
            timezone: self.timezone.clone(),
            encryption_key: self.encryption_key.clone(),
            human_logs: self.human_logs,
            statsd_host: self.statsd_host.clone(),
            statsd_port: self.statsd_port,
            statsd_label: self.statsd_label.clone(),
        }
    }

    pub fn test_settings() -> Self {
        Self {
            db_path: ":memory:".to_owned(),
            statsd_host: None,
            ..Default::default()
        }
    }
}
