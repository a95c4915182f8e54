//! Runtime settings for the notifier, read from config files and the
//! `NUTIFY__*` environment.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde_derive::Deserialize;

use nutify_common::nut::NutBinaryPaths;

pub const ENV_PREFIX: &str = "nutify";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
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
    /// Ceiling for one channel dispatch, seconds.
    pub dispatch_timeout_secs: u64,
    /// Fallback IANA timezone when no initial-setup row exists.
    pub timezone: String,
    /// Process secret for credential decryption (usually set via
    /// NUTIFY__ENCRYPTION_KEY).
    pub encryption_key: Option<String>,
    /// Use human readable (simplified, non-JSON) logs.
    pub human_logs: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
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
            dispatch_timeout_secs: 30,
            timezone: "UTC".to_owned(),
            encryption_key: None,
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
        built.try_deserialize::<Settings>()
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

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs.max(1))
    }

    pub fn test_settings() -> Self {
        Self {
            db_path: ":memory:".to_owned(),
            statsd_host: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.msmtp_path, "msmtp");
        assert_eq!(settings.dispatch_timeout(), Duration::from_secs(30));
        assert_eq!(settings.timezone, "UTC");
    }

    #[test]
    fn test_dispatch_timeout_floor() {
        let settings = Settings {
            dispatch_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.dispatch_timeout(), Duration::from_secs(1));
    }
}
