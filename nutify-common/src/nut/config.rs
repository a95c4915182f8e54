//! Parser and process-wide store for the NUT configuration files.
//!
//! Reads `nut.conf`, `ups.conf`, `upsd.conf`, `upsd.users` and
//! `upsmon.conf` to recover the monitored UPS target and the credentials the
//! supervisor uses for privileged NUT calls.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::RwLock;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum NutMode {
    Standalone,
    Netserver,
    Netclient,
    #[default]
    Unknown,
}

impl NutMode {
    /// Configuration files NUT requires for this mode.
    pub fn required_files(&self) -> &'static [&'static str] {
        match self {
            Self::Standalone | Self::Netserver => &[
                "nut.conf",
                "ups.conf",
                "upsd.conf",
                "upsd.users",
                "upsmon.conf",
            ],
            Self::Netclient => &["nut.conf", "upsmon.conf"],
            Self::Unknown => &[],
        }
    }

    /// NUT services to start for this mode, in order.
    pub fn services_to_start(&self) -> &'static [&'static str] {
        match self {
            Self::Standalone | Self::Netserver => &["upsdrvctl", "upsd", "upsmon"],
            Self::Netclient => &["upsmon"],
            Self::Unknown => &[],
        }
    }
}

/// Parsed NUT deployment configuration.
#[derive(Debug, Clone, Default)]
pub struct NutConfig {
    pub mode: NutMode,
    pub ups_name: Option<String>,
    pub ups_host: Option<String>,
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub monitor_user: Option<String>,
    pub monitor_password: Option<String>,
}

impl NutConfig {
    /// `name@host` target for the NUT CLIs.
    pub fn target(&self) -> Option<String> {
        match (&self.ups_name, &self.ups_host) {
            (Some(name), Some(host)) => Some(format!("{name}@{host}")),
            (Some(name), None) => Some(format!("{name}@localhost")),
            _ => None,
        }
    }
}

lazy_static! {
    static ref USER_SECTION_RE: Regex =
        Regex::new(r"(?s)\[([^\]]+)\](.*?)(?=\[|\z)").expect("user section regex");
    static ref PASSWORD_RE: Regex =
        Regex::new(r#"password\s*=\s*"?([^"\n]*)"?"#).expect("password regex");
}

/// Thread-safe store over the parsed files.
///
/// Initialization is lazy: the first reader triggers a refresh. `refresh()`
/// re-reads every file atomically under the write lock.
pub struct NutConfigStore {
    conf_dir: PathBuf,
    state: RwLock<Option<NutConfig>>,
}

impl NutConfigStore {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            state: RwLock::new(None),
        }
    }

    /// A snapshot of the current configuration, parsing on first use.
    pub async fn get(&self) -> NutConfig {
        if let Some(config) = self.state.read().await.as_ref() {
            return config.clone();
        }
        self.refresh().await
    }

    /// Re-read all NUT files and replace the cached configuration.
    pub async fn refresh(&self) -> NutConfig {
        let config = parse_nut_files(&self.conf_dir);
        let mut guard = self.state.write().await;
        *guard = Some(config.clone());
        config
    }
}

/// Parse the full NUT file set under `conf_dir`; missing files degrade to
/// defaults rather than erroring, matching how NUT itself tolerates partial
/// configurations.
pub fn parse_nut_files(conf_dir: &Path) -> NutConfig {
    let mode = read_mode(&conf_dir.join("nut.conf"));
    let (ups_name, ups_host) = read_monitor_line(&conf_dir.join("upsmon.conf"));
    // In standalone mode upsmon.conf may be absent; fall back to the first
    // driver section of ups.conf.
    let ups_name = ups_name.or_else(|| read_first_driver_section(&conf_dir.join("ups.conf")));
    let users = read_upsd_users(&conf_dir.join("upsd.users"));

    let mut config = NutConfig {
        mode,
        ups_name,
        ups_host: ups_host.or_else(|| Some("localhost".to_owned())),
        ..Default::default()
    };
    for user in users {
        if user.is_admin && config.admin_user.is_none() {
            config.admin_user = Some(user.name.clone());
            config.admin_password = user.password.clone();
        }
        if user.is_monitor && config.monitor_user.is_none() {
            config.monitor_user = Some(user.name.clone());
            config.monitor_password = user.password.clone();
        }
    }
    // A single privileged user commonly fills both roles.
    if config.monitor_user.is_none() {
        config.monitor_user = config.admin_user.clone();
        config.monitor_password = config.admin_password.clone();
    }
    debug!(
        "Parsed NUT config: mode={} target={:?}",
        config.mode,
        config.target()
    );
    config
}

#[derive(Debug)]
struct UpsdUser {
    name: String,
    password: Option<String>,
    is_admin: bool,
    is_monitor: bool,
}

fn read_to_string(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

fn read_mode(path: &Path) -> NutMode {
    let Some(content) = read_to_string(path) else {
        return NutMode::Unknown;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("MODE=") {
            let value = value.trim().trim_matches(['"', '\'']);
            return NutMode::from_str(&value.to_lowercase()).unwrap_or(NutMode::Unknown);
        }
    }
    NutMode::Unknown
}

/// `MONITOR <ups@host> <powervalue> <user> <password> (primary|secondary)`
fn read_monitor_line(path: &Path) -> (Option<String>, Option<String>) {
    let Some(content) = read_to_string(path) else {
        return (None, None);
    };
    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with("MONITOR") || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        parts.next();
        if let Some(spec) = parts.next() {
            return match spec.split_once('@') {
                Some((name, host)) => (Some(name.to_owned()), Some(host.to_owned())),
                None => (Some(spec.to_owned()), None),
            };
        }
    }
    (None, None)
}

fn read_first_driver_section(path: &Path) -> Option<String> {
    let content = read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            return Some(line[1..line.len() - 1].to_owned());
        }
    }
    None
}

fn read_upsd_users(path: &Path) -> Vec<UpsdUser> {
    let Some(content) = read_to_string(path) else {
        return Vec::new();
    };
    let mut users = Vec::new();
    for caps in USER_SECTION_RE.captures_iter(&content) {
        let name = caps[1].trim().to_owned();
        let block = &caps[2];
        let password = PASSWORD_RE
            .captures(block)
            .map(|c| c[1].trim().to_owned())
            .filter(|p| !p.is_empty());
        let is_admin = block.contains("actions") && (block.contains("SET") || block.contains("set"))
            || block.contains("instcmds");
        let is_monitor = block
            .lines()
            .any(|l| l.trim().starts_with("upsmon") && !l.trim().starts_with('#'));
        users.push(UpsdUser {
            name,
            password,
            is_admin,
            is_monitor,
        });
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) {
        let mut f = fs::File::create(dir.path().join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn fixture_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "nut.conf", "# comment\nMODE=standalone\n");
        write_file(
            &dir,
            "ups.conf",
            "[myups]\n  driver = usbhid-ups\n  port = auto\n",
        );
        write_file(&dir, "upsd.conf", "LISTEN 127.0.0.1 3493\n");
        write_file(
            &dir,
            "upsd.users",
            "[admin]\n  password = \"adminpw\"\n  actions = SET\n  instcmds = ALL\n\n[monuser]\n  password = \"monpw\"\n  upsmon primary\n",
        );
        write_file(
            &dir,
            "upsmon.conf",
            "MONITOR myups@localhost 1 monuser monpw primary\nMINSUPPLIES 1\n",
        );
        dir
    }

    #[test]
    fn test_parse_full_file_set() {
        let dir = fixture_dir();
        let config = parse_nut_files(dir.path());
        assert_eq!(config.mode, NutMode::Standalone);
        assert_eq!(config.ups_name.as_deref(), Some("myups"));
        assert_eq!(config.ups_host.as_deref(), Some("localhost"));
        assert_eq!(config.target().as_deref(), Some("myups@localhost"));
        assert_eq!(config.admin_user.as_deref(), Some("admin"));
        assert_eq!(config.admin_password.as_deref(), Some("adminpw"));
        assert_eq!(config.monitor_user.as_deref(), Some("monuser"));
        assert_eq!(config.monitor_password.as_deref(), Some("monpw"));
    }

    #[test]
    fn test_mode_tables() {
        assert_eq!(
            NutMode::Standalone.services_to_start(),
            &["upsdrvctl", "upsd", "upsmon"]
        );
        assert_eq!(NutMode::Netclient.services_to_start(), &["upsmon"]);
        assert_eq!(NutMode::Netclient.required_files().len(), 2);
        assert!(NutMode::Unknown.required_files().is_empty());
    }

    #[test]
    fn test_missing_files_degrade() {
        let dir = TempDir::new().unwrap();
        let config = parse_nut_files(dir.path());
        assert_eq!(config.mode, NutMode::Unknown);
        assert!(config.ups_name.is_none());
        assert!(config.admin_user.is_none());
    }

    #[test]
    fn test_ups_conf_fallback_without_upsmon() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "nut.conf", "MODE=netserver\n");
        write_file(&dir, "ups.conf", "[rackups]\n driver = usbhid-ups\n");
        let config = parse_nut_files(dir.path());
        assert_eq!(config.ups_name.as_deref(), Some("rackups"));
        assert_eq!(config.target().as_deref(), Some("rackups@localhost"));
    }

    #[actix_rt::test]
    async fn test_store_lazy_refresh() {
        let dir = fixture_dir();
        let store = NutConfigStore::new(dir.path());
        assert_eq!(store.get().await.mode, NutMode::Standalone);

        write_file(&dir, "nut.conf", "MODE=netclient\n");
        // Cached until an explicit refresh.
        assert_eq!(store.get().await.mode, NutMode::Standalone);
        assert_eq!(store.refresh().await.mode, NutMode::Netclient);
        assert_eq!(store.get().await.mode, NutMode::Netclient);
    }
}
