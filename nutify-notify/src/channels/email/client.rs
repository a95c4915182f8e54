//! The msmtp transport: a generated configuration file plus one subprocess
//! invocation per message, with the message on stdin.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::error::EmailError;

/// Bodies above this size get the extended transport timeout.
pub const LARGE_BODY_BYTES: usize = 500 * 1024;
pub const EXTENDED_TIMEOUT: Duration = Duration::from_secs(180);

/// Resolved transport fields after provider presets and port defaults.
#[derive(Debug, Clone, Default)]
pub struct SmtpOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub tls: bool,
    pub tls_starttls: bool,
}

impl SmtpOptions {
    /// Apply the TLS defaulting rule: an explicit user value wins; absent
    /// that, port 465 means implicit TLS and port 587 means STARTTLS.
    pub fn resolve_tls(port: u16, tls: Option<bool>, tls_starttls: Option<bool>) -> (bool, bool) {
        match (tls, tls_starttls) {
            (Some(t), Some(s)) => (t, s),
            (Some(t), None) => (t, t && port == 587),
            (None, Some(s)) => (s || port == 465, s),
            (None, None) => match port {
                465 => (true, false),
                587 => (true, true),
                _ => (false, false),
            },
        }
    }
}

/// Render the msmtp configuration file for one send.
pub fn render_msmtp_config(options: &SmtpOptions) -> String {
    let mut config = String::from("defaults\n");
    config.push_str(&format!(
        "auth {}\n",
        if options.username.is_some() { "on" } else { "off" }
    ));
    config.push_str(&format!("tls {}\n", on_off(options.tls)));
    config.push_str(&format!("tls_starttls {}\n", on_off(options.tls_starttls)));
    if options.tls {
        config.push_str("tls_trust_file /etc/ssl/certs/ca-certificates.crt\n");
    }
    config.push_str("logfile ~/.msmtp.log\n\n");
    config.push_str("account default\n");
    config.push_str(&format!("host {}\n", options.host));
    config.push_str(&format!("port {}\n", options.port));
    config.push_str(&format!("from {}\n", options.from));
    if let Some(user) = &options.username {
        config.push_str(&format!("user {user}\n"));
    }
    if let Some(password) = &options.password {
        config.push_str(&format!("password {password}\n"));
    }
    config
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Build the RFC-822 message. Non-ASCII subjects are MIME
/// base64-encoded-word wrapped.
pub fn build_message(from: &str, to: &[String], subject: &str, html_body: &str) -> Vec<u8> {
    let subject = if subject.is_ascii() {
        subject.to_owned()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(subject.as_bytes()))
    };
    let mut message = String::new();
    message.push_str(&format!("From: {from}\r\n"));
    message.push_str(&format!("To: {}\r\n", to.join(", ")));
    message.push_str(&format!("Subject: {subject}\r\n"));
    message.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("Content-Type: text/html; charset=utf-8\r\n");
    message.push_str("\r\n");
    message.push_str(html_body);
    message.into_bytes()
}

/// The send timeout for a message of the given size.
pub fn timeout_for(message_len: usize, base: Duration) -> Duration {
    if message_len > LARGE_BODY_BYTES {
        base.max(EXTENDED_TIMEOUT)
    } else {
        base
    }
}

#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
#[async_trait]
pub trait SmtpTransport: Send + Sync {
    async fn send(
        &self,
        options: &SmtpOptions,
        recipients: &[String],
        message: &[u8],
        send_timeout: Duration,
    ) -> Result<(), EmailError>;
}

/// Production transport invoking the configured msmtp binary.
pub struct MsmtpTransport {
    msmtp_path: String,
}

impl MsmtpTransport {
    pub fn new(msmtp_path: impl Into<String>) -> Self {
        Self {
            msmtp_path: msmtp_path.into(),
        }
    }
}

#[async_trait]
impl SmtpTransport for MsmtpTransport {
    async fn send(
        &self,
        options: &SmtpOptions,
        recipients: &[String],
        message: &[u8],
        send_timeout: Duration,
    ) -> Result<(), EmailError> {
        // Absolute paths are checked up front for a clearer error; bare
        // names are left to PATH resolution.
        if self.msmtp_path.contains('/') && !Path::new(&self.msmtp_path).exists() {
            return Err(EmailError::TransportMissing(self.msmtp_path.clone()));
        }

        let config = render_msmtp_config(options);
        let config_file = tempfile::Builder::new()
            .prefix("nutify-msmtp-")
            .suffix(".conf")
            .tempfile()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                config_file.path(),
                std::fs::Permissions::from_mode(0o600),
            )?;
        }
        std::fs::write(config_file.path(), config)?;

        let mut cmd = Command::new(&self.msmtp_path);
        cmd.arg("-C")
            .arg(config_file.path())
            .args(recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(message).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = match timeout(send_timeout, run).await {
            Ok(result) => result?,
            Err(_) => return Err(EmailError::TransportTimeout),
        };
        if !output.status.success() {
            return Err(EmailError::TransportFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(())
    }
}
