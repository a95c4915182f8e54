//! Subprocess client for the NUT CLIs (`upsc`, `upscmd`, `upsrw`,
//! `nut-scanner`, `lsusb`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

use crate::errors::{NutifyErrorKind, Result};

/// Hard ceiling for a single NUT binary invocation.
pub const NUT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// stderr substrings that mark a lost USB link rather than a generic
/// transport failure. Exact-substring, case-sensitive.
pub const DEFAULT_USB_ERROR_MARKERS: &[&str] = &[
    "No such file or directory",
    "Connection failure",
    "Data stale",
    "Driver not connected",
    "USB communication driver failed",
    "Communication with UPS lost",
];

/// Where the NUT binaries live. Plain names resolve through `PATH`.
#[derive(Debug, Clone)]
pub struct NutBinaryPaths {
    pub upsc: String,
    pub upscmd: String,
    pub upsrw: String,
    pub upsdrvctl: String,
    pub upsd: String,
    pub upsmon: String,
    pub nut_scanner: String,
    pub lsusb: String,
}

impl Default for NutBinaryPaths {
    fn default() -> Self {
        Self {
            upsc: "upsc".to_owned(),
            upscmd: "upscmd".to_owned(),
            upsrw: "upsrw".to_owned(),
            upsdrvctl: "upsdrvctl".to_owned(),
            upsd: "upsd".to_owned(),
            upsmon: "upsmon".to_owned(),
            nut_scanner: "nut-scanner".to_owned(),
            lsusb: "lsusb".to_owned(),
        }
    }
}

/// Captured output of one subprocess run.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for subprocess execution so the client is testable without NUT.
#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput>;
}

/// The production runner: tokio subprocess with a per-call timeout.
#[derive(Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        call_timeout: Duration,
    ) -> Result<ProcessOutput> {
        let fut = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = match timeout(call_timeout, fut).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NutifyErrorKind::NutTimeout(format!(
                    "{program} {}",
                    args.join(" ")
                ))
                .into())
            }
        };
        Ok(ProcessOutput {
            exit_ok: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How a failed NUT call should be treated by the connection monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UsbLost,
    Transport,
}

/// Result of an instant command.
#[derive(Debug, Clone)]
pub struct CmdOutcome {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Result of a variable write.
#[derive(Debug, Clone)]
pub struct SetVariableOutcome {
    pub ok: bool,
    /// False when the UPS had not reflected the value by the last
    /// verification read ("accepted, verify pending").
    pub verified: bool,
    pub message: String,
}

/// High-level client over the NUT CLIs.
pub struct NutClient {
    runner: Arc<dyn CommandRunner>,
    paths: NutBinaryPaths,
    call_timeout: Duration,
    usb_error_markers: Vec<String>,
}

impl NutClient {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: NutBinaryPaths) -> Self {
        Self {
            runner,
            paths,
            call_timeout: NUT_CALL_TIMEOUT,
            usb_error_markers: DEFAULT_USB_ERROR_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_usb_error_markers(mut self, markers: Vec<String>) -> Self {
        if !markers.is_empty() {
            self.usb_error_markers = markers;
        }
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout.min(NUT_CALL_TIMEOUT);
        self
    }

    /// Fetch every variable the device exposes via `upsc <target>`.
    ///
    /// An empty result is an error: a UPS always reports at least
    /// `ups.status`.
    pub async fn query(&self, target: &str) -> Result<HashMap<String, String>> {
        let output = self
            .runner
            .run(&self.paths.upsc, &[target.to_owned()], self.call_timeout)
            .await?;
        if !output.exit_ok {
            return Err(self.failure_from_stderr(&output.stderr));
        }
        let vars = parse_ups_variables(&output.stdout);
        if vars.is_empty() {
            return Err(NutifyErrorKind::NutCommand(format!(
                "upsc {target} returned no variables"
            ))
            .into());
        }
        Ok(vars)
    }

    /// Execute an instant command via `upscmd`.
    ///
    /// NUT answers a successful set/cmd with `OK` on stderr, so success is
    /// exit 0 **or** stderr == "OK".
    pub async fn instant_command(
        &self,
        target: &str,
        command: &str,
        user: &str,
        password: &str,
    ) -> Result<CmdOutcome> {
        let args = vec![
            "-u".to_owned(),
            user.to_owned(),
            "-p".to_owned(),
            password.to_owned(),
            target.to_owned(),
            command.to_owned(),
        ];
        let output = self
            .runner
            .run(&self.paths.upscmd, &args, self.call_timeout)
            .await?;
        let ok = output.exit_ok || output.stderr.trim() == "OK";
        Ok(CmdOutcome {
            ok,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Write a variable via `upsrw -s`, then verify with up to three reads
    /// spaced at least a second apart.
    pub async fn set_variable(
        &self,
        target: &str,
        name: &str,
        value: &str,
        user: &str,
        password: &str,
    ) -> Result<SetVariableOutcome> {
        let args = vec![
            "-s".to_owned(),
            format!("{name}={value}"),
            "-u".to_owned(),
            user.to_owned(),
            "-p".to_owned(),
            password.to_owned(),
            target.to_owned(),
        ];
        let output = self
            .runner
            .run(&self.paths.upsrw, &args, self.call_timeout)
            .await?;
        let ok = output.exit_ok || output.stderr.trim() == "OK";
        if !ok {
            return Ok(SetVariableOutcome {
                ok: false,
                verified: false,
                message: format!("upsrw failed: {}", output.stderr.trim()),
            });
        }

        for attempt in 0..3 {
            sleep(Duration::from_secs(1)).await;
            match self.query(target).await {
                Ok(vars) if vars.get(name).map(String::as_str) == Some(value) => {
                    return Ok(SetVariableOutcome {
                        ok: true,
                        verified: true,
                        message: format!("{name} set to {value}"),
                    });
                }
                Ok(_) => {
                    trace!("setvar verify read {} did not reflect {}", attempt + 1, name);
                }
                Err(e) => {
                    debug!("setvar verify read failed: {}", e);
                }
            }
        }
        Ok(SetVariableOutcome {
            ok: true,
            verified: false,
            message: format!("{name} accepted, verify pending"),
        })
    }

    /// List instant commands the device supports (`upscmd -l`).
    pub async fn list_commands(&self, target: &str) -> Result<Vec<(String, String)>> {
        let output = self
            .runner
            .run(
                &self.paths.upscmd,
                &["-l".to_owned(), target.to_owned()],
                self.call_timeout,
            )
            .await?;
        if !output.exit_ok {
            return Err(self.failure_from_stderr(&output.stderr));
        }
        Ok(parse_command_list(&output.stdout))
    }

    /// List writable variables and their current values (`upsrw <target>`).
    pub async fn list_variables(&self, target: &str) -> Result<Vec<WritableVariable>> {
        let output = self
            .runner
            .run(&self.paths.upsrw, &[target.to_owned()], self.call_timeout)
            .await?;
        if !output.exit_ok {
            return Err(self.failure_from_stderr(&output.stderr));
        }
        Ok(parse_writable_variables(&output.stdout))
    }

    /// Raw `lsusb` output for the monitor's device-present probe.
    pub async fn lsusb(&self) -> Result<String> {
        let output = self
            .runner
            .run(&self.paths.lsusb, &[], self.call_timeout)
            .await?;
        Ok(output.stdout)
    }

    /// Raw `nut-scanner --usb_scan` output.
    pub async fn nut_scanner_usb(&self) -> Result<String> {
        let output = self
            .runner
            .run(
                &self.paths.nut_scanner,
                &["--usb_scan".to_owned()],
                self.call_timeout,
            )
            .await?;
        Ok(output.stdout)
    }

    /// Classify a failed call by its stderr.
    pub fn classify_failure(&self, stderr: &str) -> FailureKind {
        if self
            .usb_error_markers
            .iter()
            .any(|marker| stderr.contains(marker.as_str()))
        {
            FailureKind::UsbLost
        } else {
            FailureKind::Transport
        }
    }

    fn failure_from_stderr(&self, stderr: &str) -> crate::errors::NutifyError {
        let stderr = stderr.trim().to_owned();
        match self.classify_failure(&stderr) {
            FailureKind::UsbLost => NutifyErrorKind::UsbLost(stderr).into(),
            FailureKind::Transport => NutifyErrorKind::NutCommand(stderr).into(),
        }
    }
}

/// Parse `key: value` lines as emitted by `upsc`.
pub fn parse_ups_variables(stdout: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                vars.insert(key.to_owned(), value.trim().to_owned());
            }
        }
    }
    vars
}

/// One writable variable as reported by `upsrw`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritableVariable {
    pub name: String,
    pub description: String,
    pub value: Option<String>,
}

/// Parse `upsrw <target>` output: `[name]` blocks followed by a free-text
/// description and `Key: value` attribute lines.
pub fn parse_writable_variables(stdout: &str) -> Vec<WritableVariable> {
    let mut variables: Vec<WritableVariable> = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            variables.push(WritableVariable {
                name: line[1..line.len() - 1].to_owned(),
                ..Default::default()
            });
            continue;
        }
        let Some(current) = variables.last_mut() else {
            continue;
        };
        if line.is_empty() {
            continue;
        }
        if let Some(value) = line.strip_prefix("Value:") {
            current.value = Some(value.trim().to_owned());
        } else if line.contains(':') {
            // Type / length attributes are not surfaced.
        } else if current.description.is_empty() {
            current.description = line.to_owned();
        }
    }
    variables
}

/// Parse `upscmd -l` output: lines of `name - description` after the
/// `Instant commands supported on UPS` banner.
pub fn parse_command_list(stdout: &str) -> Vec<(String, String)> {
    let mut commands = Vec::new();
    let mut in_block = false;
    for line in stdout.lines() {
        if line.contains("Instant commands supported on UPS") {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(" - ") {
            Some((name, description)) => {
                commands.push((name.trim().to_owned(), description.trim().to_owned()))
            }
            None => commands.push((line.to_owned(), String::new())),
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(runner: MockCommandRunner) -> NutClient {
        NutClient::new(Arc::new(runner), NutBinaryPaths::default())
    }

    fn ok_output(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            exit_ok: true,
            exit_code: Some(0),
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_parse_ups_variables() {
        let stdout = "battery.charge: 100\nups.status:  OL \n\nbad line\nups.load: 25\n";
        let vars = parse_ups_variables(stdout);
        assert_eq!(vars.get("battery.charge").unwrap(), "100");
        assert_eq!(vars.get("ups.status").unwrap(), "OL");
        assert_eq!(vars.get("ups.load").unwrap(), "25");
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn test_parse_command_list() {
        let stdout = "\
Instant commands supported on UPS [myups]:

beeper.disable - Disable the UPS beeper
beeper.enable - Enable the UPS beeper
test.battery.start.quick - Start a quick battery test
";
        let commands = parse_command_list(stdout);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].0, "beeper.disable");
        assert_eq!(commands[0].1, "Disable the UPS beeper");
    }

    #[test]
    fn test_parse_writable_variables() {
        let stdout = "\
[battery.charge.low]
Low battery level, percent
Type: STRING
Maximum length: 10
Value: 10

[ups.delay.shutdown]
Interval to wait after shutdown with delay command
Type: STRING
Maximum length: 10
Value: 20
";
        let variables = parse_writable_variables(stdout);
        assert_eq!(variables.len(), 2);
        assert_eq!(variables[0].name, "battery.charge.low");
        assert_eq!(variables[0].description, "Low battery level, percent");
        assert_eq!(variables[0].value.as_deref(), Some("10"));
        assert_eq!(variables[1].value.as_deref(), Some("20"));
    }

    #[test]
    fn test_classify_failure() {
        let client = client_with(MockCommandRunner::new());
        assert_eq!(
            client.classify_failure("Error: Driver not connected"),
            FailureKind::UsbLost
        );
        assert_eq!(
            client.classify_failure("USB communication driver failed"),
            FailureKind::UsbLost
        );
        assert_eq!(
            client.classify_failure("Access denied"),
            FailureKind::Transport
        );
        // Case-sensitive: a lowercase variant is not a USB marker.
        assert_eq!(
            client.classify_failure("driver not connected"),
            FailureKind::Transport
        );
    }

    #[actix_rt::test]
    async fn test_query_parses_variables() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| program == "upsc" && args == ["ups@localhost"])
            .returning(|_, _, _| Ok(ok_output("ups.status: OL\nbattery.charge: 99\n")));
        let client = client_with(runner);
        let vars = client.query("ups@localhost").await.unwrap();
        assert_eq!(vars.get("ups.status").unwrap(), "OL");
    }

    #[actix_rt::test]
    async fn test_query_empty_is_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(ok_output("")));
        let client = client_with(runner);
        assert!(client.query("ups@localhost").await.is_err());
    }

    #[actix_rt::test]
    async fn test_instant_command_ok_via_stderr() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(ProcessOutput {
                exit_ok: false,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "OK\n".to_owned(),
            })
        });
        let client = client_with(runner);
        let outcome = client
            .instant_command("ups@localhost", "beeper.disable", "admin", "pw")
            .await
            .unwrap();
        assert!(outcome.ok);
    }

    #[actix_rt::test]
    async fn test_set_variable_verify_pending() {
        let mut runner = MockCommandRunner::new();
        // upsrw succeeds...
        runner
            .expect_run()
            .withf(|program, _, _| program == "upsrw")
            .times(1)
            .returning(|_, _, _| Ok(ok_output("")));
        // ...but the UPS never reflects the new value.
        runner
            .expect_run()
            .withf(|program, _, _| program == "upsc")
            .times(3)
            .returning(|_, _, _| Ok(ok_output("battery.charge.low: 10\n")));
        let client = client_with(runner);
        let outcome = client
            .set_variable("ups@localhost", "battery.charge.low", "20", "admin", "pw")
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(!outcome.verified);
        assert!(outcome.message.contains("verify pending"));
    }
}
