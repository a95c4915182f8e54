//! The connection monitor: an independent health loop that drives the
//! recovery state machine and, on USB loss, the NUT service restart
//! sequence. Only this module issues start/stop commands for NUT services.

pub mod state;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence::StatsdClient;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

use nutify_common::errors::NutifyErrorKind;
use nutify_common::events::ParsedEvent;
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;
use nutify_common::nut::{CommandRunner, NutClient, NutConfigStore};
use nutify_common::util::{format_local, utc_now_secs};

use crate::bus::{BusEvent, BusHub};
use crate::settings::Settings;

use nutify_notify::EventPipeline;

pub use state::{ConnectionState, ConnectionTotals, MonitorState, ProbeOutcome};
use state::{tick_interval, transition, Effect};

/// USB vendor ids of common UPS manufacturers, matched against lsusb.
const UPS_USB_VENDORS: &[&str] = &[
    "051d", // APC
    "0764", // CyberPower
    "0463", // MGE / Eaton
    "06da", // Phoenixtec / Liebert
    "09ae", // Tripp Lite
    "0665", // Cypress (many budget UPSes)
];

pub struct ConnectionMonitor {
    nut: Arc<NutClient>,
    runner: Arc<dyn CommandRunner>,
    nut_config: Arc<NutConfigStore>,
    bus: Arc<BusHub>,
    pipeline: Arc<EventPipeline>,
    metrics: Arc<StatsdClient>,
    settings: Settings,
    state: Mutex<ConnectionState>,
    /// One synthetic COMMOK per outage cycle.
    commok_emitted: AtomicBool,
}

impl ConnectionMonitor {
    pub fn new(
        nut: Arc<NutClient>,
        runner: Arc<dyn CommandRunner>,
        nut_config: Arc<NutConfigStore>,
        bus: Arc<BusHub>,
        pipeline: Arc<EventPipeline>,
        metrics: Arc<StatsdClient>,
        settings: Settings,
    ) -> Self {
        Self {
            nut,
            runner,
            nut_config,
            bus,
            pipeline,
            metrics,
            settings,
            state: Mutex::new(ConnectionState::new_connected()),
            commok_emitted: AtomicBool::new(false),
        }
    }

    /// A copy of the connection state for external readers.
    pub async fn snapshot(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    async fn target(&self) -> String {
        self.nut_config
            .get()
            .await
            .target()
            .unwrap_or_else(|| "ups@localhost".to_owned())
    }

    async fn probe(&self) -> ProbeOutcome {
        match self.nut.query(&self.target().await).await {
            Ok(_) => ProbeOutcome::Ok,
            Err(e) => match e.kind {
                NutifyErrorKind::UsbLost(_) => ProbeOutcome::UsbFail,
                _ => {
                    trace!("monitor probe failed: {}", e);
                    ProbeOutcome::TransportFail
                }
            },
        }
    }

    /// One probe + transition + effects. Returns the next machine state.
    pub async fn run_tick(&self, machine: MonitorState) -> MonitorState {
        let outcome = self.probe().await;
        let next = self.advance(machine, outcome).await;
        if next.label() != machine.label() {
            info!(
                "monitor: {} -> {} ({:?})",
                machine.label(),
                next.label(),
                outcome
            );
            self.metrics
                .incr_with_tags(MetricName::MonitorTransition)
                .with_tag("to", next.label())
                .send();
        }
        next
    }

    /// Apply the pure transition and perform its effects.
    async fn advance(&self, machine: MonitorState, outcome: ProbeOutcome) -> MonitorState {
        let now = utc_now_secs();
        let t = transition(machine, outcome, self.settings.monitor_initial_retries);

        {
            let mut state = self.state.lock().await;
            state.last_check = Some(now);
            if outcome != ProbeOutcome::Ok {
                state.attempts += 1;
            }
        }

        for effect in &t.effects {
            match effect {
                Effect::MarkLost => {
                    let mut state = self.state.lock().await;
                    state.connected = false;
                    state.lost_at = Some(now);
                    state.totals.failures += 1;
                    drop(state);
                    self.metrics
                        .incr_with_tags(MetricName::MonitorCommFailure)
                        .send();
                }
                Effect::EmitUsbLost => self.emit_usb_lost(now).await,
                Effect::Recovered { was_usb } => self.recovered(*was_usb, now).await,
                Effect::AttemptUsbRecovery { attempt } => {
                    self.attempt_usb_recovery(*attempt).await
                }
            }
        }
        t.next
    }

    async fn emit_usb_lost(&self, now: chrono::NaiveDateTime) {
        warn!("USB communication with the UPS lost");
        {
            let mut state = self.state.lock().await;
            state.usb_disconnect = true;
            state.totals.usb_disconnects += 1;
        }
        self.commok_emitted.store(false, Ordering::SeqCst);
        self.metrics
            .incr_with_tags(MetricName::MonitorUsbDisconnect)
            .send();

        let timestamp = self.local_timestamp(now);
        let target = self.target().await;
        write_status_file(
            &self.settings.usb_status_file,
            &json!({
                "event": "usb_disconnect",
                "timestamp": timestamp.clone(),
                "status": "NOCOMM",
                "ups": target,
            }),
        );
        self.bus.publish(BusEvent::UsbDisconnect {
            timestamp,
            status: "NOCOMM".to_owned(),
        });
    }

    async fn recovered(&self, was_usb: bool, now: chrono::NaiveDateTime) {
        let downtime_secs = {
            let mut state = self.state.lock().await;
            let downtime = state
                .lost_at
                .map(|lost| (now - lost).num_seconds())
                .unwrap_or(0);
            state.connected = true;
            state.lost_at = None;
            state.usb_disconnect = false;
            state.totals.recoveries += 1;
            if was_usb {
                state.totals.usb_reconnects += 1;
            }
            downtime
        };
        info!(
            "Communication with the UPS recovered after {}s (usb: {})",
            downtime_secs, was_usb
        );
        self.metrics
            .incr_with_tags(MetricName::MonitorCommRecovery)
            .send();

        if was_usb {
            self.metrics
                .incr_with_tags(MetricName::MonitorUsbReconnect)
                .send();
            let timestamp = self.local_timestamp(now);
            let target = self.target().await;
            write_status_file(
                &self.settings.usb_status_file,
                &json!({
                    "event": "usb_reconnect",
                    "timestamp": timestamp.clone(),
                    "status": "COMMOK",
                    "ups": target,
                }),
            );
            self.bus.publish(BusEvent::UsbReconnectAttempt {
                timestamp,
                attempt: 0,
            });
            self.emit_synthetic_commok().await;
        }
    }

    /// Probe the USB bus; when a UPS device reappears, run the service
    /// restart sequence. The machine stays in `UsbDisconnect` until a
    /// successful query promotes it.
    async fn attempt_usb_recovery(&self, attempt: u32) {
        let timestamp = self.local_timestamp(utc_now_secs());
        self.bus.publish(BusEvent::UsbReconnectAttempt {
            timestamp: timestamp.clone(),
            attempt,
        });

        let lsusb = self.nut.lsusb().await.unwrap_or_default();
        let scanner = self.nut.nut_scanner_usb().await.unwrap_or_default();
        if !usb_device_present(&lsusb, &scanner) {
            debug!("USB recovery attempt {}: no UPS device visible", attempt);
            return;
        }

        info!(
            "USB recovery attempt {}: device present, running restart sequence",
            attempt
        );
        match self.restart_sequence().await {
            Ok(verified) => {
                if verified && !self.commok_emitted.load(Ordering::SeqCst) {
                    self.emit_synthetic_commok().await;
                }
                if !verified {
                    warn!("Service restart sequence did not verify; operator intervention may be needed");
                    write_status_file(
                        &self.settings.container_restart_file,
                        &json!({
                            "timestamp": timestamp.clone(),
                            "reason": "nut_restart_unverified",
                        }),
                    );
                    self.bus.publish(BusEvent::ContainerRestartNeeded {
                        timestamp,
                        reason: "nut_restart_unverified".to_owned(),
                    });
                }
            }
            Err(e) => warn!("Service restart sequence failed: {}", e),
        }
    }

    /// Stop upsmon -> upsd -> drivers, relax the USB device nodes, start
    /// them back up, then verify. Each step is idempotent; failures of
    /// individual stop steps are tolerated (the service may not be
    /// running).
    async fn restart_sequence(&self) -> nutify_common::errors::Result<bool> {
        self.metrics
            .incr_with_tags(MetricName::MonitorRestartSequence)
            .send();
        let timeout = Duration::from_secs(10);
        let s = &self.settings;

        let steps: Vec<(String, Vec<String>)> = vec![
            (s.upsmon_path.clone(), vec!["-c".into(), "stop".into()]),
            (s.upsd_path.clone(), vec!["-c".into(), "stop".into()]),
            (s.upsdrvctl_path.clone(), vec!["stop".into()]),
        ];
        for (program, args) in steps {
            if let Err(e) = self.runner.run(&program, &args, timeout).await {
                debug!("stop step {} tolerated failure: {}", program, e);
            }
        }

        sleep(Duration::from_secs(s.monitor_restart_wait_secs)).await;

        // USB device nodes reappear with default ownership after a
        // re-enumeration; the NUT driver needs them writable.
        if let Err(e) = self
            .runner
            .run(
                "chmod",
                &["-R".into(), "777".into(), "/dev/bus/usb".into()],
                timeout,
            )
            .await
        {
            debug!("chmod /dev/bus/usb failed: {}", e);
        }

        let starts: Vec<(String, Vec<String>)> = vec![
            (s.upsdrvctl_path.clone(), vec!["start".into()]),
            (s.upsd_path.clone(), vec![]),
            (s.upsmon_path.clone(), vec![]),
        ];
        for (program, args) in starts {
            if let Err(e) = self.runner.run(&program, &args, timeout).await {
                warn!("start step {} failed: {}", program, e);
            }
        }

        // Verify: daemons visible, scanner sees the device, a query works.
        let ps = self
            .runner
            .run("ps", &["ax".into()], timeout)
            .await
            .map(|out| out.stdout)
            .unwrap_or_default();
        let daemons_up = ps.contains("upsd") && ps.contains("upsmon");
        let scanner = self.nut.nut_scanner_usb().await.unwrap_or_default();
        let query_ok = self.nut.query(&self.target().await).await.is_ok();
        Ok(daemons_up && scanner.contains("driver = ") && query_ok)
    }

    async fn emit_synthetic_commok(&self) {
        let target = self.target().await;
        let parsed = ParsedEvent {
            ups_name: target.clone(),
            event_type: "COMMOK".to_owned(),
        };
        let message = format!("Communications restored with UPS {target}");
        match self.pipeline.process(&parsed, &message, None).await {
            Ok(summary) => {
                self.commok_emitted.store(true, Ordering::SeqCst);
                debug!("Synthetic COMMOK stored as event {}", summary.event_id);
            }
            Err(e) => warn!("Synthetic COMMOK failed: {}", e),
        }
    }

    fn local_timestamp(&self, now: chrono::NaiveDateTime) -> String {
        let tz = nutify_common::util::parse_timezone(&self.settings.timezone)
            .unwrap_or(chrono_tz::UTC);
        format_local(now, tz)
    }

    fn interval_for(&self, machine: MonitorState) -> Duration {
        tick_interval(
            machine,
            Duration::from_secs(self.settings.monitor_connected_secs),
            Duration::from_secs(self.settings.monitor_initial_retry_secs),
            Duration::from_secs(self.settings.monitor_extended_retry_secs),
            Duration::from_secs(self.settings.monitor_usb_scan_secs),
        )
    }
}

/// True when either probe indicates a UPS device on the USB bus.
pub fn usb_device_present(lsusb: &str, scanner: &str) -> bool {
    if scanner.contains("driver = ") {
        return true;
    }
    let lsusb_lower = lsusb.to_lowercase();
    if lsusb_lower.contains("ups") || lsusb_lower.contains("uninterruptible") {
        return true;
    }
    UPS_USB_VENDORS
        .iter()
        .any(|vendor| lsusb_lower.contains(&format!("id {vendor}:")))
}

/// Write a best-effort JSON status file atomically (tmp + rename).
pub fn write_status_file(path: &str, payload: &serde_json::Value) {
    let tmp = format!("{path}.tmp");
    let write = || -> std::io::Result<()> {
        std::fs::write(&tmp, serde_json::to_vec_pretty(payload).unwrap_or_default())?;
        std::fs::rename(&tmp, Path::new(path))?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!("Cannot write status file {}: {}", path, e);
    }
}

/// Spawn the monitor loop; the tick cadence follows the machine state.
pub fn spawn_monitor(monitor: Arc<ConnectionMonitor>, mut stop: watch::Receiver<bool>) {
    actix_rt::spawn(async move {
        let mut machine = MonitorState::Connected;
        loop {
            let interval = monitor.interval_for(machine);
            tokio::select! {
                _ = sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("monitor: stop signal observed, exiting");
                        break;
                    }
                }
            }
            machine = monitor.run_tick(machine).await;
        }
    });
}
