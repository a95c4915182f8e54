//! The application value at process root: owns the storage handle, the
//! NUT glue, the live bus and every long-running loop.

use std::path::Path;
use std::sync::Arc;

use cadence::StatsdClient;
use config::ConfigError;
use tokio::sync::watch;

use nutify_common::db::{DbClient, SqliteDb};
use nutify_common::metrics;
use nutify_common::nut::{CommandRunner, NutClient, NutConfigStore, SystemCommandRunner};
use nutify_common::secret::SecretStore;

use nutify_notify::EventPipeline;

use crate::bus::BusHub;
use crate::commands::CommandExecutor;
use crate::monitor::{spawn_monitor, ConnectionMonitor};
use crate::poller::{spawn_aggregator, spawn_poller, Poller};
use crate::reports::{spawn_report_scheduler, ReportGenerator};
use crate::settings::Settings;

pub struct AppState {
    pub db: Arc<dyn DbClient>,
    pub metrics: Arc<StatsdClient>,
    pub settings: Settings,
    pub nut_config: Arc<NutConfigStore>,
    pub secret: Option<Arc<SecretStore>>,
    pub bus: Arc<BusHub>,
    pub pipeline: Arc<EventPipeline>,
    pub monitor: Arc<ConnectionMonitor>,
    pub executor: Arc<CommandExecutor>,
    pub reports: Arc<ReportGenerator>,
    pub poller: Arc<Poller>,
}

impl AppState {
    pub async fn from_settings(settings: Settings) -> Result<Arc<Self>, ConfigError> {
        Self::build(settings, Arc::new(SystemCommandRunner)).await
    }

    /// Test constructor with an injected subprocess runner.
    pub async fn for_tests(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<Self> {
        Self::build(settings, runner)
            .await
            .expect("test app state")
    }

    async fn build(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Arc<Self>, ConfigError> {
        let metrics = Arc::new(
            metrics::builder(
                &settings.statsd_label,
                &settings.statsd_host,
                settings.statsd_port,
            )
            .map_err(|e| ConfigError::Message(e.to_string()))?,
        );

        let secret = SecretStore::from_env_value(settings.encryption_key.as_deref()).map(Arc::new);
        if secret.is_none() {
            warn!("No encryption key configured; credential-dependent features are disabled");
        }

        // DB unreachable at startup is process-fatal.
        let mut sqlite = SqliteDb::open(&settings.db_path)
            .map_err(|e| ConfigError::Message(format!("Cannot open database: {e}")))?;
        if let Some(secret) = &secret {
            sqlite = sqlite.with_secret_probe(Arc::clone(secret));
        }
        let db: Arc<dyn DbClient> = Arc::new(sqlite);
        let report = db
            .ensure_schema()
            .await
            .map_err(|e| ConfigError::Message(format!("Schema check failed: {e}")))?;
        if !report.recreated.is_empty() {
            warn!(
                "Recreated drifted table(s): {} (schedules cascaded: {}, notifications reset: {})",
                report.recreated.join(", "),
                report.cascaded_schedules,
                report.cascaded_notifications
            );
        }

        let nut = Arc::new(
            NutClient::new(Arc::clone(&runner), settings.nut_binary_paths())
                .with_usb_error_markers(settings.usb_error_markers.clone()),
        );
        let nut_config = Arc::new(NutConfigStore::new(settings.nut_conf_dir.clone()));
        let bus = Arc::new(BusHub::new(settings.bus_capacity, Arc::clone(&metrics)));

        let pipeline = Arc::new(EventPipeline::new(
            Arc::clone(&db),
            secret.clone(),
            settings.notify_settings(),
            Arc::clone(&metrics),
        ));
        let monitor = Arc::new(ConnectionMonitor::new(
            Arc::clone(&nut),
            Arc::clone(&runner),
            Arc::clone(&nut_config),
            Arc::clone(&bus),
            Arc::clone(&pipeline),
            Arc::clone(&metrics),
            settings.clone(),
        ));
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&db),
            Arc::clone(&nut),
            Arc::clone(&nut_config),
            Arc::clone(&bus),
            Arc::clone(&metrics),
        ));
        let reports = Arc::new(ReportGenerator::new(
            Arc::clone(&db),
            secret.clone(),
            Arc::clone(&metrics),
            settings.clone(),
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&db),
            Arc::clone(&nut),
            Arc::clone(&nut_config),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            settings.clone(),
        ));

        Ok(Arc::new(Self {
            db,
            metrics,
            settings,
            nut_config,
            secret,
            bus,
            pipeline,
            monitor,
            executor,
            reports,
            poller,
        }))
    }

    /// Missing NUT binaries at startup are process-fatal; only absolute
    /// paths can be checked ahead of time, bare names resolve via PATH at
    /// call time.
    pub fn check_nut_binaries(&self) -> Result<(), ConfigError> {
        let paths = [
            &self.settings.upsc_path,
            &self.settings.upscmd_path,
            &self.settings.upsrw_path,
            &self.settings.upsdrvctl_path,
            &self.settings.upsd_path,
            &self.settings.upsmon_path,
        ];
        for path in paths {
            if path.contains('/') && !Path::new(path).exists() {
                return Err(ConfigError::Message(format!("NUT binary not found: {path}")));
            }
        }
        Ok(())
    }

    /// Spawn every long-running loop. Each observes the stop signal and
    /// drains within the grace period.
    pub fn spawn_loops(self: &Arc<Self>, stop: watch::Receiver<bool>) {
        spawn_poller(Arc::clone(&self.poller), stop.clone());
        spawn_aggregator(
            Arc::clone(&self.db),
            Arc::clone(&self.metrics),
            std::time::Duration::from_secs(self.settings.aggregation_check_secs.max(1)),
            stop.clone(),
        );
        spawn_monitor(Arc::clone(&self.monitor), stop.clone());
        spawn_report_scheduler(Arc::clone(&self.reports), stop);
    }
}
