//! The report scheduler: cron-driven generation of multi-section HTML
//! reports with inline charts, delivered by email.

pub mod charts;
pub mod sections;
pub mod window;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cadence::StatsdClient;
use chrono::DateTime;
use chrono_tz::Tz;
use lazy_static::lazy_static;
use tera::{Context, Tera};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

use nutify_common::db::models::ReportSchedule;
use nutify_common::db::{DbClient, DbError};
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;
use nutify_common::secret::SecretStore;
use nutify_common::util::{local_now, parse_timezone, utc_now_secs};

use nutify_notify::channels::email::client::{
    build_message, timeout_for, MsmtpTransport, SmtpOptions, SmtpTransport,
};
use nutify_notify::channels::email::error::EmailError;
use nutify_notify::channels::{decrypt_credential, validate_recipients, ChannelError};

use crate::settings::Settings;

use sections::{section_title, Section, SECTION_TAGS};
use window::{compute_window, ReportWindow};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Cannot compute report window for period {0:?}")]
    Window(String),

    #[error("Invalid cron expression {0:?}")]
    Cron(String),

    #[error("Every report section failed")]
    AllSectionsFailed,

    #[error("No usable mail config for report delivery")]
    NoMailConfig,

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Email(#[from] EmailError),
}

const REPORT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: Arial, sans-serif; margin: 0; padding: 16px; background: #f4f4f4;">
  <div style="max-width: 680px; margin: auto; background: #ffffff; border-radius: 6px; overflow: hidden;">
    <div style="padding: 16px 24px; background: #34495e; color: #ffffff;">
      <h2 style="margin: 0;">UPS report: {{ label }}</h2>
      <p style="margin: 4px 0 0 0; opacity: 0.85;">{{ server_name }} &middot; {{ period }} report &middot; generated {{ generated_at }}</p>
    </div>
    {% for section in report_sections %}
    <div style="padding: 20px 24px; border-bottom: 1px solid #eeeeee;">
      <h3 style="margin: 0 0 8px 0;">{{ section.title }}</h3>
      {% if section.ok %}
      <table style="width: 100%; border-collapse: collapse; margin-bottom: 12px;">
        {% for row in section.rows %}
        <tr>
          <td style="padding: 3px 0; color: #777; width: 35%;">{{ row.0 }}</td>
          <td style="padding: 3px 0;">{{ row.1 }}</td>
        </tr>
        {% endfor %}
      </table>
      {% else %}
      <p style="color: #c0392b;">This section could not be generated.</p>
      {% endif %}
      <img src="{{ section.chart }}" alt="{{ section.title }} chart" style="width: 100%; max-width: 560px;"/>
    </div>
    {% endfor %}
    <div style="padding: 12px 24px; background: #fafafa; color: #999; font-size: 12px;">
      Scheduled report from {{ server_name }}
    </div>
  </div>
</body>
</html>"#;

lazy_static! {
    static ref TERA: Tera = {
        let mut tera = Tera::default();
        tera.add_raw_template("report.html", REPORT_TEMPLATE)
            .expect("report template must parse");
        tera
    };
}

/// Parse a 5-field POSIX cron expression (the `cron` crate wants a seconds
/// field, pinned to 0 here).
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ReportError> {
    let fields = expression.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_owned(),
        _ => return Err(ReportError::Cron(expression.to_owned())),
    };
    cron::Schedule::from_str(&full).map_err(|_| ReportError::Cron(expression.to_owned()))
}

/// Whether a cron expression fires in `(last_check, now]`, local time.
pub fn is_due(
    expression: &str,
    last_check: DateTime<Tz>,
    now: DateTime<Tz>,
) -> Result<bool, ReportError> {
    let schedule = parse_cron(expression)?;
    Ok(schedule
        .after(&last_check)
        .next()
        .map(|occurrence| occurrence <= now)
        .unwrap_or(false))
}

pub struct ReportGenerator {
    db: Arc<dyn DbClient>,
    secret: Option<Arc<SecretStore>>,
    metrics: Arc<StatsdClient>,
    settings: Settings,
    transport: Arc<dyn SmtpTransport>,
    /// `last_run` updates are taken under this lock.
    run_lock: tokio::sync::Mutex<()>,
}

impl ReportGenerator {
    pub fn new(
        db: Arc<dyn DbClient>,
        secret: Option<Arc<SecretStore>>,
        metrics: Arc<StatsdClient>,
        settings: Settings,
    ) -> Self {
        let transport = Arc::new(MsmtpTransport::new(settings.msmtp_path.clone()));
        Self::with_transport(db, secret, metrics, settings, transport)
    }

    pub fn with_transport(
        db: Arc<dyn DbClient>,
        secret: Option<Arc<SecretStore>>,
        metrics: Arc<StatsdClient>,
        settings: Settings,
        transport: Arc<dyn SmtpTransport>,
    ) -> Self {
        Self {
            db,
            secret,
            metrics,
            settings,
            transport,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn display_timezone(&self) -> Tz {
        let name = match self.db.get_initial_setup().await {
            Ok(Some(setup)) if !setup.timezone.is_empty() => setup.timezone,
            _ => self.settings.timezone.clone(),
        };
        parse_timezone(&name).unwrap_or(chrono_tz::UTC)
    }

    async fn server_name(&self) -> String {
        self.db
            .get_initial_setup()
            .await
            .ok()
            .flatten()
            .map(|setup| setup.server_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "UPS Monitor".to_owned())
    }

    /// Build every requested section; a failed reporter degrades to a
    /// placeholder rather than aborting the report.
    async fn build_sections(
        &self,
        schedule: &ReportSchedule,
        report_window: &ReportWindow,
        tz: Tz,
    ) -> Vec<Section> {
        let requested: Vec<&str> = schedule
            .section_tags()
            .into_iter()
            .filter(|tag| SECTION_TAGS.contains(tag))
            .collect();

        let samples = self
            .db
            .samples_in_range(report_window.utc_from, report_window.utc_to)
            .await;
        let variables = self.db.get_variable_config().await.unwrap_or_default();

        let mut built = Vec::new();
        for tag in requested {
            let section = match (tag, &samples) {
                ("energy", Ok(samples)) => sections::energy_section(samples, &variables, tz),
                ("battery", Ok(samples)) => sections::battery_section(samples, tz),
                ("power", Ok(samples)) => sections::power_section(samples, tz),
                ("voltage", Ok(samples)) => sections::voltage_section(samples, tz),
                ("events", _) => match self
                    .db
                    .events_in_range(report_window.utc_from, report_window.utc_to)
                    .await
                {
                    Ok(events) => sections::events_section(&events, tz),
                    Err(e) => {
                        warn!("events section failed: {}", e);
                        Section::placeholder(tag, section_title(tag))
                    }
                },
                (tag, Err(e)) => {
                    warn!("section {} failed: {}", tag, e);
                    Section::placeholder(tag, section_title(tag))
                }
                _ => Section::placeholder(tag, section_title(tag)),
            };
            built.push(section);
        }
        built
    }

    /// Resolve the delivery recipients: the mail config's `to_email` wins,
    /// then the schedule's explicit list. Invalid addresses are dropped;
    /// an empty survivor list fails the dispatch.
    async fn resolve_recipients(
        &self,
        schedule: &ReportSchedule,
    ) -> Result<Vec<String>, ReportError> {
        if let Some(config_id) = schedule.mail_config_id {
            if let Some(config) = self.db.get_mail_config(config_id).await? {
                if let Some(to_email) = config.to_email.as_deref().filter(|t| !t.is_empty()) {
                    return Ok(validate_recipients(to_email.split(','))?);
                }
            }
        }
        Ok(validate_recipients(schedule.recipient_list())?)
    }

    /// The mail transport to deliver with: the schedule's config, else the
    /// first enabled one.
    async fn delivery_config(
        &self,
        schedule: &ReportSchedule,
    ) -> Result<nutify_common::db::models::MailConfig, ReportError> {
        if let Some(config_id) = schedule.mail_config_id {
            if let Some(config) = self.db.get_mail_config(config_id).await? {
                return Ok(config);
            }
        }
        self.db
            .list_mail_configs()
            .await?
            .into_iter()
            .find(|config| config.enabled)
            .ok_or(ReportError::NoMailConfig)
    }

    /// Generate the report window, render the HTML, deliver it and stamp
    /// `last_run`.
    pub async fn generate_and_send(&self, schedule: &ReportSchedule) -> Result<(), ReportError> {
        let tz = self.display_timezone().await;
        let now_local = local_now(tz);
        let report_window = compute_window(&schedule.period_type, now_local, None)
            .ok_or_else(|| ReportError::Window(schedule.period_type.clone()))?;

        let report_sections = self.build_sections(schedule, &report_window, tz).await;
        if !report_sections.is_empty() && report_sections.iter().all(|s| !s.ok) {
            return Err(ReportError::AllSectionsFailed);
        }

        let server_name = self.server_name().await;
        let mut context = Context::new();
        context.insert("server_name", &server_name);
        context.insert("label", &report_window.label);
        context.insert("period", &schedule.period_type);
        context.insert(
            "generated_at",
            &now_local.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        context.insert("report_sections", &report_sections);
        let html = TERA.render("report.html", &context)?;

        let recipients = self.resolve_recipients(schedule).await?;
        let config = self.delivery_config(schedule).await?;
        let password =
            decrypt_credential(self.secret.as_deref(), config.password_enc.as_deref())?;
        let (tls, tls_starttls) =
            SmtpOptions::resolve_tls(config.smtp_port, config.tls, config.tls_starttls);
        let from = config
            .from_email
            .clone()
            .filter(|f| !f.is_empty())
            .or_else(|| config.username.clone())
            .unwrap_or_else(|| "nutify@localhost".to_owned());
        let options = SmtpOptions {
            host: config.smtp_server.clone(),
            port: config.smtp_port,
            username: config.username.clone(),
            password,
            from,
            tls,
            tls_starttls,
        };

        let subject = format!(
            "{server_name} - UPS Report: {} ({})",
            schedule.period_type, report_window.label
        );
        let message = build_message(&options.from, &recipients, &subject, &html);
        let send_timeout = timeout_for(message.len(), self.settings.dispatch_timeout());
        self.transport
            .send(&options, &recipients, &message, send_timeout)
            .await?;

        {
            let _guard = self.run_lock.lock().await;
            self.db
                .set_schedule_last_run(schedule.id, utc_now_secs())
                .await?;
        }
        self.metrics.incr_with_tags(MetricName::ReportSent).send();
        info!(
            "report schedule {} delivered to {}",
            schedule.id,
            recipients.join(", ")
        );
        Ok(())
    }
}

/// The scheduler daemon: wakes every minute and runs due schedules.
/// `last_run` is only advanced on success, so a failed schedule retries on
/// its next cron occurrence.
pub fn spawn_report_scheduler(generator: Arc<ReportGenerator>, mut stop: watch::Receiver<bool>) {
    actix_rt::spawn(async move {
        let tz = generator.display_timezone().await;
        let mut last_check = local_now(tz);
        loop {
            tokio::select! {
                _ = sleep(Duration::from_secs(60)) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("report scheduler: stop signal observed, exiting");
                        break;
                    }
                }
            }
            let tz = generator.display_timezone().await;
            let now = local_now(tz);

            let schedules = match generator.db.list_report_schedules().await {
                Ok(schedules) => schedules,
                Err(e) => {
                    warn!("cannot list report schedules: {}", e);
                    last_check = now;
                    continue;
                }
            };
            for schedule in schedules.iter().filter(|s| s.enabled) {
                match is_due(&schedule.cron_expression, last_check, now) {
                    Ok(true) => {
                        info!("report schedule {} due, generating", schedule.id);
                        if let Err(e) = generator.generate_and_send(schedule).await {
                            // last_run untouched: the next tick retries.
                            error!("report schedule {} failed: {}", schedule.id, e);
                            generator
                                .metrics
                                .incr_with_tags(MetricName::ReportError)
                                .send();
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!("report schedule {}: {}", schedule.id, e),
                }
            }
            last_check = now;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nutify_common::db::models::{
        DynamicSample, InitialSetup, MailConfig, StaticData,
    };
    use nutify_common::db::{MockDbClient, SqliteDb};
    use nutify_common::metrics;
    use nutify_notify::channels::email::client::MockSmtpTransport;
    use tempfile::TempDir;

    fn statsd() -> Arc<StatsdClient> {
        Arc::new(metrics::builder("nutify", &None, 8125).unwrap())
    }

    #[test]
    fn test_parse_cron_five_field() {
        assert!(parse_cron("0 7 * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("0 7 * *").is_err());
    }

    #[test]
    fn test_is_due_boundaries() {
        let tz: Tz = "UTC".parse().unwrap();
        let last = tz.with_ymd_and_hms(2024, 6, 2, 6, 59, 30).unwrap();
        let now = tz.with_ymd_and_hms(2024, 6, 2, 7, 0, 30).unwrap();
        assert!(is_due("0 7 * * *", last, now).unwrap());

        let early = tz.with_ymd_and_hms(2024, 6, 2, 6, 59, 50).unwrap();
        assert!(!is_due("0 7 * * *", last, early).unwrap());
    }

    async fn seeded_db(dir: &TempDir) -> Arc<SqliteDb> {
        let db = Arc::new(SqliteDb::open(dir.path().join("nutify.db")).unwrap());
        db.ensure_schema().await.unwrap();
        db.insert_static_data(&StaticData::default()).await.unwrap();
        db.save_initial_setup(&InitialSetup {
            server_name: "rack-4".to_owned(),
            timezone: "UTC".to_owned(),
            is_configured: true,
        })
        .await
        .unwrap();
        db
    }

    /// Seed yesterday with 24 hourly buckets of 250 Wh.
    async fn seed_yesterday(db: &SqliteDb) {
        let yesterday = (utc_now_secs() - chrono::Duration::days(1)).date();
        for hour in 0..24 {
            let mut sample = DynamicSample {
                timestamp_utc: yesterday.and_hms_opt(hour, 59, 0).unwrap(),
                ups_realpower_hrs: Some(250.0),
                ..Default::default()
            };
            sample.numeric.insert("ups_realpower".to_owned(), 250.0);
            sample.numeric.insert("battery_charge".to_owned(), 100.0);
            db.append_dynamic(&sample).await.unwrap();
        }
    }

    #[actix_rt::test]
    async fn test_daily_report_end_to_end() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir).await;
        seed_yesterday(&db).await;
        let mail_id = db
            .insert_mail_config(&MailConfig {
                smtp_server: "smtp.example.com".to_owned(),
                smtp_port: 465,
                from_email: Some("ups@example.com".to_owned()),
                to_email: Some("ops@example.com".to_owned()),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let schedule_id = db
            .insert_report_schedule(&nutify_common::db::models::ReportSchedule {
                cron_expression: "0 7 * * *".to_owned(),
                period_type: "daily".to_owned(),
                sections: "energy,power,events".to_owned(),
                recipients: "fallback@example.com".to_owned(),
                mail_config_id: Some(mail_id),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let schedule = db
            .get_report_schedule(schedule_id)
            .await
            .unwrap()
            .unwrap();

        let mut transport = MockSmtpTransport::new();
        transport
            .expect_send()
            .withf(|_, recipients, message, _| {
                let text = String::from_utf8_lossy(message);
                recipients.len() == 1
                    && recipients[0] == "ops@example.com"
                    && text.contains("Subject: rack-4 - UPS Report: daily")
                    && text.contains("6000.0 Wh")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let generator = ReportGenerator::with_transport(
            Arc::clone(&db) as Arc<dyn DbClient>,
            None,
            statsd(),
            Settings::test_settings(),
            Arc::new(transport),
        );
        generator.generate_and_send(&schedule).await.unwrap();

        let updated = db
            .get_report_schedule(schedule_id)
            .await
            .unwrap()
            .unwrap();
        assert!(updated.last_run.is_some());
    }

    #[actix_rt::test]
    async fn test_invalid_recipients_fail_whole_dispatch() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir).await;
        db.insert_mail_config(&MailConfig {
            smtp_server: "smtp.example.com".to_owned(),
            smtp_port: 465,
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();
        let schedule = nutify_common::db::models::ReportSchedule {
            id: 1,
            cron_expression: "0 7 * * *".to_owned(),
            period_type: "daily".to_owned(),
            sections: "power".to_owned(),
            recipients: "not-an-address".to_owned(),
            enabled: true,
            ..Default::default()
        };
        let generator = ReportGenerator::with_transport(
            Arc::clone(&db) as Arc<dyn DbClient>,
            None,
            statsd(),
            Settings::test_settings(),
            Arc::new(MockSmtpTransport::new()),
        );
        let err = generator.generate_and_send(&schedule).await.unwrap_err();
        assert!(matches!(
            err,
            ReportError::Channel(ChannelError::NoValidRecipients)
        ));
    }

    #[actix_rt::test]
    async fn test_all_sections_failed_is_error() {
        let mut db = MockDbClient::new();
        db.expect_get_initial_setup().returning(|| Ok(None));
        db.expect_samples_in_range()
            .returning(|_, _| Err(DbError::General("disk gone".to_owned())));
        db.expect_get_variable_config()
            .returning(|| Ok(Default::default()));

        let schedule = nutify_common::db::models::ReportSchedule {
            id: 1,
            cron_expression: "0 7 * * *".to_owned(),
            period_type: "daily".to_owned(),
            sections: "energy,power".to_owned(),
            recipients: "ops@example.com".to_owned(),
            enabled: true,
            ..Default::default()
        };
        let generator = ReportGenerator::with_transport(
            Arc::new(db),
            None,
            statsd(),
            Settings::test_settings(),
            Arc::new(MockSmtpTransport::new()),
        );
        let err = generator.generate_and_send(&schedule).await.unwrap_err();
        assert!(matches!(err, ReportError::AllSectionsFailed));
    }
}
