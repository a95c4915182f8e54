//! The polling loop: one dynamic sample per tick, plus the hourly/daily
//! energy aggregation pass.

use std::sync::Arc;
use std::time::Duration;

use cadence::StatsdClient;
use chrono::{NaiveDateTime, Timelike};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;

use nutify_common::db::models::{derive_realpower, DynamicSample, StaticData};
use nutify_common::db::{DbClient, DbError};
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;
use nutify_common::nut::{NutClient, NutConfigStore};
use nutify_common::util::{coerce_numeric, format_local, normalize_key, utc_now_secs};
use nutify_common::AGGREGATION_MAX_GAP_SECS;

use crate::bus::{BusEvent, BusHub};
use crate::settings::Settings;

/// NUT keys that belong to the immutable static row and are excluded from
/// dynamic samples.
pub static STATIC_KEYS: &[&str] = &[
    "battery.type",
    "device.location",
    "device.mfr",
    "device.model",
    "device.serial",
    "ups.firmware",
    "ups.firmware.aux",
    "ups.mfr",
    "ups.model",
    "ups.productid",
    "ups.serial",
    "ups.vendorid",
];

pub struct Poller {
    db: Arc<dyn DbClient>,
    nut: Arc<NutClient>,
    nut_config: Arc<NutConfigStore>,
    bus: Arc<BusHub>,
    metrics: Arc<StatsdClient>,
    settings: Settings,
    /// Consecutive sample-write failures; crossing the threshold surfaces
    /// a storage-unhealthy signal on the bus.
    write_failures: std::sync::atomic::AtomicU32,
}

impl Poller {
    pub fn new(
        db: Arc<dyn DbClient>,
        nut: Arc<NutClient>,
        nut_config: Arc<NutConfigStore>,
        bus: Arc<BusHub>,
        metrics: Arc<StatsdClient>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            nut,
            nut_config,
            bus,
            metrics,
            settings,
            write_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    async fn target(&self) -> String {
        self.nut_config
            .get()
            .await
            .target()
            .unwrap_or_else(|| "ups@localhost".to_owned())
    }

    /// Populate the static row from one snapshot. Must succeed before any
    /// dynamic row is written; keys not present are stored null.
    pub async fn initialize_static(&self) -> nutify_common::errors::Result<()> {
        if self.db.get_static_data().await.map(|d| d.is_some()).unwrap_or(false) {
            return Ok(());
        }
        let vars = self.nut.query(&self.target().await).await?;
        let data = static_data_from_vars(&vars);
        self.db.insert_static_data(&data).await.map_err(|e| {
            nutify_common::errors::NutifyErrorKind::DatabaseError(e).into()
        })
    }

    /// One poll tick. Query errors skip the tick; write errors are counted
    /// and surfaced but never stop polling.
    pub async fn tick(&self) {
        let vars = match self.nut.query(&self.target().await).await {
            Ok(vars) => vars,
            Err(e) => {
                debug!("poll tick skipped: {}", e);
                self.metrics.incr_with_tags(MetricName::PollTickError).send();
                return;
            }
        };
        self.metrics.incr_with_tags(MetricName::PollTickOk).send();

        // The static row must exist before any dynamic row; populate it
        // from this snapshot if startup initialization never got one.
        let mut static_data = self.db.get_static_data().await.ok().flatten();
        if static_data.is_none() {
            let data = static_data_from_vars(&vars);
            if let Err(e) = self.db.insert_static_data(&data).await {
                warn!("cannot populate static row: {}", e);
            } else {
                static_data = Some(data);
            }
        }
        let mut sample = sample_from_vars(&vars, utc_now_secs());
        derive_realpower(
            &mut sample.numeric,
            static_data
                .as_ref()
                .and_then(|d| d.ups_realpower_nominal.or(d.ups_power_nominal)),
            self.settings.default_nominal_power,
        );

        match self.db.append_dynamic(&sample).await {
            Ok(_) => {
                self.write_failures
                    .store(0, std::sync::atomic::Ordering::Relaxed);
                self.metrics
                    .incr_with_tags(MetricName::PollSampleStored)
                    .send();
            }
            Err(DbError::DuplicateSample(ts)) => {
                // Sub-second ticks collapse onto the same stored second.
                trace!("sample for {} already stored", ts);
            }
            Err(e) => {
                warn!("sample write failed: {}", e);
                self.metrics
                    .incr_with_tags(MetricName::PollSampleError)
                    .send();
                let failures = self
                    .write_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                if failures == self.settings.storage_unhealthy_threshold {
                    self.metrics
                        .incr_with_tags(MetricName::StorageUnhealthy)
                        .send();
                    self.bus.publish(BusEvent::StorageUnhealthy {
                        consecutive_failures: failures,
                    });
                }
            }
        }

        self.bus.publish(BusEvent::Sample {
            data: self.sample_payload(&sample, static_data.as_ref()).await,
        });
    }

    /// Merged static+dynamic snapshot for the bus, timestamps localized.
    async fn sample_payload(
        &self,
        sample: &DynamicSample,
        static_data: Option<&StaticData>,
    ) -> serde_json::Value {
        let tz = self.display_timezone().await;
        let mut payload = serde_json::Map::new();
        if let Some(data) = static_data {
            if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(data) {
                payload.extend(map);
            }
        }
        for (key, value) in &sample.numeric {
            payload.insert(key.clone(), json!(value));
        }
        for (key, value) in &sample.text {
            payload.insert(key.clone(), json!(value));
        }
        payload.extend(sample.extra.clone());
        payload.insert(
            "timestamp".to_owned(),
            json!(format_local(sample.timestamp_utc, tz)),
        );
        serde_json::Value::Object(payload)
    }

    async fn display_timezone(&self) -> chrono_tz::Tz {
        let name = match self.db.get_initial_setup().await {
            Ok(Some(setup)) if !setup.timezone.is_empty() => setup.timezone,
            _ => self.settings.timezone.clone(),
        };
        nutify_common::util::parse_timezone(&name).unwrap_or(chrono_tz::UTC)
    }

    /// The effective interval: a runtime override from the variable config
    /// wins over the settings default; changes take effect next tick.
    async fn effective_interval(&self) -> Duration {
        match self.db.get_variable_config().await {
            Ok(config) => config
                .polling_interval_secs
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or_else(|| self.settings.poll_interval()),
            Err(_) => self.settings.poll_interval(),
        }
    }
}

/// Split one `upsc` snapshot into the static row shape.
pub fn static_data_from_vars(vars: &std::collections::HashMap<String, String>) -> StaticData {
    let get = |key: &str| vars.get(key).cloned();
    let num = |key: &str| vars.get(key).and_then(|v| coerce_numeric(v));
    StaticData {
        device_model: get("device.model").or_else(|| get("ups.model")),
        device_serial: get("device.serial").or_else(|| get("ups.serial")),
        device_mfr: get("device.mfr").or_else(|| get("ups.mfr")),
        device_location: get("device.location"),
        ups_firmware: get("ups.firmware"),
        battery_type: get("battery.type"),
        battery_voltage_nominal: num("battery.voltage.nominal"),
        input_voltage_nominal: num("input.voltage.nominal"),
        output_voltage_nominal: num("output.voltage.nominal"),
        ups_power_nominal: num("ups.power.nominal"),
        ups_realpower_nominal: num("ups.realpower.nominal"),
    }
}

/// Render slash-separated device dates (`2020/01/15`) as ISO.
fn normalize_date_value(value: &str) -> String {
    value.trim().replace('/', "-")
}

/// Normalize one snapshot into a dynamic sample: keys `.`->`_`, numerics
/// coerced, date values as ISO, static identity keys excluded.
pub fn sample_from_vars(
    vars: &std::collections::HashMap<String, String>,
    timestamp_utc: NaiveDateTime,
) -> DynamicSample {
    let mut sample = DynamicSample {
        timestamp_utc,
        ..Default::default()
    };
    for (key, value) in vars {
        if STATIC_KEYS.contains(&key.as_str()) {
            continue;
        }
        let column = normalize_key(key);
        if column.contains("date") {
            sample.text.insert(column, normalize_date_value(value));
            continue;
        }
        match coerce_numeric(value) {
            Some(number) => {
                sample.numeric.insert(column, number);
            }
            None => {
                sample.text.insert(column, value.clone());
            }
        }
    }
    sample
}

/// Trapezoidal energy integral in Wh over ordered (timestamp, watts)
/// points. Gaps longer than the aggregation maximum contribute zero.
pub fn trapezoidal_wh(points: &[(NaiveDateTime, f64)]) -> f64 {
    points
        .windows(2)
        .map(|pair| {
            let dt = (pair[1].0 - pair[0].0).num_seconds();
            if dt <= 0 || dt > AGGREGATION_MAX_GAP_SECS {
                0.0
            } else {
                (pair[0].1 + pair[1].1) / 2.0 * dt as f64 / 3600.0
            }
        })
        .sum()
}

/// The aggregation pass: integrates the previous hour once it completes,
/// and sums hourly buckets into a daily total at day rollover.
pub struct Aggregator {
    db: Arc<dyn DbClient>,
    metrics: Arc<StatsdClient>,
    last_hour: Option<NaiveDateTime>,
    last_day: Option<NaiveDateTime>,
}

impl Aggregator {
    pub fn new(db: Arc<dyn DbClient>, metrics: Arc<StatsdClient>) -> Self {
        Self {
            db,
            metrics,
            last_hour: None,
            last_day: None,
        }
    }

    fn hour_floor(ts: NaiveDateTime) -> NaiveDateTime {
        ts.date().and_hms_opt(ts.hour(), 0, 0).expect("valid hour")
    }

    fn day_floor(ts: NaiveDateTime) -> NaiveDateTime {
        ts.date().and_hms_opt(0, 0, 0).expect("valid day")
    }

    /// Run once per sweep; writes aggregates for every completed bucket
    /// since the previous sweep.
    pub async fn sweep(&mut self, now: NaiveDateTime) {
        let this_hour = Self::hour_floor(now);
        if let Some(last) = self.last_hour {
            if this_hour > last {
                if let Err(e) = self.aggregate_hour(last).await {
                    warn!("hourly aggregation failed: {}", e);
                }
            }
        }
        self.last_hour = Some(this_hour);

        let this_day = Self::day_floor(now);
        if let Some(last) = self.last_day {
            if this_day > last {
                if let Err(e) = self.aggregate_day(last).await {
                    warn!("daily aggregation failed: {}", e);
                }
            }
        }
        self.last_day = Some(this_day);
    }

    /// Integrate one complete hour and write it onto the hour's bucket row
    /// (the last sample of the hour).
    pub async fn aggregate_hour(&self, hour_start: NaiveDateTime) -> Result<(), DbError> {
        let hour_end = hour_start + chrono::Duration::hours(1);
        let samples = self.db.samples_in_range(hour_start, hour_end).await?;
        let Some(bucket) = samples.last().and_then(|s| s.id) else {
            return Ok(());
        };
        let points: Vec<(NaiveDateTime, f64)> = samples
            .iter()
            .filter_map(|s| {
                s.numeric_value("ups_realpower")
                    .map(|p| (s.timestamp_utc, p))
            })
            .collect();
        let wh = trapezoidal_wh(&points);
        self.db
            .set_sample_aggregates(bucket, Some(wh), None)
            .await?;
        self.metrics
            .incr_with_tags(MetricName::AggregateHourly)
            .send();
        debug!(
            "hourly aggregate for {}: {:.2} Wh over {} samples",
            hour_start,
            wh,
            samples.len()
        );
        Ok(())
    }

    /// Sum the day's hourly buckets into the last sample of the day.
    pub async fn aggregate_day(&self, day_start: NaiveDateTime) -> Result<(), DbError> {
        let day_end = day_start + chrono::Duration::days(1);
        let samples = self.db.samples_in_range(day_start, day_end).await?;
        let Some(bucket) = samples.last().and_then(|s| s.id) else {
            return Ok(());
        };
        let wh: f64 = samples.iter().filter_map(|s| s.ups_realpower_hrs).sum();
        self.db
            .set_sample_aggregates(bucket, None, Some(wh))
            .await?;
        self.metrics
            .incr_with_tags(MetricName::AggregateDaily)
            .send();
        debug!("daily aggregate for {}: {:.2} Wh", day_start.date(), wh);
        Ok(())
    }
}

/// Spawn the poll loop; the interval is re-read every tick.
pub fn spawn_poller(poller: Arc<Poller>, mut stop: watch::Receiver<bool>) {
    actix_rt::spawn(async move {
        loop {
            let interval = poller.effective_interval().await;
            tokio::select! {
                _ = sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("poller: stop signal observed, exiting");
                        break;
                    }
                }
            }
            poller.tick().await;
        }
    });
}

/// Spawn the aggregation sweep loop.
pub fn spawn_aggregator(
    db: Arc<dyn DbClient>,
    metrics: Arc<StatsdClient>,
    sweep_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    actix_rt::spawn(async move {
        let mut aggregator = Aggregator::new(db, metrics);
        loop {
            tokio::select! {
                _ = sleep(sweep_interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("aggregator: stop signal observed, exiting");
                        break;
                    }
                }
            }
            aggregator.sweep(utc_now_secs()).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use nutify_common::db::SqliteDb;
    use nutify_common::metrics;
    use nutify_common::nut::{MockCommandRunner, NutBinaryPaths, ProcessOutput};
    use std::collections::{BTreeMap, HashMap};
    use tempfile::TempDir;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn statsd() -> Arc<StatsdClient> {
        Arc::new(metrics::builder("nutify", &None, 8125).unwrap())
    }

    #[test]
    fn test_derive_realpower_from_sample_nominal() {
        let mut numeric = BTreeMap::new();
        numeric.insert("ups_load".to_owned(), 25.0);
        numeric.insert("ups_realpower_nominal".to_owned(), 1000.0);
        derive_realpower(&mut numeric, Some(480.0), 1000.0);
        assert_eq!(numeric["ups_realpower"], 250.0);
    }

    #[test]
    fn test_derive_realpower_fallback_order() {
        // No sample nominal: fall back to the static row.
        let mut numeric = BTreeMap::new();
        numeric.insert("ups_load".to_owned(), 50.0);
        derive_realpower(&mut numeric, Some(480.0), 1000.0);
        assert_eq!(numeric["ups_realpower"], 240.0);

        // Neither: the configured default.
        let mut numeric = BTreeMap::new();
        numeric.insert("ups_load".to_owned(), 10.0);
        derive_realpower(&mut numeric, None, 1000.0);
        assert_eq!(numeric["ups_realpower"], 100.0);
    }

    #[test]
    fn test_derive_realpower_keeps_reported_nonzero() {
        let mut numeric = BTreeMap::new();
        numeric.insert("ups_load".to_owned(), 25.0);
        numeric.insert("ups_realpower".to_owned(), 123.4);
        derive_realpower(&mut numeric, None, 1000.0);
        assert_eq!(numeric["ups_realpower"], 123.4);

        // Zero is treated as absent.
        numeric.insert("ups_realpower".to_owned(), 0.0);
        derive_realpower(&mut numeric, None, 1000.0);
        assert_eq!(numeric["ups_realpower"], 250.0);
    }

    #[test]
    fn test_sample_from_vars_normalizes_and_excludes_static() {
        let mut vars = HashMap::new();
        vars.insert("ups.status".to_owned(), "OL".to_owned());
        vars.insert("battery.charge".to_owned(), "100".to_owned());
        vars.insert("device.model".to_owned(), "Back-UPS".to_owned());
        vars.insert("vendor.thing".to_owned(), "weird".to_owned());
        let sample = sample_from_vars(&vars, ts(10, 0, 0));

        assert_eq!(sample.numeric["battery_charge"], 100.0);
        assert_eq!(sample.text["ups_status"], "OL");
        assert_eq!(sample.text["vendor_thing"], "weird");
        assert!(!sample.text.contains_key("device_model"));
    }

    #[test]
    fn test_sample_from_vars_iso_dates() {
        let mut vars = HashMap::new();
        vars.insert("battery.date".to_owned(), "2020/01/15".to_owned());
        vars.insert("battery.mfr.date".to_owned(), "2019/11/02".to_owned());
        let sample = sample_from_vars(&vars, ts(10, 0, 0));
        assert_eq!(sample.text["battery_date"], "2020-01-15");
        assert_eq!(sample.text["battery_mfr_date"], "2019-11-02");
    }

    #[test]
    fn test_trapezoidal_integral_within_tolerance() {
        // Constant 250 W over one hour of minute samples = 250 Wh.
        let points: Vec<(NaiveDateTime, f64)> = (0..60)
            .map(|m| (ts(10, m, 0), 250.0))
            .collect();
        let wh = trapezoidal_wh(&points);
        // 59 complete minute intervals recorded.
        let expected = 250.0 * 59.0 / 60.0;
        assert!((wh - expected).abs() / expected < 0.01, "wh = {wh}");
    }

    #[test]
    fn test_trapezoidal_gap_contributes_zero() {
        let points = vec![
            (ts(0, 0, 0), 100.0),
            (ts(0, 30, 0), 100.0),
            // 3-hour gap: contributes nothing.
            (ts(3, 30, 0), 100.0),
            (ts(4, 0, 0), 100.0),
        ];
        let wh = trapezoidal_wh(&points);
        assert!((wh - 100.0).abs() < 1e-9, "wh = {wh}");
    }

    async fn seeded_db(dir: &TempDir) -> Arc<SqliteDb> {
        let db = SqliteDb::open(dir.path().join("nutify.db")).unwrap();
        db.ensure_schema().await.unwrap();
        Arc::new(db)
    }

    async fn poller_with(db: Arc<SqliteDb>, runner: MockCommandRunner) -> (Poller, Arc<BusHub>) {
        let nut = Arc::new(NutClient::new(Arc::new(runner), NutBinaryPaths::default()));
        let conf_dir = TempDir::new().unwrap();
        std::fs::write(
            conf_dir.path().join("upsmon.conf"),
            "MONITOR myups@localhost 1 mon pw primary\n",
        )
        .unwrap();
        let nut_config = Arc::new(NutConfigStore::new(conf_dir.path()));
        nut_config.refresh().await;
        let bus = Arc::new(BusHub::new(16, statsd()));
        let poller = Poller::new(
            db,
            nut,
            nut_config,
            Arc::clone(&bus),
            statsd(),
            Settings::test_settings(),
        );
        (poller, bus)
    }

    #[actix_rt::test]
    async fn test_clean_poll_appends_row_and_emits_sample() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir).await;

        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(ProcessOutput {
                exit_ok: true,
                exit_code: Some(0),
                stdout: "ups.status: OL\nbattery.charge: 100\nups.load: 25\nups.realpower.nominal: 1000\n"
                    .to_owned(),
                stderr: String::new(),
            })
        });
        let (poller, bus) = poller_with(Arc::clone(&db), runner).await;
        let mut rx = bus.subscribe();

        poller.initialize_static().await.unwrap();
        poller.tick().await;

        let stored = db.latest_sample().await.unwrap().unwrap();
        assert_eq!(stored.text_value("ups_status"), Some("OL"));
        assert_eq!(stored.numeric_value("battery_charge"), Some(100.0));
        assert_eq!(stored.numeric_value("ups_load"), Some(25.0));
        assert_eq!(stored.numeric_value("ups_realpower"), Some(250.0));
        assert!(stored.ups_realpower_hrs.is_none());

        match rx.try_recv().unwrap() {
            BusEvent::Sample { data } => {
                assert_eq!(data["ups_status"], "OL");
                assert_eq!(data["ups_realpower"], 250.0);
                assert!(data["timestamp"].is_string());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn test_failed_query_skips_tick() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir).await;
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(ProcessOutput {
                exit_ok: false,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "Data stale".to_owned(),
            })
        });
        let (poller, _bus) = poller_with(Arc::clone(&db), runner).await;
        poller.tick().await;
        assert!(db.latest_sample().await.unwrap().is_none());
    }

    #[actix_rt::test]
    async fn test_hourly_aggregation_end_to_end() {
        let dir = TempDir::new().unwrap();
        let db = seeded_db(&dir).await;
        db.insert_static_data(&Default::default()).await.unwrap();

        // One complete hour of minute samples at a constant 250 W.
        for m in 0..60 {
            let mut sample = DynamicSample {
                timestamp_utc: ts(10, m, 0),
                ..Default::default()
            };
            sample.numeric.insert("ups_realpower".to_owned(), 250.0);
            db.append_dynamic(&sample).await.unwrap();
        }

        let aggregator = Aggregator::new(Arc::clone(&db) as Arc<dyn DbClient>, statsd());
        aggregator.aggregate_hour(ts(10, 0, 0)).await.unwrap();

        let bucket = db.latest_sample().await.unwrap().unwrap();
        let wh = bucket.ups_realpower_hrs.unwrap();
        let expected = 250.0 * 59.0 / 60.0;
        assert!((wh - expected).abs() / expected < 0.01, "wh = {wh}");
    }
}
