//! Single-file SQLite implementation of [DbClient].
//!
//! Writes go through one connection behind a tokio mutex with short
//! transactions; reads open fresh connections so reporters and the API can
//! run while the poller appends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Map;
use tokio::sync::Mutex;

use crate::secret::{SecretError, SecretStore};

use super::client::{DbClient, SchemaReport};
use super::error::{DbError, DbResult};
use super::models::*;
use super::schema::{self, TableSpec};

const SQL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn ts_to_sql(ts: NaiveDateTime) -> String {
    ts.format(SQL_TIME_FORMAT).to_string()
}

pub struct SqliteDb {
    path: PathBuf,
    write: Mutex<Connection>,
    /// Used by the drift detector's decryption-integrity probe.
    secret: Option<Arc<SecretStore>>,
}

impl SqliteDb {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Self::configure(Connection::open(&path)?)?;
        Ok(Self {
            path,
            write: Mutex::new(conn),
            secret: None,
        })
    }

    pub fn with_secret_probe(mut self, secret: Arc<SecretStore>) -> Self {
        self.secret = Some(secret);
        self
    }

    fn configure(conn: Connection) -> DbResult<Connection> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// A fresh connection for readers.
    fn read_conn(&self) -> DbResult<Connection> {
        Self::configure(Connection::open(&self.path)?)
    }

    fn live_columns(conn: &Connection, table: &str) -> DbResult<HashMap<String, String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut columns = HashMap::new();
        for row in rows {
            let (name, column_type) = row?;
            columns.insert(name, column_type);
        }
        Ok(columns)
    }

    fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drop and recreate one optional table, applying the mail-config
    /// cascade when appropriate.
    fn recreate_table(
        conn: &Connection,
        spec: &TableSpec,
        report: &mut SchemaReport,
    ) -> DbResult<()> {
        warn!("Recreating drifted table {}", spec.name);
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", spec.name))?;
        conn.execute_batch(&spec.create_sql())?;
        report.recreated.push(spec.name.to_owned());

        if spec.name == schema::TABLE_MAIL_CONFIG {
            if Self::table_exists(conn, schema::TABLE_REPORT_SCHEDULES)? {
                let deleted = conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE mail_config_id IS NOT NULL",
                        schema::TABLE_REPORT_SCHEDULES
                    ),
                    [],
                )?;
                report.cascaded_schedules += deleted;
            }
            if Self::table_exists(conn, schema::TABLE_NOTIFICATION)? {
                let reset = conn.execute(
                    &format!(
                        "UPDATE {} SET id_email = NULL WHERE id_email IS NOT NULL",
                        schema::TABLE_NOTIFICATION
                    ),
                    [],
                )?;
                report.cascaded_notifications += reset;
            }
        }
        Ok(())
    }

    /// Probe stored ciphertexts; a KeyMismatch on an observably non-null
    /// field recreates the owning table.
    fn integrity_probe(
        &self,
        conn: &Connection,
        report: &mut SchemaReport,
    ) -> DbResult<()> {
        let Some(secret) = self.secret.as_ref() else {
            return Ok(());
        };
        let probes: &[(&str, &str)] = &[
            (schema::TABLE_MAIL_CONFIG, "password_enc"),
            (schema::TABLE_NTFY, "auth_token_enc"),
            (schema::TABLE_WEBHOOK, "auth_token_enc"),
        ];
        for (table, column) in probes {
            if report.recreated.iter().any(|t| t == table) {
                continue;
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT {column} FROM {table} WHERE {column} IS NOT NULL AND {column} != ''"
            ))?;
            let tokens: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<_, _>>()?;
            let mismatch = tokens
                .iter()
                .any(|t| matches!(secret.decrypt(t), Err(SecretError::KeyMismatch)));
            if mismatch {
                warn!(
                    "Encryption key mismatch in {}.{}; recreating table",
                    table, column
                );
                let spec = schema::optional_tables()
                    .into_iter()
                    .find(|s| s.name == *table)
                    .expect("probed table is declared");
                Self::recreate_table(conn, &spec, report)?;
            }
        }
        Ok(())
    }

    fn row_to_sample(row: &Row<'_>) -> rusqlite::Result<DynamicSample> {
        let mut sample = DynamicSample {
            id: Some(row.get("id")?),
            timestamp_utc: row.get("timestamp_utc")?,
            ups_realpower_hrs: row.get("ups_realpower_hrs")?,
            ups_realpower_days: row.get("ups_realpower_days")?,
            ..Default::default()
        };
        for column in schema::DYNAMIC_NUMERIC_COLUMNS {
            if let Some(value) = row.get::<_, Option<f64>>(*column)? {
                sample.numeric.insert((*column).to_owned(), value);
            }
        }
        for column in schema::DYNAMIC_TEXT_COLUMNS {
            if let Some(value) = row.get::<_, Option<String>>(*column)? {
                sample.text.insert((*column).to_owned(), value);
            }
        }
        if let Some(extra) = row.get::<_, Option<String>>("extra")? {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&extra) {
                sample.extra = map;
            }
        }
        Ok(sample)
    }

    fn row_to_event(row: &Row<'_>) -> rusqlite::Result<UpsEvent> {
        Ok(UpsEvent {
            id: row.get("id")?,
            timestamp_utc: row.get("timestamp_utc")?,
            timestamp_utc_begin: row.get("timestamp_utc_begin")?,
            timestamp_utc_end: row.get("timestamp_utc_end")?,
            ups_name: row.get("ups_name")?,
            event_type: row.get("event_type")?,
            event_message: row.get("event_message")?,
            source_ip: row.get("source_ip")?,
            acknowledged: row.get("acknowledged")?,
        })
    }

    fn row_to_mail_config(row: &Row<'_>) -> rusqlite::Result<MailConfig> {
        Ok(MailConfig {
            id: row.get("id")?,
            smtp_server: row.get("smtp_server")?,
            smtp_port: row.get::<_, i64>("smtp_port")? as u16,
            username: row.get("username")?,
            password_enc: row.get("password_enc")?,
            from_name: row.get("from_name")?,
            from_email: row.get("from_email")?,
            to_email: row.get("to_email")?,
            provider: row.get("provider")?,
            tls: row.get("tls")?,
            tls_starttls: row.get("tls_starttls")?,
            enabled: row.get("enabled")?,
        })
    }

    fn matrix_from_json(raw: Option<String>) -> EventMatrix {
        raw.and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn matrix_to_json(matrix: &EventMatrix) -> DbResult<String> {
        Ok(serde_json::to_string(matrix)?)
    }
}

#[async_trait]
impl DbClient for SqliteDb {
    async fn ensure_schema(&self) -> DbResult<SchemaReport> {
        let conn = self.write.lock().await;
        let mut report = SchemaReport::default();

        // Protected tables: created in place, never dropped.
        let static_spec = schema::static_table();
        if !Self::table_exists(&conn, static_spec.name)? {
            report.created.push(static_spec.name.to_owned());
        }
        conn.execute_batch(&static_spec.create_sql())?;
        if !Self::table_exists(&conn, schema::TABLE_DYNAMIC)? {
            report.created.push(schema::TABLE_DYNAMIC.to_owned());
        }
        conn.execute_batch(&schema::dynamic_create_sql())?;
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS ix_{0}_timestamp ON {0} (timestamp_utc)",
            schema::TABLE_DYNAMIC
        ))?;

        for spec in schema::optional_tables() {
            if Self::table_exists(&conn, spec.name)? {
                let live = Self::live_columns(&conn, spec.name)?;
                if spec.drifted(&live) {
                    Self::recreate_table(&conn, &spec, &mut report)?;
                }
            } else {
                conn.execute_batch(&spec.create_sql())?;
                report.created.push(spec.name.to_owned());
            }
        }

        self.integrity_probe(&conn, &mut report)?;

        if !report.recreated.is_empty() {
            info!(
                "Schema check recreated {} table(s): {}",
                report.recreated.len(),
                report.recreated.join(", ")
            );
        }
        Ok(report)
    }

    async fn get_static_data(&self) -> DbResult<Option<StaticData>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!("SELECT * FROM {} LIMIT 1", schema::TABLE_STATIC),
            [],
            |row| {
                Ok(StaticData {
                    device_model: row.get("device_model")?,
                    device_serial: row.get("device_serial")?,
                    device_mfr: row.get("device_mfr")?,
                    device_location: row.get("device_location")?,
                    ups_firmware: row.get("ups_firmware")?,
                    battery_type: row.get("battery_type")?,
                    battery_voltage_nominal: row.get("battery_voltage_nominal")?,
                    input_voltage_nominal: row.get("input_voltage_nominal")?,
                    output_voltage_nominal: row.get("output_voltage_nominal")?,
                    ups_power_nominal: row.get("ups_power_nominal")?,
                    ups_realpower_nominal: row.get("ups_realpower_nominal")?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn insert_static_data(&self, data: &StaticData) -> DbResult<()> {
        let conn = self.write.lock().await;
        let existing: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", schema::TABLE_STATIC),
            [],
            |row| row.get(0),
        )?;
        if existing > 0 {
            // Immutable after first populate.
            return Ok(());
        }
        conn.execute(
            &format!(
                "INSERT INTO {} (device_model, device_serial, device_mfr, device_location, \
                 ups_firmware, battery_type, battery_voltage_nominal, input_voltage_nominal, \
                 output_voltage_nominal, ups_power_nominal, ups_realpower_nominal) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                schema::TABLE_STATIC
            ),
            params![
                data.device_model,
                data.device_serial,
                data.device_mfr,
                data.device_location,
                data.ups_firmware,
                data.battery_type,
                data.battery_voltage_nominal,
                data.input_voltage_nominal,
                data.output_voltage_nominal,
                data.ups_power_nominal,
                data.ups_realpower_nominal,
            ],
        )?;
        Ok(())
    }

    async fn append_dynamic(&self, sample: &DynamicSample) -> DbResult<i64> {
        let conn = self.write.lock().await;

        let static_rows: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", schema::TABLE_STATIC),
            [],
            |row| row.get(0),
        )?;
        if static_rows == 0 {
            return Err(DbError::MissingStaticRow);
        }

        let last: Option<NaiveDateTime> = conn
            .query_row(
                &format!(
                    "SELECT timestamp_utc FROM {} ORDER BY timestamp_utc DESC LIMIT 1",
                    schema::TABLE_DYNAMIC
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(last) = last {
            if sample.timestamp_utc <= last {
                return Err(DbError::DuplicateSample(ts_to_sql(sample.timestamp_utc)));
            }
        }

        // Append is the single sample write path and owns the realpower
        // derivation; a caller that already derived it is a no-op here.
        let mut numeric = sample.numeric.clone();
        let static_nominal: Option<f64> = conn
            .query_row(
                &format!(
                    "SELECT ups_realpower_nominal, ups_power_nominal FROM {} LIMIT 1",
                    schema::TABLE_STATIC
                ),
                [],
                |row| {
                    Ok(row
                        .get::<_, Option<f64>>(0)?
                        .or(row.get::<_, Option<f64>>(1)?))
                },
            )
            .optional()?
            .flatten();
        derive_realpower(&mut numeric, static_nominal, crate::DEFAULT_NOMINAL_POWER_W);

        let mut columns: Vec<String> = vec!["timestamp_utc".to_owned()];
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(ts_to_sql(sample.timestamp_utc))];
        let mut extra: Map<String, serde_json::Value> = sample.extra.clone();

        for (key, value) in &numeric {
            if schema::is_dynamic_numeric(key) {
                columns.push(key.clone());
                values.push(SqlValue::Real(*value));
            } else {
                extra.insert(key.clone(), serde_json::json!(value));
            }
        }
        for (key, value) in &sample.text {
            if schema::is_dynamic_text(key) {
                columns.push(key.clone());
                values.push(SqlValue::Text(value.clone()));
            } else {
                extra.insert(key.clone(), serde_json::json!(value));
            }
        }
        if let Some(hrs) = sample.ups_realpower_hrs {
            columns.push("ups_realpower_hrs".to_owned());
            values.push(SqlValue::Real(hrs));
        }
        if let Some(days) = sample.ups_realpower_days {
            columns.push("ups_realpower_days".to_owned());
            values.push(SqlValue::Real(days));
        }
        if !extra.is_empty() {
            columns.push("extra".to_owned());
            values.push(SqlValue::Text(serde_json::to_string(&extra)?));
        }

        let placeholders: Vec<String> =
            (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema::TABLE_DYNAMIC,
            columns.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, params_from_iter(values))?;
        Ok(conn.last_insert_rowid())
    }

    async fn latest_sample(&self) -> DbResult<Option<DynamicSample>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT * FROM {} ORDER BY timestamp_utc DESC LIMIT 1",
                schema::TABLE_DYNAMIC
            ),
            [],
            |row| Self::row_to_sample(row),
        )
        .optional()
        .map_err(Into::into)
    }

    async fn samples_in_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> DbResult<Vec<DynamicSample>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE timestamp_utc >= ?1 AND timestamp_utc < ?2 \
             ORDER BY timestamp_utc ASC",
            schema::TABLE_DYNAMIC
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(from), ts_to_sql(to)], |row| {
            Self::row_to_sample(row)
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn set_sample_aggregates(
        &self,
        row_id: i64,
        hourly_wh: Option<f64>,
        daily_wh: Option<f64>,
    ) -> DbResult<()> {
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET \
                 ups_realpower_hrs = COALESCE(?1, ups_realpower_hrs), \
                 ups_realpower_days = COALESCE(?2, ups_realpower_days) \
                 WHERE id = ?3",
                schema::TABLE_DYNAMIC
            ),
            params![hourly_wh, daily_wh, row_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("sample row {row_id}")));
        }
        Ok(())
    }

    async fn insert_event(&self, event: &NewEvent) -> DbResult<i64> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (timestamp_utc, timestamp_utc_begin, timestamp_utc_end, \
                 ups_name, event_type, event_message, source_ip, acknowledged) \
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, 0)",
                schema::TABLE_EVENTS
            ),
            params![
                ts_to_sql(event.timestamp_utc),
                ts_to_sql(event.timestamp_utc),
                event.ups_name,
                event.event_type,
                event.event_message,
                event.source_ip,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn close_events(
        &self,
        ups_name: &str,
        event_types: &[String],
        end: NaiveDateTime,
    ) -> DbResult<usize> {
        if event_types.is_empty() {
            return Ok(0);
        }
        let conn = self.write.lock().await;
        let placeholders: Vec<String> = (3..3 + event_types.len())
            .map(|i| format!("?{i}"))
            .collect();
        let sql = format!(
            "UPDATE {} SET timestamp_utc_end = ?1 \
             WHERE ups_name = ?2 AND timestamp_utc_end IS NULL AND event_type IN ({})",
            schema::TABLE_EVENTS,
            placeholders.join(", ")
        );
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(ts_to_sql(end)),
            SqlValue::Text(ups_name.to_owned()),
        ];
        values.extend(event_types.iter().map(|t| SqlValue::Text(t.clone())));
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    async fn get_event(&self, id: i64) -> DbResult<Option<UpsEvent>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!("SELECT * FROM {} WHERE id = ?1", schema::TABLE_EVENTS),
            params![id],
            |row| Self::row_to_event(row),
        )
        .optional()
        .map_err(Into::into)
    }

    async fn open_event(&self, ups_name: &str, event_type: &str) -> DbResult<Option<UpsEvent>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT * FROM {} WHERE ups_name = ?1 AND event_type = ?2 \
                 AND timestamp_utc_end IS NULL \
                 ORDER BY timestamp_utc_begin DESC LIMIT 1",
                schema::TABLE_EVENTS
            ),
            params![ups_name, event_type],
            |row| Self::row_to_event(row),
        )
        .optional()
        .map_err(Into::into)
    }

    async fn recent_closed_event(
        &self,
        ups_name: &str,
        event_type: &str,
        since: NaiveDateTime,
    ) -> DbResult<Option<UpsEvent>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT * FROM {} WHERE ups_name = ?1 AND event_type = ?2 \
                 AND timestamp_utc_end IS NOT NULL AND timestamp_utc_begin >= ?3 \
                 ORDER BY timestamp_utc_begin DESC LIMIT 1",
                schema::TABLE_EVENTS
            ),
            params![ups_name, event_type, ts_to_sql(since)],
            |row| Self::row_to_event(row),
        )
        .optional()
        .map_err(Into::into)
    }

    async fn events_in_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> DbResult<Vec<UpsEvent>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE timestamp_utc >= ?1 AND timestamp_utc < ?2 \
             ORDER BY timestamp_utc ASC",
            schema::TABLE_EVENTS
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(from), ts_to_sql(to)], |row| {
            Self::row_to_event(row)
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn acknowledge_event(&self, id: i64) -> DbResult<()> {
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET acknowledged = 1 WHERE id = ?1",
                schema::TABLE_EVENTS
            ),
            params![id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn list_mail_configs(&self) -> DbResult<Vec<MailConfig>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY id ASC",
            schema::TABLE_MAIL_CONFIG
        ))?;
        let rows = stmt.query_map([], |row| Self::row_to_mail_config(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn get_mail_config(&self, id: i64) -> DbResult<Option<MailConfig>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!("SELECT * FROM {} WHERE id = ?1", schema::TABLE_MAIL_CONFIG),
            params![id],
            |row| Self::row_to_mail_config(row),
        )
        .optional()
        .map_err(Into::into)
    }

    async fn insert_mail_config(&self, config: &MailConfig) -> DbResult<i64> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (smtp_server, smtp_port, username, password_enc, from_name, \
                 from_email, to_email, provider, tls, tls_starttls, enabled) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                schema::TABLE_MAIL_CONFIG
            ),
            params![
                config.smtp_server,
                config.smtp_port,
                config.username,
                config.password_enc,
                config.from_name,
                config.from_email,
                config.to_email,
                config.provider,
                config.tls,
                config.tls_starttls,
                config.enabled,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_mail_config(&self, config: &MailConfig) -> DbResult<()> {
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET smtp_server = ?1, smtp_port = ?2, username = ?3, \
                 password_enc = ?4, from_name = ?5, from_email = ?6, to_email = ?7, \
                 provider = ?8, tls = ?9, tls_starttls = ?10, enabled = ?11 WHERE id = ?12",
                schema::TABLE_MAIL_CONFIG
            ),
            params![
                config.smtp_server,
                config.smtp_port,
                config.username,
                config.password_enc,
                config.from_name,
                config.from_email,
                config.to_email,
                config.provider,
                config.tls,
                config.tls_starttls,
                config.enabled,
                config.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("mail config {}", config.id)));
        }
        Ok(())
    }

    async fn delete_mail_config(&self, id: i64) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", schema::TABLE_MAIL_CONFIG),
            params![id],
        )?;
        // Deleting a transport orphans anything pointing at it.
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE mail_config_id = ?1",
                schema::TABLE_REPORT_SCHEDULES
            ),
            params![id],
        )?;
        conn.execute(
            &format!(
                "UPDATE {} SET id_email = NULL WHERE id_email = ?1",
                schema::TABLE_NOTIFICATION
            ),
            params![id],
        )?;
        Ok(())
    }

    async fn list_ntfy_configs(&self) -> DbResult<Vec<NtfyConfig>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY id ASC",
            schema::TABLE_NTFY
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(NtfyConfig {
                id: row.get("id")?,
                server: row.get("server")?,
                topic: row.get("topic")?,
                use_auth: row.get("use_auth")?,
                auth_user: row.get("auth_user")?,
                auth_token_enc: row.get("auth_token_enc")?,
                enabled: row.get("enabled")?,
                event_matrix: Self::matrix_from_json(row.get("event_matrix")?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn insert_ntfy_config(&self, config: &NtfyConfig) -> DbResult<i64> {
        let matrix = Self::matrix_to_json(&config.event_matrix)?;
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (server, topic, use_auth, auth_user, auth_token_enc, enabled, \
                 event_matrix) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                schema::TABLE_NTFY
            ),
            params![
                config.server,
                config.topic,
                config.use_auth,
                config.auth_user,
                config.auth_token_enc,
                config.enabled,
                matrix,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_ntfy_config(&self, config: &NtfyConfig) -> DbResult<()> {
        let matrix = Self::matrix_to_json(&config.event_matrix)?;
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET server = ?1, topic = ?2, use_auth = ?3, auth_user = ?4, \
                 auth_token_enc = ?5, enabled = ?6, event_matrix = ?7 WHERE id = ?8",
                schema::TABLE_NTFY
            ),
            params![
                config.server,
                config.topic,
                config.use_auth,
                config.auth_user,
                config.auth_token_enc,
                config.enabled,
                matrix,
                config.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("ntfy config {}", config.id)));
        }
        Ok(())
    }

    async fn delete_ntfy_config(&self, id: i64) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", schema::TABLE_NTFY),
            params![id],
        )?;
        Ok(())
    }

    async fn list_webhook_configs(&self) -> DbResult<Vec<WebhookConfig>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY id ASC",
            schema::TABLE_WEBHOOK
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(WebhookConfig {
                id: row.get("id")?,
                name: row.get("name")?,
                url: row.get("url")?,
                auth_type: row.get("auth_type")?,
                auth_user: row.get("auth_user")?,
                auth_token_enc: row.get("auth_token_enc")?,
                verify_ssl: row.get("verify_ssl")?,
                enabled: row.get("enabled")?,
                event_matrix: Self::matrix_from_json(row.get("event_matrix")?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn insert_webhook_config(&self, config: &WebhookConfig) -> DbResult<i64> {
        let matrix = Self::matrix_to_json(&config.event_matrix)?;
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (name, url, auth_type, auth_user, auth_token_enc, verify_ssl, \
                 enabled, event_matrix) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                schema::TABLE_WEBHOOK
            ),
            params![
                config.name,
                config.url,
                config.auth_type,
                config.auth_user,
                config.auth_token_enc,
                config.verify_ssl,
                config.enabled,
                matrix,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_webhook_config(&self, config: &WebhookConfig) -> DbResult<()> {
        let matrix = Self::matrix_to_json(&config.event_matrix)?;
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET name = ?1, url = ?2, auth_type = ?3, auth_user = ?4, \
                 auth_token_enc = ?5, verify_ssl = ?6, enabled = ?7, event_matrix = ?8 \
                 WHERE id = ?9",
                schema::TABLE_WEBHOOK
            ),
            params![
                config.name,
                config.url,
                config.auth_type,
                config.auth_user,
                config.auth_token_enc,
                config.verify_ssl,
                config.enabled,
                matrix,
                config.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("webhook config {}", config.id)));
        }
        Ok(())
    }

    async fn delete_webhook_config(&self, id: i64) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", schema::TABLE_WEBHOOK),
            params![id],
        )?;
        Ok(())
    }

    async fn list_notification_settings(&self) -> DbResult<Vec<NotificationSetting>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY id ASC",
            schema::TABLE_NOTIFICATION
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(NotificationSetting {
                id: row.get("id")?,
                event_type: row.get("event_type")?,
                enabled: row.get("enabled")?,
                id_email: row.get("id_email")?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn get_notification_setting(
        &self,
        event_type: &str,
    ) -> DbResult<Option<NotificationSetting>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT * FROM {} WHERE event_type = ?1",
                schema::TABLE_NOTIFICATION
            ),
            params![event_type],
            |row| {
                Ok(NotificationSetting {
                    id: row.get("id")?,
                    event_type: row.get("event_type")?,
                    enabled: row.get("enabled")?,
                    id_email: row.get("id_email")?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn upsert_notification_setting(&self, setting: &NotificationSetting) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (event_type, enabled, id_email) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (event_type) DO UPDATE SET enabled = ?2, id_email = ?3",
                schema::TABLE_NOTIFICATION
            ),
            params![setting.event_type, setting.enabled, setting.id_email],
        )?;
        Ok(())
    }

    async fn get_variable_config(&self) -> DbResult<VariableConfig> {
        let conn = self.read_conn()?;
        let config = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} ORDER BY id ASC LIMIT 1",
                    schema::TABLE_VARIABLE_CONFIG
                ),
                [],
                |row| {
                    Ok(VariableConfig {
                        currency: row.get("currency")?,
                        price_per_kwh: row.get("price_per_kwh")?,
                        co2_factor: row.get("co2_factor")?,
                        polling_interval_secs: row
                            .get::<_, Option<i64>>("polling_interval_secs")?
                            .map(|v| v as u64),
                    })
                },
            )
            .optional()?;
        Ok(config.unwrap_or_default())
    }

    async fn save_variable_config(&self, config: &VariableConfig) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!("DELETE FROM {}", schema::TABLE_VARIABLE_CONFIG),
            [],
        )?;
        conn.execute(
            &format!(
                "INSERT INTO {} (currency, price_per_kwh, co2_factor, polling_interval_secs) \
                 VALUES (?1, ?2, ?3, ?4)",
                schema::TABLE_VARIABLE_CONFIG
            ),
            params![
                config.currency,
                config.price_per_kwh,
                config.co2_factor,
                config.polling_interval_secs.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    async fn list_report_schedules(&self) -> DbResult<Vec<ReportSchedule>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY id ASC",
            schema::TABLE_REPORT_SCHEDULES
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(ReportSchedule {
                id: row.get("id")?,
                cron_expression: row.get("cron_expression")?,
                period_type: row.get("period_type")?,
                sections: row.get("sections")?,
                recipients: row.get("recipients")?,
                mail_config_id: row.get("mail_config_id")?,
                last_run: row.get("last_run")?,
                enabled: row.get("enabled")?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn get_report_schedule(&self, id: i64) -> DbResult<Option<ReportSchedule>> {
        let schedules = self.list_report_schedules().await?;
        Ok(schedules.into_iter().find(|s| s.id == id))
    }

    async fn insert_report_schedule(&self, schedule: &ReportSchedule) -> DbResult<i64> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (cron_expression, period_type, sections, recipients, \
                 mail_config_id, last_run, enabled) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                schema::TABLE_REPORT_SCHEDULES
            ),
            params![
                schedule.cron_expression,
                schedule.period_type,
                schedule.sections,
                schedule.recipients,
                schedule.mail_config_id,
                schedule.last_run.map(ts_to_sql),
                schedule.enabled,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_report_schedule(&self, schedule: &ReportSchedule) -> DbResult<()> {
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET cron_expression = ?1, period_type = ?2, sections = ?3, \
                 recipients = ?4, mail_config_id = ?5, last_run = ?6, enabled = ?7 WHERE id = ?8",
                schema::TABLE_REPORT_SCHEDULES
            ),
            params![
                schedule.cron_expression,
                schedule.period_type,
                schedule.sections,
                schedule.recipients,
                schedule.mail_config_id,
                schedule.last_run.map(ts_to_sql),
                schedule.enabled,
                schedule.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("report schedule {}", schedule.id)));
        }
        Ok(())
    }

    async fn delete_report_schedule(&self, id: i64) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1",
                schema::TABLE_REPORT_SCHEDULES
            ),
            params![id],
        )?;
        Ok(())
    }

    async fn set_schedule_last_run(&self, id: i64, last_run: NaiveDateTime) -> DbResult<()> {
        let conn = self.write.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET last_run = ?1 WHERE id = ?2",
                schema::TABLE_REPORT_SCHEDULES
            ),
            params![ts_to_sql(last_run), id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("report schedule {id}")));
        }
        Ok(())
    }

    async fn get_initial_setup(&self) -> DbResult<Option<InitialSetup>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT * FROM {} ORDER BY id ASC LIMIT 1",
                schema::TABLE_INITIAL_SETUP
            ),
            [],
            |row| {
                Ok(InitialSetup {
                    server_name: row.get("server_name")?,
                    timezone: row.get("timezone")?,
                    is_configured: row.get("is_configured")?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn save_initial_setup(&self, setup: &InitialSetup) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(&format!("DELETE FROM {}", schema::TABLE_INITIAL_SETUP), [])?;
        conn.execute(
            &format!(
                "INSERT INTO {} (server_name, timezone, is_configured) VALUES (?1, ?2, ?3)",
                schema::TABLE_INITIAL_SETUP
            ),
            params![setup.server_name, setup.timezone, setup.is_configured],
        )?;
        Ok(())
    }

    async fn get_login_auth(&self) -> DbResult<Option<LoginAuth>> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT * FROM {} ORDER BY id ASC LIMIT 1",
                schema::TABLE_LOGIN_AUTH
            ),
            [],
            |row| {
                Ok(LoginAuth {
                    username: row.get("username")?,
                    password_hash: row.get("password_hash")?,
                    totp_secret_enc: row.get("totp_secret_enc")?,
                    totp_enabled: row.get("totp_enabled")?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn save_login_auth(&self, auth: &LoginAuth) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute(&format!("DELETE FROM {}", schema::TABLE_LOGIN_AUTH), [])?;
        conn.execute(
            &format!(
                "INSERT INTO {} (username, password_hash, totp_secret_enc, totp_enabled) \
                 VALUES (?1, ?2, ?3, ?4)",
                schema::TABLE_LOGIN_AUTH
            ),
            params![
                auth.username,
                auth.password_hash,
                auth.totp_secret_enc,
                auth.totp_enabled
            ],
        )?;
        Ok(())
    }

    async fn insert_command_log(&self, log: &CommandLog) -> DbResult<i64> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (timestamp_utc, command, success, output) \
                 VALUES (?1, ?2, ?3, ?4)",
                schema::TABLE_COMMANDS
            ),
            params![
                ts_to_sql(log.timestamp_utc),
                log.command,
                log.success,
                log.output
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn recent_command_logs(&self, limit: u32) -> DbResult<Vec<CommandLog>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY timestamp_utc DESC LIMIT ?1",
            schema::TABLE_COMMANDS
        ))?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(CommandLog {
                id: row.get("id")?,
                timestamp_utc: row.get("timestamp_utc")?,
                command: row.get("command")?,
                success: row.get("success")?,
                output: row.get("output")?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn command_stats(&self) -> DbResult<CommandStats> {
        let conn = self.read_conn()?;
        conn.query_row(
            &format!(
                "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN success THEN 0 ELSE 1 END), 0) \
                 FROM {}",
                schema::TABLE_COMMANDS
            ),
            [],
            |row| {
                Ok(CommandStats {
                    total: row.get::<_, i64>(0)? as u64,
                    successful: row.get::<_, i64>(1)? as u64,
                    failed: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(Into::into)
    }

    async fn insert_variable_log(&self, log: &VariableLog) -> DbResult<i64> {
        let conn = self.write.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO {} (timestamp_utc, name, old_value, new_value, success) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                schema::TABLE_VARIABLES
            ),
            params![
                ts_to_sql(log.timestamp_utc),
                log.name,
                log.old_value,
                log.new_value,
                log.success
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn recent_variable_logs(&self, limit: u32) -> DbResult<Vec<VariableLog>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY timestamp_utc DESC LIMIT ?1",
            schema::TABLE_VARIABLES
        ))?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(VariableLog {
                id: row.get("id")?,
                timestamp_utc: row.get("timestamp_utc")?,
                name: row.get("name")?,
                old_value: row.get("old_value")?,
                new_value: row.get("new_value")?,
                success: row.get("success")?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn database_stats(&self) -> DbResult<DatabaseStats> {
        let conn = self.read_conn()?;
        let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        // Tables carrying a timestamp also report their newest write.
        let timestamped = [
            schema::TABLE_DYNAMIC,
            schema::TABLE_EVENTS,
            schema::TABLE_COMMANDS,
            schema::TABLE_VARIABLES,
        ];
        let mut table_names = vec![schema::TABLE_STATIC, schema::TABLE_DYNAMIC];
        table_names.extend(schema::optional_tables().iter().map(|spec| spec.name));

        let mut stats = DatabaseStats {
            size_bytes,
            ..Default::default()
        };
        for name in table_names {
            if !Self::table_exists(&conn, name)? {
                continue;
            }
            let record_count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| {
                    row.get(0)
                })?;
            let last_write: Option<NaiveDateTime> = if timestamped.contains(&name) {
                conn.query_row(
                    &format!("SELECT MAX(timestamp_utc) FROM {name}"),
                    [],
                    |row| row.get(0),
                )?
            } else {
                None
            };
            stats.total_records += record_count as u64;
            if let Some(write) = last_write {
                if stats.last_write.map(|prev| write > prev).unwrap_or(true) {
                    stats.last_write = Some(write);
                }
            }
            stats.tables.push(TableStats {
                name: name.to_owned(),
                record_count: record_count as u64,
                last_write,
            });
        }
        Ok(stats)
    }

    async fn optimize(&self) -> DbResult<()> {
        let conn = self.write.lock().await;
        conn.execute_batch("ANALYZE; VACUUM;")?;
        Ok(())
    }

    async fn backup_to(&self, backup_dir: &str) -> DbResult<String> {
        // Flush the WAL and hold the writer while the file is copied.
        let conn = self.write.lock().await;
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;

        std::fs::create_dir_all(backup_dir)
            .map_err(|e| DbError::General(format!("cannot create backup dir: {e}")))?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = Path::new(backup_dir).join(format!("nutify_backup_{stamp}.db"));
        std::fs::copy(&self.path, &backup_path)
            .map_err(|e| DbError::General(format!("backup copy failed: {e}")))?;
        Ok(backup_path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    async fn open_db(dir: &TempDir) -> SqliteDb {
        let db = SqliteDb::open(dir.path().join("nutify.db")).unwrap();
        db.ensure_schema().await.unwrap();
        db
    }

    async fn seed_static(db: &SqliteDb) {
        db.insert_static_data(&StaticData {
            device_model: Some("Back-UPS 950".to_owned()),
            ups_realpower_nominal: Some(480.0),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    fn sample_at(ts: NaiveDateTime) -> DynamicSample {
        let mut sample = DynamicSample {
            timestamp_utc: ts,
            ..Default::default()
        };
        sample.numeric.insert("battery_charge".to_owned(), 100.0);
        sample.numeric.insert("ups_load".to_owned(), 25.0);
        sample.text.insert("ups_status".to_owned(), "OL".to_owned());
        sample
    }

    #[actix_rt::test]
    async fn test_schema_created_once() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        assert!(db
            .ensure_schema()
            .await
            .unwrap()
            .recreated
            .is_empty());
    }

    #[actix_rt::test]
    async fn test_static_row_is_immutable() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        seed_static(&db).await;
        db.insert_static_data(&StaticData {
            device_model: Some("other".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();
        let data = db.get_static_data().await.unwrap().unwrap();
        assert_eq!(data.device_model.as_deref(), Some("Back-UPS 950"));
    }

    #[actix_rt::test]
    async fn test_append_requires_static_row() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        let err = db.append_dynamic(&sample_at(ts(10, 0, 0))).await.unwrap_err();
        assert!(matches!(err, DbError::MissingStaticRow));
    }

    #[actix_rt::test]
    async fn test_append_monotonic_and_duplicate_rejection() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        seed_static(&db).await;

        db.append_dynamic(&sample_at(ts(10, 0, 0))).await.unwrap();
        db.append_dynamic(&sample_at(ts(10, 0, 1))).await.unwrap();

        // Same second
        let err = db.append_dynamic(&sample_at(ts(10, 0, 1))).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateSample(_)));
        // Going backwards
        let err = db.append_dynamic(&sample_at(ts(9, 59, 59))).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateSample(_)));

        let rows = db
            .samples_in_range(ts(10, 0, 0), ts(11, 0, 0))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].timestamp_utc < rows[1].timestamp_utc);
    }

    #[actix_rt::test]
    async fn test_append_derives_realpower() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        seed_static(&db).await;

        // No ups_realpower in the sample: derived from the static nominal.
        db.append_dynamic(&sample_at(ts(10, 0, 0))).await.unwrap();
        let stored = db.latest_sample().await.unwrap().unwrap();
        // 480 W nominal × 25 % load
        assert_eq!(stored.numeric_value("ups_realpower"), Some(120.0));

        // A sample-level nominal wins over the static row.
        let mut sample = sample_at(ts(10, 0, 1));
        sample
            .numeric
            .insert("ups_realpower_nominal".to_owned(), 1000.0);
        db.append_dynamic(&sample).await.unwrap();
        let stored = db.latest_sample().await.unwrap().unwrap();
        assert_eq!(stored.numeric_value("ups_realpower"), Some(250.0));

        // A reported non-zero value is kept as is.
        let mut sample = sample_at(ts(10, 0, 2));
        sample.numeric.insert("ups_realpower".to_owned(), 123.4);
        db.append_dynamic(&sample).await.unwrap();
        let stored = db.latest_sample().await.unwrap().unwrap();
        assert_eq!(stored.numeric_value("ups_realpower"), Some(123.4));
    }

    #[actix_rt::test]
    async fn test_unknown_keys_ride_in_extra() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        seed_static(&db).await;

        let mut sample = sample_at(ts(10, 0, 0));
        sample
            .numeric
            .insert("vendor_fan_speed".to_owned(), 1200.0);
        sample
            .text
            .insert("vendor_mode".to_owned(), "eco".to_owned());
        db.append_dynamic(&sample).await.unwrap();

        let stored = db.latest_sample().await.unwrap().unwrap();
        assert_eq!(stored.numeric_value("battery_charge"), Some(100.0));
        assert_eq!(stored.extra["vendor_fan_speed"], 1200.0);
        assert_eq!(stored.extra["vendor_mode"], "eco");
    }

    #[actix_rt::test]
    async fn test_aggregate_write() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        seed_static(&db).await;

        let row_id = db.append_dynamic(&sample_at(ts(10, 59, 0))).await.unwrap();
        db.set_sample_aggregates(row_id, Some(245.5), None)
            .await
            .unwrap();
        let stored = db.latest_sample().await.unwrap().unwrap();
        assert_eq!(stored.ups_realpower_hrs, Some(245.5));
        assert_eq!(stored.ups_realpower_days, None);
    }

    #[actix_rt::test]
    async fn test_event_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        let id = db
            .insert_event(&NewEvent {
                timestamp_utc: ts(10, 0, 0),
                ups_name: "ups@localhost".to_owned(),
                event_type: "ONBATT".to_owned(),
                event_message: Some("on battery".to_owned()),
                source_ip: None,
            })
            .await
            .unwrap();

        let open = db.open_event("ups@localhost", "ONBATT").await.unwrap();
        assert_eq!(open.unwrap().id, id);

        let closed = db
            .close_events(
                "ups@localhost",
                &["ONBATT".to_owned()],
                ts(10, 2, 0),
            )
            .await
            .unwrap();
        assert_eq!(closed, 1);
        assert!(db
            .open_event("ups@localhost", "ONBATT")
            .await
            .unwrap()
            .is_none());

        let recent = db
            .recent_closed_event("ups@localhost", "ONBATT", ts(9, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recent.timestamp_utc_end, Some(ts(10, 2, 0)));
    }

    #[actix_rt::test]
    async fn test_ntfy_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        let mut matrix = EventMatrix::new();
        matrix.insert("ONBATT".to_owned(), true);
        matrix.insert("ONLINE".to_owned(), false);
        let id = db
            .insert_ntfy_config(&NtfyConfig {
                server: "https://ntfy.sh".to_owned(),
                topic: "ups-alerts".to_owned(),
                use_auth: true,
                auth_user: Some("ops".to_owned()),
                auth_token_enc: Some("token".to_owned()),
                enabled: true,
                event_matrix: matrix,
                ..Default::default()
            })
            .await
            .unwrap();

        let configs = db.list_ntfy_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        let mut config = configs.into_iter().next().unwrap();
        assert_eq!(config.id, id);
        assert_eq!(config.event_matrix.get("ONBATT"), Some(&true));
        assert_eq!(config.event_matrix.get("ONLINE"), Some(&false));

        config.topic = "ups-critical".to_owned();
        db.update_ntfy_config(&config).await.unwrap();
        assert_eq!(
            db.list_ntfy_configs().await.unwrap()[0].topic,
            "ups-critical"
        );

        db.delete_ntfy_config(id).await.unwrap();
        assert!(db.list_ntfy_configs().await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_webhook_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        let mut matrix = EventMatrix::new();
        matrix.insert("COMMBAD".to_owned(), true);
        let id = db
            .insert_webhook_config(&WebhookConfig {
                name: "monitoring".to_owned(),
                url: "https://hooks.internal/ups".to_owned(),
                auth_type: Some("bearer".to_owned()),
                verify_ssl: false,
                enabled: true,
                event_matrix: matrix,
                ..Default::default()
            })
            .await
            .unwrap();

        let config = db.list_webhook_configs().await.unwrap().remove(0);
        assert_eq!(config.id, id);
        assert!(!config.verify_ssl);
        assert_eq!(config.event_matrix.get("COMMBAD"), Some(&true));

        db.delete_webhook_config(id).await.unwrap();
        assert!(db.list_webhook_configs().await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_notification_setting_upsert() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        db.upsert_notification_setting(&NotificationSetting {
            event_type: "ONBATT".to_owned(),
            enabled: true,
            id_email: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
        // Second upsert for the same event type replaces, not duplicates.
        db.upsert_notification_setting(&NotificationSetting {
            event_type: "ONBATT".to_owned(),
            enabled: false,
            id_email: None,
            ..Default::default()
        })
        .await
        .unwrap();

        let settings = db.list_notification_settings().await.unwrap();
        assert_eq!(settings.len(), 1);
        assert!(!settings[0].enabled);
        assert_eq!(settings[0].id_email, None);
    }

    #[actix_rt::test]
    async fn test_initial_setup_and_login_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        assert!(db.get_initial_setup().await.unwrap().is_none());
        db.save_initial_setup(&InitialSetup {
            server_name: "rack-4".to_owned(),
            timezone: "Europe/Rome".to_owned(),
            is_configured: true,
        })
        .await
        .unwrap();
        let setup = db.get_initial_setup().await.unwrap().unwrap();
        assert_eq!(setup.server_name, "rack-4");
        assert_eq!(setup.timezone, "Europe/Rome");

        db.save_login_auth(&LoginAuth {
            username: "admin".to_owned(),
            password_hash: "$argon2id$stub".to_owned(),
            totp_secret_enc: None,
            totp_enabled: false,
        })
        .await
        .unwrap();
        let auth = db.get_login_auth().await.unwrap().unwrap();
        assert_eq!(auth.username, "admin");
        assert!(!auth.totp_enabled);
    }

    #[actix_rt::test]
    async fn test_report_schedule_crud() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        let id = db
            .insert_report_schedule(&ReportSchedule {
                cron_expression: "0 7 * * 1".to_owned(),
                period_type: "weekly".to_owned(),
                sections: "energy,events".to_owned(),
                recipients: "ops@example.com".to_owned(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let mut schedule = db.get_report_schedule(id).await.unwrap().unwrap();
        assert!(schedule.last_run.is_none());

        db.set_schedule_last_run(id, ts(7, 0, 0)).await.unwrap();
        schedule = db.get_report_schedule(id).await.unwrap().unwrap();
        assert_eq!(schedule.last_run, Some(ts(7, 0, 0)));

        schedule.enabled = false;
        db.update_report_schedule(&schedule).await.unwrap();
        assert!(!db.get_report_schedule(id).await.unwrap().unwrap().enabled);

        db.delete_report_schedule(id).await.unwrap();
        assert!(db.get_report_schedule(id).await.unwrap().is_none());
    }

    #[actix_rt::test]
    async fn test_drift_recreates_and_cascades() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        let mail_id = db
            .insert_mail_config(&MailConfig {
                smtp_server: "smtp.example.com".to_owned(),
                smtp_port: 587,
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        db.insert_report_schedule(&ReportSchedule {
            cron_expression: "0 7 * * *".to_owned(),
            period_type: "daily".to_owned(),
            sections: "energy".to_owned(),
            mail_config_id: Some(mail_id),
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();
        db.upsert_notification_setting(&NotificationSetting {
            event_type: "ONBATT".to_owned(),
            enabled: true,
            id_email: Some(mail_id),
            ..Default::default()
        })
        .await
        .unwrap();

        // Simulate drift: rebuild the mail table without to_email.
        {
            let conn = db.write.lock().await;
            conn.execute_batch(
                "DROP TABLE ups_opt_mail_config;\
                 CREATE TABLE ups_opt_mail_config (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, smtp_server TEXT, smtp_port INTEGER)",
            )
            .unwrap();
        }

        let report = db.ensure_schema().await.unwrap();
        assert!(report
            .recreated
            .contains(&schema::TABLE_MAIL_CONFIG.to_owned()));
        assert_eq!(report.cascaded_schedules, 1);
        assert_eq!(report.cascaded_notifications, 1);

        assert!(db.list_mail_configs().await.unwrap().is_empty());
        assert!(db.list_report_schedules().await.unwrap().is_empty());
        let setting = db
            .get_notification_setting("ONBATT")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(setting.id_email, None);
    }

    #[actix_rt::test]
    async fn test_key_mismatch_probe_recreates() {
        let dir = TempDir::new().unwrap();
        let store_a = Arc::new(SecretStore::new("secret-a"));
        let store_b = Arc::new(SecretStore::new("secret-b"));

        let db = SqliteDb::open(dir.path().join("nutify.db"))
            .unwrap()
            .with_secret_probe(store_a.clone());
        db.ensure_schema().await.unwrap();
        db.insert_mail_config(&MailConfig {
            smtp_server: "smtp.example.com".to_owned(),
            smtp_port: 465,
            password_enc: Some(store_a.encrypt("hunter2")),
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();
        drop(db);

        // Reopen under a different process secret.
        let db = SqliteDb::open(dir.path().join("nutify.db"))
            .unwrap()
            .with_secret_probe(store_b);
        let report = db.ensure_schema().await.unwrap();
        assert!(report
            .recreated
            .contains(&schema::TABLE_MAIL_CONFIG.to_owned()));
        assert!(db.list_mail_configs().await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_variable_config_default_and_save() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        let config = db.get_variable_config().await.unwrap();
        assert_eq!(config.price_per_kwh, 0.25);

        db.save_variable_config(&VariableConfig {
            price_per_kwh: 0.32,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(db.get_variable_config().await.unwrap().price_per_kwh, 0.32);
    }

    #[actix_rt::test]
    async fn test_database_stats_and_backup() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        seed_static(&db).await;
        db.append_dynamic(&sample_at(ts(10, 0, 0))).await.unwrap();
        db.append_dynamic(&sample_at(ts(10, 1, 0))).await.unwrap();

        let stats = db.database_stats().await.unwrap();
        assert!(stats.size_bytes > 0);
        assert!(stats.total_records >= 3);
        assert_eq!(stats.last_write, Some(ts(10, 1, 0)));
        let dynamic = stats
            .tables
            .iter()
            .find(|t| t.name == schema::TABLE_DYNAMIC)
            .unwrap();
        assert_eq!(dynamic.record_count, 2);

        db.optimize().await.unwrap();

        let backup_dir = dir.path().join("backups");
        let backup_path = db
            .backup_to(backup_dir.to_str().unwrap())
            .await
            .unwrap();
        assert!(std::path::Path::new(&backup_path).exists());

        // The backup is a usable database with the same rows.
        let restored = SqliteDb::open(&backup_path).unwrap();
        assert!(restored.latest_sample().await.unwrap().is_some());
    }

    #[actix_rt::test]
    async fn test_command_audit_and_stats() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;

        db.insert_command_log(&CommandLog {
            id: 0,
            timestamp_utc: ts(10, 0, 0),
            command: "beeper.disable".to_owned(),
            success: true,
            output: Some("OK".to_owned()),
        })
        .await
        .unwrap();
        db.insert_command_log(&CommandLog {
            id: 0,
            timestamp_utc: ts(10, 1, 0),
            command: "test.battery.start".to_owned(),
            success: false,
            output: Some("denied".to_owned()),
        })
        .await
        .unwrap();

        let stats = db.command_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);

        let logs = db.recent_command_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].command, "test.battery.start");
    }
}
