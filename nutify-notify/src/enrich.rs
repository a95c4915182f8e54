//! Builds the [EnrichedEvent] content model: telemetry snapshot plus
//! duration metrics for interval-closing events.

use std::str::FromStr;

use chrono::NaiveDateTime;
use chrono_tz::Tz;

use nutify_common::db::models::{DynamicSample, StaticData};
use nutify_common::db::DbClient;
use nutify_common::events::EventType;
use nutify_common::notification::{humanize_duration, EnrichedEvent};
use nutify_common::util::to_local;

use crate::error::ApiResult;

/// How far back a closed interval may start and still be reported as "the"
/// interval this event terminated.
const DURATION_LOOKBACK_SECS: i64 = 60 * 60;

/// Estimated runtime in whole minutes.
///
/// Fallback chain: `battery_runtime` (seconds), `battery_runtime_low`
/// (seconds), then a charge-derived estimate of one minute per percent.
pub fn runtime_minutes(sample: &DynamicSample) -> Option<i64> {
    if let Some(runtime) = sample.numeric_value("battery_runtime") {
        return Some((runtime / 60.0).round() as i64);
    }
    if let Some(runtime_low) = sample.numeric_value("battery_runtime_low") {
        return Some((runtime_low / 60.0).round() as i64);
    }
    sample
        .numeric_value("battery_charge")
        .map(|charge| charge.round() as i64)
}

/// Apply the telemetry snapshot from the latest sample.
fn apply_sample(event: &mut EnrichedEvent, sample: &DynamicSample) {
    event.ups_status = sample.text_value("ups_status").map(str::to_owned);
    event.battery_charge = sample
        .numeric_value("battery_charge")
        .map(|c| format!("{:.0}%", c));
    event.battery_voltage = sample.numeric_value("battery_voltage");
    event.input_voltage = sample.numeric_value("input_voltage");
    event.output_voltage = sample.numeric_value("output_voltage");
    event.ups_load = sample.numeric_value("ups_load");
    event.ups_realpower = sample.numeric_value("ups_realpower");
    event.runtime_minutes = runtime_minutes(sample);
}

fn apply_static(event: &mut EnrichedEvent, data: &StaticData) {
    event.ups_model = data.device_model.clone();
    event.ups_serial = data.device_serial.clone();
    event.ups_manufacturer = data.device_mfr.clone();
    event.ups_firmware = data.ups_firmware.clone();
    event.ups_location = data.device_location.clone();
}

/// The interval an incoming terminator event closed: the still-open row if
/// the close pass has not run, otherwise the most recent closed row that
/// began within the lookback window.
async fn closed_interval_duration(
    db: &dyn DbClient,
    ups_name: &str,
    opener: EventType,
    now: NaiveDateTime,
) -> ApiResult<Option<String>> {
    let opener = opener.to_string();
    let begin = match db.open_event(ups_name, &opener).await? {
        Some(open) => Some(open.timestamp_utc_begin),
        None => db
            .recent_closed_event(
                ups_name,
                &opener,
                now - chrono::Duration::seconds(DURATION_LOOKBACK_SECS),
            )
            .await?
            .map(|closed| closed.timestamp_utc_begin),
    };
    Ok(begin.map(|begin| humanize_duration((now - begin).num_seconds())))
}

/// Assemble the full content model for a freshly persisted event.
#[allow(clippy::too_many_arguments)]
pub async fn enrich(
    db: &dyn DbClient,
    event_id: i64,
    ups_name: &str,
    event_type: &str,
    event_message: &str,
    source_ip: Option<String>,
    now: NaiveDateTime,
    tz: Tz,
    server_name: Option<String>,
) -> ApiResult<EnrichedEvent> {
    let local = to_local(now, tz);
    let mut event = EnrichedEvent {
        event_id,
        ups_name: ups_name.to_owned(),
        event_type: event_type.to_owned(),
        event_message: event_message.to_owned(),
        server_name,
        source_ip,
        event_date: local.format("%Y-%m-%d").to_string(),
        event_time: local.format("%H:%M:%S").to_string(),
        ..Default::default()
    };

    if let Some(data) = db.get_static_data().await? {
        apply_static(&mut event, &data);
    }
    if let Some(sample) = db.latest_sample().await? {
        apply_sample(&mut event, &sample);
    }

    match EventType::from_str(event_type).ok() {
        Some(EventType::Online) => {
            event.battery_duration =
                closed_interval_duration(db, ups_name, EventType::Onbatt, now).await?;
        }
        Some(EventType::Commok) => {
            event.comm_duration =
                closed_interval_duration(db, ups_name, EventType::Commbad, now).await?;
        }
        _ => {}
    }

    Ok(event)
}
