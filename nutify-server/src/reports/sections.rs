//! The read-only section reporters.
//!
//! Each reporter is pure: given the window's samples (or events) it
//! returns deterministic stats plus an ordered series for charting.

use chrono_tz::Tz;
use serde_derive::Serialize;

use nutify_common::db::models::{DynamicSample, UpsEvent, VariableConfig};
use nutify_common::util::format_local;

use super::charts::{line_chart_data_uri, ChartSeries};

pub static SECTION_TAGS: &[&str] = &["energy", "battery", "power", "voltage", "events"];

/// min/max/avg/current over one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub current: f64,
}

impl MetricStats {
    fn over(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        let current = *values.last().expect("non-empty");
        Some(Self {
            min,
            max,
            avg: (avg * 100.0).round() / 100.0,
            current,
        })
    }
}

/// One rendered report section, ready for the HTML template.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub tag: String,
    pub title: String,
    /// (label, formatted value) rows.
    pub rows: Vec<(String, String)>,
    /// Inline SVG data URI.
    pub chart: String,
    pub ok: bool,
}

impl Section {
    /// The degraded form used when a reporter fails: an empty-placeholder
    /// chart and no rows.
    pub fn placeholder(tag: &str, title: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            title: title.to_owned(),
            rows: vec![],
            chart: super::charts::placeholder_data_uri(title),
            ok: false,
        }
    }
}

fn metric_values(samples: &[DynamicSample], column: &str) -> Vec<f64> {
    samples
        .iter()
        .filter_map(|s| s.numeric_value(column))
        .collect()
}

fn metric_series(samples: &[DynamicSample], column: &str, name: &str, tz: Tz) -> ChartSeries {
    ChartSeries {
        name: name.to_owned(),
        points: samples
            .iter()
            .filter_map(|s| {
                s.numeric_value(column)
                    .map(|v| (format_local(s.timestamp_utc, tz), v))
            })
            .collect(),
    }
}

fn stats_rows(rows: &mut Vec<(String, String)>, label: &str, unit: &str, stats: MetricStats) {
    rows.push((
        label.to_owned(),
        format!(
            "min {:.1}{unit} / avg {:.1}{unit} / max {:.1}{unit} (now {:.1}{unit})",
            stats.min, stats.avg, stats.max, stats.current
        ),
    ));
}

/// Energy: total Wh from the hourly buckets, cost and CO2 from the
/// variable config.
pub fn energy_section(
    samples: &[DynamicSample],
    variables: &VariableConfig,
    tz: Tz,
) -> Section {
    let total_wh: f64 = samples.iter().filter_map(|s| s.ups_realpower_hrs).sum();
    let total_kwh = total_wh / 1000.0;
    let cost = total_kwh * variables.price_per_kwh;
    let co2_kg = total_kwh * variables.co2_factor;

    let buckets = ChartSeries {
        name: "Wh per hour".to_owned(),
        points: samples
            .iter()
            .filter_map(|s| {
                s.ups_realpower_hrs
                    .map(|wh| (format_local(s.timestamp_utc, tz), wh))
            })
            .collect(),
    };

    Section {
        tag: "energy".to_owned(),
        title: "Energy".to_owned(),
        rows: vec![
            ("Total energy".to_owned(), format!("{total_wh:.1} Wh")),
            (
                "Cost".to_owned(),
                format!("{cost:.2} {} ({:.3} kWh)", variables.currency, total_kwh),
            ),
            ("CO2".to_owned(), format!("{co2_kg:.2} kg")),
        ],
        chart: line_chart_data_uri("Hourly energy", "Wh", &[buckets]),
        ok: true,
    }
}

pub fn battery_section(samples: &[DynamicSample], tz: Tz) -> Section {
    let mut rows = Vec::new();
    if let Some(stats) = MetricStats::over(&metric_values(samples, "battery_charge")) {
        stats_rows(&mut rows, "Charge", "%", stats);
    }
    if let Some(stats) = MetricStats::over(&metric_values(samples, "battery_runtime")) {
        rows.push((
            "Runtime".to_owned(),
            format!(
                "min {:.0} min / avg {:.0} min / max {:.0} min",
                stats.min / 60.0,
                stats.avg / 60.0,
                stats.max / 60.0
            ),
        ));
    }
    if let Some(stats) = MetricStats::over(&metric_values(samples, "battery_voltage")) {
        stats_rows(&mut rows, "Voltage", " V", stats);
    }
    Section {
        tag: "battery".to_owned(),
        title: "Battery".to_owned(),
        chart: line_chart_data_uri(
            "Battery charge",
            "%",
            &[metric_series(samples, "battery_charge", "charge", tz)],
        ),
        rows,
        ok: true,
    }
}

pub fn power_section(samples: &[DynamicSample], tz: Tz) -> Section {
    let mut rows = Vec::new();
    if let Some(stats) = MetricStats::over(&metric_values(samples, "ups_realpower")) {
        stats_rows(&mut rows, "Real power", " W", stats);
    }
    if let Some(stats) = MetricStats::over(&metric_values(samples, "ups_load")) {
        stats_rows(&mut rows, "Load", "%", stats);
    }
    Section {
        tag: "power".to_owned(),
        title: "Power".to_owned(),
        chart: line_chart_data_uri(
            "Power draw",
            "W",
            &[metric_series(samples, "ups_realpower", "realpower", tz)],
        ),
        rows,
        ok: true,
    }
}

pub fn voltage_section(samples: &[DynamicSample], tz: Tz) -> Section {
    let mut rows = Vec::new();
    if let Some(stats) = MetricStats::over(&metric_values(samples, "input_voltage")) {
        stats_rows(&mut rows, "Input", " V", stats);
    }
    if let Some(stats) = MetricStats::over(&metric_values(samples, "output_voltage")) {
        stats_rows(&mut rows, "Output", " V", stats);
    }
    Section {
        tag: "voltage".to_owned(),
        title: "Voltage".to_owned(),
        chart: line_chart_data_uri(
            "Input / output voltage",
            "V",
            &[
                metric_series(samples, "input_voltage", "input", tz),
                metric_series(samples, "output_voltage", "output", tz),
            ],
        ),
        rows,
        ok: true,
    }
}

pub fn events_section(events: &[UpsEvent], tz: Tz) -> Section {
    let mut counts: std::collections::BTreeMap<&str, usize> = Default::default();
    for event in events {
        *counts.entry(event.event_type.as_str()).or_default() += 1;
    }
    let mut rows: Vec<(String, String)> = counts
        .into_iter()
        .map(|(event_type, count)| (event_type.to_owned(), count.to_string()))
        .collect();
    if rows.is_empty() {
        rows.push(("Events".to_owned(), "none in this window".to_owned()));
    }

    // The chart shows events per day.
    let mut per_day: std::collections::BTreeMap<String, f64> = Default::default();
    for event in events {
        let day = format_local(event.timestamp_utc, tz)[..10].to_owned();
        *per_day.entry(day).or_default() += 1.0;
    }
    let series = ChartSeries {
        name: "events per day".to_owned(),
        points: per_day.into_iter().collect(),
    };

    Section {
        tag: "events".to_owned(),
        title: "Events".to_owned(),
        chart: line_chart_data_uri("Events per day", "count", &[series]),
        rows,
        ok: true,
    }
}

/// Stable section titles for placeholders.
pub fn section_title(tag: &str) -> &'static str {
    match tag {
        "energy" => "Energy",
        "battery" => "Battery",
        "power" => "Power",
        "voltage" => "Voltage",
        "events" => "Events",
        _ => "Section",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn sample(h: u32, m: u32, charge: f64, hrs: Option<f64>) -> DynamicSample {
        let mut sample = DynamicSample {
            id: Some(1),
            timestamp_utc: ts(h, m),
            ups_realpower_hrs: hrs,
            ..Default::default()
        };
        sample.numeric.insert("battery_charge".to_owned(), charge);
        sample.numeric.insert("ups_realpower".to_owned(), 250.0);
        sample.numeric.insert("input_voltage".to_owned(), 230.0);
        sample
    }

    #[test]
    fn test_energy_totals_and_cost() {
        // 24 hourly buckets of 250 Wh each = 6 kWh.
        let samples: Vec<DynamicSample> = (0..24)
            .map(|h| sample(h, 59, 100.0, Some(250.0)))
            .collect();
        let variables = VariableConfig::default();
        let section = energy_section(&samples, &variables, chrono_tz::UTC);
        assert_eq!(section.rows[0].1, "6000.0 Wh");
        // 6 kWh × 0.25 default price.
        assert!(section.rows[1].1.starts_with("1.50 EUR"));
        assert!(section.chart.starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn test_battery_stats() {
        let samples = vec![
            sample(10, 0, 100.0, None),
            sample(10, 1, 90.0, None),
            sample(10, 2, 95.0, None),
        ];
        let section = battery_section(&samples, chrono_tz::UTC);
        let charge_row = &section.rows[0];
        assert_eq!(charge_row.0, "Charge");
        assert!(charge_row.1.contains("min 90.0%"));
        assert!(charge_row.1.contains("max 100.0%"));
        assert!(charge_row.1.contains("now 95.0%"));
    }

    #[test]
    fn test_events_counts() {
        let events = vec![
            UpsEvent {
                id: 1,
                timestamp_utc: ts(10, 0),
                timestamp_utc_begin: ts(10, 0),
                timestamp_utc_end: None,
                ups_name: "ups".into(),
                event_type: "ONBATT".into(),
                event_message: None,
                source_ip: None,
                acknowledged: false,
            },
            UpsEvent {
                id: 2,
                timestamp_utc: ts(10, 2),
                timestamp_utc_begin: ts(10, 2),
                timestamp_utc_end: None,
                ups_name: "ups".into(),
                event_type: "ONBATT".into(),
                event_message: None,
                source_ip: None,
                acknowledged: false,
            },
            UpsEvent {
                id: 3,
                timestamp_utc: ts(10, 4),
                timestamp_utc_begin: ts(10, 4),
                timestamp_utc_end: None,
                ups_name: "ups".into(),
                event_type: "ONLINE".into(),
                event_message: None,
                source_ip: None,
                acknowledged: false,
            },
        ];
        let section = events_section(&events, chrono_tz::UTC);
        assert!(section.rows.contains(&("ONBATT".to_owned(), "2".to_owned())));
        assert!(section.rows.contains(&("ONLINE".to_owned(), "1".to_owned())));
    }

    #[test]
    fn test_empty_samples_are_tolerated() {
        let section = power_section(&[], chrono_tz::UTC);
        assert!(section.rows.is_empty());
        assert!(section.chart.contains("base64"));
    }

    #[test]
    fn test_placeholder_section() {
        let section = Section::placeholder("energy", "Energy");
        assert!(!section.ok);
        assert!(section.rows.is_empty());
    }
}
