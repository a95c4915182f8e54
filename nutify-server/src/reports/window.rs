//! Report window computation.
//!
//! Ranges are computed in the configured local timezone and converted to
//! naïve UTC for the storage queries; series timestamps convert back to
//! local for rendering.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportWindow {
    pub utc_from: NaiveDateTime,
    pub utc_to: NaiveDateTime,
    /// Human label for the report header ("2024-06-01", "2024-W22", ...).
    pub label: String,
}

/// Resolve a local calendar instant to UTC, taking the earlier side of DST
/// folds.
fn to_utc(tz: Tz, local: NaiveDateTime) -> NaiveDateTime {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.naive_utc())
        // A nonexistent local time (spring-forward gap) shifts one hour.
        .unwrap_or_else(|| {
            tz.from_local_datetime(&(local + Duration::hours(1)))
                .earliest()
                .map(|dt| dt.naive_utc())
                .unwrap_or(local)
        })
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).expect("midnight exists")
}

/// Compute the `[from, to)` window for a report period.
///
/// `daily` is the previous full local day, `weekly` the previous
/// Monday-to-Sunday week, `monthly` the previous calendar month; `range`
/// uses the explicit inclusive dates.
pub fn compute_window(
    period: &str,
    now_local: DateTime<Tz>,
    explicit: Option<(NaiveDate, NaiveDate)>,
) -> Option<ReportWindow> {
    let tz = now_local.timezone();
    let today = now_local.date_naive();

    let (from_date, to_date, label) = match period {
        "daily" => {
            let yesterday = today.pred_opt()?;
            (yesterday, today, yesterday.format("%Y-%m-%d").to_string())
        }
        "weekly" => {
            let days_since_monday = today.weekday().num_days_from_monday() as i64;
            let this_monday = today - Duration::days(days_since_monday);
            let prev_monday = this_monday - Duration::days(7);
            (
                prev_monday,
                this_monday,
                prev_monday.format("week of %Y-%m-%d").to_string(),
            )
        }
        "monthly" => {
            let first_of_this_month = today.with_day(1)?;
            let last_month_end = first_of_this_month.pred_opt()?;
            let first_of_last_month = last_month_end.with_day(1)?;
            (
                first_of_last_month,
                first_of_this_month,
                first_of_last_month.format("%Y-%m").to_string(),
            )
        }
        "range" | "custom" => {
            let (from, to) = explicit?;
            let to_exclusive = to.succ_opt()?;
            (
                from,
                to_exclusive,
                format!("{} to {}", from.format("%Y-%m-%d"), to.format("%Y-%m-%d")),
            )
        }
        _ => return None,
    };

    Some(ReportWindow {
        utc_from: to_utc(tz, day_start(from_date)),
        utc_to: to_utc(tz, day_start(to_date)),
        label,
    })
}
