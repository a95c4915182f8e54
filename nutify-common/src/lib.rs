#![recursion_limit = "1024"]

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

pub mod db;
pub mod errors;
pub mod events;
pub mod logging;
pub mod metric_name;
pub mod metrics;
pub mod notification;
pub mod nut;
pub mod secret;

#[macro_use]
pub mod util;

/// Default nominal power (W) assumed when neither the live sample nor the
/// static row report `ups.realpower.nominal`.
pub const DEFAULT_NOMINAL_POWER_W: f64 = 1000.0;

/// Energy price per kWh used when no variable config row exists yet.
pub const DEFAULT_PRICE_PER_KWH: f64 = 0.25;

/// A gap between adjacent samples longer than this breaks energy
/// integration; the gap interval contributes zero.
pub const AGGREGATION_MAX_GAP_SECS: i64 = 2 * 60 * 60;
