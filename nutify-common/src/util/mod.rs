//! Various small utilities accumulated over time for the UPS supervisor
use std::collections::HashMap;
use std::hash::Hash;

pub mod timing;

pub use self::timing::{
    format_local, local_now, ms_since_epoch, parse_timezone, sec_since_epoch, to_local,
    utc_now_secs,
};

pub trait InsertOpt<K: Eq + Hash, V> {
    /// Insert an item only if it exists
    fn insert_opt(&mut self, key: impl Into<K>, value: Option<impl Into<V>>);
}

impl<K: Eq + Hash, V> InsertOpt<K, V> for HashMap<K, V> {
    fn insert_opt(&mut self, key: impl Into<K>, value: Option<impl Into<V>>) {
        if let Some(value) = value {
            self.insert(key.into(), value.into());
        }
    }
}

/// Normalize a NUT variable name into a column-safe identifier
/// (`ups.realpower.nominal` -> `ups_realpower_nominal`).
pub fn normalize_key(key: &str) -> String {
    key.replace('.', "_")
}

/// Best-effort numeric coercion for NUT variable values.
///
/// NUT reports everything as text; numeric-looking values are stored as
/// floats, everything else stays a string.
pub fn coerce_numeric(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}
