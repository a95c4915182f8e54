//! The event pipeline and notification channels.
//!
//! This crate backs the `nutify-notify` executable (NUT's NOTIFYCMD entry
//! point) and is also linked by the server for synthetic events raised by
//! the connection monitor.

#[macro_use]
extern crate slog_scope;

pub mod channels;
pub mod enrich;
pub mod error;
pub mod pipeline;
pub mod settings;
pub mod templates;

pub use pipeline::{DispatchSummary, EventPipeline};
pub use settings::Settings;
