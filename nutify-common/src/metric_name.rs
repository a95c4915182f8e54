//! Defines standard metric names used across the application.
//!
//! This module provides a type-safe way to refer to metrics by replacing
//! string literals with enum variants, ensuring consistency and discoverability.

use strum::{AsRefStr, Display, EnumString};
use strum_macros::IntoStaticStr;

/// Represents all metric names used in the application.
#[derive(Debug, Clone, IntoStaticStr, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetricName {
    //
    // Poller metrics
    //
    /// One successful poll tick
    #[strum(serialize = "poll.tick.ok")]
    PollTickOk,

    /// One failed poll tick (skipped)
    #[strum(serialize = "poll.tick.error")]
    PollTickError,

    /// A dynamic sample row was stored
    #[strum(serialize = "poll.sample.stored")]
    PollSampleStored,

    /// A dynamic sample write failed
    #[strum(serialize = "poll.sample.error")]
    PollSampleError,

    /// An hourly aggregation pass completed
    #[strum(serialize = "poll.aggregate.hourly")]
    AggregateHourly,

    /// A daily aggregation pass completed
    #[strum(serialize = "poll.aggregate.daily")]
    AggregateDaily,

    //
    // Connection monitor metrics
    //
    /// Monitor state transition
    #[strum(serialize = "monitor.transition")]
    MonitorTransition,

    /// Communication failure observed
    #[strum(serialize = "monitor.comm.failure")]
    MonitorCommFailure,

    /// Communication recovered
    #[strum(serialize = "monitor.comm.recovery")]
    MonitorCommRecovery,

    /// USB disconnect detected
    #[strum(serialize = "monitor.usb.disconnect")]
    MonitorUsbDisconnect,

    /// USB reconnect recovery completed
    #[strum(serialize = "monitor.usb.reconnect")]
    MonitorUsbReconnect,

    /// Service restart sequence executed
    #[strum(serialize = "monitor.restart_sequence")]
    MonitorRestartSequence,

    //
    // Event pipeline metrics
    //
    /// NUT event received and persisted
    #[strum(serialize = "event.processed")]
    EventProcessed,

    /// NUT event that could not be parsed
    #[strum(serialize = "event.parse_error")]
    EventParseError,

    /// Notification dispatched on a channel
    #[strum(serialize = "notify.sent")]
    NotifySent,

    /// Notification dispatch failure on a channel
    #[strum(serialize = "notify.error")]
    NotifyError,

    //
    // Report metrics
    //
    /// Report generated and delivered
    #[strum(serialize = "report.sent")]
    ReportSent,

    /// Report generation or delivery failed
    #[strum(serialize = "report.error")]
    ReportError,

    //
    // Command executor metrics
    //
    /// Instant command executed
    #[strum(serialize = "command.executed")]
    CommandExecuted,

    /// Variable write executed
    #[strum(serialize = "command.variable_set")]
    CommandVariableSet,

    //
    // Live bus metrics
    //
    /// WebSocket client connected
    #[strum(serialize = "bus.client.connected")]
    BusClientConnected,

    /// Bus messages dropped for a lagging subscriber
    #[strum(serialize = "bus.dropped")]
    BusDropped,

    /// Storage marked unhealthy after consecutive write failures
    #[strum(serialize = "storage.unhealthy")]
    StorageUnhealthy,
}
