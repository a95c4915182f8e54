//! The recovery state machine, kept pure: `transition` maps
//! (state, probe outcome) to the next state plus the effects the driver
//! loop must perform. Shelling out and bus emits happen in the driver, not
//! here.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Connected,
    /// Short-cadence retries right after a loss; promotes to
    /// `ExtendedRetry` after `k_init` attempts.
    InitialRetry { k: u32 },
    ExtendedRetry,
    /// Lost USB link; every tick probes the bus and may drive the service
    /// restart sequence.
    UsbDisconnect { k: u32 },
}

impl MonitorState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_usb(&self) -> bool {
        matches!(self, Self::UsbDisconnect { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::InitialRetry { .. } => "initial_retry",
            Self::ExtendedRetry => "extended_retry",
            Self::UsbDisconnect { .. } => "usb_disconnect",
        }
    }
}

/// What one health probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    TransportFail,
    UsbFail,
}

/// Side effects the driver performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Record the loss instant and count the failure.
    MarkLost,
    /// Surface the USB loss on the bus and the filesystem status file.
    EmitUsbLost,
    /// Back to connected: compute downtime, count the recovery, and raise
    /// a synthetic COMMOK when the outage was USB.
    Recovered { was_usb: bool },
    /// Probe the USB bus and, when a device is present, run the service
    /// restart sequence.
    AttemptUsbRecovery { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: MonitorState,
    pub effects: Vec<Effect>,
}

/// The pure transition function.
pub fn transition(state: MonitorState, outcome: ProbeOutcome, k_init: u32) -> Transition {
    use MonitorState::*;
    use ProbeOutcome::*;

    match (state, outcome) {
        (Connected, Ok) => Transition {
            next: Connected,
            effects: vec![],
        },
        (Connected, TransportFail) => Transition {
            next: InitialRetry { k: 1 },
            effects: vec![Effect::MarkLost],
        },
        // A USB classification from any non-USB state enters the USB
        // machine directly.
        (Connected, UsbFail) => Transition {
            next: UsbDisconnect { k: 1 },
            effects: vec![Effect::MarkLost, Effect::EmitUsbLost],
        },
        (InitialRetry { .. } | ExtendedRetry, UsbFail) => Transition {
            next: UsbDisconnect { k: 1 },
            effects: vec![Effect::EmitUsbLost],
        },

        (state @ (InitialRetry { .. } | ExtendedRetry | UsbDisconnect { .. }), Ok) => {
            Transition {
                next: Connected,
                effects: vec![Effect::Recovered {
                    was_usb: state.is_usb(),
                }],
            }
        }

        (InitialRetry { k }, TransportFail) => {
            if k >= k_init {
                Transition {
                    next: ExtendedRetry,
                    effects: vec![],
                }
            } else {
                Transition {
                    next: InitialRetry { k: k + 1 },
                    effects: vec![],
                }
            }
        }
        (ExtendedRetry, TransportFail) => Transition {
            next: ExtendedRetry,
            effects: vec![],
        },
        (UsbDisconnect { k }, TransportFail | UsbFail) => Transition {
            next: UsbDisconnect { k: k + 1 },
            effects: vec![Effect::AttemptUsbRecovery { attempt: k }],
        },
    }
}

/// Tick cadence per state.
pub fn tick_interval(
    state: MonitorState,
    connected: Duration,
    initial: Duration,
    extended: Duration,
    usb_scan: Duration,
) -> Duration {
    match state {
        MonitorState::Connected => connected,
        MonitorState::InitialRetry { .. } => initial,
        MonitorState::ExtendedRetry => extended,
        MonitorState::UsbDisconnect { .. } => usb_scan,
    }
}

/// Lifetime counters surfaced to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTotals {
    pub failures: u64,
    pub recoveries: u64,
    pub usb_disconnects: u64,
    pub usb_reconnects: u64,
}

/// The connection-state struct. Owned exclusively by the monitor behind a
/// mutex; everything else reads snapshot copies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub lost_at: Option<NaiveDateTime>,
    pub attempts: u64,
    pub usb_disconnect: bool,
    pub totals: ConnectionTotals,
    pub last_check: Option<NaiveDateTime>,
}

impl ConnectionState {
    pub fn new_connected() -> Self {
        Self {
            connected: true,
            ..Default::default()
        }
    }

    /// `connected ⇔ lost_at is null`
    pub fn invariant_holds(&self) -> bool {
        self.connected == self.lost_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MonitorState::*;
    use ProbeOutcome::*;

    const K_INIT: u32 = 5;

    #[test]
    fn test_connected_stays_on_ok() {
        let t = transition(Connected, Ok, K_INIT);
        assert_eq!(t.next, Connected);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_transport_failure_enters_initial_retry() {
        let t = transition(Connected, TransportFail, K_INIT);
        assert_eq!(t.next, InitialRetry { k: 1 });
        assert_eq!(t.effects, vec![Effect::MarkLost]);
    }

    #[test]
    fn test_initial_retry_escalates_after_k_init() {
        let mut state = InitialRetry { k: 1 };
        for _ in 1..K_INIT {
            let t = transition(state, TransportFail, K_INIT);
            state = t.next;
        }
        assert_eq!(state, InitialRetry { k: K_INIT });
        let t = transition(state, TransportFail, K_INIT);
        assert_eq!(t.next, ExtendedRetry);
    }

    #[test]
    fn test_extended_retry_is_stable() {
        let t = transition(ExtendedRetry, TransportFail, K_INIT);
        assert_eq!(t.next, ExtendedRetry);
    }

    #[test]
    fn test_usb_failure_enters_usb_machine() {
        let t = transition(Connected, UsbFail, K_INIT);
        assert_eq!(t.next, UsbDisconnect { k: 1 });
        assert_eq!(t.effects, vec![Effect::MarkLost, Effect::EmitUsbLost]);

        let t = transition(ExtendedRetry, UsbFail, K_INIT);
        assert_eq!(t.next, UsbDisconnect { k: 1 });
        assert_eq!(t.effects, vec![Effect::EmitUsbLost]);
    }

    #[test]
    fn test_usb_tick_attempts_recovery() {
        let t = transition(UsbDisconnect { k: 1 }, UsbFail, K_INIT);
        assert_eq!(t.next, UsbDisconnect { k: 2 });
        assert_eq!(t.effects, vec![Effect::AttemptUsbRecovery { attempt: 1 }]);
    }

    #[test]
    fn test_any_failure_state_recovers_on_ok() {
        for (state, was_usb) in [
            (InitialRetry { k: 3 }, false),
            (ExtendedRetry, false),
            (UsbDisconnect { k: 4 }, true),
        ] {
            let t = transition(state, Ok, K_INIT);
            assert_eq!(t.next, Connected);
            assert_eq!(t.effects, vec![Effect::Recovered { was_usb }]);
        }
    }

    #[test]
    fn test_tick_intervals() {
        let (c, i, e, u) = (
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        assert_eq!(tick_interval(Connected, c, i, e, u), c);
        assert_eq!(tick_interval(InitialRetry { k: 2 }, c, i, e, u), i);
        assert_eq!(tick_interval(ExtendedRetry, c, i, e, u), e);
        assert_eq!(tick_interval(UsbDisconnect { k: 1 }, c, i, e, u), u);
    }

    #[test]
    fn test_connection_state_invariant() {
        let mut state = ConnectionState::new_connected();
        assert!(state.invariant_holds());
        state.lost_at = Some(chrono::Utc::now().naive_utc());
        assert!(!state.invariant_holds());
        state.connected = false;
        assert!(state.invariant_holds());
    }
}
