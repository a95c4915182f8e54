//! UPS event taxonomy and the legacy NOTIFYCMD text classifier.
//!
//! `upsmon` invokes the notifier either with two arguments
//! (`<ups@host> <EVENT>`) or, on older configurations, with a single
//! free-text message. The free-text grammar is recovered by a data table of
//! regexes, first match wins.

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// The closed set of NUT event types.
///
/// Unknown event strings are still accepted and persisted verbatim, but only
/// members of this set participate in pairing and notification enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventType {
    Online,
    Onbatt,
    Lowbatt,
    Commbad,
    Commok,
    Shutdown,
    Replbatt,
    Nocomm,
    Noparent,
    Fsd,
    Cal,
    Trim,
    Boost,
    Off,
    Overload,
    Bypass,
    Nobatt,
    Dataold,
}

impl EventType {
    /// Event types that open a timed interval.
    pub fn is_opener(&self) -> bool {
        matches!(self, Self::Onbatt | Self::Commbad | Self::Nocomm)
    }

    /// Interval-opening types that an incoming event closes.
    ///
    /// A terminating counter-event closes its partner pair; a repeated
    /// begin-event closes the previous open interval of its own category.
    pub fn closes(&self) -> &'static [EventType] {
        match self {
            Self::Online => &[Self::Onbatt],
            Self::Commok => &[Self::Commbad, Self::Nocomm],
            Self::Onbatt => &[Self::Onbatt],
            Self::Commbad => &[Self::Commbad],
            Self::Nocomm => &[Self::Nocomm],
            _ => &[],
        }
    }
}

/// An event recovered from notifier input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub ups_name: String,
    /// Raw event type string; members of [EventType] when recognized.
    pub event_type: String,
}

impl ParsedEvent {
    pub fn known_type(&self) -> Option<EventType> {
        EventType::from_str(&self.event_type).ok()
    }
}

/// One row of the legacy-message grammar.
struct LegacyPattern {
    regex: Regex,
    event_type: EventType,
}

lazy_static! {
    /// The legacy free-text grammar, in observed first-match priority order.
    static ref LEGACY_PATTERNS: Vec<LegacyPattern> = vec![
        legacy(r"Communications with UPS (\S+) lost", EventType::Commbad),
        legacy(r"Communications restored with UPS (\S+)", EventType::Commok),
        legacy(r"No communication with UPS (\S+)", EventType::Nocomm),
        legacy(r"Parent process died.*UPS (\S+)", EventType::Noparent),
        legacy(r"System was shutdown by UPS (\S+)", EventType::Shutdown),
        legacy(r"^UPS (\S+) on battery", EventType::Onbatt),
        legacy(r"^UPS (\S+) on line power|^UPS (\S+) online", EventType::Online),
        legacy(r"^UPS (\S+) low battery", EventType::Lowbatt),
        legacy(r"^UPS (\S+) forced shutdown", EventType::Fsd),
        legacy(r"^UPS (\S+) battery needs replacing", EventType::Replbatt),
    ];
}

fn legacy(pattern: &str, event_type: EventType) -> LegacyPattern {
    LegacyPattern {
        regex: Regex::new(pattern).expect("legacy pattern must compile"),
        event_type,
    }
}

/// Classify a legacy single-argument notifier message.
///
/// Falls back to a `UPS <name> <EVENT>` whitespace split, accepted only when
/// `<EVENT>` is a member of the closed set.
pub fn classify_legacy_message(message: &str) -> Option<ParsedEvent> {
    let message = message.trim();
    for pattern in LEGACY_PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(message) {
            let ups_name = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().to_owned())?;
            return Some(ParsedEvent {
                ups_name,
                event_type: pattern.event_type.to_string(),
            });
        }
    }

    let mut tokens = message.split_whitespace();
    if tokens.next() == Some("UPS") {
        if let (Some(name), Some(candidate)) = (tokens.next(), tokens.next()) {
            if EventType::from_str(candidate).is_ok() {
                return Some(ParsedEvent {
                    ups_name: name.to_owned(),
                    event_type: candidate.to_owned(),
                });
            }
        }
    }
    None
}

/// Parse the standard two-argument shape `<ups@host> <EVENT>`.
///
/// Any event token is accepted; unknown types are stored verbatim.
pub fn parse_standard_args(target: &str, event: &str) -> Option<ParsedEvent> {
    let target = target.trim();
    let event = event.trim();
    if target.is_empty() || event.is_empty() {
        return None;
    }
    Some(ParsedEvent {
        ups_name: target.to_owned(),
        event_type: event.to_uppercase(),
    })
}
