//! Outbound webhooks carrying the full enriched envelope.

pub mod channel;
pub mod error;

pub use channel::WebhookChannel;
