//! Email delivery through an external SMTP client (`msmtp`).

pub mod channel;
pub mod client;
pub mod error;
pub mod provider;

pub use channel::EmailChannel;
pub use client::{MsmtpTransport, SmtpTransport};

#[cfg(any(test, feature = "test-support"))]
pub use client::MockSmtpTransport;
