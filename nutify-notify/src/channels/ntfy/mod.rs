//! Push notifications through an ntfy server.

pub mod channel;
pub mod error;

pub use channel::NtfyChannel;
