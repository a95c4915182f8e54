//! Glue to the Network UPS Tools deployment.
//!
//! All device I/O goes through the NUT CLIs; nothing here links against NUT
//! or speaks the serial/USB protocol itself.

pub mod client;
pub mod config;

pub use client::{
    CmdOutcome, CommandRunner, FailureKind, NutBinaryPaths, NutClient, ProcessOutput,
    SetVariableOutcome, SystemCommandRunner, WritableVariable, DEFAULT_USB_ERROR_MARKERS,
};
pub use config::{NutConfig, NutConfigStore, NutMode};

#[cfg(any(test, feature = "test-support"))]
pub use client::MockCommandRunner;
