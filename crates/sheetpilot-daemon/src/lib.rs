//! The sheetpilot daemon library.
//!
//! `sheetpilotd` is the long-running process that owns the session registry
//! and every session's dedicated automation thread. Short-lived CLI
//! processes reach it over a Unix domain socket speaking newline-delimited
//! JSON envelopes. One request's failure (bad arguments, a dead workbook
//! handle, a save conflict) produces an error response; it never takes the
//! daemon down.

pub mod config;
pub mod server;

pub use config::DaemonConfig;
pub use server::serve;
