//! Shared protocol types for sheetpilot.
//!
//! Two wire surfaces live here:
//!
//! - [`envelope`]: the CLI ↔ daemon request/response envelope. Untyped on
//!   purpose: the daemon routes `command` strings through its dispatch
//!   table, so new feature commands don't require a protocol change.
//! - [`bridge`]: the typed command set the daemon speaks to its per-session
//!   automation bridge subprocess (the process that actually holds the
//!   native spreadsheet handle).
//!
//! Both surfaces are JSON, one object per line in each direction.

pub mod bridge;
pub mod endpoint;
pub mod envelope;

pub use bridge::{BridgeCommand, BridgeReply, BridgeRequest, BridgeResult, CellValue, SheetRef};
pub use envelope::{Request, Response};
