//! The native automation seam.
//!
//! `WorkbookDriver` is everything the broker needs from a live workbook
//! handle. The production implementation ([`crate::bridge::BridgeDriver`])
//! talks to an automation bridge subprocess; tests substitute an in-memory
//! fake. A driver is owned exclusively by one session worker thread and is
//! never shared; the `&mut self` receivers encode that.

use std::path::Path;

use sheetpilot_protocol::bridge::{CellValue, SheetRef};
use thiserror::Error;

/// Errors a driver can raise.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error talking to automation bridge: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Operation(String),

    #[error("{0}")]
    SaveConflict(String),

    #[error("{0}")]
    HandleDead(String),

    #[error("{0}")]
    InvalidArgs(String),
}

impl DriverError {
    /// Whether this failure means the native handle itself is unusable.
    /// A dead pipe or a desynchronized protocol stream both count: there is
    /// no way to keep issuing commands against that handle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::HandleDead(_) | DriverError::Protocol(_) | DriverError::Io(_)
        )
    }

    /// Escalate any failure to a handle-death. Used for health probes, where
    /// every failure means the handle cannot be trusted anymore.
    pub fn into_fatal(self) -> Self {
        match self {
            DriverError::HandleDead(m) => DriverError::HandleDead(m),
            other => DriverError::HandleDead(other.to_string()),
        }
    }
}

/// A live handle to one open workbook.
pub trait WorkbookDriver: Send {
    fn set_cell_value(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        value: CellValue,
    ) -> Result<(), DriverError>;

    fn set_cell_formula(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), DriverError>;

    fn get_cell_value(&mut self, sheet: &SheetRef, cell: &str) -> Result<CellValue, DriverError>;

    /// Append rows to a named table, returning the number of rows appended.
    fn append_table_rows(
        &mut self,
        table: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<u64, DriverError>;

    fn add_sheet(&mut self, name: &str) -> Result<(), DriverError>;

    fn list_sheets(&mut self) -> Result<Vec<String>, DriverError>;

    fn recalculate(&mut self) -> Result<(), DriverError>;

    /// Commit all batched mutations to the underlying file.
    fn save(&mut self) -> Result<(), DriverError>;

    /// Cheap liveness probe for the native handle.
    fn ping(&mut self) -> Result<(), DriverError>;

    /// Release the native handle without saving. Called exactly once, on the
    /// owning worker thread, on every teardown path.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens drivers. The factory is called *on the session's dedicated thread*
/// so the native handle is created on the thread that will own it. The
/// apartment-threading requirement starts at creation, not first use.
pub trait DriverFactory: Send + Sync {
    fn open(&self, path: &Path, read_only: bool) -> Result<Box<dyn WorkbookDriver>, DriverError>;
}
