//! Typed protocol between the daemon and its per-session automation bridge
//! subprocess.
//!
//! The bridge process holds the live native spreadsheet handle (one process
//! per open workbook, apartment-threaded). The daemon sends one JSON object
//! per line on its stdin and reads one reply per line from its stdout;
//! replies are correlated by a monotonically increasing request id.

use serde::{Deserialize, Serialize};

/// A command sent from the daemon to the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Monotonically increasing request ID for correlating replies.
    pub id: u64,
    #[serde(flatten)]
    pub command: BridgeCommand,
}

/// Commands the daemon can send to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum BridgeCommand {
    /// Open the workbook this bridge was spawned for.
    Open { path: String, read_only: bool },

    /// Set a cell's value.
    SetCellValue {
        sheet: SheetRef,
        cell: String,
        value: CellValue,
    },

    /// Set a cell's formula (e.g. "=SUM(A1:A10)").
    SetCellFormula {
        sheet: SheetRef,
        cell: String,
        formula: String,
    },

    /// Get a cell's computed value.
    GetCellValue { sheet: SheetRef, cell: String },

    /// Append rows to a named table.
    AppendTableRows {
        table: String,
        rows: Vec<Vec<CellValue>>,
    },

    /// Add a worksheet with the given name.
    AddSheet { name: String },

    /// List worksheet names in workbook order.
    ListSheets,

    /// Force a full recalculation.
    Recalculate,

    /// Commit all pending mutations to the underlying file.
    Save,

    /// Liveness probe for the native handle.
    Ping,

    /// Close the workbook without saving and exit the bridge process.
    Close,
}

/// Reference to a worksheet, by 0-based index or by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Index(u32),
    Name(String),
}

/// A cell value crossing the bridge in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// A reply from the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeReply {
    /// The request ID this reply corresponds to.
    pub id: u64,
    #[serde(flatten)]
    pub result: BridgeResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum BridgeResult {
    #[serde(rename = "ok")]
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<BridgeData>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        /// True when the native handle itself is gone (workbook closed
        /// externally, application crashed) rather than the one operation
        /// failing. The daemon poisons the session on this.
        #[serde(default)]
        fatal: bool,
    },
}

/// Data returned in successful replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeData {
    Value { value: CellValue },
    Sheets { sheets: Vec<String> },
}

impl CellValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::String(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => write!(f, "<empty>"),
            CellValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::String(s) => write!(f, "{s}"),
        }
    }
}
