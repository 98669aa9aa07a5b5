//! The production [`WorkbookDriver`]: a per-session automation bridge
//! subprocess driven over JSON-on-stdio.
//!
//! The bridge executable is the platform-bound half of the system: it holds
//! the actual COM automation handle and must run apartment-threaded. This
//! side only speaks the [`sheetpilot_protocol::bridge`] protocol to it: one
//! JSON request per line on stdin, one correlated reply per line on stdout.
//! Bridge diagnostics go to stderr and are inherited.
//!
//! One bridge process per open workbook. The driver is owned by the session
//! worker thread, so no interior locking is needed here.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};

use sheetpilot_protocol::bridge::{
    BridgeCommand, BridgeData, BridgeReply, BridgeRequest, BridgeResult, CellValue, SheetRef,
};

use crate::driver::{DriverError, DriverFactory, WorkbookDriver};

/// Configuration for spawning bridge processes.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Path to the bridge executable. If None, `SHEETPILOT_BRIDGE_EXE` is
    /// consulted, then a binary next to the current executable, then PATH.
    pub bridge_exe: Option<PathBuf>,
}

/// A live bridge subprocess bound to one open workbook.
pub struct BridgeDriver {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl BridgeDriver {
    /// Spawn a bridge process and open `path` in it.
    pub fn open(config: &BridgeConfig, path: &Path, read_only: bool) -> Result<Self, DriverError> {
        let exe = config.bridge_exe.clone().unwrap_or_else(find_bridge_exe);

        let mut child = std::process::Command::new(&exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DriverError::Operation(format!(
                        "automation bridge executable not found: {}",
                        exe.display()
                    ))
                } else {
                    DriverError::Io(e)
                }
            })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let mut driver = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        };

        driver.send(BridgeCommand::Open {
            path: path.display().to_string(),
            read_only,
        })?;

        Ok(driver)
    }

    /// Send one command and wait for its correlated reply.
    fn send(&mut self, command: BridgeCommand) -> Result<Option<BridgeData>, DriverError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = BridgeRequest { id, command };
        let json = serde_json::to_string(&request)
            .map_err(|e| DriverError::Protocol(format!("encode request: {e}")))?;

        writeln!(self.stdin, "{json}")?;
        self.stdin.flush()?;

        let mut line = String::new();
        self.stdout.read_line(&mut line)?;
        if line.is_empty() {
            return Err(DriverError::HandleDead(
                "automation bridge process exited".to_string(),
            ));
        }

        let reply: BridgeReply = serde_json::from_str(&line)
            .map_err(|e| DriverError::Protocol(format!("malformed bridge reply: {e}")))?;

        if reply.id != id {
            return Err(DriverError::Protocol(format!(
                "reply id {} does not match request id {id}",
                reply.id
            )));
        }

        match reply.result {
            BridgeResult::Ok { data } => Ok(data),
            BridgeResult::Error { message, fatal } => {
                if fatal {
                    Err(DriverError::HandleDead(message))
                } else {
                    Err(DriverError::Operation(message))
                }
            }
        }
    }
}

impl WorkbookDriver for BridgeDriver {
    fn set_cell_value(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        value: CellValue,
    ) -> Result<(), DriverError> {
        self.send(BridgeCommand::SetCellValue {
            sheet: sheet.clone(),
            cell: cell.to_string(),
            value,
        })?;
        Ok(())
    }

    fn set_cell_formula(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), DriverError> {
        self.send(BridgeCommand::SetCellFormula {
            sheet: sheet.clone(),
            cell: cell.to_string(),
            formula: formula.to_string(),
        })?;
        Ok(())
    }

    fn get_cell_value(&mut self, sheet: &SheetRef, cell: &str) -> Result<CellValue, DriverError> {
        let data = self.send(BridgeCommand::GetCellValue {
            sheet: sheet.clone(),
            cell: cell.to_string(),
        })?;
        match data {
            Some(BridgeData::Value { value }) => Ok(value),
            _ => Err(DriverError::Protocol(
                "expected a cell value reply".to_string(),
            )),
        }
    }

    fn append_table_rows(
        &mut self,
        table: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<u64, DriverError> {
        let count = rows.len() as u64;
        self.send(BridgeCommand::AppendTableRows {
            table: table.to_string(),
            rows,
        })?;
        Ok(count)
    }

    fn add_sheet(&mut self, name: &str) -> Result<(), DriverError> {
        self.send(BridgeCommand::AddSheet {
            name: name.to_string(),
        })?;
        Ok(())
    }

    fn list_sheets(&mut self) -> Result<Vec<String>, DriverError> {
        let data = self.send(BridgeCommand::ListSheets)?;
        match data {
            Some(BridgeData::Sheets { sheets }) => Ok(sheets),
            _ => Err(DriverError::Protocol(
                "expected a sheet list reply".to_string(),
            )),
        }
    }

    fn recalculate(&mut self) -> Result<(), DriverError> {
        self.send(BridgeCommand::Recalculate)?;
        Ok(())
    }

    fn save(&mut self) -> Result<(), DriverError> {
        // A non-fatal save failure is a conflict on the underlying file
        // (locked, externally modified). Surfaced verbatim, never retried.
        match self.send(BridgeCommand::Save) {
            Ok(_) => Ok(()),
            Err(DriverError::Operation(msg)) => Err(DriverError::SaveConflict(msg)),
            Err(other) => Err(other),
        }
    }

    fn ping(&mut self) -> Result<(), DriverError> {
        self.send(BridgeCommand::Ping)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let result = self.send(BridgeCommand::Close).map(|_| ());
        let _ = self.child.wait();
        result
    }
}

impl Drop for BridgeDriver {
    fn drop(&mut self) {
        // Normal teardown goes through close(); this is the backstop so a
        // panic or missed close never leaks a bridge process.
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawns one [`BridgeDriver`] per session.
#[derive(Debug, Clone, Default)]
pub struct BridgeDriverFactory {
    config: BridgeConfig,
}

impl BridgeDriverFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl DriverFactory for BridgeDriverFactory {
    fn open(&self, path: &Path, read_only: bool) -> Result<Box<dyn WorkbookDriver>, DriverError> {
        Ok(Box::new(BridgeDriver::open(&self.config, path, read_only)?))
    }
}

/// Locate the bridge executable: env override, next to our binary, then PATH.
fn find_bridge_exe() -> PathBuf {
    if let Ok(path) = std::env::var("SHEETPILOT_BRIDGE_EXE") {
        return PathBuf::from(path);
    }

    if let Ok(mut exe) = std::env::current_exe() {
        exe.pop();
        let candidate = exe.join("sheetpilot-bridge");
        if candidate.exists() {
            return candidate;
        }
    }

    PathBuf::from("sheetpilot-bridge")
}
