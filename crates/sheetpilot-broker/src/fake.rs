//! In-memory driver for tests.
//!
//! `FakeStore` stands in for both the automation application and the
//! filesystem: drivers mutate a working copy of a workbook, and `save`
//! writes it back to the store's "disk". The shared operation log records
//! every completed driver call, which is what the ordering properties
//! assert against. Failure knobs simulate locked cells, dead handles, and
//! slow native calls.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sheetpilot_protocol::bridge::{CellValue, SheetRef};

use crate::driver::{DriverError, DriverFactory, WorkbookDriver};

/// The in-memory contents of one workbook.
#[derive(Debug, Clone)]
pub struct FakeWorkbook {
    pub sheets: Vec<String>,
    pub cells: BTreeMap<(String, String), CellValue>,
    pub formulas: BTreeMap<(String, String), String>,
    pub tables: BTreeMap<String, Vec<Vec<CellValue>>>,
}

impl Default for FakeWorkbook {
    fn default() -> Self {
        Self {
            sheets: vec!["Sheet1".to_string()],
            cells: BTreeMap::new(),
            formulas: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    disk: HashMap<PathBuf, FakeWorkbook>,
    op_log: Vec<String>,
    op_delay: Duration,
    handle_dead: bool,
    fail_next_op: Option<String>,
    fail_next_open: Option<String>,
}

/// Shared state behind all fake drivers created from one factory.
#[derive(Clone, Default)]
pub struct FakeStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl FakeStore {
    /// Every completed driver operation, in completion order.
    pub fn op_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().op_log.clone()
    }

    /// Read a workbook back from the fake disk (what a fresh open would see).
    pub fn read_saved(&self, path: &Path) -> Option<FakeWorkbook> {
        self.inner.lock().unwrap().disk.get(path).cloned()
    }

    /// Make every subsequent operation sleep this long first.
    pub fn set_op_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().op_delay = delay;
    }

    /// Simulate the native handle dying (workbook closed externally).
    pub fn kill_handle(&self) {
        self.inner.lock().unwrap().handle_dead = true;
    }

    /// Fail the next operation with a non-fatal error.
    pub fn fail_next_op(&self, message: &str) {
        self.inner.lock().unwrap().fail_next_op = Some(message.to_string());
    }

    /// Fail the next driver open.
    pub fn fail_next_open(&self, message: &str) {
        self.inner.lock().unwrap().fail_next_open = Some(message.to_string());
    }

    /// Apply delay/failure knobs, then record the operation as completed.
    fn guard(&self, desc: String) -> Result<(), DriverError> {
        let (delay, dead, fail) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.op_delay, inner.handle_dead, inner.fail_next_op.take())
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if dead {
            return Err(DriverError::HandleDead(
                "native handle closed externally".to_string(),
            ));
        }
        if let Some(message) = fail {
            return Err(DriverError::Operation(message));
        }
        self.inner.lock().unwrap().op_log.push(desc);
        Ok(())
    }
}

/// A [`WorkbookDriver`] over a [`FakeStore`].
pub struct FakeDriver {
    path: PathBuf,
    state: FakeWorkbook,
    store: FakeStore,
}

impl FakeDriver {
    fn sheet_name(&self, sheet: &SheetRef) -> Result<String, DriverError> {
        match sheet {
            SheetRef::Index(i) => self
                .state
                .sheets
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| DriverError::Operation(format!("no sheet at index {i}"))),
            SheetRef::Name(name) => {
                if self.state.sheets.iter().any(|s| s == name) {
                    Ok(name.clone())
                } else {
                    Err(DriverError::Operation(format!("no sheet named {name:?}")))
                }
            }
        }
    }
}

impl WorkbookDriver for FakeDriver {
    fn set_cell_value(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        value: CellValue,
    ) -> Result<(), DriverError> {
        let name = self.sheet_name(sheet)?;
        self.store.guard(format!("set {cell}={value}"))?;
        self.state.cells.insert((name, cell.to_string()), value);
        Ok(())
    }

    fn set_cell_formula(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), DriverError> {
        let name = self.sheet_name(sheet)?;
        self.store.guard(format!("formula {cell}={formula}"))?;
        self.state
            .formulas
            .insert((name, cell.to_string()), formula.to_string());
        Ok(())
    }

    fn get_cell_value(&mut self, sheet: &SheetRef, cell: &str) -> Result<CellValue, DriverError> {
        let name = self.sheet_name(sheet)?;
        self.store.guard(format!("get {cell}"))?;
        Ok(self
            .state
            .cells
            .get(&(name, cell.to_string()))
            .cloned()
            .unwrap_or(CellValue::Null))
    }

    fn append_table_rows(
        &mut self,
        table: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<u64, DriverError> {
        let count = rows.len() as u64;
        self.store.guard(format!("append {table} x{count}"))?;
        self.state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        Ok(count)
    }

    fn add_sheet(&mut self, name: &str) -> Result<(), DriverError> {
        self.store.guard(format!("add_sheet {name}"))?;
        if self.state.sheets.iter().any(|s| s == name) {
            return Err(DriverError::Operation(format!(
                "sheet {name:?} already exists"
            )));
        }
        self.state.sheets.push(name.to_string());
        Ok(())
    }

    fn list_sheets(&mut self) -> Result<Vec<String>, DriverError> {
        self.store.guard("list_sheets".to_string())?;
        Ok(self.state.sheets.clone())
    }

    fn recalculate(&mut self) -> Result<(), DriverError> {
        self.store.guard("recalculate".to_string())
    }

    fn save(&mut self) -> Result<(), DriverError> {
        self.store.guard("save".to_string())?;
        self.store
            .inner
            .lock()
            .unwrap()
            .disk
            .insert(self.path.clone(), self.state.clone());
        Ok(())
    }

    fn ping(&mut self) -> Result<(), DriverError> {
        self.store.guard("ping".to_string())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.store.guard("close".to_string())
    }
}

/// Opens [`FakeDriver`]s against a shared [`FakeStore`].
#[derive(Clone, Default)]
pub struct FakeDriverFactory {
    store: FakeStore,
}

impl FakeDriverFactory {
    pub fn new(store: FakeStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &FakeStore {
        &self.store
    }
}

impl DriverFactory for FakeDriverFactory {
    fn open(&self, path: &Path, _read_only: bool) -> Result<Box<dyn WorkbookDriver>, DriverError> {
        {
            let mut inner = self.store.inner.lock().unwrap();
            if let Some(message) = inner.fail_next_open.take() {
                return Err(DriverError::Operation(message));
            }
        }
        let state = self
            .store
            .inner
            .lock()
            .unwrap()
            .disk
            .get(path)
            .cloned()
            .unwrap_or_default();
        self.store.guard(format!("open {}", path.display()))?;
        Ok(Box::new(FakeDriver {
            path: path.to_path_buf(),
            state,
            store: self.store.clone(),
        }))
    }
}
