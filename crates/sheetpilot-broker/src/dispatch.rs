//! Command dispatch: dot-namespaced command names to driver operations.
//!
//! This is the seam the feature-command families plug into. Each handler is
//! a plain `fn` that parses its JSON args and makes the corresponding driver
//! call; the worker runs it on the session's dedicated thread. Handlers are
//! classified mutating or read-only, and that classification drives the
//! batch dirty flag.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use sheetpilot_protocol::bridge::{CellValue, SheetRef};

use crate::driver::{DriverError, WorkbookDriver};
use crate::error::{BrokerError, Result};

pub type HandlerFn = fn(&mut dyn WorkbookDriver, Value) -> std::result::Result<Value, DriverError>;

/// One registered feature command.
#[derive(Debug)]
pub struct Handler {
    pub mutating: bool,
    pub run: HandlerFn,
}

/// The command table. Built once at daemon startup.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandRegistry {
    /// The built-in feature commands.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("cell.set", true, cell_set);
        registry.register("cell.formula", true, cell_formula);
        registry.register("cell.get", false, cell_get);
        registry.register("sheet.add", true, sheet_add);
        registry.register("sheet.list", false, sheet_list);
        registry.register("table.append", true, table_append);
        registry.register("workbook.recalculate", true, workbook_recalculate);
        registry
    }

    pub fn register(&mut self, name: &'static str, mutating: bool, run: HandlerFn) {
        self.handlers.insert(name, Handler { mutating, run });
    }

    pub fn get(&self, name: &str) -> Result<&Handler> {
        self.handlers
            .get(name)
            .ok_or_else(|| BrokerError::UnknownCommand(name.to_string()))
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> std::result::Result<T, DriverError> {
    serde_json::from_value(args).map_err(|e| DriverError::InvalidArgs(e.to_string()))
}

fn default_sheet() -> SheetRef {
    SheetRef::Index(0)
}

#[derive(Deserialize)]
struct CellSetArgs {
    #[serde(default = "default_sheet")]
    sheet: SheetRef,
    cell: String,
    value: CellValue,
}

fn cell_set(
    driver: &mut dyn WorkbookDriver,
    args: Value,
) -> std::result::Result<Value, DriverError> {
    let args: CellSetArgs = parse_args(args)?;
    driver.set_cell_value(&args.sheet, &args.cell, args.value)?;
    Ok(Value::Null)
}

#[derive(Deserialize)]
struct CellFormulaArgs {
    #[serde(default = "default_sheet")]
    sheet: SheetRef,
    cell: String,
    formula: String,
}

fn cell_formula(
    driver: &mut dyn WorkbookDriver,
    args: Value,
) -> std::result::Result<Value, DriverError> {
    let args: CellFormulaArgs = parse_args(args)?;
    driver.set_cell_formula(&args.sheet, &args.cell, &args.formula)?;
    Ok(Value::Null)
}

#[derive(Deserialize)]
struct CellGetArgs {
    #[serde(default = "default_sheet")]
    sheet: SheetRef,
    cell: String,
}

fn cell_get(
    driver: &mut dyn WorkbookDriver,
    args: Value,
) -> std::result::Result<Value, DriverError> {
    let args: CellGetArgs = parse_args(args)?;
    let value = driver.get_cell_value(&args.sheet, &args.cell)?;
    Ok(json!({ "value": value }))
}

#[derive(Deserialize)]
struct SheetAddArgs {
    name: String,
}

fn sheet_add(
    driver: &mut dyn WorkbookDriver,
    args: Value,
) -> std::result::Result<Value, DriverError> {
    let args: SheetAddArgs = parse_args(args)?;
    driver.add_sheet(&args.name)?;
    Ok(Value::Null)
}

fn sheet_list(
    driver: &mut dyn WorkbookDriver,
    _args: Value,
) -> std::result::Result<Value, DriverError> {
    let sheets = driver.list_sheets()?;
    Ok(json!({ "sheets": sheets }))
}

#[derive(Deserialize)]
struct TableAppendArgs {
    table: String,
    rows: Vec<Vec<CellValue>>,
}

fn table_append(
    driver: &mut dyn WorkbookDriver,
    args: Value,
) -> std::result::Result<Value, DriverError> {
    let args: TableAppendArgs = parse_args(args)?;
    let appended = driver.append_table_rows(&args.table, args.rows)?;
    Ok(json!({ "appended": appended }))
}

fn workbook_recalculate(
    driver: &mut dyn WorkbookDriver,
    _args: Value,
) -> std::result::Result<Value, DriverError> {
    driver.recalculate()?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverFactory;
    use crate::fake::{FakeDriverFactory, FakeStore};
    use pretty_assertions::assert_eq;

    fn driver(store: &FakeStore) -> Box<dyn WorkbookDriver> {
        FakeDriverFactory::new(store.clone())
            .open(std::path::Path::new("/fake/wb.xlsx"), false)
            .unwrap()
    }

    #[test]
    fn unknown_command_is_an_error() {
        let registry = CommandRegistry::builtin();
        let err = registry.get("pivot.refresh").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownCommand(_)));
    }

    #[test]
    fn cell_set_then_get_roundtrips() {
        let store = FakeStore::default();
        let mut d = driver(&store);
        let registry = CommandRegistry::builtin();

        let set = registry.get("cell.set").unwrap();
        assert!(set.mutating);
        (set.run)(d.as_mut(), json!({"cell": "A1", "value": 42.0})).unwrap();

        let get = registry.get("cell.get").unwrap();
        assert!(!get.mutating);
        let out = (get.run)(d.as_mut(), json!({"cell": "A1"})).unwrap();
        assert_eq!(out, json!({"value": 42.0}));
    }

    #[test]
    fn bad_args_surface_as_invalid_args() {
        let store = FakeStore::default();
        let mut d = driver(&store);
        let registry = CommandRegistry::builtin();

        let set = registry.get("cell.set").unwrap();
        let err = (set.run)(d.as_mut(), json!({"value": 1.0})).unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgs(_)));
    }

    #[test]
    fn table_append_reports_row_count() {
        let store = FakeStore::default();
        let mut d = driver(&store);
        let registry = CommandRegistry::builtin();

        let append = registry.get("table.append").unwrap();
        let out = (append.run)(
            d.as_mut(),
            json!({"table": "Sales", "rows": [[1.0, "a"], [2.0, "b"]]}),
        )
        .unwrap();
        assert_eq!(out, json!({"appended": 2}));
    }

    #[test]
    fn command_names_are_stable() {
        let registry = CommandRegistry::builtin();
        assert_eq!(
            registry.command_names(),
            vec![
                "cell.formula",
                "cell.get",
                "cell.set",
                "sheet.add",
                "sheet.list",
                "table.append",
                "workbook.recalculate",
            ]
        );
    }
}
