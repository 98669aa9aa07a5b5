//! sheetpilot CLI - front end for the session daemon.
//!
//! Every invocation is one request/response cycle against `sheetpilotd`:
//! resolve the socket, send the envelope, print the result, exit 0 or 1.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use sheetpilot_client::Client;
use sheetpilot_protocol::endpoint;
use sheetpilot_protocol::envelope::{commands, Request};

#[derive(Parser)]
#[command(name = "sheetpilot")]
#[command(author, version, about = "Workbook automation through a session daemon")]
struct Cli {
    /// Daemon socket (default: $SHEETPILOT_SOCKET or a per-user path)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Per-operation timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open, close, or list daemon sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Read and write cells in an open session
    Cell {
        #[command(subcommand)]
        action: CellAction,
    },

    /// Manage worksheets in an open session
    Sheet {
        #[command(subcommand)]
        action: SheetAction,
    },

    /// Table operations in an open session
    Table {
        #[command(subcommand)]
        action: TableAction,
    },

    /// Workbook-level operations (save, recalculate)
    Workbook {
        #[command(subcommand)]
        action: WorkbookAction,
    },

    /// Send a raw command with JSON args (escape hatch for new commands)
    Run {
        /// Dot-namespaced command, e.g. table.append
        command: String,

        /// Session token
        #[arg(short = 's', long)]
        session: Option<String>,

        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },

    /// Daemon health and lifecycle
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Open a workbook and print the new session token
    Open {
        /// Workbook file to open
        path: PathBuf,

        /// Open without write access (multiple read-only sessions may share a file)
        #[arg(long)]
        read_only: bool,
    },

    /// Close a session, discarding unsaved changes unless --save is given
    Close {
        session: String,

        /// Save before closing
        #[arg(long)]
        save: bool,
    },

    /// List open sessions
    List,
}

#[derive(Subcommand)]
enum CellAction {
    /// Set a cell value (parsed as number or bool when possible)
    Set {
        #[arg(short = 's', long)]
        session: String,
        cell: String,
        value: String,
        #[arg(long)]
        sheet: Option<String>,
    },

    /// Print a cell's computed value
    Get {
        #[arg(short = 's', long)]
        session: String,
        cell: String,
        #[arg(long)]
        sheet: Option<String>,
    },

    /// Set a cell formula
    Formula {
        #[arg(short = 's', long)]
        session: String,
        cell: String,
        formula: String,
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(Subcommand)]
enum SheetAction {
    /// Add a worksheet
    Add {
        #[arg(short = 's', long)]
        session: String,
        name: String,
    },

    /// List worksheet names
    List {
        #[arg(short = 's', long)]
        session: String,
    },
}

#[derive(Subcommand)]
enum TableAction {
    /// Append rows (a JSON array of arrays) to a named table
    Append {
        #[arg(short = 's', long)]
        session: String,
        table: String,
        /// Rows as JSON, e.g. '[["north", 120], ["south", 80]]'
        #[arg(long)]
        rows: String,
    },
}

#[derive(Subcommand)]
enum WorkbookAction {
    /// Commit all batched mutations to the file in one save
    Save {
        #[arg(short = 's', long)]
        session: String,
    },

    /// Force a full recalculation
    Recalculate {
        #[arg(short = 's', long)]
        session: String,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Check that the daemon is reachable
    Ping,

    /// Ask the daemon to shut down, draining open sessions
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(endpoint::socket_path);
    let timeout_ms = cli.timeout_secs.map(|s| s * 1000);
    let mut client = Client::connect(&socket)?;

    let mut call = |request: Request| -> Result<Value> {
        let mut request = request;
        request.timeout_ms = timeout_ms;
        let response = client
            .call(&request)
            .with_context(|| format!("request '{}' failed", request.command))?;
        if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            bail!(
                "{}",
                response
                    .error_message
                    .unwrap_or_else(|| "unknown daemon error".to_string())
            )
        }
    };

    match cli.command {
        Commands::Session { action } => match action {
            SessionAction::Open { path, read_only } => {
                let path = path
                    .canonicalize()
                    .with_context(|| format!("cannot resolve '{}'", path.display()))?;
                let result = call(Request {
                    command: commands::SESSION_OPEN.into(),
                    session_id: None,
                    args: Some(json!({"path": path, "read_only": read_only})),
                    timeout_ms: None,
                })?;
                match result.get("session_id").and_then(Value::as_str) {
                    Some(id) => println!("{id}"),
                    None => bail!("daemon returned no session id"),
                }
            }
            SessionAction::Close { session, save } => {
                call(Request::scoped(
                    commands::SESSION_CLOSE,
                    session,
                    json!({"save": save}),
                ))?;
            }
            SessionAction::List => {
                let result = call(Request::bare(commands::SESSION_LIST))?;
                let sessions = result
                    .get("sessions")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if sessions.is_empty() {
                    eprintln!("No open sessions");
                } else {
                    for s in sessions {
                        println!(
                            "{}  {}{}{}  idle {}s",
                            s["session_id"].as_str().unwrap_or("?"),
                            s["path"].as_str().unwrap_or("?"),
                            if s["dirty"].as_bool().unwrap_or(false) {
                                " (unsaved)"
                            } else {
                                ""
                            },
                            if s["poisoned"].as_bool().unwrap_or(false) {
                                " (dead)"
                            } else {
                                ""
                            },
                            s["idle_secs"].as_u64().unwrap_or(0),
                        );
                    }
                }
            }
        },
        Commands::Cell { action } => match action {
            CellAction::Set {
                session,
                cell,
                value,
                sheet,
            } => {
                let mut args = json!({"cell": cell, "value": parse_value(&value)});
                if let Some(sheet) = sheet {
                    args["sheet"] = json!(sheet);
                }
                call(Request::scoped("cell.set", session, args))?;
            }
            CellAction::Get { session, cell, sheet } => {
                let mut args = json!({"cell": cell});
                if let Some(sheet) = sheet {
                    args["sheet"] = json!(sheet);
                }
                let result = call(Request::scoped("cell.get", session, args))?;
                println!("{}", render_value(result.get("value").unwrap_or(&Value::Null)));
            }
            CellAction::Formula {
                session,
                cell,
                formula,
                sheet,
            } => {
                let mut args = json!({"cell": cell, "formula": formula});
                if let Some(sheet) = sheet {
                    args["sheet"] = json!(sheet);
                }
                call(Request::scoped("cell.formula", session, args))?;
            }
        },
        Commands::Sheet { action } => match action {
            SheetAction::Add { session, name } => {
                call(Request::scoped("sheet.add", session, json!({"name": name})))?;
            }
            SheetAction::List { session } => {
                let result = call(Request::scoped("sheet.list", session, json!({})))?;
                if let Some(sheets) = result.get("sheets").and_then(Value::as_array) {
                    for sheet in sheets {
                        println!("{}", sheet.as_str().unwrap_or("?"));
                    }
                }
            }
        },
        Commands::Table { action } => match action {
            TableAction::Append {
                session,
                table,
                rows,
            } => {
                let rows: Value = serde_json::from_str(&rows)
                    .context("--rows must be a JSON array of arrays")?;
                let result = call(Request::scoped(
                    "table.append",
                    session,
                    json!({"table": table, "rows": rows}),
                ))?;
                if let Some(n) = result.get("appended").and_then(Value::as_u64) {
                    eprintln!("Appended {n} rows");
                }
            }
        },
        Commands::Workbook { action } => match action {
            WorkbookAction::Save { session } => {
                call(Request::scoped(commands::WORKBOOK_SAVE, session, json!({})))?;
                eprintln!("Saved");
            }
            WorkbookAction::Recalculate { session } => {
                call(Request::scoped("workbook.recalculate", session, json!({})))?;
            }
        },
        Commands::Run {
            command,
            session,
            args,
        } => {
            let args: Option<Value> = match args {
                Some(raw) => {
                    Some(serde_json::from_str(&raw).context("--args must be a JSON object")?)
                }
                None => None,
            };
            let result = call(Request {
                command,
                session_id: session,
                args,
                timeout_ms: None,
            })?;
            if !result.is_null() {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
        Commands::Daemon { action } => match action {
            DaemonAction::Ping => {
                let result = call(Request::bare(commands::DAEMON_PING))?;
                println!(
                    "daemon alive (version {})",
                    result.get("version").and_then(Value::as_str).unwrap_or("?")
                );
            }
            DaemonAction::Stop => {
                call(Request::bare(commands::DAEMON_SHUTDOWN))?;
                eprintln!("Daemon stopping");
            }
        },
    }

    Ok(())
}

/// Interpret a CLI value the way a spreadsheet would: bool, then number,
/// then text.
fn parse_value(raw: &str) -> Value {
    match raw {
        "true" | "TRUE" => return Value::Bool(true),
        "false" | "FALSE" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "<empty>".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
