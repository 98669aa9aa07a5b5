//! The daemon request loop.
//!
//! Accept a connection, read newline-delimited JSON envelopes, resolve the
//! session, dispatch, write the response. Responses on one connection are
//! written in request order; requests from different connections touching
//! different sessions run in parallel, while requests against one session
//! serialize on that session's dedicated thread inside the broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use sheetpilot_broker::{BrokerError, CommandRegistry, DriverFactory, RegistryConfig, SessionRegistry};
use sheetpilot_protocol::envelope::{commands, Request, Response};

use crate::config::DaemonConfig;

struct DaemonState {
    registry: SessionRegistry,
    commands: CommandRegistry,
    default_op_timeout: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Run the daemon until `daemon.shutdown` or ctrl-c, then drain and
/// release every open session.
pub async fn serve(config: DaemonConfig, factory: Arc<dyn DriverFactory>) -> std::io::Result<()> {
    let registry = SessionRegistry::new(
        RegistryConfig {
            idle_timeout: config.idle_timeout,
        },
        factory,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(DaemonState {
        registry,
        commands: CommandRegistry::builtin(),
        default_op_timeout: config.default_op_timeout,
        shutdown_tx,
        shutdown_rx,
    });

    // A previous daemon that died uncleanly leaves its socket file behind.
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)?;
    tracing::info!(socket = %config.socket_path.display(), "daemon listening");

    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&state),
        config.sweep_interval,
    ));

    let mut connections = JoinSet::new();
    let mut shutdown_rx = state.shutdown_rx.clone();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::info!("shutdown requested");
                break;
            }
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, shutting down");
                let _ = state.shutdown_tx.send(true);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    connections.spawn(handle_connection(Arc::clone(&state), stream));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    sweeper.abort();
    state.registry.shutdown().await;
    let _ = std::fs::remove_file(&config.socket_path);
    tracing::info!("daemon stopped");
    Ok(())
}

async fn sweep_loop(state: Arc<DaemonState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let evicted = state.registry.sweep_idle().await;
        if evicted > 0 {
            tracing::info!(evicted, "idle sweep closed sessions");
        }
    }
}

async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut shutdown_rx = state.shutdown_rx.clone();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Per-request error boundary: whatever goes wrong becomes an error
        // response, and the daemon keeps serving.
        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                tracing::debug!(command = %request.command, "request");
                handle_request(&state, request).await
            }
            Err(e) => Response::error(format!("protocol error: malformed request: {e}")),
        };

        let wire = serde_json::to_string(&response).unwrap_or_else(|e| {
            let fallback = Response::error(format!("encode failed: {e}"));
            serde_json::to_string(&fallback).expect("error response with plain strings serializes")
        });
        if write_half.write_all(wire.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }
}

async fn handle_request(state: &DaemonState, request: Request) -> Response {
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .or(state.default_op_timeout);

    match dispatch(state, request, timeout).await {
        Ok(Value::Null) => Response::ok_empty(),
        Ok(result) => Response::ok(result),
        Err(e) => Response::error(e.to_string()),
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(
    args: Option<Value>,
) -> Result<T, BrokerError> {
    // Absent args behave like `{}` so commands with all-optional arguments
    // can be sent bare.
    let args = args.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(args).map_err(|e| BrokerError::InvalidArgs(e.to_string()))
}

fn require_session(request: &Request) -> Result<&str, BrokerError> {
    request
        .session_id
        .as_deref()
        .ok_or_else(|| BrokerError::InvalidArgs("missing session_id".to_string()))
}

async fn dispatch(
    state: &DaemonState,
    request: Request,
    timeout: Option<Duration>,
) -> Result<Value, BrokerError> {
    match request.command.as_str() {
        commands::SESSION_OPEN => {
            #[derive(Deserialize)]
            struct OpenArgs {
                path: PathBuf,
                #[serde(default)]
                read_only: bool,
            }
            let args: OpenArgs = parse_args(request.args)?;
            let session_id = state.registry.open(&args.path, args.read_only).await?;
            Ok(json!({ "session_id": session_id }))
        }
        commands::SESSION_CLOSE => {
            #[derive(Deserialize, Default)]
            struct CloseArgs {
                #[serde(default)]
                save: bool,
            }
            let session_id = require_session(&request)?.to_string();
            let args: CloseArgs = parse_args(request.args)?;
            state.registry.close(&session_id, args.save).await?;
            Ok(Value::Null)
        }
        commands::SESSION_LIST => Ok(json!({ "sessions": state.registry.list() })),
        commands::WORKBOOK_SAVE => {
            let session = state.registry.get(require_session(&request)?)?;
            session.batch().save().await?;
            Ok(Value::Null)
        }
        commands::DAEMON_PING => Ok(json!({ "version": env!("CARGO_PKG_VERSION") })),
        commands::DAEMON_SHUTDOWN => {
            let _ = state.shutdown_tx.send(true);
            Ok(Value::Null)
        }
        _ => {
            // Feature command: resolve the session, run on its thread.
            let session = state.registry.get(require_session(&request)?)?;
            session
                .batch()
                .execute(
                    &state.commands,
                    &request.command,
                    request
                        .args
                        .unwrap_or_else(|| Value::Object(Default::default())),
                    timeout,
                )
                .await
        }
    }
}
