//! Where to find the daemon.
//!
//! Both sides of the socket resolve the endpoint the same way:
//! `SHEETPILOT_SOCKET`, then `$XDG_RUNTIME_DIR/sheetpilot.sock`, then a
//! per-user path under /tmp.

use std::path::PathBuf;

/// The daemon socket path for this environment.
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("SHEETPILOT_SOCKET") {
        return PathBuf::from(path);
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("sheetpilot.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "shared".to_string());
    PathBuf::from(format!("/tmp/sheetpilot-{user}.sock"))
}
