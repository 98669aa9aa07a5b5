//! Daemon configuration: socket endpoint and timeout policy.
//!
//! Precedence is flags over environment over defaults; the binary applies
//! flags, this module applies the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one daemon process.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Unix socket the daemon listens on.
    pub socket_path: PathBuf,
    /// Sessions idle longer than this are force-closed.
    pub idle_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Default per-operation bound when a request carries no `timeout_ms`.
    /// None means operations may run unbounded.
    pub default_op_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: sheetpilot_protocol::endpoint::socket_path(),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            default_op_timeout: None,
        }
    }
}

impl DaemonConfig {
    /// Defaults with `SHEETPILOT_SOCKET` and `SHEETPILOT_IDLE_TIMEOUT_SECS`
    /// applied (the endpoint helper already reads the socket variable).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_secs("SHEETPILOT_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}
