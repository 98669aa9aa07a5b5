//! Sessions and batch handles.
//!
//! A session is the registry's view: token, target file, activity tracking.
//! The batch handle is the workbook's view: the worker that owns the native
//! handle plus the dirty flag that says unsaved mutations are batched in it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::dispatch::CommandRegistry;
use crate::error::{BrokerError, Result};
use crate::worker::SessionWorker;

/// One open workbook: the affinity worker plus batch state.
#[derive(Debug)]
pub struct BatchHandle {
    worker: SessionWorker,
    dirty: AtomicBool,
}

impl BatchHandle {
    pub fn new(worker: SessionWorker) -> Self {
        Self {
            worker,
            dirty: AtomicBool::new(false),
        }
    }

    /// Run a feature command against the live workbook.
    ///
    /// Mutating commands mark the batch dirty when they succeed, and also
    /// when the caller times out: the timed-out job still drains and applies
    /// on the session thread, so the batch must be treated as modified or a
    /// later save-on-close would skip the drained write. A mutation that
    /// failed outright never ran against the handle as far as the batch is
    /// concerned.
    pub async fn execute(
        &self,
        commands: &CommandRegistry,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let handler = commands.get(command)?;
        let run = handler.run;
        let result = self
            .worker
            .run_timeout(move |driver| run(driver, args), timeout)
            .await;
        if handler.mutating && matches!(&result, Ok(_) | Err(BrokerError::Timeout(_))) {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Commit every batched mutation to the underlying file in one save.
    pub async fn save(&self) -> Result<()> {
        self.worker.run(|driver| driver.save()).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_poisoned(&self) -> bool {
        self.worker.is_poisoned()
    }

    /// Release the native handle. Queued work drains first; runs on every
    /// exit path including after a failed save.
    pub async fn dispose(&self) {
        self.worker.dispose().await;
    }
}

/// A registry entry: one token bound to one open workbook.
#[derive(Debug)]
pub struct Session {
    id: String,
    path: PathBuf,
    read_only: bool,
    last_activity: Mutex<Instant>,
    batch: BatchHandle,
}

impl Session {
    pub fn new(id: String, path: PathBuf, read_only: bool, batch: BatchHandle) -> Self {
        Self {
            id,
            path,
            read_only,
            last_activity: Mutex::new(Instant::now()),
            batch,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn batch(&self) -> &BatchHandle {
        &self.batch
    }

    /// Record activity, deferring idle eviction.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("last_activity lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity lock")
            .elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            path: self.path.display().to_string(),
            read_only: self.read_only,
            dirty: self.batch.is_dirty(),
            poisoned: self.batch.is_poisoned(),
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

/// Snapshot of a session for `session.list`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub path: String,
    pub read_only: bool,
    pub dirty: bool,
    /// True when the native handle died; the session must be reopened.
    pub poisoned: bool,
    pub idle_secs: u64,
}
