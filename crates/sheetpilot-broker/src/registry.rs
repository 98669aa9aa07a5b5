//! The session registry: token → session, with conflict detection, idle
//! eviction, and shutdown draining.
//!
//! The registry is the only structure multiple daemon tasks touch
//! concurrently, so its lock covers map operations only: driver work always
//! happens off-lock, on the session's own thread. It is an explicit object
//! constructed at daemon startup and torn down at daemon shutdown; nothing
//! here is process-global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::driver::DriverFactory;
use crate::error::{BrokerError, Result};
use crate::session::{BatchHandle, Session, SessionInfo};
use crate::worker::SessionWorker;

/// Registry tuning. Idle timeout and the daemon's default per-operation
/// bound come from daemon configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sessions idle longer than this are force-closed by the sweep.
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    /// Opens in flight, keyed by token: conflict-checked like live sessions
    /// so two concurrent opens of one file can't race past each other.
    opening: Vec<(String, PathBuf, bool)>,
    shutting_down: bool,
}

/// Maps opaque session tokens to live sessions.
pub struct SessionRegistry {
    config: RegistryConfig,
    factory: Arc<dyn DriverFactory>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            config,
            factory,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open a workbook and register it under a fresh token.
    ///
    /// Read-only sessions may share one file; any writable session holds it
    /// exclusively. The native open happens on the session's new dedicated
    /// thread, never under the registry lock.
    pub async fn open(&self, path: &Path, read_only: bool) -> Result<String> {
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BrokerError::FileNotFound(path.to_path_buf())
            } else {
                BrokerError::Io(e)
            }
        })?;

        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        {
            let mut inner = self.inner.lock().expect("registry lock");
            if inner.shutting_down {
                return Err(BrokerError::ShuttingDown);
            }
            let conflict = inner
                .sessions
                .values()
                .map(|s| (s.path().to_path_buf(), s.read_only()))
                .chain(inner.opening.iter().map(|(_, p, ro)| (p.clone(), *ro)))
                .any(|(p, ro)| p == canonical && !(ro && read_only));
            if conflict {
                return Err(BrokerError::AlreadyOpen(canonical));
            }
            inner
                .opening
                .push((token.clone(), canonical.clone(), read_only));
        }

        let factory = Arc::clone(&self.factory);
        let open_path = canonical.clone();
        let spawned = SessionWorker::spawn(format!("session-{token}"), move || {
            factory.open(&open_path, read_only)
        })
        .await;

        let doomed_worker = {
            let mut inner = self.inner.lock().expect("registry lock");
            inner.opening.retain(|(t, _, _)| *t != token);

            let worker = match spawned {
                Ok(worker) => worker,
                Err(e) => {
                    tracing::warn!(path = %canonical.display(), error = %e, "session open failed");
                    return Err(e);
                }
            };

            // Shutdown may have started while the native open was in flight;
            // never insert behind the drain.
            if inner.shutting_down {
                Some(worker)
            } else {
                let session = Arc::new(Session::new(
                    token.clone(),
                    canonical.clone(),
                    read_only,
                    BatchHandle::new(worker),
                ));
                inner.sessions.insert(token.clone(), session);
                tracing::info!(session = %token, path = %canonical.display(), read_only, "session opened");
                None
            }
        };

        if let Some(worker) = doomed_worker {
            worker.dispose().await;
            return Err(BrokerError::ShuttingDown);
        }
        Ok(token)
    }

    /// Look up a session, bumping its activity clock.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        let inner = self.inner.lock().expect("registry lock");
        match inner.sessions.get(session_id) {
            Some(session) => {
                session.touch();
                Ok(Arc::clone(session))
            }
            None => Err(BrokerError::UnknownSession(session_id.to_string())),
        }
    }

    /// Close a session, optionally saving first. Idempotent: closing an
    /// unknown or already-closed token is a no-op.
    ///
    /// The save and the disposal are jobs on the session's FIFO mailbox, so
    /// a close requested while an operation is in flight drains behind it
    /// rather than pre-empting it. A failed save still releases the handle.
    pub async fn close(&self, session_id: &str, save: bool) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock().expect("registry lock");
            inner.sessions.remove(session_id)
        };
        let Some(session) = session else {
            return Ok(());
        };

        let save_result = if save && session.batch().is_dirty() {
            session.batch().save().await
        } else {
            Ok(())
        };
        session.batch().dispose().await;
        tracing::info!(session = %session_id, "session closed");
        save_result
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().expect("registry lock");
        let mut infos: Vec<_> = inner.sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Force-close sessions idle past the configured timeout. Unsaved
    /// batched mutations are discarded (saves are explicit); a warning
    /// records what was dropped. Returns the number of sessions evicted.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().expect("registry lock");
            let ids: Vec<String> = inner
                .sessions
                .values()
                .filter(|s| s.idle_for() > self.config.idle_timeout)
                .map(|s| s.id().to_string())
                .collect();
            ids.iter()
                .filter_map(|id| inner.sessions.remove(id))
                .collect()
        };

        let count = expired.len();
        for session in expired {
            if session.batch().is_dirty() {
                tracing::warn!(
                    session = %session.id(),
                    path = %session.path().display(),
                    "evicting idle session with unsaved changes"
                );
            } else {
                tracing::info!(session = %session.id(), "evicting idle session");
            }
            session.batch().dispose().await;
        }
        count
    }

    /// Tear down every session. New opens fail once this starts. In-flight
    /// work drains; unsaved changes are discarded.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().expect("registry lock");
            inner.shutting_down = true;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            if session.batch().is_dirty() {
                tracing::warn!(
                    session = %session.id(),
                    path = %session.path().display(),
                    "shutdown discarding unsaved changes"
                );
            }
            session.batch().dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDriverFactory, FakeStore};
    use pretty_assertions::assert_eq;

    fn registry_with(
        store: &FakeStore,
        idle_timeout: Duration,
    ) -> SessionRegistry {
        SessionRegistry::new(
            RegistryConfig { idle_timeout },
            Arc::new(FakeDriverFactory::new(store.clone())),
        )
    }

    fn scratch_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"stub").unwrap();
        path
    }

    #[tokio::test]
    async fn open_missing_file_fails() {
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));
        let err = registry
            .open(Path::new("/no/such/file.xlsx"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn get_unknown_session_fails() {
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));

        let id = registry.open(&path, false).await.unwrap();
        registry.close(&id, false).await.unwrap();
        registry.close(&id, false).await.unwrap();
        assert!(matches!(
            registry.get(&id).unwrap_err(),
            BrokerError::UnknownSession(_)
        ));
    }

    #[tokio::test]
    async fn writable_open_is_exclusive_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));

        let id = registry.open(&path, false).await.unwrap();
        let err = registry.open(&path, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyOpen(_)));
        let err = registry.open(&path, true).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyOpen(_)));

        // A different file is fine.
        let other = scratch_file(&dir, "other.xlsx");
        let id2 = registry.open(&other, false).await.unwrap();
        assert_ne!(id, id2);
    }

    #[tokio::test]
    async fn read_only_sessions_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));

        let a = registry.open(&path, true).await.unwrap();
        let b = registry.open(&path, true).await.unwrap();
        assert_ne!(a, b);

        // But a writer cannot join them.
        let err = registry.open(&path, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyOpen(_)));
    }

    #[tokio::test]
    async fn failed_driver_open_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));

        store.fail_next_open("automation app refused");
        let err = registry.open(&path, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::Driver(_)));

        // The path is not stuck in a half-open state.
        let id = registry.open(&path, false).await.unwrap();
        registry.close(&id, false).await.unwrap();
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_millis(30));

        let id = registry.open(&path, false).await.unwrap();
        assert_eq!(registry.sweep_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.sweep_idle().await, 1);
        assert!(matches!(
            registry.get(&id).unwrap_err(),
            BrokerError::UnknownSession(_)
        ));
        // The native handle was released.
        assert!(store.op_log().iter().any(|o| o == "close"));
    }

    #[tokio::test]
    async fn activity_defers_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_millis(80));

        let id = registry.open(&path, false).await.unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            registry.get(&id).unwrap();
        }
        assert_eq!(registry.sweep_idle().await, 0);
        registry.close(&id, false).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_all_sessions_and_blocks_new_opens() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch_file(&dir, "a.xlsx");
        let b = scratch_file(&dir, "b.xlsx");
        let store = FakeStore::default();
        let registry = registry_with(&store, Duration::from_secs(60));

        registry.open(&a, false).await.unwrap();
        registry.open(&b, false).await.unwrap();
        registry.shutdown().await;

        assert!(registry.list().is_empty());
        let closes = store.op_log().iter().filter(|o| *o == "close").count();
        assert_eq!(closes, 2);

        let err = registry.open(&a, false).await.unwrap_err();
        assert!(matches!(err, BrokerError::ShuttingDown));
    }

    #[tokio::test]
    async fn open_racing_shutdown_is_rejected_and_disposed() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_file(&dir, "book.xlsx");
        let store = FakeStore::default();
        let registry = Arc::new(registry_with(&store, Duration::from_secs(60)));

        // Slow the native open so shutdown can start mid-flight.
        store.set_op_delay(Duration::from_millis(100));
        let opener = {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            tokio::spawn(async move { registry.open(&path, false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.shutdown().await;

        let err = opener.await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::ShuttingDown));
        assert!(registry.list().is_empty());
        // The freshly opened driver was released, not leaked.
        assert!(store.op_log().iter().any(|o| o == "close"));
    }
}
