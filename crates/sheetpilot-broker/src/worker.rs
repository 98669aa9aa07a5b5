//! Apartment-affinity execution: one dedicated OS thread per session.
//!
//! Native spreadsheet automation is apartment-threaded: every call into a
//! given handle must come from the thread that created it. `SessionWorker`
//! enforces that: the driver is created *and* used *and* released on one
//! dedicated thread, and callers from the async side marshal closures onto
//! it through a FIFO mailbox.
//!
//! The FIFO mailbox is also what gives batches their ordering guarantee:
//! jobs for one session run strictly in submission order, so a save issued
//! after N mutations commits exactly those N mutations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::driver::{DriverError, WorkbookDriver};
use crate::error::{BrokerError, Result};

type Job = Box<dyn FnOnce(&mut dyn WorkbookDriver) + Send>;

/// A dedicated worker thread owning one workbook driver.
#[derive(Debug)]
pub struct SessionWorker {
    mailbox: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    /// Set when the native handle died; all further submissions fail fast.
    poisoned: Arc<AtomicBool>,
    /// Set after a caller-visible timeout: the timed-out job is still
    /// draining, and the handle must be probed before the next real job.
    needs_health_check: AtomicBool,
}

impl SessionWorker {
    /// Spawn the worker thread and create the driver on it.
    ///
    /// `open` runs on the new thread so the native handle is born on the
    /// thread that owns it for the rest of its life.
    pub async fn spawn<F>(name: String, open: F) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<Box<dyn WorkbookDriver>, DriverError> + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), DriverError>>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut driver = match open() {
                    Ok(d) => {
                        let _ = ready_tx.send(Ok(()));
                        d
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Runs until every sender is dropped; queued jobs drain first.
                for job in job_rx {
                    job(driver.as_mut());
                }

                if let Err(e) = driver.close() {
                    tracing::warn!(worker = %thread_name, error = %e, "driver close failed during teardown");
                }
            })
            .map_err(BrokerError::Io)?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                mailbox: Mutex::new(Some(job_tx)),
                thread: Mutex::new(Some(handle)),
                poisoned: Arc::new(AtomicBool::new(false)),
                needs_health_check: AtomicBool::new(false),
            }),
            Ok(Err(e)) => {
                drop(job_tx);
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                Err(e.into())
            }
            Err(_) => Err(BrokerError::HandleInvalidated(
                "worker thread died during driver creation".to_string(),
            )),
        }
    }

    /// Run an operation on the worker thread, waiting for its completion.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WorkbookDriver) -> std::result::Result<T, DriverError> + Send + 'static,
    {
        // After a timeout, verify the handle before accepting real work.
        // The probe queues behind the still-draining job (FIFO), so a wedged
        // handle is detected rather than corrupting the next operation.
        if self.needs_health_check.swap(false, Ordering::SeqCst) {
            self.submit(|driver| driver.ping().map_err(DriverError::into_fatal))
                .await?;
        }

        self.submit(op).await
    }

    /// Like [`run`](Self::run), bounded by a caller-supplied timeout.
    ///
    /// On expiry the caller gets [`BrokerError::Timeout`] but the job keeps
    /// running on the worker thread until it finishes. It is drained, never
    /// abandoned mid-call against the native handle.
    pub async fn run_timeout<T, F>(&self, op: F, limit: Option<Duration>) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WorkbookDriver) -> std::result::Result<T, DriverError> + Send + 'static,
    {
        match limit {
            None => self.run(op).await,
            Some(limit) => match tokio::time::timeout(limit, self.run(op)).await {
                Ok(result) => result,
                Err(_) => {
                    self.needs_health_check.store(true, Ordering::SeqCst);
                    Err(BrokerError::Timeout(limit))
                }
            },
        }
    }

    fn submit_job(&self, job: Job) -> Result<()> {
        let mailbox = self.mailbox.lock().expect("worker mailbox lock");
        match mailbox.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| {
                BrokerError::HandleInvalidated("worker thread is gone".to_string())
            }),
            None => Err(BrokerError::ShuttingDown),
        }
    }

    async fn submit<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WorkbookDriver) -> std::result::Result<T, DriverError> + Send + 'static,
    {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(BrokerError::HandleInvalidated(
                "native handle previously invalidated".to_string(),
            ));
        }

        let (done_tx, done_rx) = oneshot::channel::<std::result::Result<T, DriverError>>();
        let poisoned = Arc::clone(&self.poisoned);

        self.submit_job(Box::new(move |driver| {
            let result = op(driver);
            if matches!(&result, Err(e) if e.is_fatal()) {
                poisoned.store(true, Ordering::SeqCst);
            }
            // The receiver may have timed out and gone away; the work is
            // already done either way.
            let _ = done_tx.send(result);
        }))?;

        match done_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BrokerError::HandleInvalidated(
                "worker thread died mid-operation".to_string(),
            )),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Close the mailbox and join the thread. Queued jobs drain first, then
    /// the driver is released on its owning thread. Idempotent.
    pub async fn dispose(&self) {
        let sender = self.mailbox.lock().expect("worker mailbox lock").take();
        drop(sender);

        let handle = self.thread.lock().expect("worker thread lock").take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDriverFactory, FakeStore};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    async fn spawn_worker(factory: &FakeDriverFactory, path: &std::path::Path) -> SessionWorker {
        let factory = factory.clone();
        let path = path.to_path_buf();
        SessionWorker::spawn("test-worker".to_string(), move || {
            use crate::driver::DriverFactory;
            factory.open(&path, false)
        })
        .await
        .expect("spawn worker")
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let worker = spawn_worker(&factory, std::path::Path::new("/fake/wb.xlsx")).await;

        for i in 0..10u32 {
            let cell = format!("A{i}");
            worker
                .run(move |d| {
                    d.set_cell_value(
                        &sheetpilot_protocol::SheetRef::Index(0),
                        &cell,
                        (i as f64).into(),
                    )
                })
                .await
                .unwrap();
        }

        let ops = store.op_log();
        let sets: Vec<_> = ops.iter().filter(|o| o.starts_with("set A")).collect();
        assert_eq!(sets.len(), 10);
        for (i, op) in sets.iter().enumerate() {
            assert_eq!(**op, format!("set A{i}={i}"));
        }
        worker.dispose().await;
    }

    #[tokio::test]
    async fn concurrent_submitters_see_one_fifo_order() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let worker = Arc::new(spawn_worker(&factory, std::path::Path::new("/fake/wb.xlsx")).await);

        let mut tasks = Vec::new();
        for submitter in 0..4u32 {
            let worker = Arc::clone(&worker);
            tasks.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    let cell = format!("S{submitter}R{i}");
                    worker
                        .run(move |d| {
                            d.set_cell_value(
                                &sheetpilot_protocol::SheetRef::Index(0),
                                &cell,
                                1.0.into(),
                            )
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        // Exactly 100 operations recorded, and each submitter's own
        // operations appear in its submission order within the single log.
        let ops = store.op_log();
        assert_eq!(ops.len(), 100);
        for submitter in 0..4u32 {
            let mine: Vec<_> = ops
                .iter()
                .filter(|o| o.contains(&format!("S{submitter}R")))
                .collect();
            assert_eq!(mine.len(), 25);
            for (i, op) in mine.iter().enumerate() {
                assert!(op.contains(&format!("S{submitter}R{i}=")), "out of order: {op}");
            }
        }
        worker.dispose().await;
    }

    #[tokio::test]
    async fn timeout_leaves_job_draining_and_probes_health() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let worker = spawn_worker(&factory, std::path::Path::new("/fake/wb.xlsx")).await;

        store.set_op_delay(Duration::from_millis(200));
        let err = worker
            .run_timeout(
                |d| d.set_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1", 1.0.into()),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));

        // The next job succeeds after the slow one drains, and a ping ran
        // in between.
        store.set_op_delay(Duration::ZERO);
        worker
            .run(|d| d.get_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1"))
            .await
            .unwrap();

        let ops = store.op_log();
        assert!(ops.iter().any(|o| o == "ping"), "no health probe after timeout: {ops:?}");
        // The timed-out write completed despite the caller giving up.
        assert!(ops.iter().any(|o| o == "set A1=1"));
        worker.dispose().await;
    }

    #[tokio::test]
    async fn fatal_error_poisons_the_worker() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let worker = spawn_worker(&factory, std::path::Path::new("/fake/wb.xlsx")).await;

        store.kill_handle();
        let err = worker
            .run(|d| d.get_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::HandleInvalidated(_)));
        assert!(worker.is_poisoned());

        // Fast-fail without touching the thread.
        let err = worker
            .run(|d| d.get_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::HandleInvalidated(_)));
        worker.dispose().await;
    }

    #[tokio::test]
    async fn nonfatal_error_does_not_poison() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let worker = spawn_worker(&factory, std::path::Path::new("/fake/wb.xlsx")).await;

        store.fail_next_op("cell is locked");
        let err = worker
            .run(|d| d.set_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1", 1.0.into()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Driver(_)));
        assert!(!worker.is_poisoned());

        worker
            .run(|d| d.set_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1", 2.0.into()))
            .await
            .unwrap();
        worker.dispose().await;
    }

    #[tokio::test]
    async fn two_workers_run_in_parallel() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let w1 = spawn_worker(&factory, std::path::Path::new("/fake/one.xlsx")).await;
        let w2 = spawn_worker(&factory, std::path::Path::new("/fake/two.xlsx")).await;

        store.set_op_delay(Duration::from_millis(300));
        let start = Instant::now();
        let (a, b) = tokio::join!(
            w1.run(|d| d.set_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1", 1.0.into())),
            w2.run(|d| d.set_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1", 2.0.into())),
        );
        a.unwrap();
        b.unwrap();

        // Two 300ms operations on different sessions overlap; well under 2x.
        assert!(
            start.elapsed() < Duration::from_millis(550),
            "sessions did not run in parallel: {:?}",
            start.elapsed()
        );
        w1.dispose().await;
        w2.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_drains_queued_jobs() {
        let store = FakeStore::default();
        let factory = FakeDriverFactory::new(store.clone());
        let worker = Arc::new(spawn_worker(&factory, std::path::Path::new("/fake/wb.xlsx")).await);

        store.set_op_delay(Duration::from_millis(50));
        let pending = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                worker
                    .run(|d| {
                        d.set_cell_value(&sheetpilot_protocol::SheetRef::Index(0), "A1", 1.0.into())
                    })
                    .await
            })
        };
        // Let the job reach the mailbox before closing it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        worker.dispose().await;
        pending.await.unwrap().unwrap();

        worker.dispose().await;
        // The driver was released on the worker thread during teardown.
        assert!(store.op_log().iter().any(|o| o == "close"));
    }
}
