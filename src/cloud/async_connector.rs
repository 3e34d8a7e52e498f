//! Asynchronous cloud traffic engine.
//!
//! Producers enqueue work and return immediately; a dispatcher thread feeds a
//! small pool of worker threads that perform the blob operations. Failed items
//! go back to the dispatcher with a due time and sit in a delay heap until
//! they are ready to retry, so no worker ever sleeps holding a retry.
//!
//! Enqueueing an upload consumes the source file: it is moved into a private
//! scratch directory at enqueue time, so the producer's staging path is free
//! the moment the call returns.

use crate::cloud::connector::{append_rows, CloudConnector, HeaderGuard};
use crate::error::{EdgekitError, Result};
use crate::journal::Row;
use crate::record::StorageTier;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
enum Task {
    Upload {
        container: String,
        blob: String,
        src: PathBuf,
        tier: StorageTier,
    },
    Append {
        container: String,
        blob: String,
        columns: Vec<String>,
        rows: Vec<Row>,
    },
}

#[derive(Debug)]
struct WorkItem {
    task: Task,
    iteration: u32,
}

enum DispatcherMsg {
    Ready(WorkItem),
    Retry { item: WorkItem, due: Instant },
    Shutdown,
}

enum WorkerMsg {
    Item(WorkItem),
    Stop,
}

struct Delayed {
    due: Instant,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
pub struct TransferCounters {
    pub uploads_completed: AtomicU64,
    pub appends_completed: AtomicU64,
    pub retries: AtomicU64,
    pub dropped: AtomicU64,
}

/// Handle to the async upload engine. Cheap to clone via `Arc`.
pub struct AsyncCloudConnector {
    connector: Arc<dyn CloudConnector>,
    header_guard: HeaderGuard,
    scratch_dir: PathBuf,
    append_retry_cap: u32,
    inbox: Sender<DispatcherMsg>,
    in_flight: AtomicUsize,
    counters: TransferCounters,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncCloudConnector {
    pub fn start(
        connector: Arc<dyn CloudConnector>,
        scratch_dir: &Path,
        workers: usize,
        append_retry_cap: u32,
    ) -> Result<Arc<Self>> {
        let scratch_dir = scratch_dir.join("pending_uploads");
        std::fs::create_dir_all(&scratch_dir)?;

        let (inbox_tx, inbox_rx) = unbounded::<DispatcherMsg>();
        let (work_tx, work_rx) = bounded::<WorkerMsg>(workers * 2);

        let engine = Arc::new(Self {
            connector,
            header_guard: HeaderGuard::new(),
            scratch_dir,
            append_retry_cap,
            inbox: inbox_tx,
            in_flight: AtomicUsize::new(0),
            counters: TransferCounters::default(),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::with_capacity(workers + 1);
        for worker_id in 0..workers {
            let engine = Arc::clone(&engine);
            let rx = work_rx.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("cloud-worker-{worker_id}"))
                    .spawn(move || engine.worker_loop(worker_id, rx))?,
            );
        }
        {
            let engine = Arc::clone(&engine);
            threads.push(
                std::thread::Builder::new()
                    .name("cloud-dispatcher".to_string())
                    .spawn(move || dispatcher_loop(inbox_rx, work_tx, workers, engine))?,
            );
        }
        *engine.threads.lock() = threads;
        info!("Async cloud connector started with {workers} workers");
        Ok(engine)
    }

    pub fn connector(&self) -> &Arc<dyn CloudConnector> {
        &self.connector
    }

    pub fn counters(&self) -> &TransferCounters {
        &self.counters
    }

    /// Enqueue a file upload. The source file is moved out of `src`
    /// immediately; by the time this returns the caller's path is gone.
    pub fn upload_file(
        &self,
        container: &str,
        blob: &str,
        src: &Path,
        tier: StorageTier,
    ) -> Result<()> {
        let held = self.scratch_dir.join(format!(
            "{}_{}",
            Uuid::new_v4().simple(),
            src.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "blob".to_string())
        ));
        // Rename keeps this cheap on the same filesystem; fall back to a copy
        // if the scratch dir is on another mount.
        if std::fs::rename(src, &held).is_err() {
            std::fs::copy(src, &held)?;
            std::fs::remove_file(src)?;
        }
        self.submit(Task::Upload {
            container: container.to_string(),
            blob: blob.to_string(),
            src: held,
            tier,
        })
    }

    /// Enqueue a row append to a CSV journal blob. Rows are carried in memory;
    /// the caller has already consumed whatever file they came from.
    pub fn append_rows(
        &self,
        container: &str,
        blob: &str,
        columns: Vec<String>,
        rows: Vec<Row>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.submit(Task::Append {
            container: container.to_string(),
            blob: blob.to_string(),
            columns,
            rows,
        })
    }

    fn submit(&self, task: Task) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inbox
            .send(DispatcherMsg::Ready(WorkItem { task, iteration: 0 }))
            .map_err(|_| {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                EdgekitError::component("async_cloud", "engine is shut down")
            })
    }

    /// Number of items enqueued but not yet completed or dropped.
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Block until the queue drains or `timeout` elapses. Test and shutdown
    /// aid; returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Stop the engine. Items already queued are attempted once more without
    /// their retry delays; anything still failing is dropped.
    pub fn shutdown(&self) {
        if self.inbox.send(DispatcherMsg::Shutdown).is_err() {
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("Cloud engine thread panicked during shutdown");
            }
        }
        info!(
            "Async cloud connector stopped ({} uploads, {} appends, {} retries, {} dropped)",
            self.counters.uploads_completed.load(Ordering::Relaxed),
            self.counters.appends_completed.load(Ordering::Relaxed),
            self.counters.retries.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed),
        );
    }

    fn worker_loop(&self, worker_id: usize, rx: Receiver<WorkerMsg>) {
        loop {
            match rx.recv() {
                Ok(WorkerMsg::Item(item)) => self.execute(worker_id, item),
                Ok(WorkerMsg::Stop) | Err(_) => break,
            }
        }
    }

    fn execute(&self, worker_id: usize, mut item: WorkItem) {
        let outcome = match &item.task {
            Task::Upload {
                container,
                blob,
                src,
                tier,
            } => self
                .connector
                .upload_file(container, blob, src, *tier, true)
                .map(|()| {
                    if let Err(e) = std::fs::remove_file(src) {
                        warn!("Could not remove uploaded scratch file: {e}");
                    }
                    self.counters
                        .uploads_completed
                        .fetch_add(1, Ordering::Relaxed);
                }),
            Task::Append {
                container,
                blob,
                columns,
                rows,
            } => append_rows(
                &*self.connector,
                &self.header_guard,
                container,
                blob,
                columns,
                rows,
            )
            .map(|()| {
                self.counters
                    .appends_completed
                    .fetch_add(1, Ordering::Relaxed);
            }),
        };

        match outcome {
            Ok(()) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Err(e) => {
                item.iteration += 1;
                let is_append = matches!(item.task, Task::Append { .. });
                if is_append && item.iteration >= self.append_retry_cap {
                    error!(
                        "Worker {worker_id} dropping append after {} attempts: {e}",
                        item.iteration
                    );
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                let delay = Duration::from_secs(2 * u64::from(item.iteration));
                debug!(
                    "Worker {worker_id} transfer failed (attempt {}), retrying in {:?}: {e}",
                    item.iteration, delay
                );
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                let due = Instant::now() + delay;
                if self.inbox.send(DispatcherMsg::Retry { item, due }).is_err() {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

fn dispatcher_loop(
    inbox: Receiver<DispatcherMsg>,
    work_tx: Sender<WorkerMsg>,
    workers: usize,
    engine: Arc<AsyncCloudConnector>,
) {
    let mut delayed: BinaryHeap<Reverse<Delayed>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    'run: loop {
        // Release everything whose due time has passed.
        while delayed
            .peek()
            .map(|Reverse(d)| d.due <= Instant::now())
            .unwrap_or(false)
        {
            if let Some(Reverse(d)) = delayed.pop() {
                if work_tx.send(WorkerMsg::Item(d.item)).is_err() {
                    break 'run;
                }
            }
        }

        let timeout = delayed
            .peek()
            .map(|Reverse(d)| d.due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(60));

        match inbox.recv_timeout(timeout) {
            Ok(DispatcherMsg::Ready(item)) => {
                if work_tx.send(WorkerMsg::Item(item)).is_err() {
                    break;
                }
            }
            Ok(DispatcherMsg::Retry { item, due }) => {
                seq += 1;
                delayed.push(Reverse(Delayed { due, seq, item }));
            }
            Ok(DispatcherMsg::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Final drain: one more attempt for whatever is queued, no delays.
    for msg in inbox.try_iter() {
        match msg {
            DispatcherMsg::Ready(item) | DispatcherMsg::Retry { item, .. } => {
                if work_tx.send(WorkerMsg::Item(item)).is_err() {
                    break;
                }
            }
            DispatcherMsg::Shutdown => {}
        }
    }
    for Reverse(d) in delayed.drain() {
        if work_tx.send(WorkerMsg::Item(d.item)).is_err() {
            break;
        }
    }
    // Anything a worker re-fails now is accounted as dropped rather than
    // requeued forever.
    drop(inbox);
    for _ in 0..workers {
        let _ = work_tx.send(WorkerMsg::Stop);
    }
    let _ = engine; // keeps the engine alive for the length of the drain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::connector::LocalCloudConnector;
    use crate::journal;
    use std::io::Write;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    fn engine(workers: usize) -> (TempDir, Arc<AsyncCloudConnector>) {
        let dir = TempDir::new().unwrap();
        let conn: Arc<dyn CloudConnector> =
            Arc::new(LocalCloudConnector::new(&dir.path().join("cloud"), "test").unwrap());
        let engine =
            AsyncCloudConnector::start(conn, &dir.path().join("tmp"), workers, 3).unwrap();
        (dir, engine)
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_upload_consumes_source_and_lands_in_cloud() {
        let (dir, engine) = engine(2);
        let src = dir.path().join("sample.txt");
        let mut f = std::fs::File::create(&src).unwrap();
        f.write_all(b"payload").unwrap();
        drop(f);

        engine
            .upload_file("uploads", "sample.txt", &src, StorageTier::Hot)
            .unwrap();
        // The staging path is free as soon as the enqueue returns.
        assert!(!src.exists());

        assert!(engine.wait_idle(Duration::from_secs(10)));
        assert_eq!(
            engine
                .connector()
                .download_bytes("uploads", "sample.txt")
                .unwrap(),
            b"payload"
        );
        engine.shutdown();
    }

    #[test]
    fn test_appends_from_many_threads_all_land() {
        let (_dir, engine) = engine(4);
        let columns = vec!["timestamp".to_string(), "n".to_string()];
        let mut handles = Vec::new();
        for t in 0..4 {
            let engine = Arc::clone(&engine);
            let columns = columns.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..5 {
                    engine
                        .append_rows(
                            "journals",
                            "j.csv",
                            columns.clone(),
                            vec![row(&[
                                ("timestamp", &format!("t{t}-{i}")),
                                ("n", &i.to_string()),
                            ])],
                        )
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(engine.wait_idle(Duration::from_secs(30)));

        let bytes = engine
            .connector()
            .download_bytes("journals", "j.csv")
            .unwrap();
        let (_, rows) = journal::parse_csv_bytes(&bytes).unwrap();
        assert_eq!(rows.len(), 20);
        engine.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (_dir, engine) = engine(2);
        engine.shutdown();
        engine.shutdown();
        // Submitting after shutdown fails cleanly.
        assert!(engine
            .append_rows(
                "journals",
                "j.csv",
                vec!["timestamp".to_string()],
                vec![row(&[("timestamp", "t")])],
            )
            .is_err());
    }

    /// Connector that fails the first N file uploads, and optionally every
    /// append-path write, then behaves.
    struct FlakyConnector {
        inner: LocalCloudConnector,
        upload_failures_left: AtomicU32,
        fail_appends: bool,
    }

    impl FlakyConnector {
        fn injected(&self, container: &str) -> EdgekitError {
            EdgekitError::cloud(container.to_string(), "injected failure".to_string())
        }
    }

    impl CloudConnector for FlakyConnector {
        fn account_name(&self) -> &str {
            self.inner.account_name()
        }
        fn create_container(&self, container: &str) -> Result<()> {
            self.inner.create_container(container)
        }
        fn exists(&self, container: &str, blob: &str) -> Result<bool> {
            self.inner.exists(container, blob)
        }
        fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(container, prefix)
        }
        fn upload_file(
            &self,
            container: &str,
            blob: &str,
            src: &Path,
            tier: StorageTier,
            overwrite: bool,
        ) -> Result<()> {
            if self.upload_failures_left.load(Ordering::SeqCst) > 0 {
                self.upload_failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.injected(container));
            }
            self.inner.upload_file(container, blob, src, tier, overwrite)
        }
        fn upload_bytes(
            &self,
            container: &str,
            blob: &str,
            bytes: &[u8],
            overwrite: bool,
        ) -> Result<()> {
            if self.fail_appends {
                return Err(self.injected(container));
            }
            self.inner.upload_bytes(container, blob, bytes, overwrite)
        }
        fn download_bytes(&self, container: &str, blob: &str) -> Result<Vec<u8>> {
            self.inner.download_bytes(container, blob)
        }
        fn download_to_file(&self, container: &str, blob: &str, dst: &Path) -> Result<()> {
            self.inner.download_to_file(container, blob, dst)
        }
        fn append_bytes(&self, container: &str, blob: &str, bytes: &[u8]) -> Result<()> {
            if self.fail_appends {
                return Err(self.injected(container));
            }
            self.inner.append_bytes(container, blob, bytes)
        }
        fn delete_blob(&self, container: &str, blob: &str) -> Result<()> {
            self.inner.delete_blob(container, blob)
        }
    }

    fn flaky_engine(
        dir: &TempDir,
        upload_failures: u32,
        fail_appends: bool,
        cap: u32,
    ) -> Arc<AsyncCloudConnector> {
        let conn: Arc<dyn CloudConnector> = Arc::new(FlakyConnector {
            inner: LocalCloudConnector::new(&dir.path().join("cloud"), "test").unwrap(),
            upload_failures_left: AtomicU32::new(upload_failures),
            fail_appends,
        });
        AsyncCloudConnector::start(conn, &dir.path().join("tmp"), 1, cap).unwrap()
    }

    #[test]
    fn test_transient_upload_failure_retries_to_success() {
        let dir = TempDir::new().unwrap();
        let engine = flaky_engine(&dir, 1, false, 3);
        let src = dir.path().join("sample.txt");
        std::fs::write(&src, b"payload").unwrap();
        engine
            .upload_file("uploads", "sample.txt", &src, StorageTier::Hot)
            .unwrap();

        assert!(engine.wait_idle(Duration::from_secs(15)));
        assert_eq!(
            engine
                .connector()
                .download_bytes("uploads", "sample.txt")
                .unwrap(),
            b"payload"
        );
        assert!(engine.counters().retries.load(Ordering::Relaxed) >= 1);
        assert_eq!(engine.counters().uploads_completed.load(Ordering::Relaxed), 1);
        // The held scratch copy is gone once the retry lands.
        let scratch = dir.path().join("tmp").join("pending_uploads");
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_append_past_retry_cap_is_dropped() {
        let dir = TempDir::new().unwrap();
        let engine = flaky_engine(&dir, 0, true, 2);
        engine
            .append_rows(
                "journals",
                "j.csv",
                vec!["timestamp".to_string()],
                vec![row(&[("timestamp", "t1")])],
            )
            .unwrap();

        // One retry, then the cap drops the item for good.
        assert!(engine.wait_idle(Duration::from_secs(15)));
        assert_eq!(engine.pending(), 0);
        assert_eq!(engine.counters().retries.load(Ordering::Relaxed), 1);
        assert_eq!(engine.counters().dropped.load(Ordering::Relaxed), 1);
        assert_eq!(engine.counters().appends_completed.load(Ordering::Relaxed), 0);
        assert!(!engine.connector().exists("journals", "j.csv").unwrap());
        engine.shutdown();
    }

    #[test]
    fn test_empty_append_is_a_noop() {
        let (_dir, engine) = engine(1);
        engine
            .append_rows("journals", "j.csv", vec!["timestamp".to_string()], vec![])
            .unwrap();
        assert_eq!(engine.pending(), 0);
        engine.shutdown();
    }
}
