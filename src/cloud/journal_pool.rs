//! Pooled cloud journals.
//!
//! Small tabular records (telemetry, scores, sensor readings) are far too
//! frequent to upload one blob each. The pool buffers rows per destination
//! blob and flushes them as batched appends on a timer, on demand, and at
//! shutdown.

use crate::cloud::async_connector::AsyncCloudConnector;
use crate::error::Result;
use crate::journal::{RowBatch, Row};
use crate::sync::StopToken;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Daily journal blob name for one stream identity.
pub fn journal_blob_name(data_id: &str, day: DateTime<Utc>) -> String {
    format!("{}_{}.csv", data_id, day.format("%Y%m%d"))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct JournalKey {
    container: String,
    blob: String,
}

/// Buffers journal rows and flushes them through the async engine.
pub struct JournalPool {
    engine: Arc<AsyncCloudConnector>,
    pending: Mutex<BTreeMap<JournalKey, RowBatch>>,
}

impl JournalPool {
    pub fn new(engine: Arc<AsyncCloudConnector>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    /// Buffer rows for a journal blob. The first caller for a blob fixes its
    /// required columns; later batches must carry at least those columns.
    pub fn add_rows(
        &self,
        container: &str,
        blob: &str,
        required_columns: &[String],
        rows: Vec<Row>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let key = JournalKey {
            container: container.to_string(),
            blob: blob.to_string(),
        };
        let mut pending = self.pending.lock();
        let batch = pending
            .entry(key)
            .or_insert_with(|| RowBatch::new(required_columns.to_vec()));
        batch.add_rows(rows)
    }

    /// Rows currently buffered across all journals.
    pub fn pending_rows(&self) -> usize {
        self.pending.lock().values().map(RowBatch::len).sum()
    }

    /// Hand every non-empty batch to the async engine.
    pub fn sync(&self) -> Result<()> {
        let drained: Vec<(JournalKey, Vec<String>, Vec<Row>)> = {
            let mut pending = self.pending.lock();
            pending
                .iter_mut()
                .filter(|(_, batch)| !batch.is_empty())
                .map(|(key, batch)| (key.clone(), batch.column_order(), batch.take_rows()))
                .collect()
        };
        for (key, columns, rows) in drained {
            debug!(
                "Syncing {} journal rows to {}/{}",
                rows.len(),
                key.container,
                key.blob
            );
            self.engine
                .append_rows(&key.container, &key.blob, columns, rows)?;
        }
        Ok(())
    }

    /// Background sync loop; stops on the token and flushes one last time.
    pub fn start_sync_thread(
        self: &Arc<Self>,
        stop: StopToken,
        period: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        let pool = Arc::clone(self);
        std::thread::Builder::new()
            .name("journal-sync".to_string())
            .spawn(move || {
                info!("Journal sync thread started (period {:?})", period);
                loop {
                    let stopped = stop.wait(period);
                    if let Err(e) = pool.sync() {
                        warn!("Journal sync failed: {e}");
                    }
                    if stopped {
                        break;
                    }
                }
                info!("Journal sync thread stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::connector::{CloudConnector, LocalCloudConnector};
    use crate::journal;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn pool() -> (TempDir, Arc<AsyncCloudConnector>, Arc<JournalPool>) {
        let dir = TempDir::new().unwrap();
        let conn: Arc<dyn CloudConnector> =
            Arc::new(LocalCloudConnector::new(&dir.path().join("cloud"), "test").unwrap());
        let engine =
            AsyncCloudConnector::start(conn, &dir.path().join("tmp"), 2, 3).unwrap();
        let pool = JournalPool::new(Arc::clone(&engine));
        (dir, engine, pool)
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_journal_blob_name_is_daily() {
        let day = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 0).unwrap();
        assert_eq!(
            journal_blob_name("V3_HEART_dev1_0_0", day),
            "V3_HEART_dev1_0_0_20240601.csv"
        );
    }

    #[test]
    fn test_rows_buffer_until_sync() {
        let (_dir, engine, pool) = pool();
        let columns = vec!["timestamp".to_string()];
        pool.add_rows("journals", "j.csv", &columns, vec![row(&[("timestamp", "t1")])])
            .unwrap();
        pool.add_rows("journals", "j.csv", &columns, vec![row(&[("timestamp", "t2")])])
            .unwrap();
        assert_eq!(pool.pending_rows(), 2);
        assert!(!engine.connector().exists("journals", "j.csv").unwrap());

        pool.sync().unwrap();
        assert_eq!(pool.pending_rows(), 0);
        assert!(engine.wait_idle(Duration::from_secs(10)));

        let bytes = engine.connector().download_bytes("journals", "j.csv").unwrap();
        let (_, rows) = journal::parse_csv_bytes(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        engine.shutdown();
    }

    #[test]
    fn test_sync_thread_flushes_on_stop() {
        let (_dir, engine, pool) = pool();
        let stop = StopToken::new();
        let handle = pool
            .start_sync_thread(stop.clone(), Duration::from_secs(60))
            .unwrap();
        pool.add_rows(
            "journals",
            "j.csv",
            &["timestamp".to_string()],
            vec![row(&[("timestamp", "t1")])],
        )
        .unwrap();
        stop.request_stop();
        handle.join().unwrap();
        assert_eq!(pool.pending_rows(), 0);
        assert!(engine.wait_idle(Duration::from_secs(10)));
        assert!(engine.connector().exists("journals", "j.csv").unwrap());
        engine.shutdown();
    }
}
