//! Blob storage abstraction.
//!
//! All cloud traffic goes through the `CloudConnector` trait so the runtime
//! can target different backends. The filesystem-backed `LocalCloudConnector`
//! is the default and is what the test suite runs against; a hosted backend
//! implements the same trait.

use crate::error::{EdgekitError, Result};
use crate::journal::{self, Row};
use crate::record::StorageTier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub trait CloudConnector: Send + Sync {
    /// Identity recorded in FAIR records (e.g. the storage account name).
    fn account_name(&self) -> &str;

    fn create_container(&self, container: &str) -> Result<()>;

    fn exists(&self, container: &str, blob: &str) -> Result<bool>;

    /// Blob names in a container starting with `prefix`, unordered.
    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>>;

    fn upload_file(
        &self,
        container: &str,
        blob: &str,
        src: &Path,
        tier: StorageTier,
        overwrite: bool,
    ) -> Result<()>;

    fn upload_bytes(&self, container: &str, blob: &str, bytes: &[u8], overwrite: bool)
        -> Result<()>;

    fn download_bytes(&self, container: &str, blob: &str) -> Result<Vec<u8>>;

    fn download_to_file(&self, container: &str, blob: &str, dst: &Path) -> Result<()>;

    /// Append raw bytes to an existing blob (creating it when absent).
    fn append_bytes(&self, container: &str, blob: &str, bytes: &[u8]) -> Result<()>;

    fn delete_blob(&self, container: &str, blob: &str) -> Result<()>;
}

/// Per-blob append state: the header the blob is known to carry, or `None`
/// until this process has reconciled against the remote header once.
type BlobHeader = Arc<Mutex<Option<Vec<String>>>>;

/// Serializes appends per (container, blob) and remembers each blob's header
/// so the reconcile download runs once per blob per process. Without the
/// per-blob lock, two concurrent appends hitting the rewrite path would
/// read-modify-write the same blob and lose rows.
#[derive(Debug, Default)]
pub struct HeaderGuard {
    blobs: Mutex<HashMap<(String, String), BlobHeader>>,
}

impl HeaderGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn blob_header(&self, container: &str, blob: &str) -> BlobHeader {
        let mut blobs = self.blobs.lock();
        Arc::clone(
            blobs
                .entry((container.to_string(), blob.to_string()))
                .or_default(),
        )
    }
}

/// Append rows to a CSV blob, creating it with a header if absent.
///
/// The first append to an existing blob this process downloads it and compares
/// headers; on a mismatch (a schema changed across a deploy) the blob is
/// rewritten under the union of both schemas so no column is silently dropped.
/// Every later append with a compatible schema appends the rows in place.
pub fn append_rows(
    connector: &dyn CloudConnector,
    guard: &HeaderGuard,
    container: &str,
    blob: &str,
    columns: &[String],
    rows: &[Row],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    connector.create_container(container)?;

    let state = guard.blob_header(container, blob);
    let mut known = state.lock();

    if !connector.exists(container, blob)? {
        let bytes = journal::rows_to_csv_bytes(columns, rows)?;
        connector.upload_bytes(container, blob, &bytes, true)?;
        *known = Some(columns.to_vec());
        return Ok(());
    }

    let header = match known.as_ref() {
        Some(h) if columns.iter().all(|c| h.contains(c)) => h.clone(),
        _ => {
            // Not yet reconciled this process, or the producer's schema no
            // longer fits the known header.
            let remote = connector.download_bytes(container, blob)?;
            let (remote_header, mut remote_rows) = journal::parse_csv_bytes(&remote)?;
            if columns.iter().all(|c| remote_header.contains(c)) {
                *known = Some(remote_header.clone());
                remote_header
            } else {
                warn!(
                    "Schema drift on {container}/{blob}: remote {:?} vs local {:?}; rewriting to union",
                    remote_header, columns
                );
                // Union schema: remote order first, new local columns appended.
                let mut merged = remote_header.clone();
                for col in columns {
                    if !merged.contains(col) {
                        merged.push(col.clone());
                    }
                }
                remote_rows.extend(rows.iter().cloned());
                let bytes = journal::rows_to_csv_bytes(&merged, &remote_rows)?;
                connector.upload_bytes(container, blob, &bytes, true)?;
                *known = Some(merged);
                return Ok(());
            }
        }
    };

    let bytes = journal::rows_to_csv_body_bytes(&header, rows)?;
    connector.append_bytes(container, blob, &bytes)
}

/// Filesystem-backed connector: containers are directories under a root,
/// blobs are files (blob names may contain `/`).
pub struct LocalCloudConnector {
    root: PathBuf,
    account: String,
}

impl LocalCloudConnector {
    pub fn new(root: &Path, account: &str) -> Result<Self> {
        fs::create_dir_all(root)?;
        info!("Local cloud connector rooted at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            account: account.to_string(),
        })
    }

    fn blob_path(&self, container: &str, blob: &str) -> Result<PathBuf> {
        if container.is_empty() || blob.is_empty() {
            return Err(EdgekitError::cloud(
                container.to_string(),
                format!("empty container or blob name (blob: {blob:?})"),
            ));
        }
        if blob.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(EdgekitError::cloud(
                container.to_string(),
                format!("invalid blob name {blob:?}"),
            ));
        }
        Ok(self.root.join(container).join(blob))
    }

    fn collect_blobs(dir: &Path, base: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_blobs(&path, base, out)?;
            } else if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl CloudConnector for LocalCloudConnector {
    fn account_name(&self) -> &str {
        &self.account
    }

    fn create_container(&self, container: &str) -> Result<()> {
        fs::create_dir_all(self.root.join(container))?;
        Ok(())
    }

    fn exists(&self, container: &str, blob: &str) -> Result<bool> {
        Ok(self.blob_path(container, blob)?.is_file())
    }

    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(container);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut blobs = Vec::new();
        Self::collect_blobs(&dir, &dir, &mut blobs)?;
        blobs.retain(|b| b.starts_with(prefix));
        Ok(blobs)
    }

    fn upload_file(
        &self,
        container: &str,
        blob: &str,
        src: &Path,
        _tier: StorageTier,
        overwrite: bool,
    ) -> Result<()> {
        let dst = self.blob_path(container, blob)?;
        if !overwrite && dst.exists() {
            return Err(EdgekitError::cloud(
                container.to_string(),
                format!("blob {blob} already exists"),
            ));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, &dst)?;
        debug!("Uploaded {} to {container}/{blob}", src.display());
        Ok(())
    }

    fn upload_bytes(
        &self,
        container: &str,
        blob: &str,
        bytes: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        let dst = self.blob_path(container, blob)?;
        if !overwrite && dst.exists() {
            return Err(EdgekitError::cloud(
                container.to_string(),
                format!("blob {blob} already exists"),
            ));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dst, bytes)?;
        Ok(())
    }

    fn download_bytes(&self, container: &str, blob: &str) -> Result<Vec<u8>> {
        let src = self.blob_path(container, blob)?;
        fs::read(&src).map_err(|e| {
            EdgekitError::cloud(container.to_string(), format!("download {blob}: {e}"))
        })
    }

    fn download_to_file(&self, container: &str, blob: &str, dst: &Path) -> Result<()> {
        let src = self.blob_path(container, blob)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, dst).map_err(|e| {
            EdgekitError::cloud(container.to_string(), format!("download {blob}: {e}"))
        })?;
        Ok(())
    }

    fn append_bytes(&self, container: &str, blob: &str, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        let path = self.blob_path(container, blob)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn delete_blob(&self, container: &str, blob: &str) -> Result<()> {
        let path = self.blob_path(container, blob)?;
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn connector() -> (TempDir, LocalCloudConnector) {
        let dir = TempDir::new().unwrap();
        let conn = LocalCloudConnector::new(dir.path(), "test-account").unwrap();
        (dir, conn)
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_upload_download_delete() {
        let (_dir, conn) = connector();
        conn.upload_bytes("c1", "a.txt", b"hello", true).unwrap();
        assert!(conn.exists("c1", "a.txt").unwrap());
        assert_eq!(conn.download_bytes("c1", "a.txt").unwrap(), b"hello");
        conn.delete_blob("c1", "a.txt").unwrap();
        assert!(!conn.exists("c1", "a.txt").unwrap());
        // Deleting a missing blob is not an error.
        conn.delete_blob("c1", "a.txt").unwrap();
    }

    #[test]
    fn test_overwrite_false_rejects_existing() {
        let (_dir, conn) = connector();
        conn.upload_bytes("c1", "a.txt", b"one", true).unwrap();
        assert!(conn.upload_bytes("c1", "a.txt", b"two", false).is_err());
        assert_eq!(conn.download_bytes("c1", "a.txt").unwrap(), b"one");
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let (_dir, conn) = connector();
        conn.upload_bytes("c1", "V3_A_one.csv", b"x", true).unwrap();
        conn.upload_bytes("c1", "V3_B_two.csv", b"x", true).unwrap();
        let blobs = conn.list("c1", "V3_A").unwrap();
        assert_eq!(blobs, vec!["V3_A_one.csv"]);
        assert!(conn.list("missing", "").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_escape() {
        let (_dir, conn) = connector();
        assert!(conn.upload_bytes("c1", "../escape", b"x", true).is_err());
        assert!(conn.blob_path("c1", "a//b").is_err());
    }

    #[test]
    fn test_append_creates_then_extends() {
        let (_dir, conn) = connector();
        let guard = HeaderGuard::new();
        let columns = vec!["timestamp".to_string(), "value".to_string()];

        append_rows(
            &conn,
            &guard,
            "journals",
            "j.csv",
            &columns,
            &[row(&[("timestamp", "t1"), ("value", "1")])],
        )
        .unwrap();
        append_rows(
            &conn,
            &guard,
            "journals",
            "j.csv",
            &columns,
            &[row(&[("timestamp", "t2"), ("value", "2")])],
        )
        .unwrap();

        let bytes = conn.download_bytes("journals", "j.csv").unwrap();
        let (header, rows) = journal::parse_csv_bytes(&bytes).unwrap();
        assert_eq!(header, columns);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_append_merges_schema_drift_to_union() {
        let (_dir, conn) = connector();
        let guard = HeaderGuard::new();
        let old = vec!["timestamp".to_string(), "old_col".to_string()];
        let new = vec!["timestamp".to_string(), "new_col".to_string()];

        append_rows(
            &conn,
            &guard,
            "journals",
            "j.csv",
            &old,
            &[row(&[("timestamp", "t1"), ("old_col", "a")])],
        )
        .unwrap();
        append_rows(
            &conn,
            &guard,
            "journals",
            "j.csv",
            &new,
            &[row(&[("timestamp", "t2"), ("new_col", "b")])],
        )
        .unwrap();

        let bytes = conn.download_bytes("journals", "j.csv").unwrap();
        let (header, rows) = journal::parse_csv_bytes(&bytes).unwrap();
        assert_eq!(header, vec!["timestamp", "old_col", "new_col"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("old_col").map(String::as_str), Some("a"));
        assert_eq!(rows[1].get("new_col").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_append_skips_empty_batches() {
        let (_dir, conn) = connector();
        let guard = HeaderGuard::new();
        let columns = vec!["timestamp".to_string()];
        append_rows(&conn, &guard, "journals", "j.csv", &columns, &[]).unwrap();
        assert!(!conn.exists("journals", "j.csv").unwrap());
    }

    /// Delegating connector with a slow, counted download path, wide enough
    /// to overlap concurrent reconciles.
    struct SlowDownload {
        inner: LocalCloudConnector,
        delay: Duration,
        downloads: AtomicU32,
    }

    impl CloudConnector for SlowDownload {
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
            self.inner.upload_file(container, blob, src, tier, overwrite)
        }
        fn upload_bytes(
            &self,
            container: &str,
            blob: &str,
            bytes: &[u8],
            overwrite: bool,
        ) -> Result<()> {
            self.inner.upload_bytes(container, blob, bytes, overwrite)
        }
        fn download_bytes(&self, container: &str, blob: &str) -> Result<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.download_bytes(container, blob)
        }
        fn download_to_file(&self, container: &str, blob: &str, dst: &Path) -> Result<()> {
            self.inner.download_to_file(container, blob, dst)
        }
        fn append_bytes(&self, container: &str, blob: &str, bytes: &[u8]) -> Result<()> {
            self.inner.append_bytes(container, blob, bytes)
        }
        fn delete_blob(&self, container: &str, blob: &str) -> Result<()> {
            self.inner.delete_blob(container, blob)
        }
    }

    fn slow_connector(dir: &TempDir, delay: Duration) -> Arc<SlowDownload> {
        Arc::new(SlowDownload {
            inner: LocalCloudConnector::new(dir.path(), "test-account").unwrap(),
            delay,
            downloads: AtomicU32::new(0),
        })
    }

    #[test]
    fn test_concurrent_appends_do_not_lose_rows() {
        let dir = TempDir::new().unwrap();
        let conn = slow_connector(&dir, Duration::from_millis(200));
        let guard = Arc::new(HeaderGuard::new());
        let columns = vec!["timestamp".to_string(), "value".to_string()];
        let seed =
            journal::rows_to_csv_bytes(&columns, &[row(&[("timestamp", "t0"), ("value", "0")])])
                .unwrap();
        conn.upload_bytes("journals", "j.csv", &seed, true).unwrap();

        let mut handles = Vec::new();
        for t in 0..2 {
            let conn = Arc::clone(&conn);
            let guard = Arc::clone(&guard);
            let columns = columns.clone();
            handles.push(std::thread::spawn(move || {
                append_rows(
                    &*conn,
                    &guard,
                    "journals",
                    "j.csv",
                    &columns,
                    &[row(&[("timestamp", &format!("t{}", t + 1)), ("value", "1")])],
                )
                .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let bytes = conn.download_bytes("journals", "j.csv").unwrap();
        let (header, rows) = journal::parse_csv_bytes(&bytes).unwrap();
        assert_eq!(header, columns);
        // Both appends landed on top of the seed row, and the header row was
        // not duplicated.
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_header_reconcile_downloads_once_per_blob() {
        let dir = TempDir::new().unwrap();
        let conn = slow_connector(&dir, Duration::ZERO);
        let columns = vec!["timestamp".to_string()];
        append_rows(
            &*conn,
            &HeaderGuard::new(),
            "journals",
            "j.csv",
            &columns,
            &[row(&[("timestamp", "t1")])],
        )
        .unwrap();
        assert_eq!(conn.downloads.load(Ordering::SeqCst), 0);

        // A new guard models a process restart: one reconcile download, then
        // in-place appends.
        let guard = HeaderGuard::new();
        for t in ["t2", "t3"] {
            append_rows(
                &*conn,
                &guard,
                "journals",
                "j.csv",
                &columns,
                &[row(&[("timestamp", t)])],
            )
            .unwrap();
        }
        assert_eq!(conn.downloads.load(Ordering::SeqCst), 1);

        let bytes = conn.download_bytes("journals", "j.csv").unwrap();
        let (_, rows) = journal::parse_csv_bytes(&bytes).unwrap();
        assert_eq!(rows.len(), 3);
    }
}
