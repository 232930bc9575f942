// 📦 Versioner - content-addressed dataset snapshots + append-only version log
//
// commit(): hash the dataset, upload the blob only if the store lacks it,
// write the pointer file, then append one entry to the version log.
// The log entry is appended only after the blob is confirmed present.

use crate::config::BlobStoreConfig;
use crate::db;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HASH_ALGORITHM: &str = "sha256";

/// Shortest hash or commit id prefix accepted by `checkout`.
pub const MIN_REFERENCE_LEN: usize = 4;

// ============================================================================
// VERSION RECORDS
// ============================================================================

/// One entry of the version log. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub commit_id: String,
    pub committed_at: DateTime<Utc>,
    pub content_hash: String,
    pub row_count: usize,
    pub byte_size: u64,
    pub remote_location: String,
    pub pointer_path: String,
    pub message: String,
    /// False when the store already held the blob
    pub uploaded: bool,
}

impl DatasetVersion {
    pub fn short_hash(&self) -> &str {
        &self.content_hash[..self.content_hash.len().min(12)]
    }
}

/// Small JSON file next to the dataset naming the hash it was committed as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerFile {
    pub hash: String,
    pub algorithm: String,
    pub size: u64,
    pub row_count: usize,
    pub remote: String,
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `exchange_rates.csv` -> `exchange_rates.csv.version.json`
pub fn pointer_path(dataset_path: &Path) -> PathBuf {
    let mut name = dataset_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".version.json");
    dataset_path.with_file_name(name)
}

pub fn read_pointer(dataset_path: &Path) -> Result<Option<PointerFile>> {
    let path = pointer_path(dataset_path);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn commit_message(timestamp: &str) -> String {
    format!("Data version update - {}", timestamp)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

// ============================================================================
// BLOB STORES
// ============================================================================

/// Byte blobs keyed by content hash.
pub trait BlobStore: Send + Sync {
    /// Where a blob with this hash lives (path or URL).
    fn location(&self, hash: &str) -> String;

    fn contains(&self, hash: &str) -> Result<bool>;

    fn put(&self, hash: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, hash: &str) -> Result<Vec<u8>>;

    fn describe(&self) -> String;
}

/// Directory store with a two-character fan-out: `ab/cdef...`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path) -> Self {
        LocalBlobStore {
            root: root.to_path_buf(),
        }
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        let split = hash.len().min(2);
        self.root.join(&hash[..split]).join(&hash[split..])
    }

    /// Number of blobs on disk.
    pub fn blob_count(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for fan in std::fs::read_dir(&self.root)? {
            let fan = fan?;
            if fan.file_type()?.is_dir() {
                count += std::fs::read_dir(fan.path())?
                    .filter_map(|e| e.ok())
                    .filter(|e| !e.file_name().to_string_lossy().ends_with(".tmp"))
                    .count();
            }
        }
        Ok(count)
    }
}

fn storage_io(action: &str, hash: &str, e: std::io::Error) -> PipelineError {
    PipelineError::Storage(format!("{} blob {}: {}", action, hash, e))
}

impl BlobStore for LocalBlobStore {
    fn location(&self, hash: &str) -> String {
        self.blob_path(hash).display().to_string()
    }

    fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.blob_path(hash).is_file())
    }

    fn put(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.blob_path(hash), bytes).map_err(|e| storage_io("write", hash, e))
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>> {
        std::fs::read(self.blob_path(hash)).map_err(|e| storage_io("read", hash, e))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Remote store speaking plain `HEAD/PUT/GET {base}/{hash}`.
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpBlobStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, hash: &str) -> reqwest::blocking::RequestBuilder {
        let builder = self.client.request(method, self.location(hash));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn check_status(action: &str, status: StatusCode) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PipelineError::StorageAuth(format!(
            "{} rejected with {}",
            action, status
        )));
    }
    if !status.is_success() {
        return Err(PipelineError::Storage(format!("{} returned {}", action, status)));
    }
    Ok(())
}

fn transport(action: &str, e: reqwest::Error) -> PipelineError {
    PipelineError::Storage(format!("{} failed: {}", action, e))
}

impl BlobStore for HttpBlobStore {
    fn location(&self, hash: &str) -> String {
        format!("{}/{}", self.base_url, hash)
    }

    fn contains(&self, hash: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::HEAD, hash)
            .send()
            .map_err(|e| transport("HEAD", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status("HEAD", response.status())?;
        Ok(true)
    }

    fn put(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, hash)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .map_err(|e| transport("PUT", e))?;
        check_status("PUT", response.status())
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let response = self
            .request(reqwest::Method::GET, hash)
            .send()
            .map_err(|e| transport("GET", e))?;
        check_status("GET", response.status())?;
        let bytes = response.bytes().map_err(|e| transport("GET", e))?;
        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

/// Factory: pick the store implementation from configuration.
pub fn build_blob_store(config: &BlobStoreConfig, timeout: Duration) -> Result<Box<dyn BlobStore>> {
    match config {
        BlobStoreConfig::Local { path } => Ok(Box::new(LocalBlobStore::new(path))),
        BlobStoreConfig::Http { url, token } => {
            Ok(Box::new(HttpBlobStore::new(url, token.clone(), timeout)?))
        }
    }
}

// ============================================================================
// VERSIONER
// ============================================================================

pub struct Versioner {
    store: Box<dyn BlobStore>,
}

impl Versioner {
    pub fn new(store: Box<dyn BlobStore>) -> Self {
        Versioner { store }
    }

    pub fn store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    /// Snapshot the dataset at `dataset_path` and append a version log entry.
    ///
    /// Pushing identical bytes twice stores one blob and appends two entries
    /// referencing the same hash. On a store failure nothing is appended.
    pub fn commit(
        &self,
        conn: &Connection,
        dataset_path: &Path,
        row_count: usize,
        committed_at: DateTime<Utc>,
        timestamp: &str,
    ) -> Result<DatasetVersion> {
        let bytes = std::fs::read(dataset_path)?;
        let hash = content_hash(&bytes);

        let uploaded = if self.store.contains(&hash)? {
            tracing::info!(hash = %hash, "blob already present, skipping upload");
            false
        } else {
            self.store.put(&hash, &bytes)?;
            if !self.store.contains(&hash)? {
                return Err(PipelineError::Storage(format!(
                    "blob {} missing after upload",
                    hash
                )));
            }
            tracing::info!(hash = %hash, bytes = bytes.len(), store = %self.store.describe(), "blob uploaded");
            true
        };

        let remote = self.store.location(&hash);
        let pointer = PointerFile {
            hash: hash.clone(),
            algorithm: HASH_ALGORITHM.to_string(),
            size: bytes.len() as u64,
            row_count,
            remote: remote.clone(),
        };
        let pointer_file = pointer_path(dataset_path);

        let version = DatasetVersion {
            commit_id: uuid::Uuid::new_v4().to_string(),
            committed_at,
            content_hash: hash,
            row_count,
            byte_size: bytes.len() as u64,
            remote_location: remote,
            pointer_path: pointer_file.display().to_string(),
            message: commit_message(timestamp),
            uploaded,
        };
        // The log entry comes first; the pointer only ever names a logged hash
        db::insert_dataset_version(conn, &version)?;
        write_atomic(&pointer_file, serde_json::to_string_pretty(&pointer)?.as_bytes())?;

        tracing::info!(
            commit_id = %version.commit_id,
            hash = %version.short_hash(),
            rows = row_count,
            "dataset version committed"
        );

        Ok(version)
    }

    /// Restore a committed dataset (by hash or commit id prefix) into `dest`.
    pub fn checkout(&self, conn: &Connection, reference: &str, dest: &Path) -> Result<DatasetVersion> {
        let reference = reference.trim();
        if reference.len() < MIN_REFERENCE_LEN
            || !reference.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(PipelineError::Config(format!(
                "version reference must be at least {} hex or commit id characters, got {:?}",
                MIN_REFERENCE_LEN, reference
            )));
        }
        let version = db::find_dataset_version(conn, reference)?
            .ok_or_else(|| PipelineError::NotFound(format!("no dataset version matches {}", reference)))?;

        let bytes = self.store.get(&version.content_hash)?;
        let actual = content_hash(&bytes);
        if actual != version.content_hash {
            return Err(PipelineError::Storage(format!(
                "hash mismatch for {}: store returned {}",
                version.content_hash, actual
            )));
        }

        write_atomic(dest, &bytes)?;
        tracing::info!(hash = %version.short_hash(), dest = %dest.display(), "dataset checked out");

        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup() -> (tempfile::TempDir, Connection, Versioner, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let versioner = Versioner::new(Box::new(LocalBlobStore::new(&dir.path().join("blobs"))));
        let dataset = dir.path().join("processed").join("exchange_rates.csv");
        std::fs::create_dir_all(dataset.parent().unwrap()).unwrap();
        std::fs::write(&dataset, "timestamp,EUR\n20250101_000000,0.91\n").unwrap();
        (dir, conn, versioner, dataset)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_identical_push_stores_one_blob_two_commits() {
        let (dir, conn, versioner, dataset) = setup();

        let first = versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap();
        let second = versioner.commit(&conn, &dataset, 1, at(1), "20250101_010000").unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.uploaded);
        assert!(!second.uploaded);
        assert_ne!(first.commit_id, second.commit_id);

        let store = LocalBlobStore::new(&dir.path().join("blobs"));
        assert_eq!(store.blob_count().unwrap(), 1);
        assert_eq!(db::get_dataset_versions(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_commit_writes_pointer_and_message() {
        let (_dir, conn, versioner, dataset) = setup();

        let version = versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap();

        assert_eq!(version.message, "Data version update - 20250101_000000");
        assert_eq!(version.content_hash.len(), 64);

        let pointer = read_pointer(&dataset).unwrap().unwrap();
        assert_eq!(pointer.hash, version.content_hash);
        assert_eq!(pointer.algorithm, "sha256");
        assert_eq!(pointer.size, version.byte_size);
        assert!(pointer_path(&dataset).ends_with("exchange_rates.csv.version.json"));
    }

    #[test]
    fn test_checkout_restores_exact_bytes() {
        let (dir, conn, versioner, dataset) = setup();
        let original = std::fs::read(&dataset).unwrap();
        let version = versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap();

        // Overwrite with a newer dataset, then restore the committed one
        std::fs::write(&dataset, "timestamp,EUR\n20250102_000000,0.95\n").unwrap();
        let restore_to = dir.path().join("restored.csv");
        let restored = versioner
            .checkout(&conn, &version.content_hash[..8], &restore_to)
            .unwrap();

        assert_eq!(restored.commit_id, version.commit_id);
        assert_eq!(std::fs::read(&restore_to).unwrap(), original);
    }

    #[test]
    fn test_checkout_detects_corrupt_blob() {
        let (dir, conn, versioner, dataset) = setup();
        let version = versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap();

        let blob = PathBuf::from(LocalBlobStore::new(&dir.path().join("blobs")).location(&version.content_hash));
        std::fs::write(&blob, "tampered").unwrap();

        let err = versioner
            .checkout(&conn, &version.commit_id, &dir.path().join("out.csv"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }

    #[test]
    fn test_checkout_unknown_reference() {
        let (dir, conn, versioner, _dataset) = setup();
        let err = versioner
            .checkout(&conn, "deadbeef", &dir.path().join("out.csv"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn test_checkout_rejects_empty_or_wildcard_reference() {
        let (dir, conn, versioner, dataset) = setup();
        versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap();
        let out = dir.path().join("out.csv");

        for reference in ["", "  ", "%", "%%%%", "____", "ab"] {
            let err = versioner.checkout(&conn, reference, &out).unwrap_err();
            assert!(matches!(err, PipelineError::Config(_)), "{:?}", reference);
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_failed_log_append_leaves_no_pointer() {
        let (_dir, conn, versioner, dataset) = setup();
        conn.execute_batch("DROP TABLE dataset_versions").unwrap();

        let err = versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap_err();

        assert!(matches!(err, PipelineError::Database(_)));
        assert!(read_pointer(&dataset).unwrap().is_none());
    }

    struct RejectingStore;

    impl BlobStore for RejectingStore {
        fn location(&self, hash: &str) -> String {
            format!("https://blobs.invalid/{}", hash)
        }
        fn contains(&self, _hash: &str) -> Result<bool> {
            Ok(false)
        }
        fn put(&self, _hash: &str, _bytes: &[u8]) -> Result<()> {
            Err(PipelineError::StorageAuth("PUT rejected with 401".to_string()))
        }
        fn get(&self, hash: &str) -> Result<Vec<u8>> {
            Err(PipelineError::Storage(format!("no blob {}", hash)))
        }
        fn describe(&self) -> String {
            "rejecting".to_string()
        }
    }

    #[test]
    fn test_auth_failure_appends_nothing() {
        let (_dir, conn, _versioner, dataset) = setup();
        let versioner = Versioner::new(Box::new(RejectingStore));

        let err = versioner.commit(&conn, &dataset, 1, at(0), "20250101_000000").unwrap_err();

        assert!(matches!(err, PipelineError::StorageAuth(_)));
        assert!(err.is_retryable());
        assert!(db::get_dataset_versions(&conn).unwrap().is_empty());
        assert!(read_pointer(&dataset).unwrap().is_none());
    }

    #[test]
    fn test_local_store_fan_out() {
        let store = LocalBlobStore::new(Path::new("/tmp/blobs"));
        assert_eq!(store.location("abcdef"), "/tmp/blobs/ab/cdef");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            check_status("PUT", StatusCode::FORBIDDEN),
            Err(PipelineError::StorageAuth(_))
        ));
        assert!(matches!(
            check_status("PUT", StatusCode::BAD_GATEWAY),
            Err(PipelineError::Storage(_))
        ));
        assert!(check_status("PUT", StatusCode::CREATED).is_ok());
    }

    #[test]
    fn test_build_blob_store_from_config() {
        let local = build_blob_store(
            &BlobStoreConfig::Local {
                path: PathBuf::from("/tmp/x"),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(local.describe(), "local:/tmp/x");

        let http = build_blob_store(
            &BlobStoreConfig::Http {
                url: "https://store.example.com/fx/".to_string(),
                token: None,
            },
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(http.location("abc"), "https://store.example.com/fx/abc");
    }
}
