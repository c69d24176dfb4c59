//! Model cache
//!
//! Size-bounded local disk cache for model weights held by the storage
//! collaborator.
//!
//! # Design
//!
//! Entries are keyed by the SHA-256 of the artifact identity (`bucket/path`)
//! and tracked in an in-memory index rebuilt from disk at open. A single
//! async mutex covers the check-or-populate critical section, including the
//! download itself, so concurrent requests for the same artifact never
//! download it twice. Downloads land in a `.tmp` file that is renamed into
//! place, so readers never see a partial file.
//!
//! Eviction is least-recently-used: every hit bumps an access sequence
//! number and the file's mtime. Before a download, room is made for the
//! artifact's declared size; after it, entries are evicted until the cache
//! fits again, never evicting the entry just added.
//!
//! A background sweep re-scans the directory by mtime and trims it back
//! under the bound, catching files written outside `get_or_fetch`.

use darkroom_core::domain::artifact::ArtifactRef;
use darkroom_core::domain::metrics::CacheStats;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::Storage;
use crate::error::CacheError;

const TMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
    /// Strictly increasing access order; the smallest is evicted first
    sequence: u64,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    next_sequence: u64,
}

impl CacheIndex {
    fn from_files(mut files: Vec<CacheFile>) -> Self {
        files.sort_by_key(|file| file.modified);

        let mut index = Self::default();
        for file in files {
            index.insert(file.key, file.path, file.size_bytes);
        }
        index
    }

    fn insert(&mut self, key: String, path: PathBuf, size_bytes: u64) {
        let sequence = self.bump();
        if let Some(old) = self.entries.insert(
            key,
            CacheEntry {
                path,
                size_bytes,
                sequence,
            },
        ) {
            self.total_bytes -= old.size_bytes;
        }
        self.total_bytes += size_bytes;
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn bump(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Least recently used key, ignoring `keep`
    fn oldest(&self, keep: Option<&str>) -> Option<String> {
        self.entries
            .iter()
            .filter(|(key, _)| Some(key.as_str()) != keep)
            .min_by_key(|(_, entry)| entry.sequence)
            .map(|(key, _)| key.clone())
    }
}

/// A file found by scanning the cache directory
#[derive(Debug)]
struct CacheFile {
    key: String,
    path: PathBuf,
    size_bytes: u64,
    modified: SystemTime,
}

/// Result of a sweep
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub size_before: u64,
    pub size_after: u64,
}

/// Size-bounded LRU cache of remote artifacts
pub struct ModelCache {
    dir: PathBuf,
    max_bytes: u64,
    storage: Arc<dyn Storage>,
    index: Mutex<CacheIndex>,
}

impl ModelCache {
    /// Opens the cache at `dir`, indexing what is already on disk
    ///
    /// Leftover `.tmp` files from interrupted downloads are removed.
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let scan_dir = dir.clone();
        let files = tokio::task::spawn_blocking(move || scan(&scan_dir, true))
            .await
            .map_err(std::io::Error::other)??;

        let index = CacheIndex::from_files(files);
        info!(
            cache_dir = %dir.display(),
            entries = index.entries.len(),
            total_bytes = index.total_bytes,
            max_bytes,
            "Opened model cache"
        );

        Ok(Self {
            dir,
            max_bytes,
            storage,
            index: Mutex::new(index),
        })
    }

    /// Cache key of an artifact: SHA-256 hex of `bucket/path`
    pub fn key_for(artifact: &ArtifactRef) -> String {
        let mut hasher = Sha256::new();
        hasher.update(artifact.identity().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Local path of `artifact`, downloading it on a miss
    pub async fn get_or_fetch(&self, artifact: &ArtifactRef) -> Result<PathBuf, CacheError> {
        let key = Self::key_for(artifact);
        let mut index = self.index.lock().await;

        if let Some(entry) = index.entries.get(&key).cloned() {
            if tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
                let sequence = index.bump();
                if let Some(hit) = index.entries.get_mut(&key) {
                    hit.sequence = sequence;
                }
                touch(&entry.path).await;
                debug!(artifact = %artifact, "Model cache hit");
                return Ok(entry.path);
            }

            warn!(artifact = %artifact, "Cached file vanished, fetching again");
            index.remove(&key);
        }

        info!(artifact = %artifact, "Model cache miss, downloading");

        let declared = artifact.size_bytes.unwrap_or(0);
        self.evict_until_fits(&mut index, declared, None).await;

        let path = self.dir.join(file_name(&key, artifact));
        let tmp = self.dir.join(format!("{}.{}", key, TMP_EXTENSION));

        if let Err(e) = self.storage.download_to(artifact, &tmp).await {
            remove_quietly(&tmp).await;
            return Err(CacheError::Fetch {
                artifact: artifact.to_string(),
                message: format!("{:#}", e),
            });
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        index.insert(key.clone(), path.clone(), size_bytes);
        self.evict_until_fits(&mut index, 0, Some(&key)).await;

        debug!(artifact = %artifact, size_bytes, "Cached artifact");
        Ok(path)
    }

    /// Evicts LRU entries until `incoming` more bytes fit under the bound
    async fn evict_until_fits(&self, index: &mut CacheIndex, incoming: u64, keep: Option<&str>) {
        while index.total_bytes + incoming > self.max_bytes {
            let Some(key) = index.oldest(keep) else {
                break;
            };
            let Some(entry) = index.remove(&key) else {
                break;
            };

            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => info!(
                    path = %entry.path.display(),
                    size_bytes = entry.size_bytes,
                    "Evicted cached model"
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.path.display(), "Failed to evict: {}", e),
            }
        }
    }

    /// Trims the directory back under the bound, oldest mtime first
    pub async fn sweep(&self) -> Result<SweepResult, CacheError> {
        let mut index = self.index.lock().await;

        let dir = self.dir.clone();
        let max_bytes = self.max_bytes;
        let (result, remaining) = tokio::task::spawn_blocking(move || sweep_blocking(&dir, max_bytes))
            .await
            .map_err(std::io::Error::other)??;

        *index = CacheIndex::from_files(remaining);
        Ok(result)
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            max_bytes: self.max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Runs [`ModelCache::sweep`] every `interval` until cancelled
pub async fn run_sweep_daemon(
    cache: Arc<ModelCache>,
    interval: Duration,
    cancellation: CancellationToken,
) {
    info!(
        cache_dir = %cache.dir().display(),
        max_bytes = cache.max_bytes,
        interval_secs = interval.as_secs(),
        "Starting model cache sweep daemon"
    );

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                info!("Model cache sweep daemon shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                match cache.sweep().await {
                    Ok(result) if result.files_deleted > 0 => info!(
                        files_deleted = result.files_deleted,
                        bytes_freed = result.bytes_freed,
                        size_before = result.size_before,
                        size_after = result.size_after,
                        "Model cache sweep complete"
                    ),
                    Ok(_) => debug!("Model cache under limit"),
                    Err(e) => warn!("Model cache sweep failed: {}", e),
                }
            }
        }
    }
}

fn file_name(key: &str, artifact: &ArtifactRef) -> String {
    match Path::new(&artifact.path).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext != TMP_EXTENSION => format!("{}.{}", key, ext),
        _ => key.to_string(),
    }
}

fn is_tmp(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(TMP_EXTENSION)
}

/// Lists cached files, skipping (or removing) temporary ones
fn scan(dir: &Path, remove_tmp: bool) -> std::io::Result<Vec<CacheFile>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        if is_tmp(&path) {
            if remove_tmp {
                debug!(path = %path.display(), "Removing stale temporary file");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "Failed to remove temporary file: {}", e);
                }
            }
            continue;
        }

        let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        files.push(CacheFile {
            key,
            path,
            size_bytes: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(files)
}

fn sweep_blocking(dir: &Path, max_bytes: u64) -> std::io::Result<(SweepResult, Vec<CacheFile>)> {
    let mut files = scan(dir, false)?;
    files.sort_by_key(|file| file.modified);

    let size_before: u64 = files.iter().map(|file| file.size_bytes).sum();
    let mut result = SweepResult {
        size_before,
        size_after: size_before,
        ..SweepResult::default()
    };

    let mut remaining = Vec::with_capacity(files.len());
    for file in files {
        if result.size_after <= max_bytes {
            remaining.push(file);
            continue;
        }

        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                result.files_deleted += 1;
                result.bytes_freed += file.size_bytes;
                result.size_after -= file.size_bytes;
            }
            Err(e) => {
                debug!(path = %file.path.display(), error = %e, "Failed to delete during sweep");
                remaining.push(file);
            }
        }
    }

    Ok((result, remaining))
}

/// Marks a file as just used
async fn touch(path: &Path) {
    let path = path.to_path_buf();
    let touched = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()))
    })
    .await;

    if let Ok(Err(e)) = touched {
        debug!("Failed to refresh cache file mtime: {}", e);
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), "Failed to remove temporary file: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalStorage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        storage: Arc<LocalStorage>,
        cache_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let storage = Arc::new(LocalStorage::new(dir.path().join("storage")));
            let cache_dir = dir.path().join("cache");
            Self {
                _dir: dir,
                storage,
                cache_dir,
            }
        }

        async fn artifact(&self, name: &str, size: usize) -> ArtifactRef {
            let location = ArtifactRef::new("models", format!("{}.safetensors", name));
            self.storage.upload(vec![0u8; size], &location).await.unwrap()
        }

        async fn cache(&self, max_bytes: u64) -> ModelCache {
            ModelCache::open(&self.cache_dir, max_bytes, self.storage.clone())
                .await
                .unwrap()
        }
    }

    fn disk_usage(dir: &Path) -> u64 {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().metadata().unwrap().len())
            .sum()
    }

    #[test]
    fn test_key_is_sha256_of_identity() {
        let artifact = ArtifactRef::new("models", "a.safetensors");
        let key = ModelCache::key_for(&artifact);

        assert_eq!(key.len(), 64);
        assert_eq!(key, ModelCache::key_for(&artifact.clone().with_size(10)));
        assert_ne!(key, ModelCache::key_for(&ArtifactRef::new("models", "b.safetensors")));
    }

    #[tokio::test]
    async fn test_miss_then_hit_returns_same_path() {
        let fixture = Fixture::new();
        let artifact = fixture.artifact("a", 10).await;
        let cache = fixture.cache(100).await;

        let first = cache.get_or_fetch(&artifact).await.unwrap();
        let second = cache.get_or_fetch(&artifact).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap().len(), 10);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let fixture = Fixture::new();
        let a = fixture.artifact("a", 40).await;
        let b = fixture.artifact("b", 40).await;
        let c = fixture.artifact("c", 40).await;
        let cache = fixture.cache(100).await;

        let path_a = cache.get_or_fetch(&a).await.unwrap();
        let path_b = cache.get_or_fetch(&b).await.unwrap();
        // Touch a so that b becomes the oldest
        cache.get_or_fetch(&a).await.unwrap();
        let path_c = cache.get_or_fetch(&c).await.unwrap();

        assert!(path_a.exists());
        assert!(!path_b.exists());
        assert!(path_c.exists());
        assert_eq!(cache.stats().await.total_bytes, 80);
    }

    #[tokio::test]
    async fn test_disk_usage_stays_within_bound_plus_one_artifact() {
        let fixture = Fixture::new();
        let cache = fixture.cache(100).await;

        let mut artifacts = Vec::new();
        for (i, size) in [30, 50, 20, 70, 10, 60].into_iter().enumerate() {
            artifacts.push((fixture.artifact(&format!("m{}", i), size).await, size as u64));
        }

        for (artifact, size) in &artifacts {
            cache.get_or_fetch(artifact).await.unwrap();
            assert!(disk_usage(&fixture.cache_dir) <= 100 + size);
        }
        assert!(disk_usage(&fixture.cache_dir) <= 100);
    }

    #[tokio::test]
    async fn test_declared_size_makes_room_before_download() {
        let fixture = Fixture::new();
        let a = fixture.artifact("a", 60).await;
        let b = fixture.artifact("b", 60).await;
        let cache = fixture.cache(100).await;

        let path_a = cache.get_or_fetch(&a).await.unwrap();
        assert_eq!(b.size_bytes, Some(60));
        cache.get_or_fetch(&b).await.unwrap();

        assert!(!path_a.exists());
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_temp_file() {
        let fixture = Fixture::new();
        let cache = fixture.cache(100).await;

        let missing = ArtifactRef::new("models", "missing.safetensors");
        let err = cache.get_or_fetch(&missing).await.unwrap_err();

        assert!(matches!(err, CacheError::Fetch { .. }));
        assert_eq!(std::fs::read_dir(&fixture.cache_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_open_removes_stale_temp_files_and_indexes_existing() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(&fixture.cache_dir).unwrap();
        std::fs::write(fixture.cache_dir.join("abc.tmp"), b"partial").unwrap();
        std::fs::write(fixture.cache_dir.join("def.safetensors"), b"weights").unwrap();

        let cache = fixture.cache(100).await;

        assert!(!fixture.cache_dir.join("abc.tmp").exists());
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 7);
    }

    #[tokio::test]
    async fn test_sweep_trims_files_written_behind_the_cache() {
        let fixture = Fixture::new();
        let cache = fixture.cache(100).await;

        for name in ["old", "mid", "new"] {
            std::fs::write(fixture.cache_dir.join(name), vec![0u8; 50]).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let result = cache.sweep().await.unwrap();

        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.size_after, 100);
        assert!(!fixture.cache_dir.join("old").exists());
        assert_eq!(cache.stats().await.total_bytes, 100);
    }
}
