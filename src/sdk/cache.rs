//! Content-addressed local file cache with deferred deletion.
//!
//! Materializing a blob whose SHA-256 was already fetched copies the cached
//! file instead of downloading again. Released files linger for a grace
//! window so that a quick re-request (retry, second pass, sibling task)
//! reuses them; a background reaper removes whatever stays released past its
//! deadline.
//!
//! `ref_count[source]` counts live (unreleased) consumers of a hash, where
//! `source` is the path recorded in `hash_to_path`. A source file is only
//! removed once its count is zero and the hash's grace window has elapsed.
//! When a source disappears, a surviving copy of the same hash takes over.
//! One async mutex guards every map; downloads and copies run under it.

use crate::sdk::{SdkError, SdkResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, OnceCell},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_REAPER_TICK: Duration = Duration::from_secs(1);

static GLOBAL: OnceCell<Arc<FileCache>> = OnceCell::const_new();

/// Fetches a URL into a local path.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, target: &Path) -> SdkResult<()>;
}

/// Streams a GET response body to disk.
pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> SdkResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(10 * 60))
            .build()?;
        Ok(Self { http })
    }

    async fn fetch(&self, url: &str, target: &Path) -> SdkResult<()> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let mut file = File::create(target)
            .await
            .map_err(|e| SdkError::io(target, e))?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?)
                .await
                .map_err(|e| SdkError::io(target, e))?;
        }
        file.flush().await.map_err(|e| SdkError::io(target, e))?;
        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, target: &Path) -> SdkResult<()> {
        let result = self.fetch(url, target).await;
        if result.is_err() {
            let _ = fs::remove_file(target).await;
        }
        result
    }
}

/// Outcome of [`FileCache::get_or_download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub from_cache: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    hash_to_path: HashMap<String, PathBuf>,
    path_to_hash: HashMap<PathBuf, String>,
    ref_count: HashMap<PathBuf, usize>,
    pending_delete: HashMap<PathBuf, Instant>,
    pending_cache_delete: HashMap<String, Instant>,
}

impl CacheState {
    /// Live (unreleased) targets currently holding `hash`.
    fn live_count(&self, hash: &str) -> usize {
        self.path_to_hash
            .iter()
            .filter(|(path, h)| *h == hash && !self.pending_delete.contains_key(*path))
            .count()
    }

    /// The source of `hash` is gone or about to be overwritten. Forget it and
    /// promote a surviving copy, so live copies stay tracked and counted.
    async fn drop_source(&mut self, hash: &str, deadline: Instant) {
        let Some(old) = self.hash_to_path.remove(hash) else {
            return;
        };
        self.ref_count.remove(&old);
        self.pending_delete.remove(&old);
        self.path_to_hash.remove(&old);

        let mut copies: Vec<PathBuf> = self
            .path_to_hash
            .iter()
            .filter(|(_, h)| *h == hash)
            .map(|(path, _)| path.clone())
            .collect();
        copies.sort();

        let mut survivor = None;
        for path in copies {
            if !exists(&path).await {
                self.path_to_hash.remove(&path);
                self.pending_delete.remove(&path);
                continue;
            }
            let live = !self.pending_delete.contains_key(&path);
            let better = survivor
                .as_ref()
                .is_none_or(|(_, held_live)| live && !held_live);
            if better {
                survivor = Some((path, live));
            }
        }

        let Some((source, _)) = survivor else {
            self.pending_cache_delete.remove(hash);
            return;
        };
        let count = self.live_count(hash);
        debug!(hash = %hash, path = %source.display(), count, "promoted copy to cache source");
        self.hash_to_path.insert(hash.to_string(), source.clone());
        self.ref_count.insert(source, count);
        if count == 0 {
            self.pending_cache_delete
                .entry(hash.to_string())
                .or_insert(deadline);
        } else {
            self.pending_cache_delete.remove(hash);
        }
    }

    /// Every path mapped to `hash`, source included, and drop its entries.
    fn take_hash(&mut self, hash: &str) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .path_to_hash
            .iter()
            .filter(|(_, h)| *h == hash)
            .map(|(path, _)| path.clone())
            .collect();
        if let Some(source) = self.hash_to_path.remove(hash) {
            self.ref_count.remove(&source);
            if !paths.contains(&source) {
                paths.push(source);
            }
        }
        for path in &paths {
            self.path_to_hash.remove(path);
            self.pending_delete.remove(path);
        }
        self.pending_cache_delete.remove(hash);
        paths
    }

    /// One fewer live consumer of `hash`; opens its grace window at zero.
    fn decrement(&mut self, hash: &str, deadline: Instant) {
        let Some(source) = self.hash_to_path.get(hash) else {
            return;
        };
        let count = self.ref_count.entry(source.clone()).or_insert(0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.pending_cache_delete.insert(hash.to_string(), deadline);
        }
    }

    fn increment(&mut self, hash: &str) {
        if let Some(source) = self.hash_to_path.get(hash) {
            *self.ref_count.entry(source.clone()).or_insert(0) += 1;
        }
        self.pending_cache_delete.remove(hash);
    }

    fn is_source(&self, path: &Path) -> bool {
        self.hash_to_path.values().any(|p| p == path)
    }

    /// Bookkeeping consistency: each source counts exactly the live targets
    /// of its hash, and a hash awaits reclamation iff that count is zero.
    #[cfg(test)]
    fn check(&self) -> Result<(), String> {
        for (hash, source) in &self.hash_to_path {
            if self.path_to_hash.get(source) != Some(hash) {
                return Err(format!("source {} of {hash} is unmapped", source.display()));
            }
            let count = self.ref_count.get(source).copied().unwrap_or(0);
            let live = self.live_count(hash);
            if count != live {
                return Err(format!("{hash}: ref_count {count} but {live} live targets"));
            }
            if (count == 0) != self.pending_cache_delete.contains_key(hash) {
                return Err(format!("{hash}: count {count} disagrees with reclaim mark"));
            }
        }
        for (path, hash) in &self.path_to_hash {
            if !self.hash_to_path.contains_key(hash) {
                return Err(format!("{} maps to untracked hash {hash}", path.display()));
            }
        }
        Ok(())
    }
}

/// Per-process cache. Construct inside a tokio runtime: the reaper is spawned
/// on creation and stopped by [`FileCache::shutdown`].
pub struct FileCache {
    state: Arc<Mutex<CacheState>>,
    downloader: Arc<dyn Downloader>,
    grace: Duration,
    cancel: CancellationToken,
}

impl FileCache {
    pub fn new(downloader: Arc<dyn Downloader>) -> Arc<Self> {
        Self::with_timing(downloader, DEFAULT_GRACE_WINDOW, DEFAULT_REAPER_TICK)
    }

    pub fn with_timing(
        downloader: Arc<dyn Downloader>,
        grace: Duration,
        tick: Duration,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            downloader,
            grace,
            cancel: CancellationToken::new(),
        });

        let state = Arc::clone(&cache.state);
        let cancel = cache.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => reap(&state, Instant::now()).await,
                }
            }
            debug!("file cache reaper stopped");
        });

        cache
    }

    /// Process-wide cache backed by [`HttpDownloader`], created on first use.
    pub async fn global() -> SdkResult<Arc<FileCache>> {
        GLOBAL
            .get_or_try_init(|| async {
                let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new()?);
                Ok::<_, SdkError>(FileCache::new(downloader))
            })
            .await
            .cloned()
    }

    /// Materialize the blob `hash` at `target`, copying a cached file when one
    /// exists and downloading `url` otherwise.
    pub async fn get_or_download(
        &self,
        hash: &str,
        url: &str,
        target: &Path,
    ) -> SdkResult<CacheEntry> {
        let mut st = self.state.lock().await;
        let deadline = Instant::now() + self.grace;
        let target = target.to_path_buf();

        if let Some(path) = st.hash_to_path.get(hash).cloned() {
            if !exists(&path).await {
                debug!(hash = %hash, path = %path.display(), "cached file vanished");
                st.drop_source(hash, deadline).await;
            }
        }

        // A re-request of a released target revokes its deletion.
        let was_pending = st.pending_delete.remove(&target).is_some();

        let target_present = exists(&target).await;
        match st.path_to_hash.get(&target).cloned() {
            Some(current) if current == hash && target_present => {
                if was_pending {
                    st.increment(hash);
                } else {
                    st.pending_cache_delete.remove(hash);
                }
                return Ok(CacheEntry {
                    path: target,
                    from_cache: true,
                });
            }
            Some(current) => {
                // `target` is missing or about to be overwritten with other content.
                if st.hash_to_path.get(&current) == Some(&target) {
                    st.drop_source(&current, deadline).await;
                } else {
                    st.path_to_hash.remove(&target);
                    if !was_pending {
                        st.decrement(&current, deadline);
                    }
                }
            }
            None => {}
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SdkError::io(parent, e))?;
        }

        let from_cache = match st.hash_to_path.get(hash).cloned() {
            Some(source) => {
                if source != target {
                    fs::copy(&source, &target)
                        .await
                        .map_err(|e| SdkError::io(&target, e))?;
                }
                true
            }
            None => {
                self.downloader.download(url, &target).await?;
                st.hash_to_path.insert(hash.to_string(), target.clone());
                st.ref_count.insert(target.clone(), 0);
                false
            }
        };

        st.path_to_hash.insert(target.clone(), hash.to_string());
        st.increment(hash);
        debug!(hash = %hash, path = %target.display(), from_cache, "file materialized");

        Ok(CacheEntry {
            path: target,
            from_cache,
        })
    }

    /// Hand `target` back. The file stays on disk for the grace window.
    /// Unknown paths and repeated releases are ignored.
    pub async fn release(&self, target: &Path) {
        let mut st = self.state.lock().await;
        let Some(hash) = st.path_to_hash.get(target).cloned() else {
            return;
        };
        if st.pending_delete.contains_key(target) {
            return;
        }
        let deadline = Instant::now() + self.grace;
        st.pending_delete.insert(target.to_path_buf(), deadline);
        st.decrement(&hash, deadline);
    }

    /// Run one reaper pass now.
    pub async fn reap(&self) {
        reap(&self.state, Instant::now()).await;
    }

    /// Stop the reaper and delete every file awaiting deletion.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut st = self.state.lock().await;

        let mut doomed: HashSet<PathBuf> = st.pending_delete.keys().cloned().collect();
        let hashes: Vec<String> = st.pending_cache_delete.keys().cloned().collect();
        for hash in &hashes {
            doomed.extend(st.take_hash(hash));
        }
        for path in &doomed {
            remove_quietly(path).await;
            st.path_to_hash.remove(path);
        }
        st.pending_delete.clear();
    }

    /// Live consumer count of the file at `path` when it is a cache source.
    pub async fn ref_count(&self, path: &Path) -> usize {
        let st = self.state.lock().await;
        st.ref_count.get(path).copied().unwrap_or(0)
    }

    pub async fn cached_path(&self, hash: &str) -> Option<PathBuf> {
        let st = self.state.lock().await;
        st.hash_to_path.get(hash).cloned()
    }

    pub async fn is_cache_delete_pending(&self, hash: &str) -> bool {
        let st = self.state.lock().await;
        st.pending_cache_delete.contains_key(hash)
    }

    pub async fn is_delete_pending(&self, path: &Path) -> bool {
        let st = self.state.lock().await;
        st.pending_delete.contains_key(path)
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn reap(state: &Mutex<CacheState>, now: Instant) {
    let mut st = state.lock().await;

    let expired: Vec<PathBuf> = st
        .pending_delete
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(path, _)| path.clone())
        .collect();
    for path in expired {
        // Cache sources are reclaimed with their hash.
        if st.is_source(&path) {
            continue;
        }
        st.pending_delete.remove(&path);
        st.path_to_hash.remove(&path);
        remove_quietly(&path).await;
    }

    let expired_hashes: Vec<String> = st
        .pending_cache_delete
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(hash, _)| hash.clone())
        .collect();
    for hash in expired_hashes {
        // Re-check: a hit may have cleared the mark or revived the count.
        match st.pending_cache_delete.get(&hash) {
            Some(deadline) if *deadline <= now => {}
            _ => continue,
        }
        let Some(source) = st.hash_to_path.get(&hash).cloned() else {
            st.pending_cache_delete.remove(&hash);
            continue;
        };
        if st.ref_count.get(&source).copied().unwrap_or(0) > 0 {
            st.pending_cache_delete.remove(&hash);
            continue;
        }
        // Zero live consumers: every path still mapped to the hash is released.
        for path in st.take_hash(&hash) {
            remove_quietly(&path).await;
        }
        debug!(hash = %hash, path = %source.display(), "cached file reclaimed");
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed cached file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove cached file"),
    }
}
