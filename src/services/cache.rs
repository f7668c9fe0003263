//! Disk-backed cache for generated stream artifacts.
//!
//! A flat directory of content-addressed files with an in-memory index.
//! Entries are created by the transcoder invoker, touched on read, and
//! removed by the janitor under size pressure or by track invalidation.
//! The index mutex is never held across file I/O.

use crate::error::{AppError, Result};
use crate::models::StreamVariant;
use anyhow::Context;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EXTENSIONS: [&str; 3] = [".m3u8", ".mp4", ".m4s"];

/// Key for one cached artifact. Carries the owning track id so the cache can
/// maintain its reverse index for invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hash: String,
    pub track_id: i64,
    pub ext: &'static str,
}

impl CacheKey {
    pub fn manifest(variant: &StreamVariant) -> Self {
        Self::derive(variant.track_id, &format!("{}:manifest", variant.key()), ".m3u8")
    }

    pub fn init(variant: &StreamVariant) -> Self {
        Self::derive(variant.track_id, &format!("{}:init", variant.key()), ".mp4")
    }

    pub fn segment(variant: &StreamVariant, index: u32) -> Self {
        Self::derive(
            variant.track_id,
            &format!("{}:segment:{}", variant.key(), index),
            ".m4s",
        )
    }

    fn derive(track_id: i64, scope: &str, ext: &'static str) -> Self {
        let digest = Sha256::digest(scope.as_bytes());
        // 16 hex chars; collisions within the truncated space are not handled
        let hash = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        CacheKey { hash, track_id, ext }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
    created_at: SystemTime,
    last_access_at: SystemTime,
    track_id: Option<i64>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    by_track: HashMap<i64, HashSet<String>>,
    current_bytes: u64,
}

impl CacheState {
    fn insert(&mut self, hash: String, entry: CacheEntry) {
        if let Some(old) = self.entries.insert(hash.clone(), entry.clone()) {
            self.current_bytes -= old.size_bytes;
            if let Some(track_id) = old.track_id {
                if let Some(keys) = self.by_track.get_mut(&track_id) {
                    keys.remove(&hash);
                }
            }
        }
        self.current_bytes += entry.size_bytes;
        if let Some(track_id) = entry.track_id {
            self.by_track.entry(track_id).or_default().insert(hash);
        }
    }

    fn remove(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        self.current_bytes -= entry.size_bytes;
        if let Some(track_id) = entry.track_id {
            if let Some(keys) = self.by_track.get_mut(&track_id) {
                keys.remove(hash);
                if keys.is_empty() {
                    self.by_track.remove(&track_id);
                }
            }
        }
        Some(entry)
    }
}

pub struct StreamCache {
    dir: PathBuf,
    max_bytes: u64,
    min_ttl: Duration,
    state: Mutex<CacheState>,
}

impl StreamCache {
    /// Open the cache directory, creating it if absent, and rebuild the index
    /// from the files already on disk. An unreadable directory is fatal.
    pub async fn open(dir: PathBuf, max_bytes: u64, min_ttl: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating cache directory {}", dir.display()))?;

        let mut state = CacheState::default();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading cache directory {}", dir.display()))?;
        let mut recovered = 0usize;
        while let Some(dirent) = read_dir
            .next_entry()
            .await
            .context("scanning cache directory")?
        {
            let path = dirent.path();
            let Some(hash) = parse_cache_filename(&path) else {
                continue;
            };
            let Ok(meta) = dirent.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            state.insert(
                hash,
                CacheEntry {
                    path,
                    size_bytes: meta.len(),
                    created_at: mtime,
                    last_access_at: mtime,
                    // The scope that produced a hashed filename is not
                    // recoverable, so rebuilt entries have no track link.
                    track_id: None,
                },
            );
            recovered += 1;
        }

        info!(
            dir = %dir.display(),
            entries = recovered,
            bytes = state.current_bytes,
            "stream cache opened"
        );

        Ok(StreamCache {
            dir,
            max_bytes,
            min_ttl,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache index lock poisoned")
    }

    pub fn current_bytes(&self) -> u64 {
        self.state().current_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Write a blob under its key. The write goes to a temp name in the same
    /// directory and is renamed into place, so readers only ever see complete
    /// files. Overwrites an existing entry for the same key.
    pub async fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let final_path = self.dir.join(format!("{}{}", key.hash, key.ext));
        let tmp_path = self
            .dir
            .join(format!("{}.{}.tmp", key.hash, Uuid::new_v4().simple()));

        if let Err(e) = tokio::fs::write(&tmp_path, bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AppError::CacheWrite(format!(
                "writing {}: {}",
                tmp_path.display(),
                e
            )));
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AppError::CacheWrite(format!(
                "renaming into {}: {}",
                final_path.display(),
                e
            )));
        }

        let now = SystemTime::now();
        self.state().insert(
            key.hash.clone(),
            CacheEntry {
                path: final_path,
                size_bytes: bytes.len() as u64,
                created_at: now,
                last_access_at: now,
                track_id: Some(key.track_id),
            },
        );
        Ok(())
    }

    /// Read a cached blob, touching its access time. A read error purges the
    /// entry and reports a miss so the caller regenerates.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let snapshot = self.state().entries.get(&key.hash).cloned()?;

        match tokio::fs::read(&snapshot.path).await {
            Ok(bytes) => {
                let mut state = self.state();
                if let Some(entry) = state.entries.get_mut(&key.hash) {
                    if entry.path == snapshot.path {
                        entry.last_access_at = SystemTime::now();
                    }
                }
                Some(Bytes::from(bytes))
            }
            Err(e) => {
                warn!(key = %key.hash, error = %e, "cached file unreadable, purging entry");
                self.remove_if_current(&key.hash, &snapshot.path);
                None
            }
        }
    }

    /// Path-returning variant of `get` for zero-copy streaming. The file may
    /// still be unlinked by the janitor while the caller holds the path; the
    /// caller treats the resulting open error as a miss.
    pub fn get_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let mut state = self.state();
        let entry = state.entries.get_mut(&key.hash)?;
        entry.last_access_at = SystemTime::now();
        Some(entry.path.clone())
    }

    /// Index probe without I/O or access-time update.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.state().entries.contains_key(&key.hash)
    }

    /// Drop one entry, for callers that hit a read error on a path obtained
    /// from `get_path`.
    pub async fn purge(&self, key: &CacheKey) {
        let removed = self.state().remove(&key.hash);
        if let Some(entry) = removed {
            let _ = tokio::fs::remove_file(&entry.path).await;
        }
    }

    /// Remove every entry associated with the track. Only entries created
    /// during this process lifetime carry the association; see `open`.
    pub async fn invalidate(&self, track_id: i64) -> usize {
        let removed: Vec<CacheEntry> = {
            let mut state = self.state();
            let hashes: Vec<String> = state
                .by_track
                .get(&track_id)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default();
            hashes
                .iter()
                .filter_map(|hash| state.remove(hash))
                .collect()
        };

        for entry in &removed {
            let _ = tokio::fs::remove_file(&entry.path).await;
        }
        if !removed.is_empty() {
            info!(track_id, entries = removed.len(), "invalidated cached stream artifacts");
        }
        removed.len()
    }

    /// Evict least-recently-used entries until the cache fits its cap.
    /// Entries younger than the minimum TTL are protected even under
    /// pressure, so a fresh transcode survives its first playthrough.
    pub async fn evict(&self) -> usize {
        let victims: Vec<CacheEntry> = {
            let mut state = self.state();
            if state.current_bytes <= self.max_bytes {
                return 0;
            }

            let ttl_floor = SystemTime::now() - self.min_ttl;
            let mut candidates: Vec<(String, SystemTime, u64)> = state
                .entries
                .iter()
                .filter(|(_, e)| e.created_at <= ttl_floor)
                .map(|(hash, e)| (hash.clone(), e.last_access_at, e.size_bytes))
                .collect();
            candidates.sort_by_key(|(_, last_access, _)| *last_access);

            let mut victims = Vec::new();
            for (hash, _, _) in candidates {
                if state.current_bytes <= self.max_bytes {
                    break;
                }
                if let Some(entry) = state.remove(&hash) {
                    victims.push(entry);
                }
            }

            if state.current_bytes > self.max_bytes {
                warn!(
                    current_bytes = state.current_bytes,
                    max_bytes = self.max_bytes,
                    "cache over budget but remaining entries are within min TTL"
                );
            }
            victims
        };

        for entry in &victims {
            let _ = tokio::fs::remove_file(&entry.path).await;
        }
        if !victims.is_empty() {
            debug!(evicted = victims.len(), "cache eviction pass complete");
        }
        victims.len()
    }

    fn remove_if_current(&self, hash: &str, expected_path: &Path) {
        let mut state = self.state();
        let matches = state
            .entries
            .get(hash)
            .map(|e| e.path == expected_path)
            .unwrap_or(false);
        if matches {
            state.remove(hash);
        }
    }
}

/// `<16 hex chars><known ext>` filenames are cache entries; anything else in
/// the directory is left alone.
fn parse_cache_filename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let ext = EXTENSIONS.iter().find(|ext| name.ends_with(*ext))?;
    let stem = &name[..name.len() - ext.len()];
    if stem.len() == 16 && stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(stem.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamFormat;

    fn variant(track_id: i64) -> StreamVariant {
        StreamVariant {
            track_id,
            format: StreamFormat::Aac,
            bitrate_kbps: 128,
        }
    }

    async fn open_cache(dir: &Path, max_bytes: u64, min_ttl: Duration) -> StreamCache {
        StreamCache::open(dir.to_path_buf(), max_bytes, min_ttl)
            .await
            .unwrap()
    }

    #[test]
    fn keys_are_deterministic_and_scoped() {
        let v = variant(7);
        assert_eq!(CacheKey::manifest(&v), CacheKey::manifest(&v));
        assert_eq!(CacheKey::manifest(&v).hash.len(), 16);
        assert_ne!(CacheKey::manifest(&v).hash, CacheKey::init(&v).hash);
        assert_ne!(CacheKey::segment(&v, 0).hash, CacheKey::segment(&v, 1).hash);
        assert_ne!(
            CacheKey::segment(&variant(7), 0).hash,
            CacheKey::segment(&variant(8), 0).hash
        );
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;

        let key = CacheKey::segment(&variant(7), 0);
        cache.put(&key, b"moof+mdat").await.unwrap();

        assert!(cache.has(&key));
        assert_eq!(cache.get(&key).await.unwrap().as_ref(), b"moof+mdat");
        assert_eq!(cache.current_bytes(), 9);
    }

    #[tokio::test]
    async fn put_overwrite_corrects_byte_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;

        let key = CacheKey::manifest(&variant(7));
        cache.put(&key, &[0u8; 100]).await.unwrap();
        cache.put(&key, &[0u8; 40]).await.unwrap();

        assert_eq!(cache.current_bytes(), 40);
        assert_eq!(cache.get(&key).await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn get_path_serves_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;

        let key = CacheKey::init(&variant(7));
        cache.put(&key, b"ftyp").await.unwrap();

        let path = cache.get_path(&key).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"ftyp");
    }

    #[tokio::test]
    async fn unreadable_entry_is_purged_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;

        let key = CacheKey::segment(&variant(7), 3);
        cache.put(&key, b"data").await.unwrap();

        let path = cache.get_path(&key).unwrap();
        std::fs::remove_file(path).unwrap();

        assert!(cache.get(&key).await.is_none());
        assert!(!cache.has(&key));
        assert_eq!(cache.current_bytes(), 0);
    }

    #[tokio::test]
    async fn invalidate_removes_only_that_track() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;

        let seven = variant(7);
        let eight = variant(8);
        let keys_7 = [
            CacheKey::manifest(&seven),
            CacheKey::init(&seven),
            CacheKey::segment(&seven, 0),
        ];
        let keys_8 = [CacheKey::manifest(&eight), CacheKey::segment(&eight, 0)];
        for key in keys_7.iter().chain(keys_8.iter()) {
            cache.put(key, b"x").await.unwrap();
        }

        let removed = cache.invalidate(7).await;

        assert_eq!(removed, 3);
        for key in &keys_7 {
            assert!(!cache.has(key));
        }
        for key in &keys_8 {
            assert!(cache.has(key));
        }
    }

    #[tokio::test]
    async fn evict_is_lru_within_ttl_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let max = 10 * 1024 * 1024;
        let cache = open_cache(dir.path(), max, Duration::ZERO).await;

        let v = variant(7);
        let keys: Vec<CacheKey> = (0..12).map(|n| CacheKey::segment(&v, n)).collect();
        let blob = vec![0u8; 1024 * 1024];
        for key in &keys {
            cache.put(key, &blob).await.unwrap();
        }
        // Keys 0 and 1 stay least recently accessed
        for key in &keys[2..] {
            cache.get(key).await.unwrap();
        }

        let evicted = cache.evict().await;

        assert_eq!(evicted, 2);
        assert!(cache.current_bytes() <= max);
        assert!(!cache.has(&keys[0]));
        assert!(!cache.has(&keys[1]));
        for key in &keys[2..] {
            assert!(cache.has(key));
        }
    }

    #[tokio::test]
    async fn evict_protects_entries_within_min_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 10 * 1024, Duration::from_secs(60)).await;

        let v = variant(7);
        let blob = vec![0u8; 1024];
        for n in 0..12 {
            cache.put(&CacheKey::segment(&v, n), &blob).await.unwrap();
        }
        let before = cache.current_bytes();

        assert_eq!(cache.evict().await, 0);
        assert_eq!(cache.current_bytes(), before);
    }

    #[tokio::test]
    async fn evict_at_cap_is_a_noop_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024, Duration::ZERO).await;

        cache
            .put(&CacheKey::segment(&variant(7), 0), &[0u8; 1024])
            .await
            .unwrap();

        assert_eq!(cache.evict().await, 0);

        cache
            .put(&CacheKey::segment(&variant(7), 1), &[0u8; 512])
            .await
            .unwrap();
        assert!(cache.evict().await > 0);
        assert_eq!(cache.evict().await, 0);
    }

    #[tokio::test]
    async fn reopen_rebuilds_index_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let v = variant(7);
        let key = CacheKey::segment(&v, 0);
        {
            let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;
            cache.put(&key, b"persisted").await.unwrap();
        }
        // Unparseable names must be left alone
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        std::fs::write(dir.path().join("short.m4s"), b"ignore me").unwrap();

        let cache = open_cache(dir.path(), 1024 * 1024, Duration::ZERO).await;

        assert!(cache.has(&key));
        assert_eq!(cache.get(&key).await.unwrap().as_ref(), b"persisted");
        assert_eq!(cache.current_bytes(), 9);
        assert!(dir.path().join("notes.txt").exists());
    }
}
