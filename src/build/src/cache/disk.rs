//! Durable cache store.
//!
//! Layout under the cache directory:
//!
//! ```text
//! blobs/sha256/<hex>          delta blobs
//! layers/sha256_<hex>.json    one record per layer
//! roots.json                  GC roots
//! ```
//!
//! Every file is written to a temporary file in the same directory and
//! renamed into place, so readers never observe a partial record and a
//! crash mid-write leaves no trace.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_forge_core::error::{ForgeError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use super::{plan_prune, CacheStore, GcRoots, LayerRecord, PrunePredicate, PruneReport};
use crate::hash::{sha256_bytes, Digest};
use crate::layer::{BlobRef, Layer};

const ROOTS_FILE: &str = "roots.json";
const RECORD_EXT: &str = "json";

/// Filesystem-backed [`CacheStore`].
pub struct DiskCacheStore {
    /// Root directory (e.g., ~/.a3s/forge/cache)
    dir: PathBuf,
    blobs_dir: PathBuf,
    layers_dir: PathBuf,
    /// Shared by get/put/pin, exclusive for prune
    gc_lock: RwLock<()>,
    /// Serialises puts of the same hash; entries live while a put holds them
    put_locks: DashMap<Digest, Arc<Mutex<()>>>,
    /// Blobs written by `put_blob` whose layer has not been put yet
    staged: DashMap<Digest, usize>,
    roots: Mutex<GcRoots>,
}

impl DiskCacheStore {
    /// Open (or create) a store at `dir`, loading existing GC roots.
    pub fn open(dir: &Path) -> Result<Self> {
        let blobs_dir = dir.join("blobs").join("sha256");
        let layers_dir = dir.join("layers");
        for d in [&blobs_dir, &layers_dir] {
            std::fs::create_dir_all(d).map_err(|e| {
                ForgeError::CacheError(format!(
                    "Failed to create cache directory {}: {}",
                    d.display(),
                    e
                ))
            })?;
        }

        let roots_path = dir.join(ROOTS_FILE);
        let roots = if roots_path.is_file() {
            let content = std::fs::read_to_string(&roots_path).map_err(|e| {
                ForgeError::CacheError(format!(
                    "Failed to read GC roots {}: {}",
                    roots_path.display(),
                    e
                ))
            })?;
            serde_json::from_str(&content)?
        } else {
            GcRoots::new()
        };

        tracing::debug!(
            dir = %dir.display(),
            roots = roots.len(),
            "Opened layer cache"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            blobs_dir,
            layers_dir,
            gc_lock: RwLock::new(()),
            put_locks: DashMap::new(),
            staged: DashMap::new(),
            roots: Mutex::new(roots),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, hash: &Digest) -> PathBuf {
        self.layers_dir
            .join(format!("{}.{}", hash.to_file_name(), RECORD_EXT))
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.hex())
    }

    fn read_record(&self, hash: &Digest) -> Result<Option<LayerRecord>> {
        let path = self.record_path(hash);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ForgeError::CacheError(format!(
                    "Failed to read layer record {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let record: LayerRecord = serde_json::from_str(&content).map_err(|e| {
            ForgeError::CacheError(format!(
                "Corrupt layer record {}: {}",
                path.display(),
                e
            ))
        })?;
        if &record.layer.hash != hash {
            return Err(ForgeError::CacheError(format!(
                "Layer record {} holds hash {}",
                path.display(),
                record.layer.hash
            )));
        }
        Ok(Some(record))
    }

    fn write_record(&self, record: &LayerRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.layers_dir, &self.record_path(record.hash()), &data)
    }

    fn put_lock(&self, hash: &Digest) -> Arc<Mutex<()>> {
        self.put_locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn insert(&self, layer: Layer) -> Result<()> {
        let _gc = self.gc_lock.read().await;
        let hash = layer.hash.clone();
        let lock = self.put_lock(&hash);
        let result = {
            let _guard = lock.lock().await;
            self.write_new_record(layer)
        };
        self.put_locks.remove_if(&hash, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
        });
        result
    }

    fn write_new_record(&self, layer: Layer) -> Result<()> {
        if self.record_path(&layer.hash).is_file() {
            tracing::debug!(hash = %layer.hash, "Layer already cached");
            return Ok(());
        }
        if let Some(blob) = &layer.delta {
            if !self.blob_path(&blob.digest).is_file() {
                return Err(ForgeError::CacheError(format!(
                    "Layer {} references missing blob {}",
                    layer.hash, blob.digest
                )));
            }
        }

        let hash = layer.hash.clone();
        let size = layer.size();
        self.write_record(&LayerRecord::new(layer))?;

        tracing::debug!(hash = %hash, size_bytes = size, "Cached layer");
        Ok(())
    }

    fn unstage(&self, digest: &Digest) {
        self.staged.remove_if_mut(digest, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    fn save_roots(&self, roots: &GcRoots) -> Result<()> {
        let data = serde_json::to_vec_pretty(roots)?;
        write_atomic(&self.dir, &self.dir.join(ROOTS_FILE), &data)
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn get(&self, hash: &Digest) -> Result<Option<Layer>> {
        let _gc = self.gc_lock.read().await;
        let Some(mut record) = self.read_record(hash)? else {
            return Ok(None);
        };

        // Update last_accessed timestamp
        record.last_accessed = chrono::Utc::now();
        if let Err(e) = self.write_record(&record) {
            tracing::debug!(hash = %hash, error = %e, "Failed to refresh layer access time");
        }

        Ok(Some(record.layer))
    }

    async fn put(&self, layer: Layer) -> Result<()> {
        let staged = layer.delta.as_ref().map(|b| b.digest.clone());
        let result = self.insert(layer).await;
        // From here a stored record, or nothing, holds the blob
        if let Some(digest) = staged {
            self.unstage(&digest);
        }
        result
    }

    async fn has(&self, hash: &Digest) -> Result<bool> {
        Ok(self.record_path(hash).is_file())
    }

    async fn put_blob(&self, data: Vec<u8>) -> Result<BlobRef> {
        let _gc = self.gc_lock.read().await;
        let digest = Digest::of_bytes(&data);
        let blob = BlobRef {
            digest: digest.clone(),
            size: data.len() as u64,
        };
        let path = self.blob_path(&digest);
        if !path.is_file() {
            write_atomic(&self.blobs_dir, &path, &data)?;
        }
        *self.staged.entry(digest).or_insert(0) += 1;
        Ok(blob)
    }

    async fn read_blob(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let path = self.blob_path(&blob.digest);
        let data = std::fs::read(&path).map_err(|e| {
            ForgeError::CacheError(format!("Failed to read blob {}: {}", blob.digest, e))
        })?;
        if sha256_bytes(&data) != blob.digest.hex() {
            return Err(ForgeError::CacheError(format!(
                "Blob {} failed digest verification",
                blob.digest
            )));
        }
        Ok(data)
    }

    async fn list(&self) -> Result<Vec<LayerRecord>> {
        let read_dir = std::fs::read_dir(&self.layers_dir).map_err(|e| {
            ForgeError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.layers_dir.display(),
                e
            ))
        })?;

        let mut records = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(hash) = Digest::parse(&name.replacen('_', ":", 1)) else {
                continue;
            };
            if let Some(record) = self.read_record(&hash)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.hash().cmp(b.hash()));
        Ok(records)
    }

    async fn prune(&self, predicate: PrunePredicate<'_>) -> Result<PruneReport> {
        let _gc = self.gc_lock.write().await;
        let records = self.list().await?;
        let roots = self.roots.lock().await.clone();
        let plan = plan_prune(&records, &roots, predicate);

        let mut report = PruneReport::default();
        for hash in plan.layers {
            remove_if_present(&self.record_path(&hash))?;
            tracing::debug!(hash = %hash, "Evicted cached layer");
            report.layers_removed.push(hash);
        }
        for blob in plan.blobs {
            if self.staged.contains_key(&blob.digest) {
                tracing::debug!(digest = %blob.digest, "Keeping blob awaiting its layer");
                continue;
            }
            if remove_if_present(&self.blob_path(&blob.digest))? {
                report.blobs_removed += 1;
                report.bytes_reclaimed += blob.size;
            }
        }
        Ok(report)
    }

    async fn pin(&self, root: &str, hashes: &[Digest]) -> Result<()> {
        let _gc = self.gc_lock.read().await;
        let mut roots = self.roots.lock().await;
        let entry = roots.entry(root.to_string()).or_default();
        let before = entry.len();
        entry.extend(hashes.iter().cloned());
        if entry.len() != before || hashes.is_empty() {
            self.save_roots(&roots)?;
        }
        Ok(())
    }

    async fn unpin(&self, root: &str) -> Result<()> {
        let mut roots = self.roots.lock().await;
        if roots.remove(root).is_some() {
            self.save_roots(&roots)?;
        }
        Ok(())
    }

    async fn roots(&self) -> Result<GcRoots> {
        Ok(self.roots.lock().await.clone())
    }
}

/// Write `data` to `path` via a temporary file in `dir`.
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        ForgeError::CacheError(format!(
            "Failed to create temporary file in {}: {}",
            dir.display(),
            e
        ))
    })?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| {
            ForgeError::CacheError(format!("Failed to write {}: {}", path.display(), e))
        })?;
    tmp.persist(path).map_err(|e| {
        ForgeError::CacheError(format!("Failed to persist {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ForgeError::CacheError(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::layer;
    use tempfile::TempDir;

    async fn store_with_blob(store: &DiskCacheStore, name: &str, parent: Option<&Layer>) -> Layer {
        let blob = store.put_blob(name.as_bytes().to_vec()).await.unwrap();
        let mut l = layer(name, parent, None);
        l.delta = Some(blob);
        store.put(l.clone()).await.unwrap();
        l
    }

    #[tokio::test]
    async fn test_get_missing() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let hash = Digest::of_bytes(b"nope");
        assert!(store.get(&hash).await.unwrap().is_none());
        assert!(!store.has(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let l = store_with_blob(&store, "base", None).await;

        let got = store.get(&l.hash).await.unwrap().unwrap();
        assert_eq!(got, l);
        assert!(store.has(&l.hash).await.unwrap());
        assert!(tmp
            .path()
            .join("layers")
            .join(format!("{}.json", l.hash.to_file_name()))
            .is_file());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let l = layer("step", None, None);

        store.put(l.clone()).await.unwrap();
        store.put(l.clone()).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let l = layer("step", None, Some("never-stored"));

        let err = store.put(l.clone()).await.unwrap_err();
        assert!(matches!(err, ForgeError::CacheError(_)));
        assert!(!store.has(&l.hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_puts_same_hash() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(DiskCacheStore::open(tmp.path()).unwrap());
        let l = layer("shared", None, None);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let l = l.clone();
            handles.push(tokio::spawn(async move { store.put(l).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.put_locks.is_empty());
    }

    #[tokio::test]
    async fn test_put_locks_released_after_put() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        for name in ["a", "b", "c"] {
            store.put(layer(name, None, None)).await.unwrap();
        }
        assert!(store.put_locks.is_empty());
    }

    #[tokio::test]
    async fn test_staged_blob_survives_prune_until_put() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let old = store_with_blob(&store, "shared", None).await;

        // Same content staged for a new layer before the old one is pruned
        let blob = store.put_blob(b"shared".to_vec()).await.unwrap();
        let report = store.prune(&|_: &LayerRecord| true).await.unwrap();
        assert_eq!(report.layers_removed, vec![old.hash.clone()]);
        assert_eq!(report.blobs_removed, 0);

        let mut new = layer("new", None, None);
        new.delta = Some(blob.clone());
        store.put(new.clone()).await.unwrap();
        assert_eq!(store.read_blob(&blob).await.unwrap(), b"shared");
        assert!(store.staged.is_empty());

        let report = store.prune(&|_: &LayerRecord| true).await.unwrap();
        assert_eq!(report.layers_removed, vec![new.hash]);
        assert_eq!(report.blobs_removed, 1);
        assert!(!store.blob_path(&blob.digest).exists());
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_verification() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let blob = store.put_blob(b"delta bytes".to_vec()).await.unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(store.read_blob(&blob).await.unwrap(), b"delta bytes");

        std::fs::write(store.blob_path(&blob.digest), b"tampered").unwrap();
        assert!(store.read_blob(&blob).await.is_err());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let l = {
            let store = DiskCacheStore::open(tmp.path()).unwrap();
            let l = store_with_blob(&store, "base", None).await;
            store.pin("image:test", &[l.hash.clone()]).await.unwrap();
            l
        };

        let store = DiskCacheStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(&l.hash).await.unwrap().unwrap(), l);
        assert!(store.roots().await.unwrap()["image:test"].contains(&l.hash));
        let blob = l.delta.unwrap();
        assert_eq!(store.read_blob(&blob).await.unwrap(), b"base");
    }

    #[tokio::test]
    async fn test_list_ignores_stray_files() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        store.put(layer("a", None, None)).await.unwrap();
        std::fs::write(tmp.path().join("layers").join(".tmpXYZ"), b"partial").unwrap();
        std::fs::write(tmp.path().join("layers").join("notes.txt"), b"hi").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_respects_roots() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let base = store_with_blob(&store, "base", None).await;
        let app = store_with_blob(&store, "app", Some(&base)).await;
        let stray = store_with_blob(&store, "stray", None).await;

        store.pin("image:app", &[app.hash.clone()]).await.unwrap();
        let report = store.prune(&|_: &LayerRecord| true).await.unwrap();

        assert_eq!(report.layers_removed, vec![stray.hash.clone()]);
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(report.bytes_reclaimed, 5);
        assert!(store.has(&base.hash).await.unwrap());
        assert!(store.has(&app.hash).await.unwrap());
        assert!(!store.has(&stray.hash).await.unwrap());

        store.unpin("image:app").await.unwrap();
        let report = store.prune(&|_: &LayerRecord| true).await.unwrap();
        assert_eq!(report.layers_removed.len(), 2);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_removes_descendants() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let base = store_with_blob(&store, "base", None).await;
        let child = store_with_blob(&store, "child", Some(&base)).await;

        let target = base.hash.clone();
        let report = store
            .prune(&move |r: &LayerRecord| r.layer.hash == target)
            .await
            .unwrap();
        assert_eq!(report.layers_removed.len(), 2);
        assert!(!store.has(&child.hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_to_size_evicts_oldest() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let old = store_with_blob(&store, "old-layer", None).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let new = store_with_blob(&store, "new-layer", None).await;

        let report = store.prune_to_size(9).await.unwrap();
        assert_eq!(report.layers_removed, vec![old.hash.clone()]);
        assert!(store.has(&new.hash).await.unwrap());

        let report = store.prune_to_size(1024).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let l = store_with_blob(&store, "recent", None).await;

        let report = store
            .prune_older_than(chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(report.is_empty());

        let report = store
            .prune_older_than(chrono::Duration::zero())
            .await
            .unwrap();
        assert_eq!(report.layers_removed, vec![l.hash]);
    }

    #[tokio::test]
    async fn test_unpin_unknown_root() {
        let tmp = TempDir::new().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        store.unpin("build:missing").await.unwrap();
        assert!(store.roots().await.unwrap().is_empty());
    }
}
