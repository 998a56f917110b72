//! Layer cache stores.
//!
//! A [`CacheStore`] persists layers keyed by their hash, the delta blobs
//! they reference, and a set of named GC roots. Layers reachable from a
//! root (the pinned layers and all their ancestors) are never pruned.
//!
//! - [`DiskCacheStore`]: durable store under a cache directory
//! - [`MemoryCacheStore`]: ephemeral store for tests and throwaway builds

pub mod disk;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use a3s_forge_core::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Digest;
use crate::layer::{BlobRef, Layer};

pub use disk::DiskCacheStore;
pub use memory::MemoryCacheStore;

/// GC roots: root name to pinned layer hashes.
pub type GcRoots = BTreeMap<String, BTreeSet<Digest>>;

/// Root name pinning the layers of a build that is still running.
pub fn build_root(build_id: &uuid::Uuid) -> String {
    format!("build:{}", build_id)
}

/// Root name pinning the layers of an assembled image.
pub fn image_root(image_digest: &Digest) -> String {
    format!("image:{}", image_digest)
}

/// A stored layer plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    #[serde(flatten)]
    pub layer: Layer,
    /// Human-readable instruction, for inspection tools
    pub summary: String,
    /// Size of the referenced delta in bytes
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
}

impl LayerRecord {
    pub fn new(layer: Layer) -> Self {
        Self {
            summary: layer.produced_by.to_string(),
            size: layer.size(),
            last_accessed: layer.created_at,
            layer,
        }
    }

    pub fn hash(&self) -> &Digest {
        &self.layer.hash
    }
}

/// Outcome of a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub layers_removed: Vec<Digest>,
    pub blobs_removed: usize,
    pub bytes_reclaimed: u64,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.layers_removed.is_empty() && self.blobs_removed == 0
    }
}

/// Predicate selecting prune candidates.
pub type PrunePredicate<'a> = &'a (dyn Fn(&LayerRecord) -> bool + Send + Sync);

/// Content-addressed layer storage.
///
/// Implementations are safe to share between concurrently running stages.
/// `put` is idempotent and serialised per hash; a layer becomes visible to
/// `get` only once it is completely stored.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a layer by hash, refreshing its access time.
    async fn get(&self, hash: &Digest) -> Result<Option<Layer>>;

    /// Insert a layer. Inserting an existing hash is a no-op.
    async fn put(&self, layer: Layer) -> Result<()>;

    async fn has(&self, hash: &Digest) -> Result<bool>;

    /// Store a delta blob, returning its content address.
    async fn put_blob(&self, data: Vec<u8>) -> Result<BlobRef>;

    async fn read_blob(&self, blob: &BlobRef) -> Result<Vec<u8>>;

    /// All stored layers, ordered by hash.
    async fn list(&self) -> Result<Vec<LayerRecord>>;

    /// Remove layers matching `predicate` that are not protected by a GC
    /// root, together with their descendants and any blobs left
    /// unreferenced.
    async fn prune(&self, predicate: PrunePredicate<'_>) -> Result<PruneReport>;

    /// Add `hashes` to the named root, creating it if needed.
    async fn pin(&self, root: &str, hashes: &[Digest]) -> Result<()>;

    /// Drop a root. Unknown roots are ignored.
    async fn unpin(&self, root: &str) -> Result<()>;

    async fn roots(&self) -> Result<GcRoots>;

    /// Prune layers not accessed within `age`.
    async fn prune_older_than(&self, age: Duration) -> Result<PruneReport> {
        let cutoff = Utc::now() - age;
        let report = self
            .prune(&move |record: &LayerRecord| record.last_accessed < cutoff)
            .await?;
        tracing::info!(
            layers = report.layers_removed.len(),
            bytes = report.bytes_reclaimed,
            "Pruned layers older than cutoff"
        );
        Ok(report)
    }

    /// Evict least-recently-accessed unprotected layers until the stored
    /// blob bytes fit in `max_bytes`.
    async fn prune_to_size(&self, max_bytes: u64) -> Result<PruneReport> {
        let mut records = self.list().await?;
        let roots = self.roots().await?;

        let total: u64 = {
            let mut blob_sizes: HashMap<&Digest, u64> = HashMap::new();
            for record in &records {
                if let Some(blob) = &record.layer.delta {
                    blob_sizes.insert(&blob.digest, blob.size);
                }
            }
            blob_sizes.values().sum()
        };
        if total <= max_bytes {
            return Ok(PruneReport::default());
        }

        let protected = protected_hashes(&records, &roots);
        records.sort_by_key(|r| r.last_accessed);

        let mut current = total;
        let mut victims = HashSet::new();
        for record in &records {
            if current <= max_bytes {
                break;
            }
            if protected.contains(record.hash()) {
                continue;
            }
            victims.insert(record.hash().clone());
            current = current.saturating_sub(record.size);
        }

        let report = self
            .prune(&move |record: &LayerRecord| victims.contains(record.hash()))
            .await?;
        tracing::info!(
            layers = report.layers_removed.len(),
            bytes = report.bytes_reclaimed,
            max_bytes,
            "Pruned layer cache to size"
        );
        Ok(report)
    }
}

/// Hashes pinned by any root, plus all of their ancestors.
pub(crate) fn protected_hashes(records: &[LayerRecord], roots: &GcRoots) -> HashSet<Digest> {
    let parents: HashMap<&Digest, Option<&Digest>> = records
        .iter()
        .map(|r| (r.hash(), r.layer.parent.as_ref()))
        .collect();

    let mut protected = HashSet::new();
    for pinned in roots.values().flatten() {
        let mut current = Some(pinned);
        while let Some(hash) = current {
            if !protected.insert(hash.clone()) {
                break;
            }
            current = parents.get(hash).copied().flatten();
        }
    }
    protected
}

/// What a prune will remove.
#[derive(Debug, Default)]
pub(crate) struct PrunePlan {
    pub layers: Vec<Digest>,
    pub blobs: Vec<BlobRef>,
}

/// Select candidates, extend them with their descendants, and find blobs
/// no surviving layer references.
pub(crate) fn plan_prune(
    records: &[LayerRecord],
    roots: &GcRoots,
    predicate: PrunePredicate<'_>,
) -> PrunePlan {
    let protected = protected_hashes(records, roots);

    let mut children: HashMap<&Digest, Vec<&Digest>> = HashMap::new();
    for record in records {
        if let Some(parent) = &record.layer.parent {
            children.entry(parent).or_default().push(record.hash());
        }
    }

    let mut doomed: HashSet<&Digest> = HashSet::new();
    let mut queue: Vec<&Digest> = records
        .iter()
        .filter(|r| !protected.contains(r.hash()) && predicate(*r))
        .map(|r| r.hash())
        .collect();
    while let Some(hash) = queue.pop() {
        if protected.contains(hash) || !doomed.insert(hash) {
            continue;
        }
        if let Some(kids) = children.get(hash) {
            queue.extend(kids.iter().copied());
        }
    }

    let surviving_blobs: HashSet<&Digest> = records
        .iter()
        .filter(|r| !doomed.contains(r.hash()))
        .filter_map(|r| r.layer.delta.as_ref().map(|b| &b.digest))
        .collect();

    let mut layers = Vec::new();
    let mut blobs: BTreeMap<&Digest, &BlobRef> = BTreeMap::new();
    for record in records.iter().filter(|r| doomed.contains(r.hash())) {
        layers.push(record.hash().clone());
        if let Some(blob) = &record.layer.delta {
            if !surviving_blobs.contains(&blob.digest) {
                blobs.insert(&blob.digest, blob);
            }
        }
    }
    layers.sort();

    PrunePlan {
        layers,
        blobs: blobs.into_values().cloned().collect(),
    }
}
