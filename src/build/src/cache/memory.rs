//! In-memory cache store.

use std::collections::HashMap;

use a3s_forge_core::error::{ForgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{plan_prune, CacheStore, GcRoots, LayerRecord, PrunePredicate, PruneReport};
use crate::hash::Digest;
use crate::layer::{BlobRef, Layer};

#[derive(Default)]
struct State {
    records: HashMap<Digest, LayerRecord>,
    blobs: HashMap<Digest, Vec<u8>>,
    /// Blobs written by `put_blob` whose layer has not been put yet
    staged: HashMap<Digest, usize>,
    roots: GcRoots,
}

impl State {
    fn unstage(&mut self, digest: &Digest) {
        if let Some(count) = self.staged.get_mut(digest) {
            *count -= 1;
            if *count == 0 {
                self.staged.remove(digest);
            }
        }
    }
}

/// Ephemeral [`CacheStore`]; everything is lost when it is dropped.
#[derive(Default)]
pub struct MemoryCacheStore {
    state: RwLock<State>,
    /// Access times, kept apart so lookups only need a read lock
    accessed: DashMap<Digest, DateTime<Utc>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot_records(&self, state: &State) -> Vec<LayerRecord> {
        let mut records: Vec<LayerRecord> = state
            .records
            .values()
            .map(|record| {
                let mut record = record.clone();
                if let Some(at) = self.accessed.get(record.hash()) {
                    record.last_accessed = *at;
                }
                record
            })
            .collect();
        records.sort_by(|a, b| a.hash().cmp(b.hash()));
        records
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, hash: &Digest) -> Result<Option<Layer>> {
        let layer = self
            .state
            .read()
            .records
            .get(hash)
            .map(|record| record.layer.clone());
        if layer.is_some() {
            self.accessed.insert(hash.clone(), Utc::now());
        }
        Ok(layer)
    }

    async fn put(&self, layer: Layer) -> Result<()> {
        let mut state = self.state.write();
        if let Some(blob) = &layer.delta {
            state.unstage(&blob.digest);
        }
        if state.records.contains_key(&layer.hash) {
            return Ok(());
        }
        if let Some(blob) = &layer.delta {
            if !state.blobs.contains_key(&blob.digest) {
                return Err(ForgeError::CacheError(format!(
                    "Layer {} references missing blob {}",
                    layer.hash, blob.digest
                )));
            }
        }
        state
            .records
            .insert(layer.hash.clone(), LayerRecord::new(layer));
        Ok(())
    }

    async fn has(&self, hash: &Digest) -> Result<bool> {
        Ok(self.state.read().records.contains_key(hash))
    }

    async fn put_blob(&self, data: Vec<u8>) -> Result<BlobRef> {
        let blob = BlobRef {
            digest: Digest::of_bytes(&data),
            size: data.len() as u64,
        };
        let mut state = self.state.write();
        state.blobs.entry(blob.digest.clone()).or_insert(data);
        *state.staged.entry(blob.digest.clone()).or_insert(0) += 1;
        Ok(blob)
    }

    async fn read_blob(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.state
            .read()
            .blobs
            .get(&blob.digest)
            .cloned()
            .ok_or_else(|| ForgeError::CacheError(format!("Unknown blob {}", blob.digest)))
    }

    async fn list(&self) -> Result<Vec<LayerRecord>> {
        let state = self.state.read();
        Ok(self.snapshot_records(&state))
    }

    async fn prune(&self, predicate: PrunePredicate<'_>) -> Result<PruneReport> {
        let mut state = self.state.write();
        let records = self.snapshot_records(&state);
        let plan = plan_prune(&records, &state.roots, predicate);

        let mut report = PruneReport::default();
        for hash in plan.layers {
            state.records.remove(&hash);
            self.accessed.remove(&hash);
            report.layers_removed.push(hash);
        }
        for blob in plan.blobs {
            if state.staged.contains_key(&blob.digest) {
                continue;
            }
            if state.blobs.remove(&blob.digest).is_some() {
                report.blobs_removed += 1;
                report.bytes_reclaimed += blob.size;
            }
        }
        Ok(report)
    }

    async fn pin(&self, root: &str, hashes: &[Digest]) -> Result<()> {
        self.state
            .write()
            .roots
            .entry(root.to_string())
            .or_default()
            .extend(hashes.iter().cloned());
        Ok(())
    }

    async fn unpin(&self, root: &str) -> Result<()> {
        self.state.write().roots.remove(root);
        Ok(())
    }

    async fn roots(&self) -> Result<GcRoots> {
        Ok(self.state.read().roots.clone())
    }
}
