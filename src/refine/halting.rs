//! Builder-pack cache keyed by (namespace, modality).
//!
//! Single writer, snapshot readers: `announce` swaps a whole
//! `Arc<PackSnapshot>` under the write lock, readers clone the `Arc` under
//! the read lock. A reader never sees a half-applied parameter set.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto;
use crate::model::{BuilderPack, HaltingParams, PackStatus};
use crate::{Error, Result};

/// External collaborator serving the current pack for a key.
pub trait BuilderPackSource: Send + Sync {
    fn fetch(&self, namespace: &str, modality: &str) -> Result<Option<BuilderPack>>;
}

/// Halting contract resolved from a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltingConfig {
    pub pack_id: String,
    pub threshold: f64,
    pub m_max: usize,
    pub m_min: usize,
}

impl HaltingConfig {
    pub fn new(pack_id: impl Into<String>, params: HaltingParams) -> Self {
        Self {
            pack_id: pack_id.into(),
            threshold: params.threshold,
            m_max: params.m_max,
            m_min: params.m_min,
        }
    }
}

/// Immutable view of one announced pack.
#[derive(Debug, Clone, PartialEq)]
pub struct PackSnapshot {
    pub pack: BuilderPack,
    /// SHA-256 of the pack's canonical JSON.
    pub signature: String,
}

impl PackSnapshot {
    pub fn from_pack(pack: BuilderPack) -> Result<Self> {
        pack.check().map_err(Error::Validation)?;
        let signature = crypto::sha256_hex(&crypto::canonical_json(&pack)?);
        Ok(Self { pack, signature })
    }

    pub fn halting(&self) -> Option<HaltingConfig> {
        self.pack
            .halting
            .map(|h| HaltingConfig::new(self.pack.id.clone(), h))
    }
}

/// What an announcement did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceOutcome {
    Installed,
    Replaced,
    Unchanged,
    Invalidated,
}

type PackKey = (String, String);

#[derive(Default)]
pub struct PackCache {
    entries: RwLock<HashMap<PackKey, Arc<PackSnapshot>>>,
    source: Option<Arc<dyn BuilderPackSource>>,
}

impl std::fmt::Debug for PackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackCache")
            .field("entries", &self.entries.read().len())
            .field("source", &self.source.is_some())
            .finish()
    }
}

fn key(namespace: &str, modality: &str) -> PackKey {
    (namespace.to_string(), modality.to_string())
}

impl PackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn BuilderPackSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Apply a pack update. Retiring the installed pack drops the entry;
    /// retiring any other pack, or re-announcing the cached signature, is a
    /// no-op.
    pub fn announce(&self, namespace: &str, modality: &str, pack: BuilderPack) -> Result<AnnounceOutcome> {
        let k = key(namespace, modality);

        if pack.status == PackStatus::Retired {
            let mut entries = self.entries.write();
            if !entries.get(&k).is_some_and(|current| current.pack.id == pack.id) {
                debug!(namespace, modality, pack = %pack.id, "retired pack is not installed");
                return Ok(AnnounceOutcome::Unchanged);
            }
            entries.remove(&k);
            info!(namespace, modality, pack = %pack.id, "builder pack retired");
            return Ok(AnnounceOutcome::Invalidated);
        }

        let snapshot = Arc::new(PackSnapshot::from_pack(pack)?);
        let mut entries = self.entries.write();
        let outcome = match entries.get(&k) {
            Some(current) if current.signature == snapshot.signature => AnnounceOutcome::Unchanged,
            Some(_) => AnnounceOutcome::Replaced,
            None => AnnounceOutcome::Installed,
        };
        if outcome != AnnounceOutcome::Unchanged {
            info!(
                namespace,
                modality,
                pack = %snapshot.pack.id,
                generation = snapshot.pack.generation,
                ?outcome,
                "builder pack announced"
            );
            entries.insert(k, snapshot);
        }
        Ok(outcome)
    }

    /// Current snapshot, fetched from the source on a miss.
    pub fn snapshot(&self, namespace: &str, modality: &str) -> Result<Option<Arc<PackSnapshot>>> {
        let k = key(namespace, modality);
        if let Some(s) = self.entries.read().get(&k) {
            return Ok(Some(Arc::clone(s)));
        }
        let Some(source) = &self.source else {
            return Ok(None);
        };

        let Some(pack) = source.fetch(namespace, modality)? else {
            debug!(namespace, modality, "no builder pack available");
            return Ok(None);
        };
        if pack.status == PackStatus::Retired {
            warn!(namespace, modality, pack = %pack.id, "source served a retired pack, ignoring");
            return Ok(None);
        }
        let fetched = Arc::new(PackSnapshot::from_pack(pack)?);

        // A concurrent announce wins over the fetched value.
        let mut entries = self.entries.write();
        let current = entries.entry(k).or_insert(fetched);
        Ok(Some(Arc::clone(current)))
    }

    pub fn invalidate(&self, namespace: &str, modality: &str) -> bool {
        self.entries.write().remove(&key(namespace, modality)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
