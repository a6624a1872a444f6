//! The CGP packet: versioned, routed, optionally signed.

use std::collections::{BTreeMap, HashSet};
use serde::{Deserialize, Serialize};
use super::{Constellation, SuperNode};

/// Wire version carried in `Packet::spec`.
pub const SPEC_VERSION: &str = "chit.cgp.v0.1";

/// Event tag returned by every successful ingest.
pub const EVENT_TAG: &str = "geometry.cgp.v1";

/// Meta key naming the routing namespace.
pub const META_NAMESPACE: &str = "namespace";

/// Meta key naming the routing modality.
pub const META_MODALITY: &str = "modality";

/// Algorithm tag written into `Signature::alg`.
pub const SIGNATURE_ALG: &str = "HMAC-SHA256";

/// Free-form packet metadata. Sorted so canonical bytes are stable.
pub type Meta = BTreeMap<String, serde_json::Value>;

/// Signature envelope. Stripped before canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub alg: String,
    /// Base64 HMAC-SHA256 over the canonical packet bytes.
    pub hmac: String,
}

/// AES-256-GCM sealed anchor. All fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedAnchor {
    pub iv: String,
    pub salt: String,
    pub ciphertext: String,
}

/// A Constellation Geometry Protocol packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub spec: String,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub supernodes: Vec<SuperNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
}

impl Packet {
    /// Empty packet routed to `(namespace, modality)`.
    pub fn new(namespace: impl Into<String>, modality: impl Into<String>) -> Self {
        let mut meta = Meta::new();
        meta.insert(META_NAMESPACE.into(), serde_json::Value::String(namespace.into()));
        meta.insert(META_MODALITY.into(), serde_json::Value::String(modality.into()));
        Self {
            spec: SPEC_VERSION.to_string(),
            meta,
            supernodes: Vec::new(),
            sig: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_supernode(mut self, supernode: SuperNode) -> Self {
        self.supernodes.push(supernode);
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta.get(META_NAMESPACE).and_then(|v| v.as_str())
    }

    pub fn modality(&self) -> Option<&str> {
        self.meta.get(META_MODALITY).and_then(|v| v.as_str())
    }

    /// All constellations in packet order.
    pub fn constellations(&self) -> impl Iterator<Item = &Constellation> {
        self.supernodes.iter().flat_map(|s| s.constellations.iter())
    }

    pub fn constellations_mut(&mut self) -> impl Iterator<Item = &mut Constellation> {
        self.supernodes.iter_mut().flat_map(|s| s.constellations.iter_mut())
    }

    pub fn constellation(&self, id: &str) -> Option<&Constellation> {
        self.constellations().find(|c| c.id == id)
    }

    pub fn point_count(&self) -> usize {
        self.constellations().map(|c| c.points.len()).sum()
    }

    /// Shape validation. Returns a human-readable reason on failure.
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        if self.spec.trim().is_empty() {
            return Err("packet spec version must not be empty".into());
        }
        match (self.namespace(), self.modality()) {
            (Some(ns), Some(m)) if !ns.is_empty() && !m.is_empty() => {}
            _ => return Err("packet meta must include namespace and modality".into()),
        }

        let mut supernode_ids = HashSet::new();
        let mut constellation_ids = HashSet::new();
        for sn in &self.supernodes {
            if !supernode_ids.insert(sn.id.as_str()) {
                return Err(format!("duplicate supernode id {}", sn.id));
            }
            for c in &sn.constellations {
                c.check()?;
                if !constellation_ids.insert(c.id.as_str()) {
                    return Err(format!("duplicate constellation id {}", c.id));
                }
            }
        }
        Ok(())
    }
}
