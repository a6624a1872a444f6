//! # Shape Store Trait
//!
//! This is THE contract between the engine and any packet store.
//! Keys are content hashes of canonical packet bytes, so storage is
//! content-addressed and re-submitting identical content is idempotent.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryShapeStore` | `memory` | Bounded in-process arena + point index |
//!
//! Durable storage and replication are collaborators outside this crate;
//! they implement this trait.

pub mod memory;

use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::model::{Constellation, Packet, Point};
use crate::Result;

pub use memory::MemoryShapeStore;

// ============================================================================
// Keys and locations
// ============================================================================

/// Content hash of a packet (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeKey(pub String);

impl ShapeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShapeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShapeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where a point lives: shape key plus its path inside the packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointLocation {
    pub shape: ShapeKey,
    pub supernode: usize,
    pub constellation: usize,
    pub point: usize,
}

/// Result of an insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub key: ShapeKey,
    /// `false` when identical content was already stored.
    pub inserted: bool,
    /// Shapes evicted to make room, oldest first.
    pub evicted: Vec<ShapeKey>,
}

// ============================================================================
// ShapeStore trait
// ============================================================================

/// Bounded, content-addressed packet store with a point-level index.
///
/// Many concurrent readers, occasional exclusive writers. Every mutation
/// updates the packet map and the point index together; a reader never
/// sees one without the other.
pub trait ShapeStore: Send + Sync + 'static {
    /// Store `packet` under `key`, evicting as capacity requires.
    fn insert(&self, key: ShapeKey, packet: Packet) -> Result<InsertOutcome>;

    /// Fetch a stored packet.
    fn get(&self, key: &ShapeKey) -> Result<Option<Arc<Packet>>>;

    /// Remove a shape and all its index entries. Returns true if it existed.
    fn remove(&self, key: &ShapeKey) -> Result<bool>;

    /// O(1) point lookup through the secondary index.
    fn locate_point(&self, point_id: &str) -> Result<Option<PointLocation>>;

    /// Number of stored shapes.
    fn len(&self) -> usize;

    /// Maximum number of shapes held before eviction.
    fn capacity(&self) -> usize;

    /// Stored keys, oldest insert first.
    fn keys(&self) -> Vec<ShapeKey>;

    /// Number of indexed points.
    fn point_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, key: &ShapeKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Resolve a point to its location and value.
    ///
    /// Default: index lookup followed by a packet read.
    fn get_point(&self, point_id: &str) -> Result<Option<(PointLocation, Point)>> {
        let Some(loc) = self.locate_point(point_id)? else {
            return Ok(None);
        };
        let Some(packet) = self.get(&loc.shape)? else {
            return Ok(None);
        };
        let point = packet
            .supernodes
            .get(loc.supernode)
            .and_then(|s| s.constellations.get(loc.constellation))
            .and_then(|c| c.points.get(loc.point))
            .cloned();
        Ok(point.map(|p| (loc, p)))
    }

    /// A constellation of a stored shape, in its at-rest form.
    fn constellation(&self, key: &ShapeKey, constellation_id: &str) -> Result<Option<Constellation>> {
        Ok(self
            .get(key)?
            .and_then(|p| p.constellation(constellation_id).cloned()))
    }
}
