//! In-memory shape store.
//!
//! This is the reference implementation of `ShapeStore`: an arena of
//! packets keyed by content hash plus a secondary point index, both behind
//! ONE `RwLock` so every insert/evict lands atomically.
//!
//! ## Eviction
//!
//! Least-recently-inserted. Once `len() > capacity` the oldest insert is
//! dropped together with its point index entries, in the same critical
//! section as the insert that caused it. Re-inserting identical content is
//! a no-op and does not refresh its position.
//!
//! ## Point id collisions
//!
//! The point index maps a point id to its latest location. When the shape
//! behind an entry is dropped, the id moves to the newest surviving shape
//! that still holds it, or leaves the index.

use std::collections::VecDeque;
use std::sync::Arc;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::model::Packet;
use crate::Result;
use super::{InsertOutcome, PointLocation, ShapeKey, ShapeStore};

/// Capacity used by `MemoryShapeStore::new()`.
pub const DEFAULT_CAPACITY: usize = 1024;

// ============================================================================
// MemoryShapeStore
// ============================================================================

/// Bounded in-process packet arena with a point index.
#[derive(Clone)]
pub struct MemoryShapeStore {
    inner: Arc<RwLock<Arena>>,
    capacity: usize,
}

#[derive(Default)]
struct Arena {
    shapes: HashMap<ShapeKey, Arc<Packet>>,
    /// Insertion order, oldest first.
    order: VecDeque<ShapeKey>,
    /// point id → location
    point_index: HashMap<String, PointLocation>,
}

impl Arena {
    fn index(&mut self, key: &ShapeKey, packet: &Packet) {
        for (s, sn) in packet.supernodes.iter().enumerate() {
            for (c, con) in sn.constellations.iter().enumerate() {
                for (p, point) in con.points.iter().enumerate() {
                    self.point_index.insert(
                        point.id.clone(),
                        PointLocation {
                            shape: key.clone(),
                            supernode: s,
                            constellation: c,
                            point: p,
                        },
                    );
                }
            }
        }
    }

    /// Newest stored location of `point_id`.
    fn find_point(&self, point_id: &str) -> Option<PointLocation> {
        self.order.iter().rev().find_map(|key| {
            let packet = self.shapes.get(key)?;
            packet.supernodes.iter().enumerate().find_map(|(s, sn)| {
                sn.constellations.iter().enumerate().find_map(|(c, con)| {
                    con.points.iter().position(|p| p.id == point_id).map(|p| PointLocation {
                        shape: key.clone(),
                        supernode: s,
                        constellation: c,
                        point: p,
                    })
                })
            })
        })
    }

    /// Call after `key` has left `shapes` and `order`.
    fn unindex(&mut self, key: &ShapeKey, packet: &Packet) {
        for point in packet.constellations().flat_map(|c| c.points.iter()) {
            if !self.point_index.get(&point.id).is_some_and(|loc| &loc.shape == key) {
                continue;
            }
            match self.find_point(&point.id) {
                Some(loc) => {
                    self.point_index.insert(point.id.clone(), loc);
                }
                None => {
                    self.point_index.remove(&point.id);
                }
            }
        }
    }

    fn drop_shape(&mut self, key: &ShapeKey) -> bool {
        let Some(packet) = self.shapes.remove(key) else {
            return false;
        };
        self.order.retain(|k| k != key);
        self.unindex(key, &packet);
        true
    }
}

impl MemoryShapeStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A store holding at most `capacity` shapes (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arena::default())),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryShapeStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ShapeStore impl
// ============================================================================

impl ShapeStore for MemoryShapeStore {
    fn insert(&self, key: ShapeKey, packet: Packet) -> Result<InsertOutcome> {
        let mut arena = self.inner.write();

        if arena.shapes.contains_key(&key) {
            debug!(shape = %key, "identical shape already stored");
            return Ok(InsertOutcome { key, inserted: false, evicted: Vec::new() });
        }

        arena.index(&key, &packet);
        arena.shapes.insert(key.clone(), Arc::new(packet));
        arena.order.push_back(key.clone());

        let mut evicted = Vec::new();
        while arena.shapes.len() > self.capacity {
            let Some(oldest) = arena.order.front().cloned() else {
                break;
            };
            arena.drop_shape(&oldest);
            warn!(shape = %oldest, capacity = self.capacity, "evicted shape");
            evicted.push(oldest);
        }

        Ok(InsertOutcome { key, inserted: true, evicted })
    }

    fn get(&self, key: &ShapeKey) -> Result<Option<Arc<Packet>>> {
        Ok(self.inner.read().shapes.get(key).cloned())
    }

    fn remove(&self, key: &ShapeKey) -> Result<bool> {
        Ok(self.inner.write().drop_shape(key))
    }

    fn locate_point(&self, point_id: &str) -> Result<Option<PointLocation>> {
        Ok(self.inner.read().point_index.get(point_id).cloned())
    }

    fn len(&self) -> usize {
        self.inner.read().shapes.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn keys(&self) -> Vec<ShapeKey> {
        self.inner.read().order.iter().cloned().collect()
    }

    fn point_count(&self) -> usize {
        self.inner.read().point_index.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
