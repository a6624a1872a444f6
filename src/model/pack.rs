//! Builder packs: externally tuned, versioned parameter blobs.

use serde::{Deserialize, Serialize};

/// Lifecycle of a builder pack as reported by the tuning controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackStatus {
    Active,
    Candidate,
    Retired,
}

/// Builder parameters carried by a pack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PackParams {
    #[serde(rename = "K")]
    pub k: usize,
    pub iterations: usize,
    pub beta: f64,
    pub bins: usize,
    pub tau: f64,
}

/// Halting contract for the refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaltingParams {
    pub threshold: f64,
    #[serde(rename = "Mmax")]
    pub m_max: usize,
    #[serde(rename = "Mmin")]
    pub m_min: usize,
}

/// A versioned pack, consumed read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderPack {
    pub id: String,
    pub status: PackStatus,
    pub generation: u64,
    pub params: PackParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halting: Option<HaltingParams>,
}

impl BuilderPack {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        let p = &self.params;
        if self.id.is_empty() {
            return Err("builder pack id must not be empty".into());
        }
        if p.k == 0 || p.bins == 0 {
            return Err(format!("pack {}: K and bins must be positive", self.id));
        }
        if !(p.beta.is_finite() && p.beta > 0.0) || !(p.tau.is_finite() && p.tau > 0.0) {
            return Err(format!("pack {}: beta and tau must be positive", self.id));
        }
        if let Some(h) = &self.halting {
            if !(0.0..=1.0).contains(&h.threshold) {
                return Err(format!("pack {}: halting threshold outside [0, 1]", self.id));
            }
            if h.m_max == 0 {
                return Err(format!("pack {}: Mmax must be positive", self.id));
            }
        }
        Ok(())
    }
}
