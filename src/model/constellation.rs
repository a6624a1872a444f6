//! Constellations and the SuperNode grouping container.

use serde::{Deserialize, Serialize};
use super::{EncryptedAnchor, Point};

/// Tolerance on `Σ spectrum ≈ 1` for packets produced outside this crate.
pub(crate) const SPECTRUM_SUM_TOLERANCE: f32 = 1e-2;

/// Geometric summary of one cluster: anchor direction, radial range and
/// the radial spectrum of its members.
///
/// At rest exactly one of `anchor` / `anchor_enc` is present. Decryption
/// fills `anchor` on a working copy and clears `anchor_enc` there only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constellation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_enc: Option<EncryptedAnchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// `(min, max)` of member projections, `min <= max`.
    pub radial_minmax: (f32, f32),
    /// Normalized histogram over `spectrum.len()` equal-width bins.
    pub spectrum: Vec<f32>,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Constellation {
    pub fn new(
        id: impl Into<String>,
        anchor: Vec<f32>,
        radial_minmax: (f32, f32),
        spectrum: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            anchor: Some(anchor),
            anchor_enc: None,
            summary: None,
            radial_minmax,
            spectrum,
            points: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }

    /// Number of spectrum bins.
    pub fn bins(&self) -> usize {
        self.spectrum.len()
    }

    pub fn is_encrypted(&self) -> bool {
        self.anchor_enc.is_some()
    }

    pub fn point(&self, id: &str) -> Option<&Point> {
        self.points.iter().find(|p| p.id == id)
    }

    /// Structural checks shared by ingest validation.
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        if self.id.is_empty() {
            return Err("constellation id must not be empty".into());
        }
        match (&self.anchor, &self.anchor_enc) {
            (Some(_), Some(_)) => {
                return Err(format!("constellation {} carries both anchor and anchor_enc", self.id));
            }
            (None, None) => {
                return Err(format!("constellation {} carries no anchor", self.id));
            }
            (Some(anchor), None) => {
                if anchor.is_empty() || anchor.iter().any(|x| !x.is_finite()) {
                    return Err(format!("constellation {} anchor is empty or non-finite", self.id));
                }
                if anchor.iter().all(|x| *x == 0.0) {
                    return Err(format!("constellation {} anchor is the zero vector", self.id));
                }
            }
            (None, Some(_)) => {}
        }

        let (lo, hi) = self.radial_minmax;
        if !lo.is_finite() || !hi.is_finite() || lo > hi {
            return Err(format!("constellation {} radial_minmax ({lo}, {hi}) is invalid", self.id));
        }

        if self.spectrum.is_empty() {
            return Err(format!("constellation {} has an empty spectrum", self.id));
        }
        if self.spectrum.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(format!("constellation {} spectrum has negative or non-finite weights", self.id));
        }
        let total: f32 = self.spectrum.iter().sum();
        if (total - 1.0).abs() > SPECTRUM_SUM_TOLERANCE {
            return Err(format!("constellation {} spectrum sums to {total}, expected ~1", self.id));
        }

        let mut seen = std::collections::HashSet::with_capacity(self.points.len());
        for p in &self.points {
            p.check()?;
            if !seen.insert(p.id.as_str()) {
                return Err(format!("constellation {} repeats point id {}", self.id, p.id));
            }
        }
        Ok(())
    }
}

/// Grouping container for constellations. Ids are unique within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperNode {
    pub id: String,
    #[serde(default)]
    pub constellations: Vec<Constellation>,
}

impl SuperNode {
    pub fn new(id: impl Into<String>, constellations: Vec<Constellation>) -> Self {
        Self { id: id.into(), constellations }
    }

    pub fn constellation(&self, id: &str) -> Option<&Constellation> {
        self.constellations.iter().find(|c| c.id == id)
    }
}
