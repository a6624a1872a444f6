//! Calibration: how well a codebook covers a constellation's spectrum.
//!
//! Every codebook entry is projected on the constellation anchor and
//! counted into the nearest spectrum bin center (projections outside the
//! radial range land in the edge bins). The resulting empirical histogram
//! is compared to the stored spectrum with ε-smoothed KL and JS.
//!
//! An empty codebook yields a neutral report: no samples, zero coverage,
//! an all-zero histogram and `empty` set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{centers_of, project_codebook, unit_anchor};
use crate::math;
use crate::model::{Codebook, Constellation};
use crate::storage::ShapeKey;
use crate::{Error, Result};

/// Divergence and coverage of a codebook against one constellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub constellation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<ShapeKey>,
    pub bins: usize,
    /// `KL(target ‖ empirical)` in nats.
    pub kl: f64,
    /// Jensen-Shannon divergence in nats, within `[0, ln 2]`.
    pub js: f64,
    /// Fraction of bins holding at least one codebook entry.
    pub coverage: f64,
    pub target: Vec<f64>,
    pub empirical: Vec<f64>,
    pub samples: usize,
    /// Set when the codebook held no entries.
    #[serde(default)]
    pub empty: bool,
    pub created_at: DateTime<Utc>,
}

impl CalibrationReport {
    /// True when every bin received at least one entry.
    pub fn is_fully_covered(&self) -> bool {
        self.bins > 0 && (self.coverage - 1.0).abs() < f64::EPSILON
    }
}

/// Compare the codebook's projection histogram to `c.spectrum`.
pub fn calibrate(c: &Constellation, codebook: &Codebook, shape: Option<&ShapeKey>) -> Result<CalibrationReport> {
    let u = unit_anchor(c)?;
    let bins = c.bins();
    if bins == 0 {
        return Err(Error::Validation(format!("constellation {} has an empty spectrum", c.id)));
    }

    let centers = centers_of(c);
    let mut counts = vec![0.0f64; bins];
    for proj in project_codebook(&u, codebook)? {
        counts[math::nearest_bin(proj, &centers)] += 1.0;
    }

    let empty = codebook.is_empty();
    let empirical = if empty { counts.clone() } else { math::to_distribution(&counts) };
    let target = math::to_distribution(&c.spectrum.iter().map(|&x| x as f64).collect::<Vec<_>>());
    let kl = math::kl_divergence(&target, &empirical);
    let js = math::js_divergence(&target, &empirical);
    let coverage = counts.iter().filter(|&&n| n > 0.0).count() as f64 / bins as f64;

    debug!(constellation = %c.id, kl, js, coverage, "calibrated");

    Ok(CalibrationReport {
        constellation_id: c.id.clone(),
        shape: shape.cloned(),
        bins,
        kl,
        js,
        coverage,
        target,
        empirical,
        samples: codebook.len(),
        empty,
        created_at: Utc::now(),
    })
}
