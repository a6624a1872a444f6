//! # Decoder
//!
//! Projection-based reconstruction of ranked content from a constellation
//! and a codebook, plus constellation mixing.
//!
//! ```text
//! anchor ──normalize──► u
//! entry  ──normalize──► e      proj = u·e
//! radial_minmax ──► bins mid-point centers ──► nearest center b
//! weight = spectrum[b]  ──► sort (weight ↓, |proj| ↓, codebook order)
//! ```
//!
//! Decoding needs a plain anchor. Sealed constellations must be opened
//! with [`crate::crypto::open_constellation`] first.

pub mod calibration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::math;
use crate::model::{Codebook, Constellation};
use crate::storage::ShapeKey;
use crate::{Error, Result};

pub use calibration::{calibrate, CalibrationReport};

// ============================================================================
// Candidates
// ============================================================================

/// Where a decoded candidate came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<ShapeKey>,
    pub constellation_id: String,
    pub entry_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

/// One ranked decode result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    pub proj: f32,
    pub weight: f32,
    pub bin: usize,
    pub source: Provenance,
}

// ============================================================================
// Anchor access
// ============================================================================

/// Unit anchor of a plain constellation.
pub fn unit_anchor(c: &Constellation) -> Result<Vec<f32>> {
    let Some(anchor) = &c.anchor else {
        return Err(if c.is_encrypted() {
            Error::Crypto(format!("constellation {} anchor is sealed", c.id))
        } else {
            Error::Validation(format!("constellation {} has no anchor", c.id))
        });
    };
    let u = math::normalize(anchor);
    if u.iter().all(|x| *x == 0.0) {
        return Err(Error::Validation(format!("constellation {} anchor is the zero vector", c.id)));
    }
    Ok(u)
}

/// Projections of every codebook entry on `u`, in codebook order.
pub(crate) fn project_codebook(u: &[f32], codebook: &Codebook) -> Result<Vec<f64>> {
    codebook
        .iter()
        .map(|entry| {
            if entry.embedding.len() != u.len() {
                return Err(Error::Validation(format!(
                    "codebook entry {} has dimension {}, anchor has {}",
                    entry.id,
                    entry.embedding.len(),
                    u.len()
                )));
            }
            Ok(math::dot(u, &math::normalize(&entry.embedding)))
        })
        .collect()
}

/// Spectrum bin centers over the constellation's radial range.
pub(crate) fn centers_of(c: &Constellation) -> Vec<f64> {
    let (lo, hi) = c.radial_minmax;
    math::bin_centers(lo as f64, hi as f64, c.bins())
}

// ============================================================================
// Decode
// ============================================================================

/// Rank `codebook` against `c` and keep the top `per_constellation`.
///
/// An empty codebook yields an empty ranking, not an error.
pub fn decode(
    c: &Constellation,
    codebook: &Codebook,
    per_constellation: usize,
    shape: Option<&ShapeKey>,
) -> Result<Vec<Candidate>> {
    let u = unit_anchor(c)?;
    if c.spectrum.is_empty() {
        return Err(Error::Validation(format!("constellation {} has an empty spectrum", c.id)));
    }
    if codebook.is_empty() || per_constellation == 0 {
        return Ok(Vec::new());
    }

    let projections = project_codebook(&u, codebook)?;
    let centers = centers_of(c);

    let mut ranked: Vec<Candidate> = codebook
        .iter()
        .zip(&projections)
        .map(|(entry, &proj)| {
            let bin = math::nearest_bin(proj, &centers);
            Candidate {
                text: entry.text.clone(),
                proj: proj as f32,
                weight: c.spectrum[bin],
                bin,
                source: Provenance {
                    shape: shape.cloned(),
                    constellation_id: c.id.clone(),
                    entry_id: entry.id.clone(),
                    source_ref: entry.source_ref.clone(),
                },
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| b.proj.abs().total_cmp(&a.proj.abs()))
    });
    ranked.truncate(per_constellation);

    debug!(constellation = %c.id, entries = codebook.len(), kept = ranked.len(), "decoded constellation");
    Ok(ranked)
}

// ============================================================================
// Mixing
// ============================================================================

/// Interpolate two constellations.
///
/// Coefficients are normalized to sum 1. The anchor is the normalized
/// weighted sum of both unit anchors; `radial_minmax` and the spectrum are
/// blended linearly, the spectrum renormalized. The result has no points.
pub fn mix(a: &Constellation, b: &Constellation, alpha: f64, beta: f64) -> Result<Constellation> {
    if !(alpha.is_finite() && beta.is_finite()) || alpha < 0.0 || beta < 0.0 || alpha + beta <= 0.0 {
        return Err(Error::Validation(format!(
            "blend coefficients must be non-negative with a positive sum, got ({alpha}, {beta})"
        )));
    }
    let ua = unit_anchor(a)?;
    let ub = unit_anchor(b)?;
    if ua.len() != ub.len() {
        return Err(Error::Validation(format!(
            "cannot mix anchors of dimension {} and {}",
            ua.len(),
            ub.len()
        )));
    }
    if a.bins() != b.bins() {
        return Err(Error::Validation(format!(
            "cannot mix spectra of {} and {} bins",
            a.bins(),
            b.bins()
        )));
    }

    let wa = alpha / (alpha + beta);
    let wb = beta / (alpha + beta);

    let blended: Vec<f64> = ua
        .iter()
        .zip(&ub)
        .map(|(&x, &y)| wa * x as f64 + wb * y as f64)
        .collect();
    let anchor = math::normalize_f64(&blended);
    if anchor.iter().all(|x| *x == 0.0) {
        return Err(Error::Validation(format!(
            "anchors of {} and {} cancel out at this blend",
            a.id, b.id
        )));
    }

    let lerp = |x: f32, y: f32| (wa * x as f64 + wb * y as f64) as f32;
    let radial = (
        lerp(a.radial_minmax.0, b.radial_minmax.0),
        lerp(a.radial_minmax.1, b.radial_minmax.1),
    );

    let raw: Vec<f64> = a
        .spectrum
        .iter()
        .zip(&b.spectrum)
        .map(|(&x, &y)| wa * x as f64 + wb * y as f64)
        .collect();
    let spectrum: Vec<f32> = match math::to_distribution(&raw) {
        d if d.iter().any(|x| *x > 0.0) => d.into_iter().map(|x| x as f32).collect(),
        _ => vec![1.0 / a.bins() as f32; a.bins()],
    };

    Ok(Constellation::new(format!("mix({},{})", a.id, b.id), anchor, radial, spectrum))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CodebookEntry, EncryptedAnchor};

    fn unit_at(x: f32) -> Vec<f32> {
        vec![x, (1.0 - x * x).max(0.0).sqrt()]
    }

    fn constellation() -> Constellation {
        Constellation::new("c0", vec![1.0, 0.0], (0.0, 1.0), vec![0.1, 0.2, 0.3, 0.4])
    }

    #[test]
    fn test_decode_ranks_by_spectrum_weight() {
        let codebook = Codebook::new(vec![
            CodebookEntry::new("low", "low", unit_at(0.1)),
            CodebookEntry::new("high", "high", unit_at(0.9)),
            CodebookEntry::new("mid", "mid", unit_at(0.6)),
        ]);
        let out = decode(&constellation(), &codebook, 3, None).unwrap();
        let order: Vec<&str> = out.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
        assert_eq!(out[0].bin, 3);
        assert!((out[0].weight - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_ties_break_on_projection_magnitude() {
        let codebook = Codebook::new(vec![
            CodebookEntry::new("a", "a", unit_at(0.76)),
            CodebookEntry::new("b", "b", unit_at(0.99)),
        ]);
        let out = decode(&constellation(), &codebook, 2, None).unwrap();
        assert_eq!(out[0].source.entry_id, "b");
    }

    #[test]
    fn test_decode_truncates_and_handles_empty() {
        let codebook = Codebook::new((0..10).map(|i| {
            CodebookEntry::new(format!("e{i}"), "t", unit_at(i as f32 / 10.0))
        }).collect());
        assert_eq!(decode(&constellation(), &codebook, 3, None).unwrap().len(), 3);
        assert!(decode(&constellation(), &Codebook::default(), 3, None).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_dimension_mismatch() {
        let codebook = Codebook::new(vec![CodebookEntry::new("x", "x", vec![1.0, 0.0, 0.0])]);
        assert!(matches!(
            decode(&constellation(), &codebook, 1, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_sealed_anchor_is_crypto_error() {
        let mut c = constellation();
        c.anchor = None;
        c.anchor_enc = Some(EncryptedAnchor { iv: "a".into(), salt: "b".into(), ciphertext: "c".into() });
        let codebook = Codebook::new(vec![CodebookEntry::new("x", "x", unit_at(0.5))]);
        assert!(matches!(decode(&c, &codebook, 1, None), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_mix_midpoint() {
        let a = Constellation::new("a", vec![1.0, 0.0], (0.0, 0.4), vec![1.0, 0.0]);
        let b = Constellation::new("b", vec![0.0, 1.0], (0.2, 1.0), vec![0.0, 1.0]);
        let m = mix(&a, &b, 1.0, 1.0).unwrap();
        let anchor = m.anchor.unwrap();
        assert!((anchor[0] - anchor[1]).abs() < 1e-6);
        assert!((m.radial_minmax.0 - 0.1).abs() < 1e-6);
        assert!((m.radial_minmax.1 - 0.7).abs() < 1e-6);
        assert!((m.spectrum[0] - 0.5).abs() < 1e-6);
        assert_eq!(m.id, "mix(a,b)");
    }

    #[test]
    fn test_mix_extremes_reproduce_inputs() {
        let a = Constellation::new("a", vec![1.0, 0.0], (0.0, 0.4), vec![0.25, 0.75]);
        let b = Constellation::new("b", vec![0.0, 1.0], (0.2, 1.0), vec![0.5, 0.5]);
        let m = mix(&a, &b, 1.0, 0.0).unwrap();
        assert_eq!(m.anchor.unwrap(), vec![1.0, 0.0]);
        assert_eq!(m.spectrum, a.spectrum);
    }

    #[test]
    fn test_mix_validation() {
        let a = Constellation::new("a", vec![1.0, 0.0], (0.0, 1.0), vec![1.0]);
        let b = Constellation::new("b", vec![-1.0, 0.0], (0.0, 1.0), vec![1.0]);
        let c = Constellation::new("c", vec![0.0, 1.0], (0.0, 1.0), vec![0.5, 0.5]);
        assert!(mix(&a, &b, -1.0, 1.0).is_err());
        assert!(mix(&a, &b, 0.0, 0.0).is_err());
        assert!(mix(&a, &b, 1.0, 1.0).is_err());
        assert!(mix(&a, &c, 1.0, 1.0).is_err());
    }
}
