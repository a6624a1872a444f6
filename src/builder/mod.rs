//! # Constellation Builder (CHR)
//!
//! Iterative entropy-minimizing clustering over unit vectors.
//!
//! ```text
//! vectors ──L2──► z_i ──k-means++──► U_j
//!                  │
//!                  └─► for round in 0..iterations:
//!                        p_ij = softmax_j(β · z_i·U_j)        (per point)
//!                        U_j  = normalize(Σ_i p_ij z_i)        (per anchor)
//!                        H_g, H_s                              (diagnostics)
//!                  ──► labels, projections, spectra, MHEP
//! ```
//!
//! Each round is a hard synchronization point: every anchor update reads
//! every assignment of the same round. Inside a round, assignment runs per
//! point and reduction per anchor; with the `parallel` feature both go
//! through rayon and are collected in index order, so output is identical
//! either way.
//!
//! Identical input and seed give bit-identical anchors, labels and MHEP.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::math;
use crate::model::{Constellation, PackParams, Packet, Point, SuperNode};
use crate::{Error, Result};

// ============================================================================
// Parameters
// ============================================================================

/// Weight of the range-entropy drop in MHEP.
pub const MHEP_RANGE_WEIGHT: f64 = 0.7;
/// Weight of the slab-entropy drop in MHEP.
pub const MHEP_SLAB_WEIGHT: f64 = 0.3;

/// Builder knobs. `beta` and `tau` are exposed, never hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Target constellation count.
    pub k: usize,
    pub iterations: usize,
    /// Softmax temperature on `z·U`.
    pub beta: f64,
    /// Spectrum / slab histogram bins.
    pub bins: usize,
    /// RBF width of the soft slab histogram.
    pub tau: f64,
    pub seed: u64,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            k: 8,
            iterations: 20,
            beta: 10.0,
            bins: 16,
            tau: 0.1,
            seed: 42,
        }
    }
}

impl BuildParams {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::Validation("K must be at least 1".into()));
        }
        if self.bins == 0 {
            return Err(Error::Validation("bins must be at least 1".into()));
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            return Err(Error::Validation(format!("beta must be positive, got {}", self.beta)));
        }
        if !(self.tau.is_finite() && self.tau > 0.0) {
            return Err(Error::Validation(format!("tau must be positive, got {}", self.tau)));
        }
        Ok(())
    }
}

impl From<PackParams> for BuildParams {
    fn from(p: PackParams) -> Self {
        Self {
            k: p.k,
            iterations: p.iterations,
            beta: p.beta,
            bins: p.bins,
            tau: p.tau,
            ..Self::default()
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// Entropy diagnostics after one round (round 0 = seeded anchors).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundDiagnostics {
    pub round: usize,
    /// Mean per-point assignment entropy (`H_g`).
    pub range_entropy: f64,
    /// Mean soft slab entropy over anchors (`H_s`).
    pub slab_entropy: f64,
    /// Entropy of the mean assignment `-Σ m_j ln m_j`.
    pub usage_entropy: f64,
}

/// Everything a build run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub params: BuildParams,
    pub anchors: Vec<Vec<f32>>,
    /// Arg-max constellation per input vector.
    pub labels: Vec<usize>,
    /// Projection of each input on its labelled anchor.
    pub projections: Vec<f32>,
    /// Winning soft-assignment weight per input.
    pub confidences: Vec<f32>,
    pub spectra: Vec<Vec<f32>>,
    pub radial: Vec<(f32, f32)>,
    pub history: Vec<RoundDiagnostics>,
    /// Maximum Harvestable Energy Potential, `[0, 100]`.
    pub mhep: f64,
    /// Wrapped copies added because `N < K`.
    pub padded: usize,
}

impl BuildReport {
    pub fn final_diagnostics(&self) -> Option<&RoundDiagnostics> {
        self.history.last()
    }

    /// Input indices labelled `j`.
    pub fn members(&self, j: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == j)
            .map(|(i, _)| i)
            .collect()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Runs the CHR optimizer.
#[derive(Debug, Clone)]
pub struct ConstellationBuilder {
    params: BuildParams,
}

impl ConstellationBuilder {
    pub fn new(params: BuildParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &BuildParams {
        &self.params
    }

    pub fn build(&self, vectors: &[Vec<f32>]) -> Result<BuildReport> {
        let p = self.params;
        let z = prepare(vectors)?;
        let n = z.len();

        let mut work = z.clone();
        let padded = p.k.saturating_sub(n);
        if padded > 0 {
            warn!(n, k = p.k, "fewer vectors than constellations, padding by wrapping input");
            for t in 0..padded {
                work.push(z[t % n].clone());
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(p.seed);
        let mut anchors: Vec<Vec<f32>> = math::kmeanspp_seed(&work, p.k, &mut rng)
            .into_iter()
            .map(|i| math::normalize(&work[i]))
            .collect();

        let mut assign = soft_assign(&work, &anchors, p.beta);
        let mut history = Vec::with_capacity(p.iterations + 1);
        history.push(diagnostics(0, &work, &anchors, &assign, p.bins, p.tau));

        for round in 1..=p.iterations {
            anchors = update_anchors(&work, &assign, &anchors);
            assign = soft_assign(&work, &anchors, p.beta);
            let d = diagnostics(round, &work, &anchors, &assign, p.bins, p.tau);
            debug!(round, h_g = d.range_entropy, h_s = d.slab_entropy, "builder round");
            history.push(d);
        }

        // Hard assignment over the original inputs only.
        let mut labels = Vec::with_capacity(n);
        let mut projections = Vec::with_capacity(n);
        let mut confidences = Vec::with_capacity(n);
        for (zi, pi) in z.iter().zip(&assign) {
            let (best, proj) = anchors
                .iter()
                .map(|u| math::dot(zi, u))
                .enumerate()
                .fold((0usize, f64::NEG_INFINITY), |acc, (j, d)| if d > acc.1 { (j, d) } else { acc });
            labels.push(best);
            projections.push(proj as f32);
            confidences.push(pi[best].clamp(0.0, 1.0) as f32);
        }

        let mut spectra = Vec::with_capacity(p.k);
        let mut radial = Vec::with_capacity(p.k);
        for j in 0..p.k {
            let member_proj: Vec<f64> = labels
                .iter()
                .zip(&projections)
                .filter(|(l, _)| **l == j)
                .map(|(_, &x)| x as f64)
                .collect();
            let (spectrum, range) = spectrum_of(&member_proj, p.bins);
            spectra.push(spectrum);
            radial.push(range);
        }

        let last = history.last().copied().unwrap_or(RoundDiagnostics {
            round: 0,
            range_entropy: 0.0,
            slab_entropy: 0.0,
            usage_entropy: 0.0,
        });
        let mhep = mhep(last.range_entropy, last.slab_entropy, p.k, p.bins);
        info!(n, k = p.k, iterations = p.iterations, mhep, "constellation build complete");

        Ok(BuildReport {
            params: p,
            anchors,
            labels,
            projections,
            confidences,
            spectra,
            radial,
            history,
            mhep,
            padded,
        })
    }
}

/// L2-normalize after shape checks.
fn prepare(vectors: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
    let Some(first) = vectors.first() else {
        return Err(Error::Validation("builder needs at least one vector".into()));
    };
    let dim = first.len();
    if dim == 0 {
        return Err(Error::Validation("vectors must have at least one dimension".into()));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dim {
            return Err(Error::Validation(format!(
                "vector {i} has dimension {}, expected {dim}",
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(format!("vector {i} has non-finite components")));
        }
    }
    Ok(vectors.iter().map(|v| math::normalize(v)).collect())
}

// ============================================================================
// Round kernels
// ============================================================================

fn assign_row(zi: &[f32], anchors: &[Vec<f32>], beta: f64) -> Vec<f64> {
    let logits: Vec<f64> = anchors.iter().map(|u| beta * math::dot(zi, u)).collect();
    math::softmax(&logits)
}

fn reduce_anchor(j: usize, z: &[Vec<f32>], assign: &[Vec<f64>], previous: &[f32]) -> Vec<f32> {
    let mut acc = vec![0.0f64; previous.len()];
    for (zi, pi) in z.iter().zip(assign) {
        let w = pi[j];
        for (a, &x) in acc.iter_mut().zip(zi) {
            *a += w * x as f64;
        }
    }
    let next = math::normalize_f64(&acc);
    if next.iter().all(|x| *x == 0.0) {
        previous.to_vec()
    } else {
        next
    }
}

#[cfg(feature = "parallel")]
fn soft_assign(z: &[Vec<f32>], anchors: &[Vec<f32>], beta: f64) -> Vec<Vec<f64>> {
    z.par_iter().map(|zi| assign_row(zi, anchors, beta)).collect()
}

#[cfg(not(feature = "parallel"))]
fn soft_assign(z: &[Vec<f32>], anchors: &[Vec<f32>], beta: f64) -> Vec<Vec<f64>> {
    z.iter().map(|zi| assign_row(zi, anchors, beta)).collect()
}

#[cfg(feature = "parallel")]
fn update_anchors(z: &[Vec<f32>], assign: &[Vec<f64>], anchors: &[Vec<f32>]) -> Vec<Vec<f32>> {
    (0..anchors.len())
        .into_par_iter()
        .map(|j| reduce_anchor(j, z, assign, &anchors[j]))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn update_anchors(z: &[Vec<f32>], assign: &[Vec<f64>], anchors: &[Vec<f32>]) -> Vec<Vec<f32>> {
    (0..anchors.len())
        .map(|j| reduce_anchor(j, z, assign, &anchors[j]))
        .collect()
}

// ============================================================================
// Diagnostics
// ============================================================================

fn diagnostics(
    round: usize,
    z: &[Vec<f32>],
    anchors: &[Vec<f32>],
    assign: &[Vec<f64>],
    bins: usize,
    tau: f64,
) -> RoundDiagnostics {
    let n = z.len().max(1) as f64;
    let k = anchors.len();

    let range_entropy = assign.iter().map(|p| math::entropy(p)).sum::<f64>() / n;

    let mut usage = vec![0.0f64; k];
    for p in assign {
        for (m, w) in usage.iter_mut().zip(p) {
            *m += w / n;
        }
    }
    let usage_entropy = math::entropy(&usage);

    let centers = math::bin_centers(-1.0, 1.0, bins);
    let mut slab_total = 0.0;
    for (j, u) in anchors.iter().enumerate() {
        let mut hist = vec![0.0f64; bins];
        for (zi, pi) in z.iter().zip(assign) {
            let x = math::dot(zi, u);
            let row = rbf_row(x, &centers, tau);
            for (h, r) in hist.iter_mut().zip(&row) {
                *h += pi[j] * r;
            }
        }
        slab_total += math::entropy(&math::to_distribution(&hist));
    }
    let slab_entropy = slab_total / k.max(1) as f64;

    RoundDiagnostics { round, range_entropy, slab_entropy, usage_entropy }
}

/// RBF weights of `x` against every center, normalized to 1.
fn rbf_row(x: f64, centers: &[f64], tau: f64) -> Vec<f64> {
    let denom = 2.0 * tau * tau;
    let raw: Vec<f64> = centers.iter().map(|c| (-(x - c).powi(2) / denom).exp()).collect();
    let total: f64 = raw.iter().sum();
    if total > 0.0 && total.is_finite() {
        raw.into_iter().map(|r| r / total).collect()
    } else {
        let mut hard = vec![0.0; centers.len()];
        hard[math::nearest_bin(x, centers)] = 1.0;
        hard
    }
}

fn normalized_drop(h: f64, h_max: f64) -> f64 {
    if h_max <= 0.0 {
        return 0.0;
    }
    (h_max - h) / h_max
}

/// `100 · clip(0.7·drop(H_g) + 0.3·drop(H_s), 0, 1)`.
pub fn mhep(range_entropy: f64, slab_entropy: f64, k: usize, bins: usize) -> f64 {
    let drop_g = normalized_drop(range_entropy, (k as f64).ln());
    let drop_s = normalized_drop(slab_entropy, (bins as f64).ln());
    100.0 * (MHEP_RANGE_WEIGHT * drop_g + MHEP_SLAB_WEIGHT * drop_s).clamp(0.0, 1.0)
}

/// Normalized histogram of member projections and their `(min, max)`.
fn spectrum_of(proj: &[f64], bins: usize) -> (Vec<f32>, (f32, f32)) {
    if proj.is_empty() {
        return (vec![1.0 / bins as f32; bins], (0.0, 0.0));
    }
    let lo = proj.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = proj.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut counts = vec![0usize; bins];
    for &x in proj {
        counts[math::bin_index(x, lo, hi, bins)] += 1;
    }
    let total = proj.len() as f32;
    (
        counts.into_iter().map(|c| c as f32 / total).collect(),
        (lo as f32, hi as f32),
    )
}

// ============================================================================
// Packet assembly
// ============================================================================

/// One embedded content unit handed to the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildItem {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

impl BuildItem {
    pub fn new(id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self { id: id.into(), embedding, text: None, source_ref: None }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }
}

/// Build and wrap the result in a single-supernode packet.
pub fn build_packet(
    params: BuildParams,
    items: &[BuildItem],
    namespace: &str,
    modality: &str,
) -> Result<(Packet, BuildReport)> {
    let vectors: Vec<Vec<f32>> = items.iter().map(|it| it.embedding.clone()).collect();
    let report = ConstellationBuilder::new(params)?.build(&vectors)?;
    let packet = assemble_packet(&report, items, namespace, modality)?;
    Ok((packet, report))
}

/// Constellations `c0..c{K-1}` with points taken from `items` in order.
pub fn assemble_packet(
    report: &BuildReport,
    items: &[BuildItem],
    namespace: &str,
    modality: &str,
) -> Result<Packet> {
    if items.len() != report.labels.len() {
        return Err(Error::Validation(format!(
            "{} items for a report over {} vectors",
            items.len(),
            report.labels.len()
        )));
    }
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    for it in items {
        if it.id.is_empty() || !seen.insert(it.id.as_str()) {
            return Err(Error::Validation(format!("item id {:?} is empty or repeated", it.id)));
        }
    }

    let mut constellations = Vec::with_capacity(report.anchors.len());
    for (j, anchor) in report.anchors.iter().enumerate() {
        let members = report.members(j);
        let points: Vec<Point> = members
            .iter()
            .map(|&i| {
                let it = &items[i];
                let mut p = Point::new(it.id.clone(), report.projections[i], report.confidences[i]);
                p.text = it.text.clone();
                p.source_ref = it.source_ref.clone();
                p
            })
            .collect();

        let summary = members
            .iter()
            .copied()
            .filter(|&i| items[i].text.is_some())
            .fold(None::<usize>, |best, i| match best {
                Some(b) if report.projections[b] >= report.projections[i] => Some(b),
                _ => Some(i),
            })
            .and_then(|i| items[i].text.clone());

        let mut c = Constellation::new(format!("c{j}"), anchor.clone(), report.radial[j], report.spectra[j].clone())
            .with_points(points);
        c.summary = summary;
        constellations.push(c);
    }

    Ok(Packet::new(namespace, modality)
        .with_meta("mhep", report.mhep)
        .with_supernode(SuperNode::new("sn0", constellations)))
}

// ============================================================================
// Tests
// ============================================================================
