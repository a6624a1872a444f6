//! # Vector Math Kernel
//!
//! Pure functions over dense `f32` vectors. No state, no allocation beyond
//! the returned values.
//!
//! Vectors are stored as `f32` (wire precision); every reduction
//! accumulates in `f64` so results do not depend on summation width.
//!
//! | Function | Used by |
//! |----------|---------|
//! | [`normalize`], [`dot`] | builder, decoder, mixing |
//! | [`softmax`], [`entropy`] | builder diagnostics |
//! | [`kmeanspp_seed`] | builder seeding |
//! | [`kl_divergence`], [`js_divergence`] | calibration |
//! | [`bin_index`], [`bin_centers`], [`nearest_bin`] | spectra |

use rand::Rng;

// ============================================================================
// Constants
// ============================================================================

/// Norm below which a vector is treated as the zero vector.
pub const NORM_EPS: f64 = 1e-12;

/// Floor under which k-means++ seeding weights are considered degenerate.
pub const SEED_FLOOR: f64 = 1e-12;

/// Smoothing mass added to every bin before divergences.
pub const DIVERGENCE_EPS: f64 = 1e-9;

// ============================================================================
// Norms and products
// ============================================================================

/// Euclidean norm.
#[inline]
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Unit vector in the direction of `v`. The zero vector maps to itself.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = l2_norm(v);
    if n < NORM_EPS {
        return vec![0.0; v.len()];
    }
    v.iter().map(|&x| ((x as f64) / n) as f32).collect()
}

/// Normalize from an `f64` accumulator.
pub fn normalize_f64(v: &[f64]) -> Vec<f32> {
    let n = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if n < NORM_EPS {
        return vec![0.0; v.len()];
    }
    v.iter().map(|&x| (x / n) as f32).collect()
}

/// Inner product. Callers guarantee equal length.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| (x as f64) * (y as f64)).sum()
}

/// `1 - cos` for unit vectors, clamped to `[0, 2]`.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    (1.0 - dot(a, b)).clamp(0.0, 2.0)
}

// ============================================================================
// Distributions
// ============================================================================

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Shannon entropy in nats. Zero-mass entries contribute nothing.
pub fn entropy(p: &[f64]) -> f64 {
    -p.iter().filter(|&&x| x > 0.0).map(|&x| x * x.ln()).sum::<f64>()
}

/// Normalize non-negative weights to a distribution. All-zero stays zero.
pub fn to_distribution(w: &[f64]) -> Vec<f64> {
    let total: f64 = w.iter().sum();
    if total <= 0.0 {
        return vec![0.0; w.len()];
    }
    w.iter().map(|x| x / total).collect()
}

fn smoothed(p: &[f64]) -> Vec<f64> {
    let total: f64 = p.iter().map(|x| x.max(0.0) + DIVERGENCE_EPS).sum();
    p.iter().map(|x| (x.max(0.0) + DIVERGENCE_EPS) / total).collect()
}

/// `KL(p ‖ q)` in nats after ε-smoothing both sides. Always finite, ≥ 0.
pub fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    debug_assert_eq!(p.len(), q.len());
    let p = smoothed(p);
    let q = smoothed(q);
    let kl: f64 = p.iter().zip(&q).map(|(a, b)| a * (a / b).ln()).sum();
    kl.max(0.0)
}

/// Jensen-Shannon divergence in nats. Bounded by `ln 2`.
pub fn js_divergence(p: &[f64], q: &[f64]) -> f64 {
    debug_assert_eq!(p.len(), q.len());
    let p = smoothed(p);
    let q = smoothed(q);
    let m: Vec<f64> = p.iter().zip(&q).map(|(a, b)| 0.5 * (a + b)).collect();
    let half = |x: &[f64]| -> f64 { x.iter().zip(&m).map(|(a, b)| a * (a / b).ln()).sum() };
    (0.5 * half(&p) + 0.5 * half(&q)).clamp(0.0, std::f64::consts::LN_2)
}

// ============================================================================
// Binning
// ============================================================================

/// Equal-width bucket of `x` over `[lo, hi]`. Degenerate ranges map to 0.
pub fn bin_index(x: f64, lo: f64, hi: f64, bins: usize) -> usize {
    if bins == 0 {
        return 0;
    }
    let width = hi - lo;
    if width <= 0.0 || !x.is_finite() {
        return 0;
    }
    let idx = ((x - lo) / width * bins as f64).floor();
    if idx <= 0.0 {
        0
    } else {
        (idx as usize).min(bins - 1)
    }
}

/// Mid-points of `bins` equal-width buckets over `[lo, hi]`.
pub fn bin_centers(lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    let width = (hi - lo) / bins.max(1) as f64;
    (0..bins).map(|b| lo + (b as f64 + 0.5) * width).collect()
}

/// Index of the closest center. Ties resolve to the lower index.
pub fn nearest_bin(x: f64, centers: &[f64]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = (x - c).abs();
        if d < best_d {
            best = i;
            best_d = d;
        }
    }
    best
}

// ============================================================================
// k-means++ seeding
// ============================================================================

/// Pick `k` seed indices over unit vectors with cosine distance.
///
/// The first index is uniform; each next one is drawn with probability
/// proportional to the squared cosine distance to its nearest chosen seed,
/// floored at [`SEED_FLOOR`] per point. When every distance is degenerate
/// the draw is uniform.
pub fn kmeanspp_seed<R: Rng>(points: &[Vec<f32>], k: usize, rng: &mut R) -> Vec<usize> {
    let n = points.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }

    let mut seeds = Vec::with_capacity(k);
    seeds.push(rng.gen_range(0..n));
    let mut nearest: Vec<f64> = points
        .iter()
        .map(|p| cosine_distance(p, &points[seeds[0]]))
        .collect();

    while seeds.len() < k {
        let degenerate = nearest.iter().all(|d| d * d < SEED_FLOOR);
        let weights: Vec<f64> = nearest.iter().map(|d| (d * d).max(SEED_FLOOR)).collect();
        let total: f64 = weights.iter().sum();

        let pick = if degenerate {
            rng.gen_range(0..n)
        } else {
            let target = rng.gen_range(0.0..total);
            let mut acc = 0.0;
            let mut chosen = n - 1;
            for (i, w) in weights.iter().enumerate() {
                acc += w;
                if target < acc {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        seeds.push(pick);
        for (i, p) in points.iter().enumerate() {
            let d = cosine_distance(p, &points[pick]);
            if d < nearest[i] {
                nearest[i] = d;
            }
        }
    }

    seeds
}

// ============================================================================
// Tests
// ============================================================================
