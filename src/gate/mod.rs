//! # Quality Gate
//!
//! Stateless scorer over one decode call's candidate set.
//!
//! ```text
//! text ─► Features ─► Reranker (logistic) ─► model_score ─┐
//!      └► RuleSet ─► flagged terms, hint ─► rule_score ───┴─► combined
//!                                                0.65·model + 0.35·rule
//! ```
//!
//! Below the threshold a candidate receives up to `max_edits` bounded
//! edits (see [`rules::EditKind`]), rescored after each one. The best
//! final candidate is selected; telemetry reports the decision.
//!
//! A failing [`Reranker`] never fails the call: scoring falls back to the
//! rule score alone and the telemetry carries a `degraded` reason.

pub mod features;
pub mod rules;

use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decoder::Candidate;
use crate::{Error, Result};

pub use features::Features;
pub use rules::{Critique, EditKind, FormatFlag, RuleSet};

pub const MODEL_WEIGHT: f64 = 0.65;
pub const RULE_WEIGHT: f64 = 0.35;

pub const DEFAULT_BANNED_PATTERN: &str = r"(?i)\b(TODO|FIXME|TBD|XXX|lorem ipsum)\b";
pub const DEFAULT_CLARIFIER: &str = "This point is grounded in the surrounding source material.";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub enabled: bool,
    pub accept_threshold: f64,
    pub max_edits: usize,
    pub min_tokens: usize,
    pub min_avg_sentence_tokens: f64,
    pub banned_pattern: String,
    pub clarifier: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            accept_threshold: 0.6,
            max_edits: 2,
            min_tokens: 4,
            min_avg_sentence_tokens: 3.0,
            banned_pattern: DEFAULT_BANNED_PATTERN.to_string(),
            clarifier: DEFAULT_CLARIFIER.to_string(),
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.accept_threshold) {
            return Err(Error::Validation(format!(
                "gate.accept_threshold must be in [0, 1], got {}",
                self.accept_threshold
            )));
        }
        if !self.min_avg_sentence_tokens.is_finite() || self.min_avg_sentence_tokens < 0.0 {
            return Err(Error::Validation("gate.min_avg_sentence_tokens must be >= 0".into()));
        }
        RuleSet::new(self).map(|_| ())
    }
}

// ============================================================================
// Reranker capability
// ============================================================================

/// Learned scoring backend.
pub trait Reranker: Send + Sync {
    /// Probability-like score in `[0, 1]`.
    fn score(&self, features: &Features) -> Result<f64>;

    fn name(&self) -> &str {
        "reranker"
    }
}

/// `sigmoid(bias + Σ w_f · x_f)` with fixed default weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticReranker {
    pub bias: f64,
    /// Order matches [`Features::as_array`].
    pub weights: [f64; features::FEATURE_COUNT],
}

impl Default for LogisticReranker {
    fn default() -> Self {
        Self {
            bias: -2.0,
            weights: [3.0, -0.5, 1.5, -1.5, -1.0, -0.5],
        }
    }
}

impl Reranker for LogisticReranker {
    fn score(&self, features: &Features) -> Result<f64> {
        let z = self.bias
            + self
                .weights
                .iter()
                .zip(features.as_array())
                .map(|(w, x)| w * x)
                .sum::<f64>();
        Ok(1.0 / (1.0 + (-z).exp()))
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    Accepted,
    Escalated,
    Bypassed,
    Empty,
}

/// Per-candidate scoring trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTelemetry {
    /// Combined score before any edit, then after each edit.
    pub scores: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvaluation {
    /// Codebook entry id of the candidate.
    pub id: String,
    /// Position in the candidate list.
    pub index: usize,
    pub original: String,
    /// Final text after edits.
    pub text: String,
    /// `None` when the reranker failed for this candidate.
    pub model_score: Option<f64>,
    pub rule_score: f64,
    pub combined: f64,
    pub critique: Critique,
    pub edits: Vec<EditKind>,
    pub accepted: bool,
    pub rejected: bool,
    pub telemetry: EvaluationTelemetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateTelemetry {
    pub decision: GateDecision,
    pub candidates: usize,
    pub mean_score: f64,
    pub edits: usize,
    pub accepted: usize,
    pub rejected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl GateTelemetry {
    fn bare(decision: GateDecision, candidates: usize) -> Self {
        Self { decision, candidates, mean_score: 0.0, edits: 0, accepted: 0, rejected: 0, degraded: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    /// Selected candidate with its final (possibly edited) text.
    pub selected: Option<Candidate>,
    pub evaluations: Vec<CandidateEvaluation>,
    pub telemetry: GateTelemetry,
}

// ============================================================================
// QualityGate
// ============================================================================

#[derive(Clone)]
pub struct QualityGate {
    config: GateConfig,
    rules: RuleSet,
    reranker: Arc<dyn Reranker>,
}

impl std::fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityGate")
            .field("config", &self.config)
            .field("reranker", &self.reranker.name())
            .finish()
    }
}

struct Scored {
    model_score: Option<f64>,
    rule_score: f64,
    combined: f64,
    critique: Critique,
    degraded: Option<String>,
}

impl QualityGate {
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;
        let rules = RuleSet::new(&config)?;
        Ok(Self { config, rules, reranker: Arc::new(LogisticReranker::default()) })
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    fn score(&self, text: &str) -> Scored {
        let critique = self.rules.check(text);
        let rule_score = rules::rule_score(critique.flagged.len());
        match self.reranker.score(&Features::extract(text)) {
            Ok(m) if m.is_finite() => {
                let m = m.clamp(0.0, 1.0);
                Scored {
                    model_score: Some(m),
                    rule_score,
                    combined: MODEL_WEIGHT * m + RULE_WEIGHT * rule_score,
                    critique,
                    degraded: None,
                }
            }
            other => {
                let reason = match other {
                    Err(e) => format!("{} failed: {e}", self.reranker.name()),
                    Ok(m) => format!("{} returned non-finite score {m}", self.reranker.name()),
                };
                Scored { model_score: None, rule_score, combined: rule_score, critique, degraded: Some(reason) }
            }
        }
    }

    fn evaluate_one(&self, index: usize, candidate: &Candidate) -> (CandidateEvaluation, Option<String>) {
        let text = candidate.text.as_str();
        let mut current = text.to_string();
        let mut scored = self.score(&current);
        let mut degraded = scored.degraded.take();
        let mut edits = Vec::new();
        let mut scores = vec![scored.combined];

        let must_edit = |s: &Scored| {
            s.combined < self.config.accept_threshold || !s.critique.flagged.is_empty()
        };
        while edits.len() < self.config.max_edits && must_edit(&scored) {
            let Some((kind, edited)) = self.rules.next_edit(&current) else {
                break;
            };
            edits.push(kind);
            current = edited;
            scored = self.score(&current);
            scores.push(scored.combined);
            degraded = degraded.or(scored.degraded.take());
        }

        let accepted = scored.combined >= self.config.accept_threshold;
        let eval = CandidateEvaluation {
            id: candidate.source.entry_id.clone(),
            index,
            original: text.to_string(),
            text: current,
            model_score: scored.model_score,
            rule_score: scored.rule_score,
            combined: scored.combined,
            critique: scored.critique,
            edits,
            accepted,
            rejected: !accepted,
            telemetry: EvaluationTelemetry { scores, degraded: degraded.clone() },
        };
        (eval, degraded)
    }

    /// Score, edit and select over `candidates`.
    pub fn run(&self, candidates: &[Candidate]) -> GateOutcome {
        if candidates.is_empty() {
            return GateOutcome {
                selected: None,
                evaluations: Vec::new(),
                telemetry: GateTelemetry::bare(GateDecision::Empty, 0),
            };
        }
        if !self.config.enabled {
            return GateOutcome {
                selected: candidates.first().cloned(),
                evaluations: Vec::new(),
                telemetry: GateTelemetry::bare(GateDecision::Bypassed, candidates.len()),
            };
        }

        let results = self.evaluate_all(candidates);
        let degraded = results.iter().find_map(|(_, d)| d.clone());
        let evaluations: Vec<CandidateEvaluation> = results.into_iter().map(|(e, _)| e).collect();
        if let Some(reason) = &degraded {
            warn!(reason = %reason, "quality gate degraded to rule-only scoring");
        }

        let mut best = 0;
        for (i, e) in evaluations.iter().enumerate() {
            if e.combined > evaluations[best].combined {
                best = i;
            }
        }
        let winner = &evaluations[best];
        let mut selected = candidates[winner.index].clone();
        selected.text = winner.text.clone();

        let accepted = evaluations.iter().filter(|e| e.accepted).count();
        let telemetry = GateTelemetry {
            decision: if winner.accepted { GateDecision::Accepted } else { GateDecision::Escalated },
            candidates: candidates.len(),
            mean_score: evaluations.iter().map(|e| e.combined).sum::<f64>() / evaluations.len() as f64,
            edits: evaluations.iter().map(|e| e.edits.len()).sum(),
            accepted,
            rejected: evaluations.len() - accepted,
            degraded,
        };
        debug!(
            decision = ?telemetry.decision,
            candidates = telemetry.candidates,
            mean_score = telemetry.mean_score,
            edits = telemetry.edits,
            "quality gate"
        );

        GateOutcome { selected: Some(selected), evaluations, telemetry }
    }

    #[cfg(feature = "parallel")]
    fn evaluate_all(&self, candidates: &[Candidate]) -> Vec<(CandidateEvaluation, Option<String>)> {
        candidates
            .par_iter()
            .enumerate()
            .map(|(i, c)| self.evaluate_one(i, c))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn evaluate_all(&self, candidates: &[Candidate]) -> Vec<(CandidateEvaluation, Option<String>)> {
        candidates
            .iter()
            .enumerate()
            .map(|(i, c)| self.evaluate_one(i, c))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Provenance;

    fn candidate(text: &str) -> Candidate {
        Candidate {
            text: text.to_string(),
            proj: 0.5,
            weight: 0.5,
            bin: 0,
            source: Provenance {
                shape: None,
                constellation_id: "c0".into(),
                entry_id: "e0".into(),
                source_ref: None,
            },
        }
    }

    struct Broken;

    impl Reranker for Broken {
        fn score(&self, _: &Features) -> Result<f64> {
            Err(Error::Validation("model not loaded".into()))
        }
    }

    #[test]
    fn test_logistic_is_a_probability() {
        let r = LogisticReranker::default();
        for text in ["", "x", "A long sentence with many words. And another!"] {
            let s = r.score(&Features::extract(text)).unwrap();
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_empty_candidates() {
        let gate = QualityGate::new(GateConfig::default()).unwrap();
        let out = gate.run(&[]);
        assert_eq!(out.telemetry.decision, GateDecision::Empty);
        assert!(out.selected.is_none());
    }

    #[test]
    fn test_disabled_gate_bypasses_to_first() {
        let config = GateConfig { enabled: false, ..GateConfig::default() };
        let gate = QualityGate::new(config).unwrap();
        let out = gate.run(&[candidate("TODO first"), candidate("second")]);
        assert_eq!(out.telemetry.decision, GateDecision::Bypassed);
        assert_eq!(out.selected.unwrap().text, "TODO first");
    }

    #[test]
    fn test_flagged_terms_are_stripped() {
        let config = GateConfig { accept_threshold: 0.0, max_edits: 1, ..GateConfig::default() };
        let gate = QualityGate::new(config).unwrap();
        let out = gate.run(&[candidate("TODO fix this")]);
        let eval = &out.evaluations[0];
        assert_eq!(eval.edits, vec![EditKind::StripFlagged]);
        assert!(!eval.text.contains("TODO"));
        assert_eq!(out.telemetry.decision, GateDecision::Accepted);
    }

    #[test]
    fn test_spliced_banned_term_never_survives_one_edit() {
        let config = GateConfig { accept_threshold: 0.9, max_edits: 1, ..GateConfig::default() };
        let gate = QualityGate::new(config).unwrap();
        let out = gate.run(&[candidate("lorem TODO ipsum")]);
        let eval = &out.evaluations[0];
        assert_eq!(eval.edits, vec![EditKind::StripFlagged]);
        assert!(eval.critique.flagged.is_empty(), "{:?}", eval.critique.flagged);
        assert!(!out.selected.unwrap().text.to_lowercase().contains("lorem ipsum"));
    }

    #[test]
    fn test_evaluation_carries_id_flags_and_trace() {
        let config = GateConfig { accept_threshold: 0.9, max_edits: 2, ..GateConfig::default() };
        let gate = QualityGate::new(config).unwrap();
        let out = gate.run(&[candidate("TODO fix this")]);
        let eval = &out.evaluations[0];
        assert_eq!(eval.id, "e0");
        assert_eq!(eval.rejected, !eval.accepted);
        assert_eq!(eval.telemetry.scores.len(), eval.edits.len() + 1);
        assert_eq!(*eval.telemetry.scores.last().unwrap(), eval.combined);
        assert!(eval.telemetry.degraded.is_none());
    }

    #[test]
    fn test_zero_edits_leaves_text() {
        let config = GateConfig { max_edits: 0, ..GateConfig::default() };
        let gate = QualityGate::new(config).unwrap();
        let out = gate.run(&[candidate("TODO fix this")]);
        assert_eq!(out.evaluations[0].text, "TODO fix this");
        assert!(out.evaluations[0].edits.is_empty());
    }

    #[test]
    fn test_broken_reranker_degrades_to_rules() {
        let gate = QualityGate::new(GateConfig::default())
            .unwrap()
            .with_reranker(Arc::new(Broken));
        let out = gate.run(&[candidate("Grounded actionable insight with detail.")]);
        let eval = &out.evaluations[0];
        assert!(eval.model_score.is_none());
        assert_eq!(eval.combined, eval.rule_score);
        assert!(out.telemetry.degraded.as_deref().unwrap().contains("model not loaded"));
        assert!(out.selected.is_some());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = GateConfig { accept_threshold: 1.5, ..GateConfig::default() };
        assert!(QualityGate::new(config).is_err());
    }
}
