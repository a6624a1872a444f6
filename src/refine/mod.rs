//! # Refinement Loop
//!
//! Optional post-processing of the selected candidate under a halting
//! controller.
//!
//! ```text
//! text ─► bytes (alphabet 256) ─► state
//!   loop: steps < Mmax
//!     halt when steps ≥ Mmin and (p_halt > threshold or refiner halts at Mmin)
//!     p_halt = refiner.step(state)
//! state.tokens ─► UTF-8 ─► text
//! ```
//!
//! Refinement never fails its caller. Missing configuration, an
//! unavailable backend, oversize input and internal errors all return the
//! input text unchanged with a reason.

pub mod halting;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

pub use halting::{AnnounceOutcome, BuilderPackSource, HaltingConfig, PackCache, PackSnapshot};

/// Default cap on input length, in tokens.
pub const DEFAULT_MAX_TOKENS: usize = 4096;

/// Mutable state threaded through refinement steps.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineState {
    pub tokens: Vec<u8>,
    pub hidden: Vec<f32>,
}

impl RefineState {
    pub fn encode(text: &str) -> Self {
        let tokens = text.as_bytes().to_vec();
        let hidden = tokens.iter().map(|&b| b as f32 / 255.0).collect();
        Self { tokens, hidden }
    }

    pub fn decode(&self) -> std::result::Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.tokens.clone())
    }
}

/// Learned refinement backend.
pub trait Refiner: Send + Sync {
    /// One refine step. Returns the halting probability after it.
    fn step(&self, state: &mut RefineState) -> Result<f64>;

    /// Halting probability before any step has run.
    fn prior_halt(&self) -> f64 {
        0.0
    }

    /// Stop as soon as `Mmin` steps have run, whatever the threshold.
    fn halts_at_min(&self) -> bool {
        false
    }

    fn available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "refiner"
    }
}

/// Behavior-preserving refiner: no change, always ready to halt.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRefiner;

impl Refiner for IdentityRefiner {
    fn step(&self, _state: &mut RefineState) -> Result<f64> {
        Ok(1.0)
    }

    fn prior_halt(&self) -> f64 {
        1.0
    }

    fn halts_at_min(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "identity"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementOutcome {
    pub text: String,
    pub steps: usize,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
}

impl RefinementOutcome {
    pub fn skipped(text: &str, reason: impl Into<String>) -> Self {
        Self {
            text: text.to_string(),
            steps: 0,
            enabled: false,
            reason: Some(reason.into()),
            pack_id: None,
        }
    }
}

#[derive(Clone)]
pub struct RefinementLoop {
    refiner: Arc<dyn Refiner>,
    max_tokens: usize,
}

impl std::fmt::Debug for RefinementLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefinementLoop")
            .field("refiner", &self.refiner.name())
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Default for RefinementLoop {
    fn default() -> Self {
        Self::new(Arc::new(IdentityRefiner), DEFAULT_MAX_TOKENS)
    }
}

impl RefinementLoop {
    pub fn new(refiner: Arc<dyn Refiner>, max_tokens: usize) -> Self {
        Self { refiner, max_tokens }
    }

    pub fn refiner_name(&self) -> &str {
        self.refiner.name()
    }

    pub fn run(&self, text: &str, halting: Option<&HaltingConfig>) -> RefinementOutcome {
        let Some(h) = halting else {
            return RefinementOutcome::skipped(text, "no halting configuration");
        };
        if !self.refiner.available() {
            return RefinementOutcome::skipped(text, format!("{} backend unavailable", self.refiner.name()));
        }
        if text.is_empty() {
            return RefinementOutcome::skipped(text, "empty input");
        }
        let mut state = RefineState::encode(text);
        if state.tokens.len() > self.max_tokens {
            return RefinementOutcome::skipped(
                text,
                format!("input has {} tokens, limit is {}", state.tokens.len(), self.max_tokens),
            );
        }

        let m_max = h.m_max;
        let m_min = h.m_min.min(m_max);
        let mut p_halt = self.refiner.prior_halt();
        let mut steps = 0;
        while steps < m_max {
            if steps >= m_min && (self.refiner.halts_at_min() || p_halt > h.threshold) {
                break;
            }
            p_halt = match self.refiner.step(&mut state) {
                Ok(p) if p.is_finite() => p,
                Ok(p) => return self.degraded(text, &format!("non-finite halting probability {p}")),
                Err(e) => return self.degraded(text, &e.to_string()),
            };
            steps += 1;
        }

        match state.decode() {
            Ok(refined) => {
                debug!(steps, pack = %h.pack_id, refiner = self.refiner.name(), "refined");
                RefinementOutcome {
                    text: refined,
                    steps,
                    enabled: true,
                    reason: None,
                    pack_id: Some(h.pack_id.clone()),
                }
            }
            Err(e) => self.degraded(text, &format!("refined tokens are not UTF-8: {e}")),
        }
    }

    fn degraded(&self, text: &str, detail: &str) -> RefinementOutcome {
        warn!(refiner = self.refiner.name(), detail, "refinement disabled for this call");
        RefinementOutcome::skipped(text, format!("refinement failed: {detail}"))
    }
}
