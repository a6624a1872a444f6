//! Rule checks and the bounded edits the gate may apply.

use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::features::{sentence_count, token_count};
use super::GateConfig;
use crate::{Error, Result};

/// Penalty per flagged term.
pub const FLAG_PENALTY: f64 = 0.3;
/// Cap on the total flagged-term penalty.
pub const MAX_PENALTY: f64 = 0.9;

/// `1 - min(0.3 · flagged, 0.9)`
pub fn rule_score(flagged: usize) -> f64 {
    1.0 - (FLAG_PENALTY * flagged as f64).min(MAX_PENALTY)
}

/// Shape problems found independently of banned terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatFlag {
    MissingTerminalPunctuation,
    RepeatedTerminalPunctuation,
    TooFewTokens,
    ShortSentences,
}

/// Rule findings for one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub flagged: SmallVec<[String; 4]>,
    #[serde(default)]
    pub format: SmallVec<[FormatFlag; 2]>,
    pub tokens: usize,
    pub avg_sentence_tokens: f64,
    /// Empty when nothing is wrong.
    pub hint: String,
}

impl Critique {
    pub fn is_clean(&self) -> bool {
        self.hint.is_empty()
    }
}

/// Edit kinds, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    StripFlagged,
    NormalizePunctuation,
    PadClarifier,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    banned: Regex,
    min_tokens: usize,
    min_avg_sentence_tokens: f64,
    clarifier: String,
}

impl RuleSet {
    pub fn new(config: &GateConfig) -> Result<Self> {
        let banned = Regex::new(&config.banned_pattern)
            .map_err(|e| Error::Validation(format!("banned_pattern: {e}")))?;
        Ok(Self {
            banned,
            min_tokens: config.min_tokens,
            min_avg_sentence_tokens: config.min_avg_sentence_tokens,
            clarifier: config.clarifier.trim().to_string(),
        })
    }

    pub fn check(&self, text: &str) -> Critique {
        let flagged: SmallVec<[String; 4]> = self
            .banned
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
        let tokens = token_count(text);
        let avg_sentence_tokens = tokens as f64 / sentence_count(text).max(1) as f64;

        let mut format = SmallVec::new();
        let mut hints = Vec::new();
        if !flagged.is_empty() {
            hints.push(format!("remove flagged terms: {}", flagged.join(", ")));
        }
        if let Some(flag) = trailing_flag(text) {
            format.push(flag);
            hints.push(match flag {
                FormatFlag::RepeatedTerminalPunctuation => "use a single closing mark".to_string(),
                _ => "end with terminal punctuation".to_string(),
            });
        }
        if tokens < self.min_tokens {
            format.push(FormatFlag::TooFewTokens);
            hints.push(format!("expand to at least {} tokens", self.min_tokens));
        }
        if avg_sentence_tokens < self.min_avg_sentence_tokens {
            format.push(FormatFlag::ShortSentences);
            hints.push(format!(
                "sentences average {avg_sentence_tokens:.1} tokens, aim for {:.0}+",
                self.min_avg_sentence_tokens
            ));
        }

        Critique { flagged, format, tokens, avg_sentence_tokens, hint: hints.join("; ") }
    }

    /// Next applicable edit, or `None` when the text has nothing left to fix.
    pub fn next_edit(&self, text: &str) -> Option<(EditKind, String)> {
        if self.banned.is_match(text) {
            return Some((EditKind::StripFlagged, self.strip_flagged(text)));
        }
        if let Some(fixed) = normalize_trailing(text) {
            return Some((EditKind::NormalizePunctuation, fixed));
        }
        if token_count(text) < self.min_tokens && !self.clarifier.is_empty() {
            let padded = if text.trim().is_empty() {
                self.clarifier.clone()
            } else {
                format!("{} {}", text.trim(), self.clarifier)
            };
            return Some((EditKind::PadClarifier, padded));
        }
        None
    }

    /// Remove banned matches until none remain. Collapsing whitespace can
    /// join the neighbours of a removed term into a fresh match.
    fn strip_flagged(&self, text: &str) -> String {
        let mut current = text.to_string();
        while self.banned.is_match(&current) {
            let stripped = self.banned.replace_all(&current, " ");
            let next = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
            if next == current {
                break;
            }
            current = next;
        }
        current
    }
}

fn trailing_flag(text: &str) -> Option<FormatFlag> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    let body = trimmed.trim_end_matches(['.', '!', '?', ',', ';', ':']);
    match trimmed.len() - body.len() {
        0 => Some(FormatFlag::MissingTerminalPunctuation),
        1 if trimmed.ends_with(['.', '!', '?']) => None,
        1 => Some(FormatFlag::MissingTerminalPunctuation),
        _ => Some(FormatFlag::RepeatedTerminalPunctuation),
    }
}

/// Collapse repeated terminal punctuation to one mark, or add a period.
/// `None` when the text already ends cleanly (or is empty).
pub fn normalize_trailing(text: &str) -> Option<String> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    let body = trimmed.trim_end_matches(['.', '!', '?', ',', ';', ':']);
    let tail = &trimmed[body.len()..];
    let mark = match tail.chars().last() {
        Some(c @ ('.' | '!' | '?')) => c,
        _ => '.',
    };
    let fixed = format!("{body}{mark}");
    (fixed != text).then_some(fixed)
}
