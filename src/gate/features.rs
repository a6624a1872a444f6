//! Cheap scalar text features for the gate's scoring model.

use serde::{Deserialize, Serialize};

/// Characters at which `length` saturates to 1.
pub const LENGTH_SATURATION: f64 = 200.0;

pub const FEATURE_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    /// `min(chars / 200, 1)`
    pub length: f64,
    /// sentences per token
    pub sentence_density: f64,
    /// unique lowercase tokens per token
    pub unique_ratio: f64,
    /// uppercase letters per letter
    pub upper_ratio: f64,
    /// digits per char
    pub digit_ratio: f64,
    /// ASCII punctuation per char
    pub punct_ratio: f64,
}

impl Features {
    pub fn extract(text: &str) -> Self {
        let chars = text.chars().count();
        if chars == 0 {
            return Self::default();
        }
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let letters = text.chars().filter(|c| c.is_alphabetic()).count();

        let mut unique: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
        unique.sort();
        unique.dedup();

        let ratio = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f64 / d as f64 };

        Self {
            length: (chars as f64 / LENGTH_SATURATION).min(1.0),
            sentence_density: ratio(sentence_count(text), tokens.len()),
            unique_ratio: ratio(unique.len(), tokens.len()),
            upper_ratio: ratio(text.chars().filter(|c| c.is_uppercase()).count(), letters),
            digit_ratio: ratio(text.chars().filter(|c| c.is_ascii_digit()).count(), chars),
            punct_ratio: ratio(text.chars().filter(|c| c.is_ascii_punctuation()).count(), chars),
        }
    }

    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.length,
            self.sentence_density,
            self.unique_ratio,
            self.upper_ratio,
            self.digit_ratio,
            self.punct_ratio,
        ]
    }
}

/// Non-empty segments between `.`, `!` and `?`.
pub fn sentence_count(text: &str) -> usize {
    text.split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count()
}

pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_all_zero() {
        assert_eq!(Features::extract(""), Features::default());
    }

    #[test]
    fn test_ratios() {
        let f = Features::extract("Abc abc 12.");
        assert!((f.unique_ratio - 2.0 / 3.0).abs() < 1e-12);
        assert!((f.upper_ratio - 1.0 / 6.0).abs() < 1e-12);
        assert!((f.digit_ratio - 2.0 / 11.0).abs() < 1e-12);
        assert!((f.punct_ratio - 1.0 / 11.0).abs() < 1e-12);
        assert!((f.sentence_density - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_length_saturates() {
        let long = "a".repeat(500);
        assert_eq!(Features::extract(&long).length, 1.0);
    }

    #[test]
    fn test_sentence_count_ignores_empty_segments() {
        assert_eq!(sentence_count("One. Two!! Three?"), 3);
        assert_eq!(sentence_count("..."), 0);
        assert_eq!(sentence_count("no terminator"), 1);
    }
}
