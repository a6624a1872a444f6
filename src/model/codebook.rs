//! Codebook: the corpus decoded against.

use serde::{Deserialize, Serialize};

/// Opaque text-embedding collaborator.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// One decodable entry: text plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodebookEntry {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

impl CodebookEntry {
    pub fn new(id: impl Into<String>, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding,
            source_ref: None,
        }
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }
}

/// Ordered set of codebook entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    pub entries: Vec<CodebookEntry>,
}

impl Codebook {
    pub fn new(entries: Vec<CodebookEntry>) -> Self {
        Self { entries }
    }

    /// Embed raw texts; entry ids are `e0`, `e1`, ...
    pub fn from_texts<E: Embedder + ?Sized>(embedder: &E, texts: &[&str]) -> Self {
        let entries = texts
            .iter()
            .enumerate()
            .map(|(i, t)| CodebookEntry::new(format!("e{i}"), *t, embedder.embed(t)))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodebookEntry> {
        self.entries.iter()
    }
}

impl From<Vec<CodebookEntry>> for Codebook {
    fn from(entries: Vec<CodebookEntry>) -> Self {
        Self::new(entries)
    }
}
