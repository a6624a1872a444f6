//! Point inside a constellation.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A single embedded content unit, placed on its constellation's anchor.
///
/// `proj` is the radial projection onto the owning anchor and `conf` the
/// soft-assignment weight that won the point for this constellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    /// Optional 2-D/3-D layout coordinates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<SmallVec<[f32; 3]>>,
    pub proj: f32,
    pub conf: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Opaque locator, e.g. `media:<id>#t=<start>-<end>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

impl Point {
    pub fn new(id: impl Into<String>, proj: f32, conf: f32) -> Self {
        Self {
            id: id.into(),
            coords: None,
            proj,
            conf,
            text: None,
            source_ref: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_coords(mut self, coords: impl IntoIterator<Item = f32>) -> Self {
        self.coords = Some(coords.into_iter().collect());
        self
    }

    /// Structural checks shared by ingest validation.
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        if self.id.is_empty() {
            return Err("point id must not be empty".into());
        }
        if !self.proj.is_finite() {
            return Err(format!("point {} has non-finite proj", self.id));
        }
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(format!("point {} conf {} outside [0, 1]", self.id, self.conf));
        }
        if let Some(coords) = &self.coords {
            if !(2..=3).contains(&coords.len()) {
                return Err(format!(
                    "point {} has {} coordinates, expected 2 or 3",
                    self.id,
                    coords.len()
                ));
            }
        }
        Ok(())
    }

    /// Parsed `media:` locator, if `source_ref` is one.
    pub fn media_ref(&self) -> Option<MediaRef> {
        self.source_ref.as_deref().and_then(MediaRef::parse)
    }
}

/// `media:<id>#t=<start>-<end>`, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub start: f64,
    pub end: f64,
}

fn media_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^media:([^#\s]+)#t=(\d+(?:\.\d+)?)-(\d+(?:\.\d+)?)$")
            .unwrap_or_else(|e| unreachable!("static media pattern: {e}"))
    })
}

impl MediaRef {
    pub fn parse(source_ref: &str) -> Option<Self> {
        let caps = media_pattern().captures(source_ref.trim())?;
        let start: f64 = caps[2].parse().ok()?;
        let end: f64 = caps[3].parse().ok()?;
        (end >= start).then(|| Self { id: caps[1].to_string(), start, end })
    }

    /// Substitute `{id}`, `{start}` and `{end}` (whole seconds) into `template`.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{id}", &self.id)
            .replace("{start}", &(self.start.floor() as u64).to_string())
            .replace("{end}", &(self.end.floor() as u64).to_string())
    }
}
