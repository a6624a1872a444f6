//! # cgp-rs: Constellation Geometry Protocol engine
//!
//! Compresses sets of embedded content into signed, optionally encrypted
//! geometric summaries ("constellations") and reconstructs ranked content
//! from them against a codebook.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `ShapeStore` is the contract between engine and storage
//! 2. **Clean DTOs**: `Packet`, `Constellation`, `Point` cross all boundaries
//! 3. **Fail closed**: signatures and anchor AEAD either verify or reject
//! 4. **Degrade, don't abort**: gate and refinement failures fall back locally
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cgp_rs::{BuildItem, Codebook, ConstellationRef, DecodeRequest, Engine, EngineConfig};
//!
//! # fn example(items: Vec<BuildItem>, codebook: Codebook) -> cgp_rs::Result<()> {
//! let engine = Engine::new(EngineConfig::default().with_passphrase("s3cret"))?;
//!
//! let built = engine.build(&items, "docs", "text")?;
//! let receipt = engine.ingest(built.packet)?;
//!
//! let request = DecodeRequest::new(ConstellationRef::stored(receipt.key, None)).per_constellation(3);
//! for candidate in engine.decode(&request, &codebook)?.candidates {
//!     println!("{:.3} {}", candidate.weight, candidate.text);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! vectors ─► builder ─► Packet ─► crypto (sign / seal) ─► ingest ─► ShapeStore
//!                                                                     │
//!   codebook ─► decoder (decode / mix / calibrate) ◄──────────────────┘
//!                 └─► gate ─► refine ─► selected candidate
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod math;
pub mod crypto;
pub mod builder;
pub mod storage;
pub mod decoder;
pub mod gate;
pub mod refine;
pub mod config;
pub mod export;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Point, MediaRef, Constellation, SuperNode, Packet, Signature, EncryptedAnchor,
    Codebook, CodebookEntry, Embedder, BuilderPack, PackParams, PackStatus, HaltingParams,
    EVENT_TAG, SPEC_VERSION,
};

// ============================================================================
// Re-exports: Components
// ============================================================================

pub use builder::{BuildItem, BuildParams, BuildReport, ConstellationBuilder};
pub use storage::{ShapeStore, ShapeKey, PointLocation, InsertOutcome, MemoryShapeStore};
pub use decoder::{Candidate, Provenance, CalibrationReport};
pub use gate::{
    CandidateEvaluation, EvaluationTelemetry, FormatFlag, GateConfig, GateDecision, GateOutcome,
    GateTelemetry, LogisticReranker, QualityGate, Reranker,
};
pub use refine::{
    Refiner, IdentityRefiner, RefinementLoop, RefinementOutcome,
    PackCache, BuilderPackSource, AnnounceOutcome,
};
pub use config::EngineConfig;
pub use export::{ReportSink, JsonDirSink};

// ============================================================================
// Requests and responses
// ============================================================================

/// A constellation to operate on: stored in the shape store, or inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstellationRef {
    /// `constellation: None` means every constellation of the shape.
    Stored { shape: ShapeKey, constellation: Option<String> },
    Inline(Constellation),
}

impl ConstellationRef {
    pub fn stored(shape: impl Into<ShapeKey>, constellation: Option<&str>) -> Self {
        Self::Stored { shape: shape.into(), constellation: constellation.map(str::to_string) }
    }

    pub fn inline(constellation: Constellation) -> Self {
        Self::Inline(constellation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeRequest {
    pub target: ConstellationRef,
    pub per_constellation: usize,
    pub run_gate: bool,
    pub refine: bool,
    /// Refinement scope override; stored shapes default to their packet meta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<(String, String)>,
}

impl DecodeRequest {
    pub const DEFAULT_PER_CONSTELLATION: usize = 5;

    pub fn new(target: ConstellationRef) -> Self {
        Self {
            target,
            per_constellation: Self::DEFAULT_PER_CONSTELLATION,
            run_gate: false,
            refine: false,
            scope: None,
        }
    }

    pub fn per_constellation(mut self, n: usize) -> Self {
        self.per_constellation = n;
        self
    }

    pub fn with_gate(mut self, on: bool) -> Self {
        self.run_gate = on;
        self
    }

    pub fn with_refinement(mut self, on: bool) -> Self {
        self.refine = on;
        self
    }

    pub fn with_scope(mut self, namespace: impl Into<String>, modality: impl Into<String>) -> Self {
        self.scope = Some((namespace.into(), modality.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeResponse {
    /// Ranked per constellation, constellations in packet order.
    pub candidates: Vec<Candidate>,
    /// Gate output when requested, else the top candidate.
    pub selected: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<RefinementOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub key: ShapeKey,
    /// Always [`EVENT_TAG`].
    pub event: String,
    pub inserted: bool,
    pub evicted: Vec<ShapeKey>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointLink {
    pub point_id: String,
    pub shape: ShapeKey,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    pub report: CalibrationReport,
    /// Where the report was persisted, when a sink is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixOutcome {
    pub constellation: Constellation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub packet: Packet,
    pub report: BuildReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
}

// ============================================================================
// Top-level Engine handle
// ============================================================================

/// The primary entry point. An `Engine` wraps a shape store and exposes
/// ingest, point resolve, decode, calibrate, mix and build.
pub struct Engine<S: ShapeStore = MemoryShapeStore> {
    store: S,
    config: EngineConfig,
    gate: QualityGate,
    packs: PackCache,
    refinement: RefinementLoop,
    reports: Option<Arc<dyn ReportSink>>,
}

impl Engine<MemoryShapeStore> {
    /// In-memory engine sized by `config.store_capacity`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = MemoryShapeStore::with_capacity(config.store_capacity);
        Self::with_store(store, config)
    }
}

impl<S: ShapeStore> Engine<S> {
    pub fn with_store(store: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let gate = QualityGate::new(config.gate.clone())?;
        let refinement = RefinementLoop::new(Arc::new(IdentityRefiner), config.refine_max_tokens);
        Ok(Self { store, config, gate, packs: PackCache::new(), refinement, reports: None })
    }

    pub fn with_pack_source(mut self, source: Arc<dyn BuilderPackSource>) -> Self {
        self.packs = PackCache::new().with_source(source);
        self
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refinement = RefinementLoop::new(refiner, self.config.refine_max_tokens);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.gate = self.gate.with_reranker(reranker);
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.reports = Some(sink);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn packs(&self) -> &PackCache {
        &self.packs
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Validate, verify, trial-decrypt and store a packet.
    pub fn ingest(&self, packet: Packet) -> Result<IngestReceipt> {
        packet.check().map_err(Error::Validation)?;
        self.verify_signature(&packet)?;

        if packet.constellations().any(Constellation::is_encrypted) {
            if self.config.allow_anchor_decrypt {
                let secret = self.anchor_secret()?;
                for c in packet.constellations().filter(|c| c.is_encrypted()) {
                    crypto::open_constellation(c, secret)?;
                }
            } else {
                debug!("anchor decryption disabled, storing sealed anchors opaque");
            }
        }

        let key = ShapeKey(crypto::content_hash(&packet)?);
        let outcome = self.store.insert(key, packet)?;
        info!(
            shape = %outcome.key,
            inserted = outcome.inserted,
            evicted = outcome.evicted.len(),
            event = EVENT_TAG,
            "ingested packet"
        );
        Ok(IngestReceipt {
            key: outcome.key,
            event: EVENT_TAG.to_string(),
            inserted: outcome.inserted,
            evicted: outcome.evicted,
            stored_at: Utc::now(),
        })
    }

    fn verify_signature(&self, packet: &Packet) -> Result<()> {
        match (&packet.sig, self.config.secret()) {
            (None, _) if self.config.require_signature => {
                Err(Error::Authentication("packet is unsigned".into()))
            }
            (None, _) => Ok(()),
            (Some(_), Some(secret)) => {
                if crypto::verify_packet(packet, secret)? {
                    Ok(())
                } else {
                    Err(Error::Authentication("packet signature does not verify".into()))
                }
            }
            (Some(_), None) => {
                warn!("packet is signed but no passphrase is configured, signature not checked");
                Ok(())
            }
        }
    }

    fn anchor_secret(&self) -> Result<&str> {
        if !self.config.allow_anchor_decrypt {
            return Err(Error::Crypto("anchor decryption is disabled".into()));
        }
        self.config
            .secret()
            .ok_or_else(|| Error::Crypto("no passphrase configured for anchor decryption".into()))
    }

    /// Working copy with a plain anchor.
    fn open(&self, c: &Constellation) -> Result<Constellation> {
        if c.is_encrypted() {
            crypto::open_constellation(c, self.anchor_secret()?)
        } else {
            Ok(c.clone())
        }
    }

    // ========================================================================
    // Point resolve
    // ========================================================================

    /// Deep link for a point. `media:` locators render through the
    /// configured template, anything else yields `cgp://point/<id>`.
    pub fn resolve_point(&self, point_id: &str) -> Result<PointLink> {
        let (loc, point) = self
            .store
            .get_point(point_id)?
            .ok_or_else(|| Error::NotFound(format!("point {point_id}")))?;
        let media = point.media_ref();
        let link = match &media {
            Some(m) => m.render(&self.config.media_link_template),
            None => format!("cgp://point/{point_id}"),
        };
        Ok(PointLink { point_id: point.id, shape: loc.shape, link, media })
    }

    // ========================================================================
    // Decode / calibrate / mix
    // ========================================================================

    /// Plain working copies of the referenced constellations, with the
    /// owning shape key and packet scope.
    fn resolve(&self, target: &ConstellationRef) -> Result<Resolved> {
        match target {
            ConstellationRef::Inline(c) => {
                c.check().map_err(Error::Validation)?;
                Ok(Resolved { shape: None, scope: None, constellations: vec![self.open(c)?] })
            }
            ConstellationRef::Stored { shape, constellation } => {
                let packet = self
                    .store
                    .get(shape)?
                    .ok_or_else(|| Error::NotFound(format!("shape {shape}")))?;
                let selected: Vec<&Constellation> = match constellation {
                    Some(id) => vec![packet
                        .constellation(id)
                        .ok_or_else(|| Error::NotFound(format!("constellation {id} in shape {shape}")))?],
                    None => packet.constellations().collect(),
                };
                let constellations = selected
                    .into_iter()
                    .map(|c| self.open(c))
                    .collect::<Result<Vec<_>>>()?;
                let scope = packet
                    .namespace()
                    .zip(packet.modality())
                    .map(|(ns, m)| (ns.to_string(), m.to_string()));
                Ok(Resolved { shape: Some(shape.clone()), scope, constellations })
            }
        }
    }

    fn resolve_one(&self, target: &ConstellationRef) -> Result<(Option<ShapeKey>, Constellation)> {
        let mut resolved = self.resolve(target)?;
        match resolved.constellations.len() {
            1 => Ok((resolved.shape, resolved.constellations.remove(0))),
            0 => Err(Error::NotFound("shape has no constellations".into())),
            n => Err(Error::Validation(format!(
                "shape holds {n} constellations, name one"
            ))),
        }
    }

    /// Ranked candidates, optionally gated and refined.
    pub fn decode(&self, request: &DecodeRequest, codebook: &Codebook) -> Result<DecodeResponse> {
        let resolved = self.resolve(&request.target)?;
        let mut candidates = Vec::new();
        for c in &resolved.constellations {
            candidates.extend(decoder::decode(
                c,
                codebook,
                request.per_constellation,
                resolved.shape.as_ref(),
            )?);
        }

        let (mut selected, gate) = if request.run_gate {
            let outcome = self.gate.run(&candidates);
            (outcome.selected.clone(), Some(outcome))
        } else {
            (candidates.first().cloned(), None)
        };

        let refinement = match (&mut selected, request.refine) {
            (Some(chosen), true) => {
                let scope = request.scope.clone().or(resolved.scope);
                let outcome = self.refine(&chosen.text, scope.as_ref());
                chosen.text = outcome.text.clone();
                Some(outcome)
            }
            (None, true) => Some(RefinementOutcome::skipped("", "empty input")),
            (_, false) => None,
        };

        Ok(DecodeResponse { candidates, selected, gate, refinement })
    }

    fn refine(&self, text: &str, scope: Option<&(String, String)>) -> RefinementOutcome {
        if !self.config.refinement_enabled {
            return RefinementOutcome::skipped(text, "refinement disabled by configuration");
        }
        let Some((namespace, modality)) = scope else {
            return RefinementOutcome::skipped(text, "no namespace/modality for refinement");
        };
        match self.packs.snapshot(namespace, modality) {
            Ok(snapshot) => {
                let halting = snapshot.and_then(|s| s.halting());
                self.refinement.run(text, halting.as_ref())
            }
            Err(e) => {
                warn!(namespace = %namespace, modality = %modality, error = %e, "builder pack fetch failed");
                RefinementOutcome::skipped(text, format!("builder pack unavailable: {e}"))
            }
        }
    }

    /// KL, JS and coverage of `codebook` against one constellation.
    pub fn calibrate(&self, target: &ConstellationRef, codebook: &Codebook) -> Result<CalibrationOutcome> {
        let (shape, c) = self.resolve_one(target)?;
        let report = decoder::calibrate(&c, codebook, shape.as_ref())?;
        let link = match &self.reports {
            Some(sink) => Some(sink.persist(&report)?),
            None => None,
        };
        Ok(CalibrationOutcome { report, link })
    }

    /// Blend two constellations, optionally decoding the result.
    pub fn mix(
        &self,
        a: &ConstellationRef,
        b: &ConstellationRef,
        alpha: f64,
        beta: f64,
        decode: Option<(&Codebook, usize)>,
    ) -> Result<MixOutcome> {
        let (_, ca) = self.resolve_one(a)?;
        let (_, cb) = self.resolve_one(b)?;
        let constellation = decoder::mix(&ca, &cb, alpha, beta)?;
        let candidates = match decode {
            Some((codebook, n)) => Some(decoder::decode(&constellation, codebook, n, None)?),
            None => None,
        };
        Ok(MixOutcome { constellation, candidates })
    }

    // ========================================================================
    // Build / packs
    // ========================================================================

    /// Build a packet for `(namespace, modality)` with the announced pack's
    /// parameters (defaults otherwise), sealed and signed per config.
    pub fn build(&self, items: &[BuildItem], namespace: &str, modality: &str) -> Result<BuildOutcome> {
        let snapshot = self.packs.snapshot(namespace, modality)?;
        let params = snapshot
            .as_ref()
            .map(|s| BuildParams::from(s.pack.params))
            .unwrap_or_default();
        let pack_id = snapshot.map(|s| s.pack.id.clone());

        let (mut packet, report) = builder::build_packet(params, items, namespace, modality)?;
        if let Some(id) = &pack_id {
            packet.meta.insert("pack_id".into(), id.clone().into());
        }
        if self.config.encrypt_anchors {
            let secret = self
                .config
                .secret()
                .ok_or_else(|| Error::Crypto("encrypt_anchors needs a passphrase".into()))?;
            for sn in &mut packet.supernodes {
                for c in &mut sn.constellations {
                    crypto::seal_constellation(c, secret)?;
                }
            }
        }
        if let Some(secret) = self.config.secret() {
            crypto::sign_packet(&mut packet, secret)?;
        }

        info!(namespace, modality, k = params.k, mhep = report.mhep, pack = ?pack_id, "built packet");
        Ok(BuildOutcome { packet, report, pack_id })
    }

    pub fn announce_pack(&self, namespace: &str, modality: &str, pack: BuilderPack) -> Result<AnnounceOutcome> {
        self.packs.announce(namespace, modality, pack)
    }
}

struct Resolved {
    shape: Option<ShapeKey>,
    scope: Option<(String, String)>,
    constellations: Vec<Constellation>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
