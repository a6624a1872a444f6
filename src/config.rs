//! Engine configuration.
//!
//! ```json
//! {
//!   "require_signature": true,
//!   "allow_anchor_decrypt": true,
//!   "passphrase": "…",
//!   "gate": { "enabled": true, "accept_threshold": 0.6, "max_edits": 2 },
//!   "refinement_enabled": false
//! }
//! ```
//!
//! Every field has a default; unknown fields are rejected.

use serde::{Deserialize, Serialize};

use crate::gate::GateConfig;
use crate::refine::DEFAULT_MAX_TOKENS;
use crate::storage::memory::DEFAULT_CAPACITY;
use crate::{Error, Result};

pub const DEFAULT_MEDIA_LINK_TEMPLATE: &str = "https://www.youtube.com/watch?v={id}&t={start}s";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Reject packets without a valid signature.
    pub require_signature: bool,
    /// Permit anchor decryption at all.
    pub allow_anchor_decrypt: bool,
    /// Signing and anchor encryption secret.
    pub passphrase: Option<String>,
    /// Seal anchors of packets produced by `Engine::build`.
    pub encrypt_anchors: bool,
    pub store_capacity: usize,
    pub gate: GateConfig,
    pub refinement_enabled: bool,
    pub refine_max_tokens: usize,
    /// `{id}`, `{start}` and `{end}` are substituted.
    pub media_link_template: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            require_signature: false,
            allow_anchor_decrypt: true,
            passphrase: None,
            encrypt_anchors: false,
            store_capacity: DEFAULT_CAPACITY,
            gate: GateConfig::default(),
            refinement_enabled: false,
            refine_max_tokens: DEFAULT_MAX_TOKENS,
            media_link_template: DEFAULT_MEDIA_LINK_TEMPLATE.to_string(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("require_signature", &self.require_signature)
            .field("allow_anchor_decrypt", &self.allow_anchor_decrypt)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("encrypt_anchors", &self.encrypt_anchors)
            .field("store_capacity", &self.store_capacity)
            .field("gate", &self.gate)
            .field("refinement_enabled", &self.refinement_enabled)
            .field("refine_max_tokens", &self.refine_max_tokens)
            .field("media_link_template", &self.media_link_template)
            .finish()
    }
}

impl EngineConfig {
    /// Parse and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_require_signature(mut self, on: bool) -> Self {
        self.require_signature = on;
        self
    }

    pub fn with_anchor_decrypt(mut self, on: bool) -> Self {
        self.allow_anchor_decrypt = on;
        self
    }

    pub fn with_encrypt_anchors(mut self, on: bool) -> Self {
        self.encrypt_anchors = on;
        self
    }

    pub fn with_store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_refinement(mut self, on: bool) -> Self {
        self.refinement_enabled = on;
        self
    }

    /// Non-empty passphrase, if configured.
    pub fn secret(&self) -> Option<&str> {
        self.passphrase.as_deref().filter(|p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_capacity == 0 {
            return Err(Error::Validation("store_capacity must be positive".into()));
        }
        if self.refine_max_tokens == 0 {
            return Err(Error::Validation("refine_max_tokens must be positive".into()));
        }
        if self.require_signature && self.secret().is_none() {
            return Err(Error::Validation("require_signature needs a passphrase".into()));
        }
        if self.encrypt_anchors && self.secret().is_none() {
            return Err(Error::Validation("encrypt_anchors needs a passphrase".into()));
        }
        if !self.media_link_template.contains("{id}") {
            return Err(Error::Validation("media_link_template must contain {id}".into()));
        }
        self.gate.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let c = EngineConfig::from_json(
            r#"{"require_signature": true, "passphrase": "s3cret", "gate": {"max_edits": 1}}"#,
        )
        .unwrap();
        assert!(c.require_signature);
        assert_eq!(c.gate.max_edits, 1);
        assert_eq!(c.gate.min_tokens, GateConfig::default().min_tokens);
        assert_eq!(c.store_capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"requre_signature": true}"#),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_require_signature_needs_secret() {
        let c = EngineConfig::default().with_require_signature(true);
        assert!(matches!(c.validate(), Err(Error::Validation(_))));
        assert!(c.with_passphrase("pw").validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let c = EngineConfig::default().with_passphrase("hunter2");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }
}
