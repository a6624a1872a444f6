//! # Crypto Envelope
//!
//! Canonical serialization, content addressing and packet signatures.
//! Anchor encryption lives in [`anchor`].
//!
//! ```text
//! Packet ──strip sig──► sorted-key compact JSON ──► canonical bytes
//!                                                     ├─► SHA-256 hex   (shape key)
//!                                                     └─► HMAC-SHA256   (sig.hmac, base64)
//! ```
//!
//! Verification fails closed: a missing or mismatching signature is never
//! treated as valid.

pub mod anchor;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{Packet, Signature, SIGNATURE_ALG};
use crate::{Error, Result};

pub use anchor::{decrypt_anchor, derive_key, encrypt_anchor, open_constellation, seal_constellation};

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Canonical form
// ============================================================================

/// Rebuild every object with lexicographically sorted keys.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// JSON tree parsed back from the serialized text, so `f32` fields keep
/// their shortest wire form (`0.1`, not `0.10000000149011612`).
fn wire_tree<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::from_slice(&serde_json::to_vec(value)?)?)
}

/// Sorted-key compact JSON of any serializable value.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let tree = sort_keys(wire_tree(value)?);
    Ok(serde_json::to_vec(&tree)?)
}

/// Canonical packet bytes: `sig` removed, sorted keys, no whitespace.
pub fn canonical_bytes(packet: &Packet) -> Result<Vec<u8>> {
    let mut tree = wire_tree(packet)?;
    if let Value::Object(map) = &mut tree {
        map.remove("sig");
    }
    Ok(serde_json::to_vec(&sort_keys(tree))?)
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Content hash of a packet (signature excluded).
pub fn content_hash(packet: &Packet) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(packet)?))
}

// ============================================================================
// HMAC signatures
// ============================================================================

fn mac(passphrase: &str) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(passphrase.as_bytes())
        .map_err(|e| Error::Crypto(format!("hmac key rejected: {e}")))
}

/// Base64 HMAC-SHA256 of `bytes`.
pub fn sign_bytes(bytes: &[u8], passphrase: &str) -> Result<String> {
    let mut m = mac(passphrase)?;
    m.update(bytes);
    Ok(BASE64.encode(m.finalize().into_bytes()))
}

/// Constant-time check of a base64 HMAC. Undecodable tags are invalid.
pub fn verify_bytes(bytes: &[u8], tag_b64: &str, passphrase: &str) -> bool {
    let Ok(tag) = BASE64.decode(tag_b64) else {
        return false;
    };
    let Ok(mut m) = mac(passphrase) else {
        return false;
    };
    m.update(bytes);
    m.verify_slice(&tag).is_ok()
}

/// Sign in place, replacing any existing signature.
pub fn sign_packet(packet: &mut Packet, passphrase: &str) -> Result<()> {
    let bytes = canonical_bytes(packet)?;
    packet.sig = Some(Signature {
        alg: SIGNATURE_ALG.to_string(),
        hmac: sign_bytes(&bytes, passphrase)?,
    });
    Ok(())
}

/// `Ok(false)` when unsigned, signed with another algorithm, or mismatching.
pub fn verify_packet(packet: &Packet, passphrase: &str) -> Result<bool> {
    let Some(sig) = &packet.sig else {
        return Ok(false);
    };
    if sig.alg != SIGNATURE_ALG {
        return Ok(false);
    }
    let bytes = canonical_bytes(packet)?;
    Ok(verify_bytes(&bytes, &sig.hmac, passphrase))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Constellation, SuperNode};

    fn packet() -> Packet {
        Packet::new("docs", "text")
            .with_meta("zeta", 1)
            .with_meta("alpha", "first")
            .with_supernode(SuperNode::new(
                "sn0",
                vec![Constellation::new("c0", vec![0.6, 0.8], (0.1, 0.9), vec![0.5, 0.5])],
            ))
    }

    #[test]
    fn test_canonical_bytes_sorted_and_compact() {
        let bytes = canonical_bytes(&packet()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains(' '));
        assert!(!text.contains('\n'));
        let alpha = text.find("\"alpha\"").unwrap();
        let zeta = text.find("\"zeta\"").unwrap();
        assert!(alpha < zeta);
        assert!(text.starts_with("{\"meta\""));
    }

    #[test]
    fn test_canonical_keeps_short_float_text() {
        let text = String::from_utf8(canonical_bytes(&packet()).unwrap()).unwrap();
        assert!(text.contains("\"radial_minmax\":[0.1,0.9]"), "{text}");
        assert!(text.contains("\"anchor\":[0.6,0.8]"), "{text}");
    }

    #[test]
    fn test_canonical_ignores_signature() {
        let unsigned = packet();
        let mut signed = packet();
        sign_packet(&mut signed, "secret").unwrap();
        assert_eq!(canonical_bytes(&unsigned).unwrap(), canonical_bytes(&signed).unwrap());
        assert_eq!(content_hash(&unsigned).unwrap(), content_hash(&signed).unwrap());
    }

    #[test]
    fn test_sign_then_verify() {
        let mut p = packet();
        sign_packet(&mut p, "secret").unwrap();
        assert!(verify_packet(&p, "secret").unwrap());
        assert!(!verify_packet(&p, "other").unwrap());
    }

    #[test]
    fn test_tampered_packet_fails_verification() {
        let mut p = packet();
        sign_packet(&mut p, "secret").unwrap();
        p.supernodes[0].constellations[0].spectrum = vec![0.4, 0.6];
        assert!(!verify_packet(&p, "secret").unwrap());
    }

    #[test]
    fn test_unsigned_and_garbage_tags_are_invalid() {
        assert!(!verify_packet(&packet(), "secret").unwrap());
        assert!(!verify_bytes(b"abc", "not base64!!", "secret"));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
