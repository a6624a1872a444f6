//! Anchor encryption: scrypt key derivation + AES-256-GCM.
//!
//! The constellation id is bound as associated data, so a sealed anchor
//! moved onto another constellation fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::model::{Constellation, EncryptedAnchor};
use crate::{Error, Result};

/// scrypt cost: N = 2^14.
pub const SCRYPT_LOG_N: u8 = 14;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;

/// 256-bit key from `passphrase` and `salt`.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| Error::Crypto(format!("scrypt params: {e}")))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut key)
        .map_err(|e| Error::Crypto(format!("scrypt: {e}")))?;
    Ok(key)
}

fn cipher(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| Error::Crypto(format!("aes key: {e}")))
}

fn encode_floats(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_floats(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Crypto(format!(
            "anchor plaintext length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| Error::Crypto(format!("anchor_enc.{name} is not base64: {e}")))
}

/// Seal `anchor` for `constellation_id` under a fresh salt and IV.
pub fn encrypt_anchor(anchor: &[f32], passphrase: &str, constellation_id: &str) -> Result<EncryptedAnchor> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt)?;
    let plaintext = encode_floats(anchor);
    let ciphertext = cipher(&key)?
        .encrypt(
            Nonce::from_slice(&iv),
            Payload { msg: &plaintext, aad: constellation_id.as_bytes() },
        )
        .map_err(|_| Error::Crypto("anchor encryption failed".into()))?;

    Ok(EncryptedAnchor {
        iv: BASE64.encode(iv),
        salt: BASE64.encode(salt),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open a sealed anchor. Any tag mismatch is an error; no partial plaintext.
pub fn decrypt_anchor(enc: &EncryptedAnchor, passphrase: &str, constellation_id: &str) -> Result<Vec<f32>> {
    let iv = decode_field("iv", &enc.iv)?;
    let salt = decode_field("salt", &enc.salt)?;
    let ciphertext = decode_field("ciphertext", &enc.ciphertext)?;
    if iv.len() != IV_LEN {
        return Err(Error::Crypto(format!("anchor_enc.iv must be {IV_LEN} bytes, got {}", iv.len())));
    }

    let key = derive_key(passphrase, &salt)?;
    let plaintext = cipher(&key)?
        .decrypt(
            Nonce::from_slice(&iv),
            Payload { msg: &ciphertext, aad: constellation_id.as_bytes() },
        )
        .map_err(|_| Error::Crypto(format!("anchor authentication failed for constellation {constellation_id}")))?;
    decode_floats(&plaintext)
}

/// Replace a plain anchor with its sealed form. Already-sealed is a no-op.
pub fn seal_constellation(c: &mut Constellation, passphrase: &str) -> Result<()> {
    if let Some(anchor) = c.anchor.take() {
        match encrypt_anchor(&anchor, passphrase, &c.id) {
            Ok(enc) => c.anchor_enc = Some(enc),
            Err(e) => {
                c.anchor = Some(anchor);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Working copy with a plain anchor. Plain constellations are cloned as-is.
pub fn open_constellation(c: &Constellation, passphrase: &str) -> Result<Constellation> {
    let mut copy = c.clone();
    if let Some(enc) = copy.anchor_enc.take() {
        copy.anchor = Some(decrypt_anchor(&enc, passphrase, &c.id)?);
    }
    Ok(copy)
}
