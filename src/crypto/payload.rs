//! Payload encryption under a single DEK.
//!
//! ## Construction
//!
//! ```text
//! enc_key = HMAC-SHA256(dek, "gatekeeper:enc")
//! mac_key = HMAC-SHA256(dek, "gatekeeper:mac")
//! ct      = AES-256-CBC(enc_key, iv, PKCS#7(plaintext))      iv: 16 random bytes
//! tag     = HMAC-SHA256(mac_key, len(kid) || kid || iv || ct) len: u32 big-endian
//! ```
//!
//! The tag is verified in constant time before any decryption is attempted.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const DEK_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;

/// Self-describing ciphertext: everything needed to decrypt except the key.
///
/// Wire format: `{kid, iv, ct, tag}` with binary fields base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub kid: String,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ct: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> AppResult<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| AppError::Internal(format!("HMAC key rejected: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn subkeys(dek: &[u8; DEK_LEN]) -> AppResult<([u8; 32], [u8; 32])> {
    Ok((
        hmac(dek, &[b"gatekeeper:enc"])?,
        hmac(dek, &[b"gatekeeper:mac"])?,
    ))
}

fn compute_tag(mac_key: &[u8], kid: &str, iv: &[u8], ct: &[u8]) -> AppResult<[u8; TAG_LEN]> {
    // Length prefix keeps (kid, iv) boundaries unambiguous
    let kid_len = u32::try_from(kid.len())
        .map_err(|_| AppError::MalformedPayload("key id too long".to_string()))?
        .to_be_bytes();
    hmac(mac_key, &[&kid_len, kid.as_bytes(), iv, ct])
}

/// Encrypt `plaintext` under `dek`, tagging it with `kid`. A fresh IV is drawn
/// from the thread-local CSPRNG on every call.
pub fn seal(kid: &str, dek: &[u8; DEK_LEN], plaintext: &[u8]) -> AppResult<EncryptedPayload> {
    let (enc_key, mac_key) = subkeys(dek)?;

    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let ct = Aes256CbcEnc::new_from_slices(&enc_key, &iv)
        .map_err(|e| AppError::Internal(format!("cipher init failed: {e}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let tag = compute_tag(&mac_key, kid, &iv, &ct)?;

    Ok(EncryptedPayload {
        kid: kid.to_string(),
        iv: iv.to_vec(),
        ct,
        tag: tag.to_vec(),
    })
}

/// Authenticate and decrypt `payload` with `dek`.
///
/// # Errors
///
/// - `AuthenticationFailure` if the tag does not match. Nothing is decrypted.
/// - `MalformedPayload` if an authentic payload has a bad IV or padding.
pub fn open(dek: &[u8; DEK_LEN], payload: &EncryptedPayload) -> AppResult<Vec<u8>> {
    let (enc_key, mac_key) = subkeys(dek)?;

    let expected = compute_tag(&mac_key, &payload.kid, &payload.iv, &payload.ct)?;
    if !bool::from(expected.as_slice().ct_eq(payload.tag.as_slice())) {
        return Err(AppError::AuthenticationFailure);
    }

    let cipher = Aes256CbcDec::new_from_slices(&enc_key, &payload.iv)
        .map_err(|_| AppError::MalformedPayload(format!("IV must be {IV_LEN} bytes")))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&payload.ct)
        .map_err(|_| AppError::MalformedPayload("invalid padding".to_string()))
}

impl EncryptedPayload {
    /// Parse the JSON wire form.
    pub fn from_json(json: &str) -> AppResult<Self> {
        serde_json::from_str(json).map_err(|e| AppError::MalformedPayload(e.to_string()))
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Encode raw bytes with the payload's base64 alphabet.
pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_b64(encoded: &str) -> AppResult<Vec<u8>> {
    BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| AppError::BadRequest(format!("invalid base64: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const DEK: [u8; DEK_LEN] = [7u8; DEK_LEN];

    #[test]
    fn test_seal_open_round_trip() {
        for plaintext in [&b""[..], b"a", b"exactly sixteen!", &[0u8; 1000][..]] {
            let payload = seal("k1", &DEK, plaintext).unwrap();
            assert_eq!(payload.iv.len(), IV_LEN);
            assert_eq!(payload.tag.len(), TAG_LEN);
            assert_eq!(payload.ct.len() % 16, 0);
            assert_eq!(open(&DEK, &payload).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let a = seal("k1", &DEK, b"same").unwrap();
        let b = seal("k1", &DEK, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ct, b.ct);
    }

    #[test]
    fn test_bit_flips_fail_authentication() {
        let payload = seal("k1", &DEK, b"attack at dawn").unwrap();

        for field in 0..3 {
            let len = match field {
                0 => payload.ct.len(),
                1 => payload.iv.len(),
                _ => payload.tag.len(),
            };
            for byte in 0..len {
                for bit in 0..8 {
                    let mut tampered = payload.clone();
                    let target = match field {
                        0 => &mut tampered.ct,
                        1 => &mut tampered.iv,
                        _ => &mut tampered.tag,
                    };
                    target[byte] ^= 1 << bit;
                    assert!(matches!(
                        open(&DEK, &tampered),
                        Err(AppError::AuthenticationFailure)
                    ));
                }
            }
        }
    }

    #[test]
    fn test_kid_is_authenticated() {
        let mut payload = seal("k1", &DEK, b"data").unwrap();
        payload.kid = "k2".to_string();
        assert!(matches!(
            open(&DEK, &payload),
            Err(AppError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let payload = seal("k1", &DEK, b"data").unwrap();
        assert!(matches!(
            open(&[8u8; DEK_LEN], &payload),
            Err(AppError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_truncated_tag_fails_authentication() {
        let mut payload = seal("k1", &DEK, b"data").unwrap();
        payload.tag.truncate(16);
        assert!(matches!(
            open(&DEK, &payload),
            Err(AppError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_json_wire_format() {
        let payload = seal("k1", &DEK, b"data").unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();

        assert_eq!(json["kid"], "k1");
        for field in ["iv", "ct", "tag"] {
            let encoded = json[field].as_str().unwrap();
            assert!(BASE64.decode(encoded).is_ok());
        }

        let parsed = EncryptedPayload::from_json(&payload.to_json().unwrap()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let err = EncryptedPayload::from_json(r#"{"kid":"k","iv":"!!","ct":"","tag":""}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));
    }
}
