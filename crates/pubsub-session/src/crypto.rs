//! Payload encryption and publish signing.

use std::fmt::Write as _;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::types::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV: [u8; 16] = *b"0123456789012345";

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// AES-256-CBC payload cipher derived from a shared cipher key.
///
/// The AES key is the first 32 characters of the hex SHA-256 digest of the
/// cipher key; the IV is fixed. Ciphertext travels as base64 text.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; 32],
}

impl PayloadCipher {
    pub fn new(cipher_key: &str) -> Result<Self, Error> {
        if cipher_key.is_empty() {
            return Err(Error::Configuration("cipher key must not be empty".into()));
        }
        let digest = to_hex(&Sha256::digest(cipher_key.as_bytes()));
        let mut key = [0u8; 32];
        for (dst, src) in key.iter_mut().zip(digest.bytes()) {
            *dst = src;
        }
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &IV.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        BASE64.encode(ciphertext)
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, Error> {
        let ciphertext = BASE64
            .decode(encoded)
            .map_err(|e| Error::Serialization(format!("ciphertext is not base64: {e}")))?;
        let plaintext = Aes256CbcDec::new(&self.key.into(), &IV.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| Error::Serialization("payload failed to decrypt".into()))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Serialization(format!("decrypted payload is not UTF-8: {e}")))
    }

    /// Encrypt a JSON value into a JSON string value.
    pub fn seal(&self, value: &serde_json::Value) -> Result<serde_json::Value, Error> {
        let text = serde_json::to_string(value)?;
        Ok(serde_json::Value::String(self.encrypt(&text)))
    }

    /// Reverse of [`seal`](Self::seal).
    pub fn open(&self, value: &serde_json::Value) -> Result<serde_json::Value, Error> {
        let serde_json::Value::String(encoded) = value else {
            return Err(Error::Serialization(
                "encrypted payload must be a string".into(),
            ));
        };
        let text = self.decrypt(encoded)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(..)")
    }
}

/// Open `payload` with `cipher`, falling back to the raw payload when it does
/// not decrypt.
pub(crate) fn decode_payload(
    cipher: Option<&PayloadCipher>,
    payload: serde_json::Value,
) -> serde_json::Value {
    let Some(cipher) = cipher else {
        return payload;
    };
    match cipher.open(&payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Failed to decrypt payload: {e}");
            payload
        }
    }
}

/// Publish signature: hex HMAC-SHA256 over `pub/sub/secret/channel/message`,
/// or `"0"` when no secret key is configured.
pub(crate) fn sign_publish(
    publish_key: &str,
    subscribe_key: &str,
    secret_key: &str,
    channel: &str,
    message: &str,
) -> Result<String, Error> {
    if secret_key.is_empty() {
        return Ok("0".to_string());
    }
    let sign_text = format!("{publish_key}/{subscribe_key}/{secret_key}/{channel}/{message}");
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|e| Error::Configuration(format!("HMAC error: {e}")))?;
    mac.update(sign_text.as_bytes());
    Ok(to_hex(&mac.finalize().into_bytes()))
}
