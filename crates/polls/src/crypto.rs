//! At-rest encryption of provider tokens.
//!
//! Sealed values are `base64([nonce: 24 bytes][ciphertext + tag])`.

#[allow(deprecated)] // upstream generic-array 0.x deprecation
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use {
    base64::{Engine, engine::general_purpose::STANDARD},
    rand::RngCore,
    secrecy::{ExposeSecret, Secret},
};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Symmetric cipher for credential columns.
pub struct TokenCipher {
    key: Secret<[u8; 32]>,
}

impl TokenCipher {
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Secret::new(key),
        }
    }

    /// Build from a base64 encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::external("token key is not base64", e))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| Error::Crypto {
            message: "token key must be 32 bytes".into(),
        })?;
        Ok(Self::new(key))
    }

    /// Cipher with a random key, valid for this process only.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Encrypt `plaintext`, binding it to `context` (e.g. the streamer id).
    #[allow(deprecated)]
    pub fn seal(&self, plaintext: &str, context: &str) -> Result<String> {
        let cipher = XChaCha20Poly1305::new(self.key.expose_secret().into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), Payload {
                msg: plaintext.as_bytes(),
                aad: context.as_bytes(),
            })
            .map_err(|e| Error::Crypto {
                message: e.to_string(),
            })?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    #[allow(deprecated)]
    pub fn open(&self, sealed: &str, context: &str) -> Result<Secret<String>> {
        let blob = STANDARD.decode(sealed).map_err(|e| Error::Crypto {
            message: format!("sealed token is not base64: {e}"),
        })?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto {
                message: "sealed token too short".into(),
            });
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(self.key.expose_secret().into());
        let plain = cipher
            .decrypt(XNonce::from_slice(nonce), Payload {
                msg: ciphertext,
                aad: context.as_bytes(),
            })
            .map_err(|_| Error::Crypto {
                message: "token decryption failed".into(),
            })?;
        String::from_utf8(plain)
            .map(Secret::new)
            .map_err(|_| Error::Crypto {
                message: "decrypted token is not utf-8".into(),
            })
    }
}
