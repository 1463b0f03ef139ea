//! One-shot asymmetric encryption for sensitive LRPC2 arguments.
//!
//! Message payloads are not encrypted at rest on the wire, so arguments
//! that carry secrets (e.g. passwords) are RSA-OAEP encrypted against the
//! peer's public key before being placed in the payload. Plaintexts larger
//! than one OAEP block are split into chunks that are encrypted
//! independently and reassembled in order on decryption.

use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{ProtocolError, Result};

// 1024-bit RSA key for wire compatibility with the native agent.
const KEY_SIZE_BITS: usize = 1024;

enum KeyState {
    Ready { key: RsaPrivateKey, key_id: u32 },
    Failed(String),
}

/// Owns the process-wide key pair used to protect sensitive LRPC2
/// arguments. Construct one at process start and share it by reference.
///
/// The key pair is generated lazily on first use, under a lock so that
/// concurrent callers observe exactly one generation. A generation
/// failure is cached and replayed on every subsequent call; the key is
/// never rotated within a process lifetime.
pub struct SecureMessenger {
    key_store: Mutex<Option<KeyState>>,
}

impl SecureMessenger {
    pub fn new() -> Self {
        Self {
            key_store: Mutex::new(None),
        }
    }

    /// Returns the public half of the key pair and its key ID, generating
    /// the pair on first call.
    pub fn public_key(&self) -> Result<(RsaPublicKey, u32)> {
        let (key, key_id) = self.private_key()?;
        Ok((key.to_public_key(), key_id))
    }

    /// Decrypts a slice of base64-encoded OAEP chunks into a single
    /// string. The label must match the one used at encryption time; any
    /// chunk that fails to decode or decrypt aborts the whole operation.
    pub fn decrypt_string(&self, ciphers: &[String], label: &str) -> Result<String> {
        let (key, _) = self.private_key()?;

        let mut plain = Vec::new();
        for cipher_text in ciphers {
            let cipher = BASE64.decode(cipher_text)?;
            let padding = Oaep::new_with_label::<Sha256, _>(label);
            let chunk = key.decrypt(padding, &cipher)?;
            plain.extend_from_slice(&chunk);
        }

        String::from_utf8(plain).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Returns a clone of the private key, lazily generating the key pair
    /// on first call. Cloning keeps the lock scope away from the actual
    /// crypto operations.
    fn private_key(&self) -> Result<(RsaPrivateKey, u32)> {
        let mut store = self
            .key_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if store.is_none() {
            *store = Some(match generate_key() {
                Ok((key, key_id)) => KeyState::Ready { key, key_id },
                Err(e) => {
                    debug!("LRPC2 key pair generation failed: {}", e);
                    KeyState::Failed(e.to_string())
                }
            });
        }

        match store.as_ref() {
            Some(KeyState::Ready { key, key_id }) => Ok((key.clone(), *key_id)),
            Some(KeyState::Failed(msg)) => Err(ProtocolError::KeyGeneration(msg.clone())),
            None => unreachable!(),
        }
    }
}

impl Default for SecureMessenger {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_key() -> std::result::Result<(RsaPrivateKey, u32), rsa::Error> {
    let mut key = RsaPrivateKey::new(&mut OsRng, KEY_SIZE_BITS)?;
    key.precompute()?;
    Ok((key, rand::random::<u32>()))
}

/// Maximum plaintext bytes per OAEP block for the given key. Derived from
/// the key size and the digest overhead rather than hard-coded, so a key
/// size change cannot silently corrupt chunking.
fn max_chunk_len(pub_key: &RsaPublicKey) -> usize {
    pub_key.size() - 2 * <Sha256 as Digest>::output_size() - 2
}

/// Encrypts a payload against the given public key, chunking it to fit
/// the OAEP block size. Each chunk is independently encrypted and
/// base64-encoded; the chunks must be decrypted in the returned order.
/// An empty payload still produces exactly one chunk.
///
/// The label binds the ciphertext to a semantic use (e.g. the caller's
/// user identity); decryption with a different label fails.
pub fn encrypt_string(
    payload: &str,
    label: &str,
    pub_key: &RsaPublicKey,
) -> Result<Vec<String>> {
    let limit = max_chunk_len(pub_key);
    let src = payload.as_bytes();

    let chunks = if src.is_empty() {
        1
    } else {
        (src.len() - 1) / limit + 1
    };

    let mut ret = Vec::with_capacity(chunks);
    let mut index = 0;
    for _ in 0..chunks {
        let end = usize::min(index + limit, src.len());
        let padding = Oaep::new_with_label::<Sha256, _>(label);
        let cipher = pub_key.encrypt(&mut OsRng, padding, &src[index..end])?;
        ret.push(BASE64.encode(cipher));
        index = end;
    }

    Ok(ret)
}
