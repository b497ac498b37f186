// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Authenticated encryption of exported batches.
//!
//! # Algorithms
//!
//! - **Encryption**: AES-256-GCM for the legacy format, ChaCha20-Poly1305
//!   for the salted format (both 12-byte nonce, 16-byte tag)
//! - **Key Derivation**: Argon2id over (password, random salt) for the
//!   salted format; password bytes padded with spaces to 32 bytes for the
//!   legacy format
//!
//! # Container Layouts
//!
//! ```text
//! Legacy:
//!   [0..12)   nonce
//!   [12..28)  tag
//!   [28..)    ciphertext
//!
//! Salted:
//!   [0..4)    magic "PMC" + version 0x02
//!   [4..8)    argon2 memory (KiB, u32 LE)
//!   [8..12)   argon2 iterations (u32 LE)
//!   [12..16)  argon2 parallelism (u32 LE)
//!   [16..32)  salt
//!   [32..44)  nonce
//!   [44..60)  tag
//!   [60..)    ciphertext
//! ```
//!
//! In the salted layout bytes `[0..32)` are bound as associated data, so a
//! modified header fails authentication the same way a modified ciphertext
//! does. Every seal draws a fresh nonce (and salt) from the OS RNG.
//!
//! Decryption verifies the tag before returning anything. A wrong password,
//! a tampered file, a truncated file and an unusable header all surface as
//! [`ReplicationError::InvalidPassword`].

use crate::error::{ReplicationError, Result};
use crate::record::BatchEntry;
use argon2::{Algorithm, Argon2, Params, Version};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::consts::{U12, U16};
use chacha20poly1305::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Key length (256 bits).
pub const KEY_LEN: usize = 32;

/// Nonce length for both AEADs.
pub const NONCE_LEN: usize = 12;

/// Authentication tag length.
pub const TAG_LEN: usize = 16;

/// Salt length for key derivation.
pub const SALT_LEN: usize = 16;

/// Magic prefix of the salted container.
pub const SALTED_MAGIC: [u8; 4] = [b'P', b'M', b'C', 0x02];

/// Bytes before the nonce in the salted container.
pub const SALTED_HEADER_LEN: usize = 4 + 3 * 4 + SALT_LEN;

/// Upper bounds on Argon2 cost, checked before deriving a key from a file
/// header and before sealing.
pub const MAX_MEMORY_KIB: u32 = 1 << 17; // 128 MB
pub const MAX_ITERATIONS: u32 = 8;
pub const MAX_PARALLELISM: u32 = 8;

/// Container format written by an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// `nonce || tag || ciphertext`, key = padded password.
    Legacy,
    /// Versioned header with Argon2id parameters and salt.
    #[default]
    Salted,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536, // 64 MB
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Smallest parameters Argon2 accepts.
    pub fn for_testing() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    pub fn within_bounds(&self) -> bool {
        self.memory_kib <= MAX_MEMORY_KIB
            && (1..=MAX_ITERATIONS).contains(&self.iterations)
            && (1..=MAX_PARALLELISM).contains(&self.parallelism)
    }
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Legacy key: UTF-8 password bytes, truncated or space-padded to 32 bytes.
pub fn legacy_key(password: &str) -> [u8; KEY_LEN] {
    let mut key = [b' '; KEY_LEN];
    let bytes = password.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Derive a 256-bit key from a password using Argon2id.
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| ReplicationError::KeyDerivation(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| ReplicationError::KeyDerivation(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Identify the container format of a sealed file.
pub fn detect_format(sealed: &[u8]) -> ContainerFormat {
    if sealed.len() >= SALTED_HEADER_LEN + NONCE_LEN + TAG_LEN && sealed[..4] == SALTED_MAGIC {
        ContainerFormat::Salted
    } else {
        ContainerFormat::Legacy
    }
}

// =============================================================================
// BatchCodec
// =============================================================================

/// Seals and opens batch files.
#[derive(Debug, Clone)]
pub struct BatchCodec {
    format: ContainerFormat,
    kdf: KdfParams,
}

impl BatchCodec {
    pub fn new(format: ContainerFormat, kdf: KdfParams) -> Self {
        Self { format, kdf }
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// Encrypt plaintext under the configured format.
    pub fn seal(&self, plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
        match self.format {
            ContainerFormat::Legacy => seal_legacy(plaintext, password),
            ContainerFormat::Salted => seal_salted(plaintext, password, &self.kdf),
        }
    }

    /// Decrypt a container of either format.
    pub fn open(&self, sealed: &[u8], password: &str) -> Result<Vec<u8>> {
        match detect_format(sealed) {
            ContainerFormat::Salted => open_salted(sealed, password),
            ContainerFormat::Legacy => open_legacy(sealed, password),
        }
    }

    /// Serialize a batch to a JSON array and seal it.
    pub fn seal_batch(&self, entries: &[BatchEntry], password: &str) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(entries)?;
        self.seal(&plaintext, password)
    }

    /// Open a batch and return its array elements unparsed, so one bad
    /// element cannot reject the others.
    pub fn open_batch(&self, sealed: &[u8], password: &str) -> Result<Vec<Value>> {
        let plaintext = self.open(sealed, password)?;
        match serde_json::from_slice::<Value>(&plaintext)? {
            Value::Array(items) => Ok(items),
            _ => Err(ReplicationError::MalformedContainer(
                "payload is not a JSON array".to_string(),
            )),
        }
    }
}

fn encrypt<C>(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<(Tag<C>, Vec<u8>)>
where
    C: KeyInit + AeadInPlace<NonceSize = U12, TagSize = U16>,
{
    let cipher = C::new_from_slice(key).map_err(|e| ReplicationError::Internal(format!("Bad key length: {e}")))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<C>::from_slice(nonce), aad, &mut buffer)
        .map_err(|e| ReplicationError::Internal(format!("Encryption failed: {e}")))?;
    Ok((tag, buffer))
}

fn decrypt<C>(key: &[u8; KEY_LEN], nonce: &[u8], aad: &[u8], tag: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: KeyInit + AeadInPlace<NonceSize = U12, TagSize = U16>,
{
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(ReplicationError::InvalidPassword);
    }
    let cipher = C::new_from_slice(key).map_err(|e| ReplicationError::Internal(format!("Bad key length: {e}")))?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::<C>::from_slice(nonce), aad, &mut buffer, Tag::<C>::from_slice(tag))
        .map_err(|_| ReplicationError::InvalidPassword)?;
    Ok(buffer)
}

fn seal_legacy(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let key = legacy_key(password);
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let (tag, ciphertext) = encrypt::<Aes256Gcm>(&key, &nonce, &[], plaintext)?;

    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// A container that cannot be authenticated, for a reason other than the tag.
fn unauthenticated(reason: std::fmt::Arguments<'_>) -> ReplicationError {
    debug!(%reason, "Container rejected before decryption");
    ReplicationError::InvalidPassword
}

fn open_legacy(sealed: &[u8], password: &str) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(unauthenticated(format_args!(
            "{} bytes is shorter than nonce and tag",
            sealed.len()
        )));
    }
    let (nonce, rest) = sealed.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    decrypt::<Aes256Gcm>(&legacy_key(password), nonce, &[], tag, ciphertext)
}

fn seal_salted(plaintext: &[u8], password: &str, kdf: &KdfParams) -> Result<Vec<u8>> {
    if !kdf.within_bounds() {
        return Err(ReplicationError::Config(format!(
            "key derivation parameters exceed what an import accepts: {kdf:?}"
        )));
    }
    let salt: [u8; SALT_LEN] = random_bytes();
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let key = derive_key(password, &salt, kdf)?;

    let mut out = Vec::with_capacity(SALTED_HEADER_LEN + NONCE_LEN + TAG_LEN + plaintext.len());
    out.extend_from_slice(&SALTED_MAGIC);
    out.extend_from_slice(&kdf.memory_kib.to_le_bytes());
    out.extend_from_slice(&kdf.iterations.to_le_bytes());
    out.extend_from_slice(&kdf.parallelism.to_le_bytes());
    out.extend_from_slice(&salt);

    let (tag, ciphertext) = encrypt::<ChaCha20Poly1305>(&key, &nonce, &out[..SALTED_HEADER_LEN], plaintext)?;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn open_salted(sealed: &[u8], password: &str) -> Result<Vec<u8>> {
    if sealed.len() < SALTED_HEADER_LEN + NONCE_LEN + TAG_LEN {
        return Err(unauthenticated(format_args!(
            "{} bytes is shorter than the salted header",
            sealed.len()
        )));
    }

    let kdf = KdfParams {
        memory_kib: read_u32(sealed, 4),
        iterations: read_u32(sealed, 8),
        parallelism: read_u32(sealed, 12),
    };
    if !kdf.within_bounds() {
        return Err(unauthenticated(format_args!("key derivation parameters out of range: {kdf:?}")));
    }

    let (header, rest) = sealed.split_at(SALTED_HEADER_LEN);
    let salt = &header[16..];
    let (nonce, rest) = rest.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    // the header is authenticated, so parameters Argon2 refuses mean a
    // modified header
    let key = derive_key(password, salt, &kdf).map_err(|e| unauthenticated(format_args!("{e}")))?;
    decrypt::<ChaCha20Poly1305>(&key, nonce, header, tag, ciphertext)
}
