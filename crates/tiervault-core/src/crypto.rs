//! Cryptographic primitives for `tiervault`.
//!
//! Provides the per-level algorithm table, scrypt key derivation, the
//! integrity checksum, and detached-tag cipher helpers for every supported
//! algorithm. All key material is zeroized when dropped.
//!
//! # Security model
//!
//! - Every encryption uses a fresh 16-byte IV and 32-byte salt from `OsRng`.
//! - AES-GCM runs with a 16-byte nonce; ChaCha20-Poly1305 consumes the first
//!   12 bytes of the IV. The full IV is bound by the checksum either way.
//! - AES-128 variants key the cipher with the first 16 bytes of the derived
//!   key; the checksum covers the full derived key.
//! - The checksum is `SHA256(ciphertext || derived_key || iv)` and is
//!   compared in constant time.

use std::fmt;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::typenum::Unsigned;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, Nonce, Tag};
use aes_gcm::AesGcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::metadata::SecurityLevel;

/// IV length stored for every algorithm.
pub const IV_LEN: usize = 16;

/// Salt length for key derivation.
pub const SALT_LEN: usize = 32;

/// Detached AEAD tag length.
pub const TAG_LEN: usize = 16;

/// Hex length of a SHA-256 checksum.
pub const CHECKSUM_HEX_LEN: usize = 64;

type Aes128Cbc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256Cbc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128Gcm16 = AesGcm<aes_gcm::aes::Aes128, U16>;
type Aes256Gcm16 = AesGcm<aes_gcm::aes::Aes256, U16>;

/// The 256-bit root secret every per-secret key is derived from.
///
/// Never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a key from 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Validation`] if the input is not exactly 32
    /// bytes of hex.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(hex::decode(encoded.trim()).map_err(|e| {
            CryptoError::Validation {
                reason: format!("master key is not valid hex: {e}"),
            }
        })?);
        let bytes: [u8; 32] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::Validation {
                    reason: format!("master key must be 32 bytes, got {}", decoded.len()),
                })?;
        Ok(Self(bytes))
    }

    /// Borrow the raw key bytes. Never log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-secret key produced by [`derive_key`]. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey(Vec<u8>);

impl DerivedKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("len", &self.0.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Cipher used for a payload. Chosen from the security level, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    /// Fixed selection table.
    #[must_use]
    pub fn for_level(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Public => Self::Aes128Cbc,
            SecurityLevel::Internal => Self::Aes256Cbc,
            SecurityLevel::Confidential => Self::Aes128Gcm,
            SecurityLevel::Secret => Self::Aes256Gcm,
            SecurityLevel::TopSecret => Self::ChaCha20Poly1305,
        }
    }

    /// Inverse of [`for_level`](Self::for_level).
    #[must_use]
    pub fn security_level(self) -> SecurityLevel {
        match self {
            Self::Aes128Cbc => SecurityLevel::Public,
            Self::Aes256Cbc => SecurityLevel::Internal,
            Self::Aes128Gcm => SecurityLevel::Confidential,
            Self::Aes256Gcm => SecurityLevel::Secret,
            Self::ChaCha20Poly1305 => SecurityLevel::TopSecret,
        }
    }

    /// Whether the algorithm produces an authentication tag.
    #[must_use]
    pub fn is_aead(self) -> bool {
        !matches!(self, Self::Aes128Cbc | Self::Aes256Cbc)
    }

    /// Derived key length in bytes for payloads under this algorithm.
    #[must_use]
    pub fn key_size(self) -> usize {
        derived_key_len(self.security_level())
    }

    /// Number of key bytes the cipher itself consumes.
    #[must_use]
    pub fn cipher_key_len(self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes128Gcm => 16,
            Self::Aes256Cbc | Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    /// Wire name (`aes-256-gcm`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "aes-128-cbc",
            Self::Aes256Cbc => "aes-256-cbc",
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived key length for a level: 16 bytes for public, 32 otherwise.
#[must_use]
pub fn derived_key_len(level: SecurityLevel) -> usize {
    if level == SecurityLevel::Public { 16 } else { 32 }
}

/// Key-derivation function recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDerivation {
    #[default]
    Scrypt,
}

/// scrypt cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// log2 of the CPU/memory cost `N`.
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            log_n: 14,
            r: 8,
            p: 1,
        }
    }
}

/// Derive the per-secret key with scrypt.
///
/// The password is the master key and the salt is the UTF-8 string
/// `"{key_id}:{level}:{salt_hex}"`. Pure and CPU-bound; async callers should
/// run it on the blocking pool.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the scrypt parameters are
/// rejected.
pub fn derive_key(
    master: &MasterKey,
    key_id: &str,
    level: SecurityLevel,
    salt_hex: &str,
    params: KdfParams,
) -> Result<DerivedKey, CryptoError> {
    let len = derived_key_len(level);
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, len).map_err(|e| {
        CryptoError::KeyDerivation {
            key_id: key_id.to_owned(),
            reason: e.to_string(),
        }
    })?;

    let salt = format!("{key_id}:{level}:{salt_hex}");
    let mut output = vec![0u8; len];
    scrypt::scrypt(master.as_bytes(), salt.as_bytes(), &scrypt_params, &mut output).map_err(
        |e| CryptoError::KeyDerivation {
            key_id: key_id.to_owned(),
            reason: e.to_string(),
        },
    )?;

    Ok(DerivedKey(output))
}

/// Fill a fresh random buffer of `len` bytes.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// `SHA256(ciphertext || key || iv)` as lowercase hex.
#[must_use]
pub fn checksum(ciphertext: &[u8], key: &DerivedKey, iv: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ciphertext);
    hasher.update(key.as_bytes());
    hasher.update(iv);
    hex::encode(hasher.finalize())
}

/// Compare a recomputed checksum against the stored hex in constant time.
#[must_use]
pub fn checksum_matches(computed_hex: &str, stored_hex: &str) -> bool {
    match (hex::decode(computed_hex), hex::decode(stored_hex)) {
        (Ok(computed), Ok(stored)) => computed.ct_eq(&stored).into(),
        _ => false,
    }
}

/// Output of [`seal`].
#[derive(Debug)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    /// Present for AEAD algorithms only.
    pub tag: Option<Vec<u8>>,
}

/// Encrypt `plaintext` under `algorithm`.
///
/// `aad` is bound for AEAD algorithms and ignored for CBC.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the key or IV has the wrong
/// length or the cipher fails.
pub fn seal(
    algorithm: EncryptionAlgorithm,
    key: &DerivedKey,
    iv: &[u8],
    aad: Option<&[u8]>,
    plaintext: &[u8],
) -> Result<Sealed, CryptoError> {
    let cipher_key = cipher_key(algorithm, key).map_err(|reason| CryptoError::Encryption { reason })?;
    let aad = aad.unwrap_or_default();

    match algorithm {
        EncryptionAlgorithm::Aes128Cbc => {
            let enc = Aes128Cbc::new_from_slices(cipher_key, iv).map_err(encryption_err)?;
            Ok(Sealed {
                ciphertext: enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
                tag: None,
            })
        }
        EncryptionAlgorithm::Aes256Cbc => {
            let enc = Aes256Cbc::new_from_slices(cipher_key, iv).map_err(encryption_err)?;
            Ok(Sealed {
                ciphertext: enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
                tag: None,
            })
        }
        EncryptionAlgorithm::Aes128Gcm => seal_aead::<Aes128Gcm16>(cipher_key, iv, aad, plaintext),
        EncryptionAlgorithm::Aes256Gcm => seal_aead::<Aes256Gcm16>(cipher_key, iv, aad, plaintext),
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            seal_aead::<ChaCha20Poly1305>(cipher_key, chacha_nonce(iv), aad, plaintext)
        }
    }
}

/// Decrypt `ciphertext` under `algorithm`.
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] on bad padding, a bad or missing
/// tag, or a wrong-length key or IV.
pub fn open(
    algorithm: EncryptionAlgorithm,
    key: &DerivedKey,
    iv: &[u8],
    tag: Option<&[u8]>,
    aad: Option<&[u8]>,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = cipher_key(algorithm, key).map_err(|reason| CryptoError::Decryption { reason })?;
    let aad = aad.unwrap_or_default();

    match algorithm {
        EncryptionAlgorithm::Aes128Cbc => Aes128CbcDec::new_from_slices(cipher_key, iv)
            .map_err(decryption_err)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(decryption_err),
        EncryptionAlgorithm::Aes256Cbc => Aes256CbcDec::new_from_slices(cipher_key, iv)
            .map_err(decryption_err)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(decryption_err),
        EncryptionAlgorithm::Aes128Gcm => {
            open_aead::<Aes128Gcm16>(cipher_key, iv, require_tag(tag)?, aad, ciphertext)
        }
        EncryptionAlgorithm::Aes256Gcm => {
            open_aead::<Aes256Gcm16>(cipher_key, iv, require_tag(tag)?, aad, ciphertext)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => open_aead::<ChaCha20Poly1305>(
            cipher_key,
            chacha_nonce(iv),
            require_tag(tag)?,
            aad,
            ciphertext,
        ),
    }
}

fn cipher_key(algorithm: EncryptionAlgorithm, key: &DerivedKey) -> Result<&[u8], String> {
    key.as_bytes()
        .get(..algorithm.cipher_key_len())
        .ok_or_else(|| {
            format!(
                "{algorithm} needs a {}-byte key, got {}",
                algorithm.cipher_key_len(),
                key.as_bytes().len()
            )
        })
}

fn chacha_nonce(iv: &[u8]) -> &[u8] {
    iv.get(..12).unwrap_or(iv)
}

fn require_tag(tag: Option<&[u8]>) -> Result<&[u8], CryptoError> {
    tag.ok_or_else(|| CryptoError::Decryption {
        reason: "authentication tag missing".to_owned(),
    })
}

fn seal_aead<C>(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Sealed, CryptoError>
where
    C: AeadInPlace + KeyInit,
{
    if nonce.len() != <C as AeadCore>::NonceSize::USIZE {
        return Err(CryptoError::Encryption {
            reason: format!("nonce must be {} bytes", <C as AeadCore>::NonceSize::USIZE),
        });
    }
    let cipher = C::new_from_slice(key).map_err(encryption_err)?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<C>::from_slice(nonce), aad, &mut buffer)
        .map_err(encryption_err)?;
    Ok(Sealed {
        ciphertext: buffer,
        tag: Some(tag.to_vec()),
    })
}

fn open_aead<C>(
    key: &[u8],
    nonce: &[u8],
    tag: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError>
where
    C: AeadInPlace + KeyInit,
{
    if nonce.len() != <C as AeadCore>::NonceSize::USIZE {
        return Err(CryptoError::Decryption {
            reason: format!("nonce must be {} bytes", <C as AeadCore>::NonceSize::USIZE),
        });
    }
    if tag.len() != <C as AeadCore>::TagSize::USIZE {
        return Err(CryptoError::Decryption {
            reason: format!("tag must be {} bytes", <C as AeadCore>::TagSize::USIZE),
        });
    }
    let cipher = C::new_from_slice(key).map_err(decryption_err)?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::<C>::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::<C>::from_slice(tag),
        )
        .map_err(decryption_err)?;
    Ok(buffer)
}

#[allow(clippy::needless_pass_by_value)]
fn encryption_err(e: impl fmt::Display) -> CryptoError {
    CryptoError::Encryption {
        reason: e.to_string(),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn decryption_err(e: impl fmt::Display) -> CryptoError {
    CryptoError::Decryption {
        reason: e.to_string(),
    }
}
