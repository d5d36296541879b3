//! Error types for `tiervault-core`.
//!
//! Each subsystem has its own error enum. Crypto errors never include key
//! material, plaintext or IVs. Only key identifiers and operation
//! descriptions appear.

/// Errors from the encryption engine.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Encryption metadata or input is structurally malformed.
    #[error("invalid encryption metadata: {reason}")]
    Validation { reason: String },

    /// The recomputed checksum does not match the stored one. Plaintext is
    /// withheld.
    #[error("integrity verification failed for key '{key_id}': data may be corrupted or tampered")]
    Integrity { key_id: String },

    /// The key registry has no record for this key id.
    #[error("encryption key not found: {key_id}")]
    KeyNotFound { key_id: String },

    /// A key with this id is already registered.
    #[error("encryption key already exists: {key_id}")]
    KeyExists { key_id: String },

    /// The underlying cipher failed to encrypt.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// The underlying cipher failed to decrypt (bad padding, bad tag, bad IV).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// scrypt parameter or execution failure.
    #[error("key derivation failed for key '{key_id}': {reason}")]
    KeyDerivation { key_id: String, reason: String },

    /// The key registry backend failed.
    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from registry backends (`PolicyStore`, `KeyStore`).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be read or written.
    #[error("store backend failed: {reason}")]
    Backend { reason: String },

    /// A stored record could not be encoded or decoded.
    #[error("store serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from policy registry operations.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {id}")]
    NotFound { id: String },

    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The policy store failed.
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from audit sinks.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Every configured audit backend failed. The operation must abort.
    #[error("all audit backends failed (fail-closed)")]
    AllBackendsFailed,

    /// A specific audit backend failed.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// Serialization of the audit entry failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the secret persistence boundary.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No secret with this id is stored.
    #[error("secret not found: {secret_id}")]
    NotFound { secret_id: String },

    /// A stored record could not be encoded or decoded.
    #[error("backend serialization failed: {reason}")]
    Serialization { reason: String },

    /// The storage service is unreachable or returned an error.
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors from orchestrated secret operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Policy evaluation (or a metadata restriction) denied the request.
    /// The reason is surfaced verbatim.
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// No secret with this id exists.
    #[error("secret not found: {secret_id}")]
    NotFound { secret_id: String },

    /// The request itself is malformed.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    /// An encryption engine operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The persistence boundary failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The audit boundary failed.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// The policy registry failed.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be used.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}
