//! Replacement values for secret rotation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use rand::rngs::OsRng;

use crate::crypto;
use crate::metadata::SecretCategory;

/// Shortest value ever generated.
pub const MIN_GENERATED_LEN: usize = 32;

const DEFAULT_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Generate a fresh value shaped for `category`, at least
/// [`MIN_GENERATED_LEN`] characters and no shorter than the current value.
///
/// - `api_key`: base64 with non-alphanumerics stripped.
/// - `encryption_key`: lowercase hex.
/// - anything else: letters, digits, and `!@#$%^&*`.
#[must_use]
pub fn generate_value(category: SecretCategory, current_len: usize) -> String {
    let len = current_len.max(MIN_GENERATED_LEN);
    match category {
        SecretCategory::ApiKey => alphanumeric_base64(len),
        SecretCategory::EncryptionKey => {
            let mut out = hex::encode(crypto::random_bytes(len.div_ceil(2)));
            out.truncate(len);
            out
        }
        _ => from_charset(len),
    }
}

fn alphanumeric_base64(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let chunk = BASE64.encode(crypto::random_bytes(len));
        out.extend(chunk.chars().filter(char::is_ascii_alphanumeric));
    }
    out.truncate(len);
    out
}

fn from_charset(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(DEFAULT_CHARSET[rng.gen_range(0..DEFAULT_CHARSET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_are_alphanumeric() {
        let value = generate_value(SecretCategory::ApiKey, 10);
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn encryption_keys_are_hex() {
        let value = generate_value(SecretCategory::EncryptionKey, 64);
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn odd_length_encryption_keys_keep_full_length() {
        let value = generate_value(SecretCategory::EncryptionKey, 65);
        assert_eq!(value.len(), 65);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(generate_value(SecretCategory::EncryptionKey, 33).len(), 33);
    }

    #[test]
    fn default_charset_and_length() {
        let value = generate_value(SecretCategory::Database, 48);
        assert_eq!(value.len(), 48);
        assert!(value.bytes().all(|b| DEFAULT_CHARSET.contains(&b)));
    }

    #[test]
    fn values_differ() {
        assert_ne!(
            generate_value(SecretCategory::Service, 0),
            generate_value(SecretCategory::Service, 0)
        );
    }
}
