use num_bigint::{BigInt, ParseBigIntError};
use num_traits::Num;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid input: {}", .0.to_lowercase())]
    InvalidInput(String),
}

impl From<ParseBigIntError> for Error {
    fn from(err: ParseBigIntError) -> Self {
        Error::InvalidInput(format!("{err}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub trait Hasher {
    /// Hash as a lowercase hex digest (64 characters).
    fn hash_hex(&self, input: &str) -> Result<String>;

    /// Hash as a decimal digest, for uses that need digits only (e.g. date offsets).
    fn hash_decimal(&self, input: &str) -> Result<String> {
        let hex = self.hash_hex(input)?;
        let as_number = BigInt::from_str_radix(&hex, 16)?;
        Ok(as_number.to_string())
    }
}

/// Salted blake3 hasher. The salt keeps pseudonymized identifiers from being
/// reversible by hashing candidate identifiers, so it must be kept secret and
/// stable across runs of the same project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blake3Hasher {
    salt: String,
}

impl Blake3Hasher {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }
}

impl Hasher for Blake3Hasher {
    fn hash_hex(&self, input: &str) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(input.as_bytes());
        Ok(hasher.finalize().to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digest_length() {
        let hasher = Blake3Hasher::new("salt");
        let result = hasher.hash_hex("hello, world!").unwrap();
        assert_eq!(result.len(), 64);
        assert!(result.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_string() {
        let hasher = Blake3Hasher::new("salt");
        let result = hasher.hash_hex("").unwrap();
        assert_eq!(result.len(), 64);
    }

    #[test]
    fn test_decimal_digest_is_digits() {
        let hasher = Blake3Hasher::new("salt");
        let result = hasher.hash_decimal("abc").unwrap();
        assert!(!result.is_empty());
        assert!(result.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_same_result_for_same_input() {
        let hasher = Blake3Hasher::new("salt");
        assert_eq!(hasher.hash_hex("abc").unwrap(), hasher.hash_hex("abc").unwrap());
    }

    #[test]
    fn test_different_result_for_different_input() {
        let hasher = Blake3Hasher::new("salt");
        assert_ne!(hasher.hash_hex("abc").unwrap(), hasher.hash_hex("def").unwrap());
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = Error::InvalidInput("bad input".into());
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_salt_changes_digest() {
        let a = Blake3Hasher::new("salt-a").hash_hex("abc").unwrap();
        let b = Blake3Hasher::new("salt-b").hash_hex("abc").unwrap();
        assert_ne!(a, b);
    }
}
