//! Error types for key validation, message assembly, and delivery.

use thiserror::Error;

/// Why a submitted key was rejected by the registry.
///
/// These are surfaced to the caller verbatim (e.g. by a form layer) and are
/// never auto-corrected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The material contained no importable key.
    #[error("no key was found")]
    NoKeyFound,

    /// The material contained more than one key.
    #[error("more than one key was imported")]
    MultipleKeys,

    /// The key carries a revocation signature.
    #[error("the key is revoked")]
    Revoked,

    /// The key's expiry timestamp lies in the past.
    #[error("the key is expired")]
    Expired,

    /// The key failed self-signature verification.
    #[error("the key is invalid")]
    Invalid,

    /// The key cannot be used for encryption.
    #[error("the key is not capable of encryption")]
    NotEncryptable,

    /// The material is not valid ASCII-armored text.
    #[error("the key material is not valid text")]
    BadEncoding,
}

/// Failures while building or delivering a single batch.
#[derive(Debug, Error)]
pub enum SendError {
    /// The signing engine produced no signature.
    #[error("message signing failed: {0}")]
    Signing(String),

    /// Encryption was requested for an address with no resolvable key.
    ///
    /// This is a hard error in every mode: quietly mailing plaintext to a
    /// recipient that was meant to be encrypted is not a delivery nuisance.
    #[error("no encryption key found for {0}")]
    NoKeyForAddress(String),

    /// The engine rejected a recipient key during encryption.
    #[error("recipient key rejected for {0}")]
    InvalidRecipient(String),

    /// The engine produced no ciphertext.
    #[error("message encryption failed: {0}")]
    Encryption(String),

    /// The transport collaborator refused the message.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SendError {
    /// Whether fail-silently mode may swallow this error by skipping the
    /// batch. A missing recipient key is never suppressed.
    pub fn suppressible(&self) -> bool {
        !matches!(self, SendError::NoKeyForAddress(_))
    }
}

/// Configuration and keystore availability problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The keystore home directory could not be created or opened.
    #[error("keystore unavailable at {path}: {reason}")]
    KeystoreUnavailable { path: String, reason: String },

    /// Signing was requested but the keystore holds no secret key.
    #[error("no signing key present in the keystore")]
    NoSigningKey,

    /// An environment variable held an unusable value.
    #[error("invalid setting {name}: {value}")]
    BadSetting { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_never_suppressible() {
        assert!(!SendError::NoKeyForAddress("a@example.com".into()).suppressible());
        assert!(SendError::Signing("engine returned nothing".into()).suppressible());
        assert!(SendError::Encryption("no ciphertext".into()).suppressible());
        assert!(SendError::InvalidRecipient("b@example.com".into()).suppressible());
    }

    #[test]
    fn validation_errors_are_distinct() {
        assert_ne!(ValidationError::NoKeyFound, ValidationError::MultipleKeys);
        assert_eq!(ValidationError::Expired.to_string(), "the key is expired");
    }
}
