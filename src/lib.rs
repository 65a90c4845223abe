//! Mailseal - OpenPGP support for outgoing mail
//!
//! This crate provides per-recipient key storage and validation, a
//! file-backed OpenPGP keystore, and RFC 3156 PGP/MIME message assembly
//! for signed and/or encrypted sends.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod keyring;
pub mod mail;
pub mod registry;

#[cfg(test)]
mod test_send;

// Re-export commonly used items for convenience
pub use config::Settings;
pub use db::Db;
pub use error::{ConfigError, SendError, ValidationError};
pub use keyring::Keyring;
pub use mail::{Mailer, OutgoingMail};
pub use registry::KeyRegistry;
