//! OpenPGP engine adapter: armored keystore, ephemeral validation scopes,
//! and armor/material normalization helpers.

mod backend;
mod material;

pub use backend::{DetachedSignature, EncryptOutcome, ImportOutcome, KeyInfo, Keyring};
pub use material::{clean_key, email_from_uid, micalg};
