//! Keystore-backed adapter over the rPGP engine.
//!
//! Keys live as armored files in a home directory: `<FPR>.asc` for public
//! certificates and `<FPR>.sec.asc` for secret material. The adapter exposes
//! the narrow import/info/list/sign/encrypt/decrypt/delete contract the
//! registry and message builder consume, and hides every engine quirk
//! (armor cleanup, subkey selection, trust handling) behind it.

use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use pgp::composed::{
    Deserializable, KeyType, Message, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
    StandaloneSignature,
};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::public_key::PublicKeyAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::types::{CompressionAlgorithm, KeyTrait, Mpi, PublicKeyTrait, SecretKeyTrait};
use rand::{thread_rng, CryptoRng, Rng};
use tempfile::TempDir;

use super::material::{clean_key, email_from_uid};
use crate::error::ConfigError;

/// What an import attempt found in the supplied material.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    /// Number of keys the engine considered in the material.
    pub considered: usize,
    /// Fingerprints of the keys now present in the keystore.
    pub fingerprints: Vec<String>,
}

/// Engine-level view of one stored key.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// Self-signatures verified.
    pub valid: bool,
    pub can_encrypt: bool,
    /// Raw user id strings as carried by the key.
    pub identities: Vec<String>,
}

impl KeyInfo {
    /// Email addresses derivable from the key's identities, lower-cased.
    pub fn addresses(&self) -> BTreeSet<String> {
        self.identities
            .iter()
            .filter_map(|uid| email_from_uid(uid))
            .collect()
    }

    /// Whether the key's expiry timestamp, if any, lies before `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(ts) if ts < now)
    }
}

/// A detached signature produced by the engine.
#[derive(Debug, Clone)]
pub struct DetachedSignature {
    /// ASCII-armored signature block.
    pub armored: String,
    /// Hash algorithm the signature was computed with.
    pub hash: HashAlgorithm,
}

/// Result of an encryption attempt.
#[derive(Debug, Clone)]
pub struct EncryptOutcome {
    /// Armored ciphertext, absent when the engine produced nothing.
    pub armored: Option<String>,
    /// Fingerprints the engine refused to encrypt to.
    pub invalid: Vec<String>,
}

/// File-backed OpenPGP keystore.
///
/// The primary instance wraps the configured home directory and is shared,
/// read-only, across sends. [`Keyring::ephemeral`] yields a scoped instance
/// over a temporary directory that is erased when the value drops, on every
/// exit path, so unvalidated keys never touch the primary store.
#[derive(Debug)]
pub struct Keyring {
    home: PathBuf,
    always_trust: bool,
    _scratch: Option<TempDir>,
}

/// The concrete key a message gets encrypted to: an encryption-capable
/// subkey when the certificate carries one, the primary key otherwise.
#[derive(Debug)]
enum EncryptionTarget<'a> {
    Primary(&'a SignedPublicKey),
    Subkey(&'a pgp::composed::SignedPublicSubKey),
}

impl<'a> KeyTrait for EncryptionTarget<'a> {
    fn fingerprint(&self) -> Vec<u8> {
        match self {
            Self::Primary(k) => k.fingerprint(),
            Self::Subkey(k) => k.fingerprint(),
        }
    }

    fn key_id(&self) -> pgp::types::KeyId {
        match self {
            Self::Primary(k) => k.key_id(),
            Self::Subkey(k) => k.key_id(),
        }
    }

    fn algorithm(&self) -> PublicKeyAlgorithm {
        match self {
            Self::Primary(k) => k.algorithm(),
            Self::Subkey(k) => k.algorithm(),
        }
    }
}

impl<'a> PublicKeyTrait for EncryptionTarget<'a> {
    fn verify_signature(
        &self,
        hash: HashAlgorithm,
        data: &[u8],
        sig: &[Mpi],
    ) -> pgp::errors::Result<()> {
        match self {
            Self::Primary(k) => k.verify_signature(hash, data, sig),
            Self::Subkey(k) => k.verify_signature(hash, data, sig),
        }
    }

    fn encrypt<R: CryptoRng + Rng>(
        &self,
        rng: &mut R,
        plain: &[u8],
    ) -> pgp::errors::Result<Vec<Mpi>> {
        match self {
            Self::Primary(k) => k.encrypt(rng, plain),
            Self::Subkey(k) => k.encrypt(rng, plain),
        }
    }

    fn to_writer_old(&self, writer: &mut impl std::io::Write) -> pgp::errors::Result<()> {
        match self {
            Self::Primary(k) => k.to_writer_old(writer),
            Self::Subkey(k) => k.to_writer_old(writer),
        }
    }
}

/// Pick the key material to encrypt to. Subkeys win over the primary.
fn select_encryption_target(key: &SignedPublicKey) -> Option<EncryptionTarget<'_>> {
    if let Some(subkey) = key
        .public_subkeys
        .iter()
        .find(|subkey| subkey.is_encryption_key())
    {
        return Some(EncryptionTarget::Subkey(subkey));
    }
    if key.is_encryption_key() {
        return Some(EncryptionTarget::Primary(key));
    }
    None
}

fn fingerprint_hex(raw: &[u8]) -> String {
    hex::encode_upper(raw)
}

/// Fingerprints double as keystore file names; only hex is allowed through.
fn store_name(fingerprint: &str) -> Result<String> {
    let upper = fingerprint.trim().to_ascii_uppercase();
    if upper.is_empty() || !upper.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("not a fingerprint: {:?}", fingerprint));
    }
    Ok(upper)
}

impl Keyring {
    /// Open (creating if needed) the keystore at `home`.
    pub fn open(home: impl Into<PathBuf>, always_trust: bool) -> Result<Self, ConfigError> {
        let home = home.into();
        fs::create_dir_all(&home).map_err(|e| ConfigError::KeystoreUnavailable {
            path: home.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Keyring {
            home,
            always_trust,
            _scratch: None,
        })
    }

    /// A scoped keystore over an exclusive temporary directory. Storage is
    /// erased when the value drops, including on panic unwinds.
    pub fn ephemeral() -> Result<Self, ConfigError> {
        let scratch = TempDir::new().map_err(|e| ConfigError::KeystoreUnavailable {
            path: "<tempdir>".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Keyring {
            home: scratch.path().to_path_buf(),
            always_trust: true,
            _scratch: Some(scratch),
        })
    }

    /// The keystore directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Import armored public key material after armor cleanup.
    ///
    /// Every key found in the material is considered and stored; re-import
    /// of identical material rewrites the same files and yields the same
    /// fingerprints.
    pub fn import(&self, material: &str) -> Result<ImportOutcome> {
        let cleaned = clean_key(material)?;
        let (parsed, _headers) = match SignedPublicKey::from_string_many(&cleaned) {
            Ok(parsed) => parsed,
            Err(e) => {
                // material without a readable armor block holds no key
                debug!("import found no armor block: {}", e);
                return Ok(ImportOutcome {
                    considered: 0,
                    fingerprints: Vec::new(),
                });
            }
        };

        let mut fingerprints = Vec::new();
        let mut considered = 0;
        for key in parsed {
            considered += 1;
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    warn!("skipping unparseable key in import: {}", e);
                    continue;
                }
            };
            let fpr = fingerprint_hex(&key.fingerprint());
            let armored = key
                .to_armored_string(None)
                .context("re-armoring imported key")?;
            fs::write(self.home.join(format!("{}.asc", store_name(&fpr)?)), armored)?;
            debug!("imported key {}", fpr);
            fingerprints.push(fpr);
        }
        Ok(ImportOutcome {
            considered,
            fingerprints,
        })
    }

    /// Load the stored public key for a fingerprint.
    pub fn load_public(&self, fingerprint: &str) -> Result<Option<SignedPublicKey>> {
        let path = self.home.join(format!("{}.asc", store_name(fingerprint)?));
        if !path.exists() {
            return Ok(None);
        }
        let armored = fs::read_to_string(&path)?;
        let (key, _) = SignedPublicKey::from_string(&armored)
            .with_context(|| format!("stored key {} is unreadable", fingerprint))?;
        Ok(Some(key))
    }

    /// Engine-level facts about a stored key.
    pub fn key_info(&self, fingerprint: &str) -> Result<Option<KeyInfo>> {
        match self.load_public(fingerprint)? {
            None => Ok(None),
            Some(key) => Ok(Some(describe(&key))),
        }
    }

    /// All stored keys, optionally filtered by a pattern matching the
    /// fingerprint or one of the key's email addresses.
    pub fn list_keys(&self, pattern: Option<&str>) -> Result<Vec<KeyInfo>> {
        let mut infos = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.home)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for path in entries {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.ends_with(".asc") || name.ends_with(".sec.asc") {
                continue;
            }
            let armored = fs::read_to_string(&path)?;
            let key = match SignedPublicKey::from_string(&armored) {
                Ok((key, _)) => key,
                Err(e) => {
                    warn!("unreadable key file {}: {}", path.display(), e);
                    continue;
                }
            };
            let info = describe(&key);
            if let Some(pattern) = pattern {
                let needle = pattern.trim().to_ascii_lowercase();
                let fpr_match = info.fingerprint.to_ascii_lowercase().contains(&needle);
                let addr_match = info.addresses().iter().any(|a| *a == needle);
                if !fpr_match && !addr_match {
                    continue;
                }
            }
            infos.push(info);
        }
        Ok(infos)
    }

    /// Remove a key's stored material. With `include_secret`, secret
    /// material is purged as well.
    pub fn delete_key(&self, fingerprint: &str, include_secret: bool) -> Result<()> {
        let name = store_name(fingerprint)?;
        let public = self.home.join(format!("{}.asc", name));
        if public.exists() {
            fs::remove_file(&public)?;
        }
        if include_secret {
            let secret = self.home.join(format!("{}.sec.asc", name));
            if secret.exists() {
                fs::remove_file(&secret)?;
            }
        }
        Ok(())
    }

    /// Generate the service signing identity and persist both halves.
    pub fn generate_signing_key(&self, identity: &str) -> Result<String> {
        let params = SecretKeyParamsBuilder::default()
            .key_type(KeyType::Rsa(2048))
            .can_create_certificates(true)
            .can_sign(true)
            .primary_user_id(identity.to_string())
            .build()
            .map_err(|e| anyhow!("key parameters rejected: {}", e))?;
        let secret = params.generate().context("key generation failed")?;
        let secret = secret
            .sign(String::new)
            .context("self-signing secret key failed")?;
        let public = secret
            .public_key()
            .sign(&secret, String::new)
            .context("self-signing public key failed")?;

        let fpr = fingerprint_hex(&secret.fingerprint());
        let name = store_name(&fpr)?;
        fs::write(
            self.home.join(format!("{}.sec.asc", name)),
            secret.to_armored_string(None)?,
        )?;
        fs::write(
            self.home.join(format!("{}.asc", name)),
            public.to_armored_string(None)?,
        )?;
        Ok(fpr)
    }

    /// Every secret key held in the store, in stable order.
    fn secret_keys(&self) -> Result<Vec<SignedSecretKey>> {
        let mut names: Vec<PathBuf> = fs::read_dir(&self.home)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".sec.asc"))
            })
            .collect();
        names.sort();
        let mut keys = Vec::with_capacity(names.len());
        for path in names {
            let armored = fs::read_to_string(&path)?;
            let (key, _) = SignedSecretKey::from_string(&armored)
                .with_context(|| format!("stored secret key {} is unreadable", path.display()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// The service signing key, if one has been generated.
    pub fn signing_key(&self) -> Result<Option<SignedSecretKey>> {
        Ok(self.secret_keys()?.into_iter().next())
    }

    /// Compute a detached signature over `data` with the service key.
    pub fn sign_detached(&self, data: &[u8]) -> Result<DetachedSignature> {
        let key = self.signing_key()?.ok_or(ConfigError::NoSigningKey)?;
        let hash = HashAlgorithm::SHA2_256;
        let signed = Message::new_literal_bytes("", data)
            .sign(&key, String::new, hash)
            .context("signing engine returned no signature")?;
        let armored = signed
            .into_signature()
            .to_armored_string(None)
            .context("armoring signature failed")?;
        Ok(DetachedSignature { armored, hash })
    }

    /// Encrypt `data` to every fingerprint in `recipients`.
    ///
    /// Keys that cannot be used (missing, unreadable, no encryption
    /// material, or failing self-signature checks while the keystore does
    /// not trust unverified keys) are reported in `invalid` and no
    /// ciphertext is produced.
    pub fn encrypt(&self, data: &[u8], recipients: &[String]) -> Result<EncryptOutcome> {
        let mut keys = Vec::new();
        let mut invalid = Vec::new();
        for fpr in recipients {
            match self.load_public(fpr) {
                Ok(Some(key)) => {
                    if !self.always_trust && key.verify().is_err() {
                        warn!("recipient key {} fails verification", fpr);
                        invalid.push(fpr.clone());
                    } else {
                        keys.push(key);
                    }
                }
                Ok(None) => invalid.push(fpr.clone()),
                Err(e) => {
                    warn!("recipient key {} unusable: {}", fpr, e);
                    invalid.push(fpr.clone());
                }
            }
        }

        let targets: Vec<EncryptionTarget<'_>> = keys
            .iter()
            .filter_map(select_encryption_target)
            .collect();
        if targets.len() < keys.len() {
            for key in &keys {
                if select_encryption_target(key).is_none() {
                    invalid.push(fingerprint_hex(&key.fingerprint()));
                }
            }
        }
        if !invalid.is_empty() || targets.is_empty() {
            return Ok(EncryptOutcome {
                armored: None,
                invalid,
            });
        }

        let target_refs: Vec<&EncryptionTarget<'_>> = targets.iter().collect();
        let mut rng = thread_rng();
        let armored = Message::new_literal_bytes("", data)
            .compress(CompressionAlgorithm::ZLIB)
            .and_then(|msg| {
                msg.encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &target_refs)
            })
            .and_then(|msg| msg.to_armored_string(None))
            .context("encryption engine failed")?;
        Ok(EncryptOutcome {
            armored: Some(armored),
            invalid,
        })
    }

    /// Decrypt an armored message with any secret key held in the store.
    pub fn decrypt(&self, armored: &str) -> Result<Vec<u8>> {
        let keys = self.secret_keys()?;
        if keys.is_empty() {
            return Err(ConfigError::NoSigningKey.into());
        }
        let key_refs: Vec<&SignedSecretKey> = keys.iter().collect();
        let (message, _) = Message::from_armor_single(Cursor::new(armored.as_bytes()))
            .context("unreadable encrypted message")?;
        let (decryptor, _) = message
            .decrypt(String::new, &key_refs)
            .context("decryption failed")?;
        let messages = decryptor.collect::<pgp::errors::Result<Vec<_>>>()?;
        let message = messages
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("decryption produced no message"))?;
        let message = match message {
            Message::Compressed(_) => message.decompress().context("decompression failed")?,
            other => other,
        };
        message
            .get_content()?
            .ok_or_else(|| anyhow!("decrypted message has no content"))
    }

    /// Verify a detached signature against the stored public half of the
    /// service key. Exercised by tests and the validation tooling.
    pub fn verify_detached(&self, data: &[u8], signature_armored: &str) -> Result<bool> {
        let (signature, _) = StandaloneSignature::from_string(signature_armored)
            .context("unreadable signature")?;
        let key = self.signing_key()?.ok_or(ConfigError::NoSigningKey)?;
        let public = key.public_key().sign(&key, String::new)?;
        Ok(signature.verify(&public, data).is_ok())
    }
}

fn describe(key: &SignedPublicKey) -> KeyInfo {
    KeyInfo {
        fingerprint: fingerprint_hex(&key.fingerprint()),
        revoked: !key.details.revocation_signatures.is_empty(),
        expires_at: key.expires_at(),
        valid: key.verify().is_ok(),
        can_encrypt: select_encryption_target(key).is_some(),
        identities: key
            .details
            .users
            .iter()
            .map(|user| String::from_utf8_lossy(user.id.id()).to_string())
            .collect(),
    }
}
