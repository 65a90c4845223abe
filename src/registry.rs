//! Registry of recipient keys and the addresses they certify.
//!
//! Validation always runs against a scoped ephemeral keystore so rejected
//! material never touches the primary store. Persistence is reconciled as a
//! set difference on re-save: addresses still certified by the key are kept
//! (preference refreshed), dropped ones are pruned, and nothing else moves.
//!
//! Domain failures are reported as [`ValidationError`] values inside the
//! `anyhow` chain; callers that need to branch on the reason downcast:
//! `err.downcast_ref::<ValidationError>()`.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::db::{Db, KeyRow};
use crate::error::ValidationError;
use crate::keyring::{KeyInfo, Keyring};

/// Key registry over the shared database and primary keystore.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    db: Arc<Db>,
    keyring: Arc<Keyring>,
}

/// Acceptance rules for a single imported key.
///
/// Pure so every rejection reason is testable without engine material.
fn check_key(info: &KeyInfo, now: DateTime<Utc>) -> Result<(), ValidationError> {
    if info.revoked {
        return Err(ValidationError::Revoked);
    }
    if info.expired_at(now) {
        return Err(ValidationError::Expired);
    }
    if !info.valid {
        return Err(ValidationError::Invalid);
    }
    if !info.can_encrypt {
        return Err(ValidationError::NotEncryptable);
    }
    Ok(())
}

impl KeyRegistry {
    pub fn new(db: Arc<Db>, keyring: Arc<Keyring>) -> Self {
        Self { db, keyring }
    }

    /// Import the material into an ephemeral keystore and apply the
    /// acceptance rules. The scratch store is erased when this returns.
    fn inspect(&self, material: &str) -> Result<(String, KeyInfo)> {
        let scratch = Keyring::ephemeral()?;
        let outcome = scratch.import(material)?;
        if outcome.considered == 0 {
            return Err(ValidationError::NoKeyFound.into());
        }
        if outcome.considered > 1 {
            return Err(ValidationError::MultipleKeys.into());
        }
        let fingerprint = outcome
            .fingerprints
            .first()
            .ok_or(ValidationError::Invalid)?
            .clone();
        let info = scratch
            .key_info(&fingerprint)?
            .ok_or(ValidationError::Invalid)?;
        check_key(&info, Utc::now())?;
        Ok((fingerprint, info))
    }

    /// Validate key material and return its fingerprint.
    ///
    /// Validating the same material twice yields the same fingerprint and
    /// leaves no trace in the primary keystore.
    pub fn validate(&self, material: &str) -> Result<String> {
        let (fingerprint, _) = self.inspect(material)?;
        Ok(fingerprint)
    }

    /// Side-effect-free preview of the address set a key certifies.
    /// `None` when the material fails validation.
    pub fn read_addresses(&self, material: &str) -> Result<Option<BTreeSet<String>>> {
        match self.inspect(material) {
            Ok((_, info)) => Ok(Some(info.addresses())),
            Err(err) if err.downcast_ref::<ValidationError>().is_some() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Validate, import into the primary keystore, and persist.
    pub async fn save(&self, material: &str, use_asc: bool) -> Result<KeyRow> {
        let (fingerprint, info) = self.inspect(material)?;
        self.keyring.import(material)?;

        let cleaned = crate::keyring::clean_key(material)?;
        let row = self.db.upsert_key(&fingerprint, &cleaned, use_asc).await?;
        let addresses: Vec<String> = info.addresses().into_iter().collect();
        let (bound, pruned) = self.bind_addresses(row.id, &addresses, use_asc).await?;
        info!(
            "saved key {} ({} addresses bound, {} pruned)",
            fingerprint, bound, pruned
        );
        Ok(row)
    }

    /// Reconcile the address rows of a key against its current address set.
    ///
    /// Present addresses are created or updated in place (propagating the
    /// naming preference); only addresses no longer certified are removed.
    pub async fn bind_addresses(
        &self,
        key_id: i64,
        addresses: &[String],
        use_asc: bool,
    ) -> Result<(usize, usize)> {
        for address in addresses {
            self.db.upsert_address(key_id, address, use_asc).await?;
        }
        let keep: Vec<String> = addresses.to_vec();
        let pruned = self.db.prune_addresses(key_id, &keep).await?;
        Ok((addresses.len(), pruned))
    }

    /// Remove a key's rows and purge its material, secret half included.
    pub async fn delete(&self, key: &KeyRow) -> Result<()> {
        self.db.delete_key_row(key.id).await?;
        self.keyring.delete_key(&key.fingerprint, true)?;
        info!("deleted key {}", key.fingerprint);
        Ok(())
    }

    /// Key row bound to an address, regardless of current capability.
    pub async fn lookup(&self, address: &str) -> Result<Option<KeyRow>> {
        self.db.key_for_address(&address.to_ascii_lowercase()).await
    }

    /// All stored keys.
    pub async fn list(&self) -> Result<Vec<KeyRow>> {
        self.db.list_key_rows().await
    }

    /// Fingerprints of keystore keys certifying this address that are
    /// usable for encryption right now (capable, not revoked, not expired).
    pub fn fingerprints_for(&self, address: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let infos = self.keyring.list_keys(Some(address))?;
        Ok(infos
            .into_iter()
            .filter(|info| info.can_encrypt && !info.revoked && !info.expired_at(now))
            .map(|info| info.fingerprint)
            .collect())
    }

    /// The key row for an address, only when its stored key is currently
    /// usable for encryption. Drives recipient partitioning.
    pub async fn encryptable_key_for(&self, address: &str) -> Result<Option<KeyRow>> {
        let Some(row) = self.lookup(address).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        match self.keyring.key_info(&row.fingerprint)? {
            Some(info) if info.can_encrypt && !info.revoked && !info.expired_at(now) => {
                Ok(Some(row))
            }
            _ => {
                debug!("key for {} present but not usable for encryption", address);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::Keyring;

    fn synthetic_info(fingerprint: &str) -> KeyInfo {
        KeyInfo {
            fingerprint: fingerprint.to_string(),
            revoked: false,
            expires_at: None,
            valid: true,
            can_encrypt: true,
            identities: vec!["Someone <someone@example.com>".to_string()],
        }
    }

    #[test]
    fn check_key_accepts_sound_keys() {
        let info = synthetic_info("AA00");
        assert_eq!(check_key(&info, Utc::now()), Ok(()));
    }

    #[test]
    fn check_key_rejects_expired_but_not_future_expiry() {
        let now = Utc::now();
        let mut info = synthetic_info("AA00");
        info.expires_at = Some(now - chrono::Duration::days(1));
        assert_eq!(check_key(&info, now), Err(ValidationError::Expired));

        info.expires_at = Some(now + chrono::Duration::days(30));
        assert_eq!(check_key(&info, now), Ok(()));
    }

    #[test]
    fn check_key_rejects_revoked_invalid_and_unencryptable() {
        let now = Utc::now();
        let mut revoked = synthetic_info("AA00");
        revoked.revoked = true;
        assert_eq!(check_key(&revoked, now), Err(ValidationError::Revoked));

        let mut invalid = synthetic_info("AA00");
        invalid.valid = false;
        assert_eq!(check_key(&invalid, now), Err(ValidationError::Invalid));

        let mut sign_only = synthetic_info("AA00");
        sign_only.can_encrypt = false;
        assert_eq!(
            check_key(&sign_only, now),
            Err(ValidationError::NotEncryptable)
        );
    }

    async fn registry() -> Result<KeyRegistry> {
        let db = Arc::new(Db::open(":memory:").await?);
        db.init().await?;
        let keyring = Arc::new(Keyring::ephemeral()?);
        Ok(KeyRegistry::new(db, keyring))
    }

    fn armored_key_for(identity: &str) -> Result<String> {
        let scratch = Keyring::ephemeral()?;
        let fpr = scratch.generate_signing_key(identity)?;
        let armored = std::fs::read_to_string(scratch.home().join(format!("{}.asc", fpr)))?;
        Ok(armored)
    }

    #[tokio::test]
    async fn test_validate_is_idempotent() -> Result<()> {
        let registry = registry().await?;
        let armored = armored_key_for("Alice <alice@example.com>")?;
        let first = registry.validate(&armored)?;
        let second = registry.validate(&armored)?;
        assert_eq!(first, second);
        // validation leaves nothing behind in the primary keystore
        assert!(registry.keyring.key_info(&first)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_validate_rejects_garbage_and_multiples() -> Result<()> {
        let registry = registry().await?;

        let err = registry.validate("no armor here").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::NoKeyFound)
        );

        let one = armored_key_for("a@example.com")?;
        let two = armored_key_for("b@example.com")?;
        let both = format!("{}\n{}", one, two);
        let err = registry.validate(&both).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MultipleKeys)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_save_binds_addresses_and_imports() -> Result<()> {
        let registry = registry().await?;
        let armored = armored_key_for("Alice <alice@example.com>")?;
        let row = registry.save(&armored, true).await?;
        assert!(row.use_asc);

        let bound = registry.lookup("alice@example.com").await?.unwrap();
        assert_eq!(bound.id, row.id);
        // the key is now present in the primary keystore
        assert!(registry.keyring.key_info(&row.fingerprint)?.is_some());
        // and usable for encryption
        assert_eq!(
            registry.fingerprints_for("alice@example.com")?,
            vec![row.fingerprint]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_rebinding_subset_prunes_only_dropped_addresses() -> Result<()> {
        let registry = registry().await?;
        let armored = armored_key_for("Alice <alice@example.com>")?;
        let row = registry.save(&armored, false).await?;

        let full: Vec<String> = vec![
            "alice@example.com".to_string(),
            "old@example.com".to_string(),
        ];
        registry.bind_addresses(row.id, &full, false).await?;
        let subset: Vec<String> = vec!["alice@example.com".to_string()];
        let (bound, pruned) = registry.bind_addresses(row.id, &subset, true).await?;
        assert_eq!((bound, pruned), (1, 1));

        assert!(registry.lookup("old@example.com").await?.is_none());
        let kept = registry.db.lookup_address("alice@example.com").await?.unwrap();
        assert!(kept.use_asc, "preference propagates on re-bind");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_rows_and_material() -> Result<()> {
        let registry = registry().await?;
        let armored = armored_key_for("Alice <alice@example.com>")?;
        let row = registry.save(&armored, false).await?;
        registry.delete(&row).await?;
        assert!(registry.lookup("alice@example.com").await?.is_none());
        assert!(registry.keyring.key_info(&row.fingerprint)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_addresses_previews_without_persisting() -> Result<()> {
        let registry = registry().await?;
        let armored = armored_key_for("Alice <alice@example.com>")?;
        let addresses = registry.read_addresses(&armored)?.unwrap();
        assert!(addresses.contains("alice@example.com"));
        assert!(registry.list().await?.is_empty());

        assert_eq!(registry.read_addresses("not a key")?, None);
        Ok(())
    }
}
