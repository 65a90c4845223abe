//! Split a recipient list into one shared plain batch and singleton
//! encrypted batches.
//!
//! Encryption is per key, so no two recipients ever share an encrypted
//! envelope; recipients without a usable key travel together in a single
//! multi-recipient send.

use anyhow::Result;

use crate::registry::KeyRegistry;

/// The batches a send decomposes into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batches {
    /// Recipients without a usable key, delivered as one envelope.
    pub plain: Vec<String>,
    /// One singleton batch per keyed recipient.
    pub encrypted: Vec<Vec<String>>,
}

impl Batches {
    /// Dispatch order: the plain batch (when present), then each encrypted
    /// singleton. The boolean marks batches to encrypt.
    pub fn dispatch_order(&self) -> Vec<(Vec<String>, bool)> {
        let mut order = Vec::with_capacity(self.encrypted.len() + 1);
        if !self.plain.is_empty() {
            order.push((self.plain.clone(), false));
        }
        for batch in &self.encrypted {
            order.push((batch.clone(), true));
        }
        order
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.encrypted.is_empty()
    }
}

/// Partition `recipients` by key availability in the registry.
pub async fn partition(registry: &KeyRegistry, recipients: &[String]) -> Result<Batches> {
    let mut batches = Batches::default();
    for recipient in recipients {
        let address = recipient.trim().to_string();
        if address.is_empty() {
            continue;
        }
        if registry.encryptable_key_for(&address).await?.is_some() {
            batches.encrypted.push(vec![address]);
        } else {
            batches.plain.push(address);
        }
    }
    Ok(batches)
}
