//! Row operations for imported keys and their addresses.

use super::Db;
use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

/// A stored key: armored text plus derived fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRow {
    pub id: i64,
    pub key_text: String,
    pub fingerprint: String,
    pub use_asc: bool,
}

/// An email identity bound to a stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressRow {
    pub id: i64,
    pub address: String,
    pub key_id: Option<i64>,
    pub use_asc: bool,
}

fn key_row(row: &sqlx::sqlite::SqliteRow) -> Result<KeyRow> {
    Ok(KeyRow {
        id: row.try_get("id")?,
        key_text: row.try_get("key_text")?,
        fingerprint: row.try_get("fingerprint")?,
        use_asc: row.try_get::<i64, _>("use_asc")? != 0,
    })
}

fn address_row(row: &sqlx::sqlite::SqliteRow) -> Result<AddressRow> {
    Ok(AddressRow {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        key_id: row.try_get("key_id")?,
        use_asc: row.try_get::<i64, _>("use_asc")? != 0,
    })
}

impl Db {
    /// Insert or refresh a key row keyed by fingerprint.
    pub async fn upsert_key(
        &self,
        fingerprint: &str,
        key_text: &str,
        use_asc: bool,
    ) -> Result<KeyRow> {
        sqlx::query(
            r#"
            INSERT INTO pgp_keys (key_text, fingerprint, use_asc) VALUES (?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                key_text = excluded.key_text,
                use_asc = excluded.use_asc
            "#,
        )
        .bind(key_text)
        .bind(fingerprint)
        .bind(use_asc as i64)
        .execute(&self.pool)
        .await?;

        self.get_key_by_fingerprint(fingerprint)
            .await?
            .ok_or_else(|| anyhow::anyhow!("key row missing after upsert"))
    }

    /// Fetch a key row by fingerprint.
    pub async fn get_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<KeyRow>> {
        if let Some(row) = sqlx::query(
            r#"SELECT id, key_text, fingerprint, use_asc FROM pgp_keys WHERE fingerprint = ?"#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?
        {
            Ok(Some(key_row(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Load all key rows.
    pub async fn list_key_rows(&self) -> Result<Vec<KeyRow>> {
        let rows =
            sqlx::query(r#"SELECT id, key_text, fingerprint, use_asc FROM pgp_keys ORDER BY id"#)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(key_row).collect()
    }

    /// Delete a key row and every address bound to it.
    pub async fn delete_key_row(&self, key_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pgp_addresses WHERE key_id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM pgp_keys WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bind an address to a key, rebinding from any previous key. The most
    /// recent key to validate an address owns it.
    pub async fn upsert_address(&self, key_id: i64, address: &str, use_asc: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pgp_addresses (address, key_id, use_asc) VALUES (?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                key_id = excluded.key_id,
                use_asc = excluded.use_asc
            "#,
        )
        .bind(address)
        .bind(key_id)
        .bind(use_asc as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the addresses currently bound to a key.
    pub async fn addresses_for_key(&self, key_id: i64) -> Result<Vec<AddressRow>> {
        let rows = sqlx::query(
            r#"SELECT id, address, key_id, use_asc FROM pgp_addresses WHERE key_id = ? ORDER BY address"#,
        )
        .bind(key_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(address_row).collect()
    }

    /// Remove addresses bound to a key that are absent from the kept set.
    /// Used by re-validation so only dropped identities disappear.
    pub async fn prune_addresses(&self, key_id: i64, keep: &[String]) -> Result<usize> {
        let current = self.addresses_for_key(key_id).await?;
        let mut removed = 0;
        for row in current {
            if !keep.contains(&row.address) {
                sqlx::query("DELETE FROM pgp_addresses WHERE id = ?")
                    .bind(row.id)
                    .execute(&self.pool)
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Look up the address row for an email address, if any key holds it.
    pub async fn lookup_address(&self, address: &str) -> Result<Option<AddressRow>> {
        if let Some(row) = sqlx::query(
            r#"SELECT id, address, key_id, use_asc FROM pgp_addresses WHERE address = ?"#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?
        {
            Ok(Some(address_row(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Fetch the key row owning an address.
    pub async fn key_for_address(&self, address: &str) -> Result<Option<KeyRow>> {
        if let Some(row) = sqlx::query(
            r#"
            SELECT k.id, k.key_text, k.fingerprint, k.use_asc
            FROM pgp_keys k JOIN pgp_addresses a ON a.key_id = k.id
            WHERE a.address = ?
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?
        {
            Ok(Some(key_row(&row)?))
        } else {
            Ok(None)
        }
    }
}
