//! SQLite persistence for imported keys and their addresses.
//!
//! Two tables back the key registry:
//! - `pgp_keys`: armored key text, fingerprint, attachment-naming preference
//! - `pgp_addresses`: one row per email identity, bound to the most recent
//!   key that validated it
//!
//! Row reconciliation lives in the registry; this module only knows rows.

mod keys;

pub use keys::{AddressRow, KeyRow};

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::{fs, path::Path};

/// SQLite-backed database.
#[derive(Debug)]
pub struct Db {
    pub(crate) pool: SqlitePool,
}

impl Db {
    /// Open or create a database at the given path.
    pub async fn open(path: &str) -> Result<Self> {
        // ensure parent directories exist so SQLite can create/open the file
        if let Some(dir) = Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let url = format!("sqlite://{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        Ok(Db { pool })
    }

    /// Create the key and address tables.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pgp_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key_text TEXT NOT NULL,
                fingerprint TEXT UNIQUE,
                use_asc INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pgp_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                key_id INTEGER REFERENCES pgp_keys(id),
                use_asc INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
