//! Runtime settings loaded from the environment.
//!
//! All knobs come from `MAILSEAL_*` variables (a `.env` file is honored by
//! the binary via dotenvy). The library never reads the environment on its
//! own; callers construct a [`Settings`] once and pass it down.

use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Read-only configuration surface for the mail pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Whether the OpenPGP backend is enabled at all. When false the mailer
    /// is a plain passthrough and no keystore is opened.
    pub use_pgp: bool,
    /// Directory holding the primary keystore.
    pub keystore_home: PathBuf,
    /// Pass unverified recipient keys to the engine as trusted.
    pub always_trust: bool,
    /// Sign every outgoing message with the service key.
    pub sign_outgoing: bool,
    /// SQLite database path for key and address rows.
    pub db_path: String,
    /// Directory searched by the file-backed template renderer.
    pub template_dir: Option<PathBuf>,
    /// Directory the development file transport writes messages into.
    pub outbox_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_pgp: true,
            keystore_home: PathBuf::from("keystore"),
            always_trust: false,
            sign_outgoing: false,
            db_path: "mailseal.db".to_string(),
            template_dir: None,
            outbox_dir: PathBuf::from("outbox"),
        }
    }
}

impl Settings {
    /// Build settings from `MAILSEAL_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        Ok(Settings {
            use_pgp: env_bool("MAILSEAL_USE_PGP", defaults.use_pgp)?,
            keystore_home: env::var("MAILSEAL_KEYSTORE_HOME")
                .map(PathBuf::from)
                .unwrap_or(defaults.keystore_home),
            always_trust: env_bool("MAILSEAL_ALWAYS_TRUST", defaults.always_trust)?,
            sign_outgoing: env_bool("MAILSEAL_SIGN_OUTGOING", defaults.sign_outgoing)?,
            db_path: env::var("MAILSEAL_DB_PATH").unwrap_or(defaults.db_path),
            template_dir: env::var("MAILSEAL_TEMPLATE_DIR").ok().map(PathBuf::from),
            outbox_dir: env::var("MAILSEAL_OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.outbox_dir),
        })
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::BadSetting {
                name: name.to_string(),
                value: raw,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_pgp_without_signing() {
        let s = Settings::default();
        assert!(s.use_pgp);
        assert!(!s.sign_outgoing);
        assert!(!s.always_trust);
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        // Distinct variable names per case: the process environment is
        // shared across the test binary.
        env::set_var("MAILSEAL_TEST_BOOL_A", "yes");
        assert!(env_bool("MAILSEAL_TEST_BOOL_A", false).unwrap());
        env::set_var("MAILSEAL_TEST_BOOL_B", "0");
        assert!(!env_bool("MAILSEAL_TEST_BOOL_B", true).unwrap());
        env::set_var("MAILSEAL_TEST_BOOL_C", "sideways");
        assert!(env_bool("MAILSEAL_TEST_BOOL_C", true).is_err());
        assert!(env_bool("MAILSEAL_TEST_BOOL_UNSET", true).unwrap());
    }
}
