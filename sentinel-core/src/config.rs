//! Engine-wide settings.
//!
//! Everything here is process configuration, as opposed to the per-sync
//! definitions in [`crate::models`]. The CLI fills these from flags and
//! environment variables; tests build them with the `with_*` methods.

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

/// Default number of rows fetched per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Upper bound on the batch size.
pub const MAX_BATCH_SIZE: usize = 100_000;

/// A secret string that is wiped on drop and never printed.
#[derive(Clone)]
pub struct SecretString(Zeroizing<String>);

impl Default for SecretString {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl SecretString {
    /// Wraps a secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrows the secret.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// True when no secret has been configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(****)")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Connection limits applied by every source connector.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Seconds allowed to establish a connection
    pub connect_timeout_secs: u64,
    /// Seconds allowed per statement where the dialect supports it
    pub query_timeout_secs: u64,
    /// Maximum pooled connections per run
    pub max_connections: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            query_timeout_secs: 300,
            max_connections: 2,
        }
    }
}

impl ConnectionSettings {
    /// Connect timeout as a [`Duration`].
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Query timeout as a [`Duration`].
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Settings shared by every run the engine executes.
///
/// # Example
/// ```rust
/// use sentinel_core::config::EngineSettings;
///
/// let settings = EngineSettings::default()
///     .with_hash_secret("pepper")
///     .with_batch_size(500);
///
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Key for the `hash` masking rule
    pub hash_secret: SecretString,
    /// Passphrase for encrypted artifacts
    pub encryption_passphrase: Option<SecretString>,
    /// Rows per fetch batch
    pub batch_size: usize,
    /// Output directory for configs that leave theirs empty
    pub default_output_dir: PathBuf,
    /// Row cap for tables that do not set their own
    pub default_row_limit: Option<u64>,
    /// Source connection limits
    pub connection: ConnectionSettings,
    /// Allow `randomize` on primary-key columns instead of upgrading it to `hash`
    pub allow_nondeterministic_pk_masking: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hash_secret: SecretString::default(),
            encryption_passphrase: None,
            batch_size: DEFAULT_BATCH_SIZE,
            default_output_dir: PathBuf::from("./output"),
            default_row_limit: None,
            connection: ConnectionSettings::default(),
            allow_nondeterministic_pk_masking: false,
        }
    }
}

impl EngineSettings {
    /// Validates settings.
    ///
    /// # Errors
    /// Returns a configuration error for out-of-range values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(crate::SentinelError::configuration(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }

        if self.default_row_limit == Some(0) {
            return Err(crate::SentinelError::configuration(
                "default_row_limit must be greater than 0",
            ));
        }

        if self.connection.connect_timeout_secs == 0 {
            return Err(crate::SentinelError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }

        if self.connection.query_timeout_secs == 0 {
            return Err(crate::SentinelError::configuration(
                "query_timeout must be greater than 0",
            ));
        }

        if self.connection.max_connections == 0 || self.connection.max_connections > 100 {
            return Err(crate::SentinelError::configuration(
                "max_connections must be between 1 and 100",
            ));
        }

        if self
            .encryption_passphrase
            .as_ref()
            .is_some_and(SecretString::is_empty)
        {
            return Err(crate::SentinelError::configuration(
                "encryption passphrase cannot be empty",
            ));
        }

        Ok(())
    }

    /// Sets the hash masking key.
    #[must_use]
    pub fn with_hash_secret(mut self, secret: impl Into<String>) -> Self {
        self.hash_secret = SecretString::new(secret);
        self
    }

    /// Sets the artifact encryption passphrase.
    #[must_use]
    pub fn with_encryption_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.encryption_passphrase = Some(SecretString::new(passphrase));
        self
    }

    /// Sets the fetch batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the fallback output directory.
    #[must_use]
    pub fn with_default_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_output_dir = dir.into();
        self
    }

    /// Sets the fallback row cap.
    #[must_use]
    pub const fn with_default_row_limit(mut self, limit: Option<u64>) -> Self {
        self.default_row_limit = limit;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connect_timeout_secs = timeout.as_secs();
        self
    }

    /// Permits `randomize` on primary-key columns.
    #[must_use]
    pub const fn allow_nondeterministic_pk_masking(mut self, allow: bool) -> Self {
        self.allow_nondeterministic_pk_masking = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_settings_default() {
        let settings = EngineSettings::default();
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.default_output_dir, PathBuf::from("./output"));
        assert!(!settings.allow_nondeterministic_pk_masking);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_engine_settings_validation() {
        assert!(EngineSettings::default().with_batch_size(0).validate().is_err());
        assert!(
            EngineSettings::default()
                .with_batch_size(MAX_BATCH_SIZE + 1)
                .validate()
                .is_err()
        );
        assert!(
            EngineSettings::default()
                .with_default_row_limit(Some(0))
                .validate()
                .is_err()
        );
        assert!(
            EngineSettings::default()
                .with_connect_timeout(Duration::from_millis(10))
                .validate()
                .is_err()
        );
        assert!(
            EngineSettings::default()
                .with_encryption_passphrase("")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let settings = EngineSettings::default()
            .with_hash_secret("pepper")
            .with_encryption_passphrase("correct horse");
        let debug = format!("{settings:?}");
        assert!(!debug.contains("pepper"));
        assert!(!debug.contains("correct horse"));
    }

    #[test]
    fn test_settings_from_json() {
        let settings: EngineSettings = serde_json::from_value(serde_json::json!({
            "hash_secret": "pepper",
            "batch_size": 250,
            "connection": {"connect_timeout_secs": 5}
        }))
        .unwrap();
        assert_eq!(settings.hash_secret.expose(), "pepper");
        assert_eq!(settings.batch_size, 250);
        assert_eq!(settings.connection.connect_timeout_secs, 5);
        assert_eq!(settings.connection.query_timeout_secs, 300);
    }
}
