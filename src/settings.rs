//! Runtime settings.
//!
//! Loaded from a TOML file with five sections, every field optional:
//!
//! ```toml
//! [broker]
//! url = "amqp://lega:secret@mq:5672/%2F"
//! queue = "files"
//! connection_attempts = 30
//! retry_delay_ms = 1000
//! max_retry_delay_ms = 30000
//! max_redeliveries = 5
//!
//! [database]
//! path = "lega.db"
//! busy_timeout_ms = 5000
//!
//! [keys]
//! service_key = "keys/service.sec"
//! archive_key = "keys/archive.sec"
//! any_key_id = false
//!
//! [storage]
//! inbox = "inbox"
//! archive = "archive"
//! backup = "backup"
//!
//! [worker]
//! name = "worker-1"
//! log_level = "info"
//! ```
//!
//! Key passphrases and the broker URL may be set in the file but are better
//! passed through `LEGA_SERVICE_PASSPHRASE`, `LEGA_ARCHIVE_PASSPHRASE` and
//! `LEGA_BROKER_URL`, which take precedence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::broker::Backoff;
use crate::cipher::{PublicKeyAlgorithm, UnlockedKey, load_secret_keys};
use crate::config::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_CONNECTION_ATTEMPTS, DEFAULT_MAX_REDELIVERIES, DEFAULT_MAX_RETRY_DELAY_MS, DEFAULT_QUEUE, DEFAULT_RETRY_DELAY_MS};
use crate::engine::Keyring;
use crate::secret::Passphrase;

/// Environment variable holding the service key passphrase.
pub const SERVICE_PASSPHRASE_ENV: &str = "LEGA_SERVICE_PASSPHRASE";

/// Environment variable holding the archive key passphrase.
pub const ARCHIVE_PASSPHRASE_ENV: &str = "LEGA_ARCHIVE_PASSPHRASE";

/// Environment variable holding the broker URL, credentials included.
pub const BROKER_URL_ENV: &str = "LEGA_BROKER_URL";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub database: DatabaseSettings,
    pub keys: KeySettings,
    pub storage: StorageSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSettings {
    /// AMQP URL; only the `worker` command needs it.
    #[serde(deserialize_with = "secret")]
    pub url: Option<SecretString>,
    pub queue: String,
    pub connection_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,

    /// Requeues of a transiently failing message before it is dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: None,
            queue: DEFAULT_QUEUE.to_owned(),
            connection_attempts: DEFAULT_CONNECTION_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }
}

impl BrokerSettings {
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.retry_delay_ms), Duration::from_millis(self.max_retry_delay_ms))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { path: PathBuf::from("lega.db"), busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS }
    }
}

impl DatabaseSettings {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeySettings {
    pub service_key: PathBuf,

    #[serde(deserialize_with = "secret")]
    pub service_passphrase: Option<SecretString>,

    /// Defaults to the service key.
    pub archive_key: Option<PathBuf>,

    /// Defaults to the service passphrase.
    #[serde(deserialize_with = "secret")]
    pub archive_passphrase: Option<SecretString>,

    /// Try every key on every session key packet, whatever key id it names.
    pub any_key_id: bool,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self { service_key: PathBuf::from("keys/service.sec"), service_passphrase: None, archive_key: None, archive_passphrase: None, any_key_id: false }
    }
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    pub inbox: PathBuf,
    pub archive: PathBuf,
    pub backup: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { inbox: PathBuf::from("inbox"), archive: PathBuf::from("archive"), backup: PathBuf::from("backup") }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Recorded with every error row.
    pub name: String,

    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()), log_level: "info".to_owned() }
    }
}

impl Settings {
    /// Parses settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid TOML or unknown fields.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid settings")
    }

    /// Loads the settings file, or the defaults when `path` is `None`, and
    /// applies passphrases from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let text = fs::read_to_string(path).with_context(|| format!("failed to read settings: {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("in {}", path.display()))?
            }
            None => Self::default(),
        };

        settings.apply_env(|name| std::env::var(name).ok());
        debug!(?settings, "settings loaded");
        Ok(settings)
    }

    /// Overrides secrets with the values `lookup` finds.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(BROKER_URL_ENV) {
            self.broker.url = Some(SecretString::from(url));
        }
        if let Some(passphrase) = lookup(SERVICE_PASSPHRASE_ENV) {
            self.keys.service_passphrase = Some(SecretString::from(passphrase));
        }
        if let Some(passphrase) = lookup(ARCHIVE_PASSPHRASE_ENV) {
            self.keys.archive_passphrase = Some(SecretString::from(passphrase));
        }
    }
}

impl KeySettings {
    /// Unlocks the service keys and the archive key.
    ///
    /// # Errors
    ///
    /// Returns an error when a key file cannot be read or unlocked, or holds
    /// no key that can decrypt.
    pub fn keyring(&self) -> Result<Keyring> {
        let service = unlock_all(&self.service_key, self.service_passphrase.as_ref())?;

        let archive_path = self.archive_key.as_deref().unwrap_or(&self.service_key);
        let archive_passphrase = self.archive_passphrase.as_ref().or(self.service_passphrase.as_ref());
        let archive = unlock_all(archive_path, archive_passphrase)?
            .into_iter()
            .rev()
            .find(|key| matches!(key.public().algorithm(), PublicKeyAlgorithm::Rsa | PublicKeyAlgorithm::RsaEncryptOnly))
            .with_context(|| format!("{} holds no RSA encryption key", archive_path.display()))?;

        info!(service_keys = service.len(), archive_key = %archive.key_id(), any_key_id = self.any_key_id, "keys unlocked");
        Ok(Keyring::new(service, archive, self.any_key_id))
    }
}

/// Unlocks every secret key of a key file.
fn unlock_all(path: &Path, passphrase: Option<&SecretString>) -> Result<Vec<UnlockedKey>> {
    let data = fs::read(path).with_context(|| format!("failed to read key file: {}", path.display()))?;
    let keys = load_secret_keys(&data).with_context(|| format!("invalid key file: {}", path.display()))?;

    let passphrase = passphrase.map_or_else(Passphrase::empty, Passphrase::from);
    let unlocked = keys
        .iter()
        .map(|key| key.unlock(&passphrase).with_context(|| format!("failed to unlock key {} of {}", key.key_id(), path.display())))
        .collect::<Result<Vec<_>>>()?;

    if unlocked.is_empty() {
        bail!("{} holds no secret key", path.display());
    }
    Ok(unlocked)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;
    use tempfile::tempdir;

    use super::*;
    use crate::fixtures;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.broker.queue, DEFAULT_QUEUE);
        assert_eq!(settings.broker.connection_attempts, DEFAULT_CONNECTION_ATTEMPTS);
        assert_eq!(settings.storage.backup, PathBuf::from("backup"));
        assert!(settings.keys.service_passphrase.is_none());
        assert!(!settings.keys.any_key_id);
        assert!(settings.broker.url.is_none());
        assert_eq!(settings.broker.max_redeliveries, DEFAULT_MAX_REDELIVERIES);
        assert_eq!(settings.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn test_sections_override_defaults() {
        let settings = Settings::from_toml(
            r#"
            [broker]
            url = "amqp://lega:hunter2@mq:5672/%2F"
            queue = "ingest"
            retry_delay_ms = 10
            max_redeliveries = 2

            [database]
            busy_timeout_ms = 250

            [keys]
            service_key = "/etc/lega/service.sec"
            service_passphrase = "crazywow"
            any_key_id = true

            [worker]
            name = "worker-7"
            "#,
        )
        .unwrap();

        assert_eq!(settings.broker.queue, "ingest");
        assert_eq!(settings.broker.backoff().delay(0), Duration::from_millis(10));
        assert_eq!(settings.broker.max_redeliveries, 2);
        assert_eq!(settings.database.busy_timeout(), Duration::from_millis(250));
        assert!(!format!("{settings:?}").contains("hunter2"));
        assert_eq!(settings.keys.service_passphrase.as_ref().map(ExposeSecret::expose_secret), Some("crazywow"));
        assert!(settings.keys.any_key_id);
        assert_eq!(settings.worker.name, "worker-7");
        assert!(!format!("{settings:?}").contains("crazywow"));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Settings::from_toml("[broker]\nhost = \"x\"").is_err());
    }

    #[test]
    fn test_environment_passphrases_take_precedence() {
        let mut settings = Settings::from_toml("[keys]\nservice_passphrase = \"from-file\"").unwrap();
        settings.apply_env(|name| match name {
            SERVICE_PASSPHRASE_ENV => Some("from-env".to_owned()),
            BROKER_URL_ENV => Some("amqp://mq".to_owned()),
            _ => None,
        });
        assert_eq!(settings.keys.service_passphrase.as_ref().map(ExposeSecret::expose_secret), Some("from-env"));
        assert_eq!(settings.broker.url.as_ref().map(ExposeSecret::expose_secret), Some("amqp://mq"));
        assert!(settings.keys.archive_passphrase.is_none());
    }

    #[test]
    fn test_keyring_from_key_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.sec");
        fs::write(&path, fixtures::secret_key()).unwrap();

        let mut settings = Settings::default();
        settings.keys.service_key = path;
        settings.apply_env(|name| (name == SERVICE_PASSPHRASE_ENV).then(|| fixtures::PASSPHRASE.to_owned()));

        let keyring = settings.keys.keyring().unwrap();
        assert_eq!(keyring.service().len(), 1);
        assert_eq!(keyring.archive().key_id().to_string(), fixtures::KEY_ID);
    }

    #[test]
    fn test_keyring_with_wrong_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.sec");
        fs::write(&path, fixtures::secret_key()).unwrap();

        let mut settings = Settings::default();
        settings.keys.service_key = path;
        settings.keys.service_passphrase = Some(SecretString::from("wrong".to_owned()));

        let error = settings.keys.keyring().unwrap_err();
        assert!(format!("{error:#}").contains("failed to unlock key"));
    }
}
