//! Configuration for claim-check senders and receivers.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `CLAIMCHECK__`)
//! 2. YAML configuration file
//! 3. Defaults
//!
//! # Connection Strings
//!
//! Both connection strings select a backend by scheme:
//!
//! - `memory://` keeps the queue or the blobs in process memory.
//! - `file://<path>` stores blobs as files below `<path>`. Only valid for the blob store.
//!
//! # Example
//!
//! ```yaml
//! queue_connection_string: memory://
//! blob_connection_string: file:///var/lib/claimcheck
//! queue_name: orders
//! container_name: order-payloads
//! max_concurrent_deliveries: 8
//! ```

use std::fmt;
use std::path::Path;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "CLAIMCHECK__";

/// Connection string selecting the in-process backends.
pub const MEMORY_CONNECTION_STRING: &str = "memory://";

/// Newtype around `String` that keeps connection strings out of logs. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_owned())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

fn secret(value: &str) -> SecretBox<ConfigSecret> {
    SecretBox::new(Box::new(ConfigSecret::from(value)))
}

/// Connection and dispatch settings.
///
/// No options besides the ones below are recognized. Unknown keys in the YAML file or in
/// `CLAIMCHECK__` environment variables fail [`Config::load`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where the queue lives.
    ///
    /// # Default
    ///
    /// `memory://`
    ///
    /// # Environment Variable
    ///
    /// `CLAIMCHECK__QUEUE_CONNECTION_STRING`
    pub queue_connection_string: SecretBox<ConfigSecret>,

    /// Where offloaded payloads are stored.
    ///
    /// # Default
    ///
    /// `memory://`
    ///
    /// # Environment Variable
    ///
    /// `CLAIMCHECK__BLOB_CONNECTION_STRING`
    pub blob_connection_string: SecretBox<ConfigSecret>,

    /// The queue messages are sent to and received from.
    ///
    /// # Default
    ///
    /// `claimcheck`
    pub queue_name: String,

    /// The blob container holding offloaded payloads.
    ///
    /// # Default
    ///
    /// `claimcheck`
    pub container_name: String,

    /// Upper bound on deliveries a receiver processes at once.
    ///
    /// # Default
    ///
    /// `1`
    pub max_concurrent_deliveries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_connection_string: secret(MEMORY_CONNECTION_STRING),
            blob_connection_string: secret(MEMORY_CONNECTION_STRING),
            queue_name: "claimcheck".to_owned(),
            container_name: "claimcheck".to_owned(),
            max_concurrent_deliveries: 1,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if any source contains
    /// invalid values or unknown keys.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert_eq!(
                config.queue_connection_string.expose_secret().as_str(),
                "memory://"
            );
            assert_eq!(
                config.blob_connection_string.expose_secret().as_str(),
                "memory://"
            );
            assert_eq!(config.queue_name, "claimcheck");
            assert_eq!(config.container_name, "claimcheck");
            assert_eq!(config.max_concurrent_deliveries, 1);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CLAIMCHECK__BLOB_CONNECTION_STRING", "file:///tmp/payloads");
            jail.set_env("CLAIMCHECK__QUEUE_NAME", "orders");
            jail.set_env("CLAIMCHECK__MAX_CONCURRENT_DELIVERIES", "16");

            let config = Config::load(None).unwrap();

            assert_eq!(
                config.blob_connection_string.expose_secret().as_str(),
                "file:///tmp/payloads"
            );
            assert_eq!(config.queue_name, "orders");
            assert_eq!(config.container_name, "claimcheck");
            assert_eq!(config.max_concurrent_deliveries, 16);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            queue_name: orders
            container_name: order-payloads
            max_concurrent_deliveries: 4
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("CLAIMCHECK__MAX_CONCURRENT_DELIVERIES", "8");

            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.queue_name, "orders");
            assert_eq!(config.container_name, "order-payloads");
            assert_eq!(config.max_concurrent_deliveries, 8);

            Ok(())
        });
    }

    #[test]
    fn rejects_unknown_options() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CLAIMCHECK__AUTO_COMPLETE", "true");

            assert!(Config::load(None).is_err());

            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        let config = Config::default();
        let debug = format!("{config:?}");

        assert!(!debug.contains("memory://"));
    }
}
