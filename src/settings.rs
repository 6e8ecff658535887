//! Configuration persistence
//!
//! [`SettingsStore`] abstracts over whatever key/value backend the host
//! application uses. [`crate::ClientConfig`] loads and stores itself
//! through it under the `indi/` key prefix; absent or unparseable keys
//! fall back to the defaults.

use crate::{BlobPolicy, ClientConfig};
use std::path::PathBuf;

/// String key/value backend for client settings.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

const KEY_HOST: &str = "indi/host";
const KEY_PORT: &str = "indi/port";
const KEY_CONNECT_TIMEOUT: &str = "indi/connect-timeout-secs";
const KEY_VERBOSITY: &str = "indi/verbosity";
const KEY_BLOB_POLICY: &str = "indi/blob-policy";
const KEY_DOWNLOAD_DIR: &str = "indi/download-dir";

impl ClientConfig {
    /// Build a config from a settings store, defaulting each missing or
    /// invalid key individually.
    pub fn load(store: &dyn SettingsStore) -> Self {
        let defaults = ClientConfig::default();
        Self {
            host: store.get(KEY_HOST).unwrap_or(defaults.host),
            port: store
                .get(KEY_PORT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            connect_timeout_secs: store
                .get(KEY_CONNECT_TIMEOUT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_secs),
            verbosity: store
                .get(KEY_VERBOSITY)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.verbosity),
            blob_policy: store
                .get(KEY_BLOB_POLICY)
                .and_then(|v| BlobPolicy::parse(&v))
                .unwrap_or(defaults.blob_policy),
            download_dir: store.get(KEY_DOWNLOAD_DIR).map(PathBuf::from),
        }
    }

    /// Persist every field. The download directory key is only written when
    /// one is configured.
    pub fn store(&self, store: &mut dyn SettingsStore) {
        store.set(KEY_HOST, &self.host);
        store.set(KEY_PORT, &self.port.to_string());
        store.set(KEY_CONNECT_TIMEOUT, &self.connect_timeout_secs.to_string());
        store.set(KEY_VERBOSITY, &self.verbosity.to_string());
        store.set(KEY_BLOB_POLICY, self.blob_policy.as_str());
        if let Some(dir) = &self.download_dir {
            store.set(KEY_DOWNLOAD_DIR, &dir.to_string_lossy());
        }
    }
}
