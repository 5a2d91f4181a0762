// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core configuration document and its on-disk store.
//!
//! The document is kept as raw JSON text per top-level field so that fields the
//! supervisor does not understand (`routing`, `inbounds`, ...) pass through
//! untouched. Only the fields in [`ALLOWED_FIELDS`] survive a load or a save.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Serialize;
use serde_json::value::RawValue;
use tracing::debug;

use crate::errors::ConfigStoreError;

/// Top-level fields the core accepts from the settings document.
pub const ALLOWED_FIELDS: [&str; 14] = [
    "log",
    "api",
    "dns",
    "routing",
    "policy",
    "inbounds",
    "outbounds",
    "transport",
    "stats",
    "reverse",
    "fakedns",
    "metrics",
    "observatory",
    "burstObservatory",
];

// The core picks up `config.json` from its working directory on its own, which
// would shadow the document we feed it over stdin.
const RESERVED_FILE_NAME: &str = "config.json";

const INDENT: &[u8] = b"    ";

pub fn is_allowed_field(key: &str) -> bool {
    ALLOWED_FIELDS.contains(&key)
}

/// Mapping from top-level field name to the raw JSON text of its value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreConfiguration {
    fields: BTreeMap<String, String>,
}

impl CoreConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object, keeping every field's value verbatim.
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigStoreError> {
        let raw: BTreeMap<String, Box<RawValue>> =
            serde_json::from_slice(data).map_err(ConfigStoreError::Decode)?;
        Ok(Self {
            fields: raw
                .into_iter()
                .map(|(key, value)| (key, value.get().to_string()))
                .collect(),
        })
    }

    /// Stores `raw` as the value of `key` without validating it. Invalid JSON is
    /// reported when the document is rendered.
    pub fn insert_raw(&mut self, key: impl Into<String>, raw: impl Into<String>) -> Option<String> {
        self.fields.insert(key.into(), raw.into())
    }

    /// Serializes `value` and stores it under `key`, replacing any previous value.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ConfigStoreError> {
        let raw = serde_json::to_string(value).map_err(ConfigStoreError::Encode)?;
        self.fields.insert(key.to_string(), raw);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Drops every field that is not in [`ALLOWED_FIELDS`].
    pub fn retain_allowed(&mut self) {
        self.fields.retain(|key, _| is_allowed_field(key));
    }

    /// Renders the document as compact JSON.
    pub fn to_vec(&self) -> Result<Vec<u8>, ConfigStoreError> {
        serde_json::to_vec(&self.raw_values()?).map_err(ConfigStoreError::Encode)
    }

    /// Renders the document as JSON indented with four spaces, newline terminated.
    pub fn to_vec_pretty(&self) -> Result<Vec<u8>, ConfigStoreError> {
        let values = self.raw_values()?;
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(INDENT);
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        values
            .serialize(&mut serializer)
            .map_err(ConfigStoreError::Encode)?;
        out.push(b'\n');
        Ok(out)
    }

    fn raw_values(&self) -> Result<BTreeMap<&str, Box<RawValue>>, ConfigStoreError> {
        self.fields
            .iter()
            .map(|(key, raw)| {
                RawValue::from_string(raw.clone())
                    .map(|value| (key.as_str(), value))
                    .map_err(|_| ConfigStoreError::InvalidField { key: key.clone() })
            })
            .collect()
    }
}

pub trait ConfigLoader: Send + Sync {
    fn load_config(&self) -> Result<CoreConfiguration, ConfigStoreError>;
}

pub trait ConfigSaver: Send + Sync {
    fn save_config(&self, config: CoreConfiguration) -> Result<(), ConfigStoreError>;
}

/// Settings document on disk, replaced atomically on every save.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileConfigStore {
    /// Opens the settings document, normalizing it to the allowed fields.
    ///
    /// Fails when the file is missing or is not a JSON object, which callers
    /// treat as fatal at startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigStoreError> {
        let path = path.into();
        if path
            .file_name()
            .is_some_and(|name| name == RESERVED_FILE_NAME)
        {
            return Err(ConfigStoreError::ReservedName(path));
        }

        let store = Self {
            path,
            lock: RwLock::new(()),
        };
        let config = store.load_config()?;
        store.save_config(config)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp: OsString = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn write_temp(&self, tmp: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(tmp)?;
        file.write_all(data)?;
        file.sync_all()
    }
}

impl ConfigLoader for FileConfigStore {
    fn load_config(&self) -> Result<CoreConfiguration, ConfigStoreError> {
        #[allow(clippy::expect_used)]
        let _guard = self.lock.read().expect("lock poisoned");

        let data = fs::read(&self.path).map_err(|source| ConfigStoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        let mut config = CoreConfiguration::from_slice(&data)?;
        config.retain_allowed();
        Ok(config)
    }
}

impl ConfigSaver for FileConfigStore {
    fn save_config(&self, mut config: CoreConfiguration) -> Result<(), ConfigStoreError> {
        config.retain_allowed();
        let data = config.to_vec_pretty()?;

        #[allow(clippy::expect_used)]
        let _guard = self.lock.write().expect("lock poisoned");

        let tmp = self.temp_path();
        let write_error = |source| ConfigStoreError::Write {
            path: tmp.clone(),
            source,
        };
        if let Err(e) = self.write_temp(&tmp, &data) {
            let _ = fs::remove_file(&tmp);
            return Err(write_error(e));
        }
        fs::rename(&tmp, &self.path).map_err(|source| ConfigStoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!("Saved core config with {} fields to {}", config.len(), self.path.display());
        Ok(())
    }
}
