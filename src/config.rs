//! Layered configuration.
//!
//! [`Properties`] merges any number of configuration files (format picked
//! from the extension: toml, json, yaml, ini) plus `RESUME_*` environment
//! variables into one immutable, flat key space. Later sources override
//! earlier ones. Values may reference other keys with `${key}`, resolved on
//! read with a bounded depth so a cycle fails instead of recursing forever.
//!
//! [`Settings`] is the typed view the download service needs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File, Value, ValueKind};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::headers::BuildOptions;
use crate::transfer::DEFAULT_CHUNK_SIZE;
use crate::{DownloadOptions, MalformedRangePolicy};

/// Longest `${...}` chain followed before giving up.
pub const MAX_INTERPOLATION_DEPTH: usize = 16;

/// Environment variables with this prefix override file values,
/// `RESUME_SERVER__BIND` sets `server.bind`.
pub const ENV_PREFIX: &str = "RESUME";

/// Key under which the list of loaded files is recorded.
pub const CONFIG_FILES_KEY: &str = "config_files";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    Load(#[from] ::config::ConfigError),
    #[error("reference cycle while resolving `{key}`")]
    CyclicReference { key: String },
    #[error("`{key}` references undefined key `{missing}`")]
    MissingKey { key: String, missing: String },
}

/// Merged configuration values, keyed by dotted path (`server.bind`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    /// Loads `paths` in order. Missing files are skipped.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        for path in paths {
            builder = builder.add_source(File::from(path.as_ref()).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let merged: HashMap<String, Value> = builder.build()?.try_deserialize()?;

        let mut values = BTreeMap::new();
        for (key, value) in merged {
            flatten(key, value, &mut values);
        }

        let files: Vec<String> = paths.iter().map(|p| p.as_ref().display().to_string()).collect();
        values.insert(CONFIG_FILES_KEY.to_owned(), files.join(","));

        debug!(files = %files.join(","), keys = values.len(), "configuration loaded");
        Ok(Properties { values })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Properties {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// The stored value with references left in place.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The value for `key` with every `${...}` reference expanded.
    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.lookup(key, 0)
    }

    pub fn get_or(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_owned()))
    }

    /// Every key, fully expanded.
    pub fn resolved(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.values
            .iter()
            .map(|(key, raw)| Ok((key.clone(), self.interpolate(key, raw, 0)?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn lookup(&self, key: &str, depth: usize) -> Result<Option<String>, ConfigError> {
        match self.values.get(key) {
            Some(raw) => self.interpolate(key, raw, depth).map(Some),
            None => Ok(None),
        }
    }

    fn interpolate(&self, key: &str, raw: &str, depth: usize) -> Result<String, ConfigError> {
        if depth >= MAX_INTERPOLATION_DEPTH {
            return Err(ConfigError::CyclicReference { key: key.to_owned() });
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(open) = rest.find("${") {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                // unterminated, keep literally
                break;
            };
            out.push_str(&rest[..open]);

            let name = &rest[open + 2..close];
            let value = self.lookup(name, depth + 1)?.ok_or_else(|| ConfigError::MissingKey {
                key: key.to_owned(),
                missing: name.to_owned(),
            })?;
            out.push_str(&value);
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn flatten(key: String, value: Value, out: &mut BTreeMap<String, String>) {
    match value.kind {
        ValueKind::Table(table) => {
            for (child, value) in table {
                flatten(format!("{key}.{child}"), value, out);
            }
        }
        ValueKind::Array(items) => {
            for (i, value) in items.into_iter().enumerate() {
                flatten(format!("{key}[{i}]"), value, out);
            }
        }
        ValueKind::Nil => {}
        scalar => {
            if let Ok(text) = Value::new(None, scalar).into_string() {
                out.insert(key, text);
            }
        }
    }
}

/// Typed settings for the download service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub download: DownloadSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub root: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "127.0.0.1:3000".to_owned(),
            root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub chunk_size: usize,
    pub malformed_range: MalformedRangePolicy,
    pub advertise_ranges: bool,
    pub channel_depth: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        let options = DownloadOptions::default();
        DownloadSettings {
            chunk_size: options.chunk_size,
            malformed_range: options.malformed_range,
            advertise_ranges: options.headers.advertise_ranges_on_full,
            channel_depth: options.channel_depth,
        }
    }
}

impl Settings {
    /// Deserializes settings from fully expanded `properties`.
    pub fn from_properties(properties: &Properties) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        for (key, value) in properties.resolved()? {
            if key == CONFIG_FILES_KEY {
                continue;
            }
            builder = builder.set_override(key, value)?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            chunk_size: if self.download.chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                self.download.chunk_size
            },
            malformed_range: self.download.malformed_range,
            headers: BuildOptions {
                advertise_ranges_on_full: self.download.advertise_ranges,
            },
            channel_depth: self.download.channel_depth.max(1),
        }
    }
}
