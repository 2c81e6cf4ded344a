//! Configuration loading, validation and the live snapshot store

mod error;
pub mod ip;
mod raw;
mod snapshot;
mod store;

pub use error::ConfigError;
pub use snapshot::*;
pub use store::ConfigStore;

use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use raw::RawConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Where configuration text comes from
///
/// The source is re-read on every reload.
pub trait ConfigSource: Send + Sync {
    fn read(&self) -> Result<String, ConfigError>;

    fn format(&self) -> ConfigFormat;

    /// Human-readable origin, used in log messages
    fn describe(&self) -> String;
}

/// A configuration file; `.json` files are parsed as JSON, everything else as TOML
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileSource {
    fn read(&self) -> Result<String, ConfigError> {
        std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn format(&self) -> ConfigFormat {
        match self.path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// An in-memory configuration whose text can be replaced between reloads
pub struct MemorySource {
    format: ConfigFormat,
    text: Mutex<String>,
}

impl MemorySource {
    pub fn new(format: ConfigFormat, text: impl Into<String>) -> Self {
        Self {
            format,
            text: Mutex::new(text.into()),
        }
    }

    pub fn replace(&self, text: impl Into<String>) {
        *self.text.lock() = text.into();
    }
}

impl ConfigSource for MemorySource {
    fn read(&self) -> Result<String, ConfigError> {
        Ok(self.text.lock().clone())
    }

    fn format(&self) -> ConfigFormat {
        self.format
    }

    fn describe(&self) -> String {
        "in-memory configuration".to_string()
    }
}

/// Reads and validates the whole configuration from `source`
pub fn load(source: &dyn ConfigSource) -> Result<ConfigSnapshot, ConfigError> {
    let text = source.read()?;
    parse(&text, source.format())
}

/// Parses and validates configuration text; nothing is returned unless every field is valid
pub fn parse(text: &str, format: ConfigFormat) -> Result<ConfigSnapshot, ConfigError> {
    let raw: RawConfig = match format {
        ConfigFormat::Toml => toml::from_str(text).map_err(|e| decode_error(e.to_string()))?,
        ConfigFormat::Json => serde_json::from_str(text).map_err(|e| decode_error(e.to_string()))?,
    };

    ConfigSnapshot::from_raw(raw)
}

fn decode_error(message: String) -> ConfigError {
    const MARKER: &str = "unknown field `";

    let unknown = message.find(MARKER).and_then(|start| {
        let rest = &message[start + MARKER.len()..];
        rest.find('`').map(|end| rest[..end].to_string())
    });

    match unknown {
        Some(name) => ConfigError::UnknownOption(name),
        None => ConfigError::Syntax(message),
    }
}
