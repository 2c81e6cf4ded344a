use std::path::PathBuf;

use super::ip::{CidrParseError, HardwareAddrParseError};

/// Why a configuration could not be turned into a snapshot
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("malformed configuration: {0}")]
    Syntax(String),
    #[error("invalid hardware address {value:?} in {field}: {source}")]
    HardwareAddr {
        field: String,
        value: String,
        #[source]
        source: HardwareAddrParseError,
    },
    #[error("invalid CIDR {value:?} in {field}: {source}")]
    Cidr {
        field: String,
        value: String,
        #[source]
        source: CidrParseError,
    },
    #[error("invalid {family} {value:?}")]
    AddressFamily {
        family: &'static str,
        value: String,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
