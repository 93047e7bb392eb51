// config.rs — Compilation options
//
// One options struct covers the three knobs a compilation unit exposes. Every
// field has a default, so an empty JSON object (or no file at all) is valid.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Inserted between the source name and the serial of a wrapper.
    pub wrapper_suffix: String,
    /// Emit one `if` per specialization around a producer's loop nests.
    pub emit_specializations: bool,
    /// Check every load and store against the realized buffer bounds.
    pub check_bounds: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            wrapper_suffix: ".in".to_string(),
            emit_specializations: true,
            check_bounds: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

impl Options {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
