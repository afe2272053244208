//! Client output decoding

use crate::tree::AttributeTree;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Output format of a client sub-command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Yaml,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Json => write!(f, "JSON"),
            Format::Yaml => write!(f, "YAML"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty {0} document")]
    Empty(Format),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How a call site treats output that does not decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Undecodable output means the resource is absent
    Lenient,
    /// Undecodable output is an error
    Strict,
}

/// Parse client output into an attribute tree
pub fn decode(bytes: &[u8], format: Format) -> Result<AttributeTree, DecodeError> {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return Err(DecodeError::Empty(format));
    }

    let value: Value = match format {
        Format::Json => serde_json::from_str(&text)?,
        Format::Yaml => serde_yaml::from_str(&text)?,
    };
    Ok(AttributeTree::new(value))
}

/// Parse client output, applying the call site's leniency
pub fn decode_with(
    bytes: &[u8],
    format: Format,
    policy: DecodePolicy,
) -> Result<Option<AttributeTree>, DecodeError> {
    match decode(bytes, format) {
        Ok(tree) => Ok(Some(tree)),
        Err(e) if policy == DecodePolicy::Lenient => {
            tracing::debug!("Treating undecodable output as absent: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
