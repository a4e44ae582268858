//! Call envelope exchanged with the engine
//!
//! Every engine call takes base64 text of a JSON request and returns base64
//! text of a JSON response `{success, data, error}`.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Failure reason reported for an envelope that cannot be decoded
pub const INVALID_RESPONSE: &str = "Invalid response";

/// Request for the engine's start call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(rename = "datDir")]
    pub dat_dir: String,

    #[serde(rename = "mphCachePath", default, skip_serializing_if = "Option::is_none")]
    pub mph_cache_path: Option<String>,

    #[serde(rename = "configJSON")]
    pub config_json: String,
}

impl StartRequest {
    /// Base64 text of the JSON request
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(raw.trim())
            .map_err(|e| Error::parse(format!("start request is not base64: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Response of any engine call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(default)]
    pub success: bool,

    #[serde(
        default,
        deserialize_with = "data_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResponse {
    pub fn ok(data: Option<String>) -> Self {
        CallResponse {
            success: true,
            data,
            error: None,
        }
    }

    pub fn fail<S: Into<String>>(error: S) -> Self {
        CallResponse {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Base64 text of the JSON response
    pub fn encode(&self) -> String {
        // Serializing plain strings and bools cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode an envelope, accepting base64 text or bare JSON
    pub fn decode(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(bytes) = STANDARD.decode(raw) {
            if let Ok(response) = serde_json::from_slice(&bytes) {
                return Ok(response);
            }
        }
        serde_json::from_str(raw).map_err(|_| Error::engine(INVALID_RESPONSE))
    }

    /// Turn the envelope into a result, with the engine's error as the reason
    pub fn into_result(self) -> Result<Option<String>> {
        if self.success {
            Ok(self.data)
        } else {
            let reason = self
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "engine reported failure".to_string());
            Err(Error::engine(reason))
        }
    }
}

/// `data` may be a string, a number or null; numbers keep their textual form
fn data_as_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
