//! Capability envelope handling.
//!
//! Requests carry `{provider, module, ...}`. The `provider` field is removed
//! before a provider sees the payload, and stamped back onto every callback
//! by the routing layer.

use serde_json::{Map, Value};

pub const PROVIDER_FIELD: &str = "provider";
pub const MODULE_FIELD: &str = "module";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope field `{0}` is missing or not a string")]
    MissingField(&'static str),
}

fn parse_object(text: &str) -> Result<Map<String, Value>, EnvelopeError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(EnvelopeError::NotAnObject),
        Err(e) => Err(EnvelopeError::InvalidJson(e.to_string())),
    }
}

fn string_field(map: &Map<String, Value>, field: &'static str) -> Result<String, EnvelopeError> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(EnvelopeError::MissingField(field))
}

/// A parsed outbound capability request.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityEnvelope {
    pub provider: String,
    pub module: String,
    body: Map<String, Value>,
}

impl CapabilityEnvelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        Self::from_map(parse_object(text)?)
    }

    pub fn from_map(mut body: Map<String, Value>) -> Result<Self, EnvelopeError> {
        let provider = string_field(&body, PROVIDER_FIELD)?;
        let module = string_field(&body, MODULE_FIELD)?;
        body.remove(PROVIDER_FIELD);
        Ok(Self {
            provider,
            module,
            body,
        })
    }

    /// The payload handed to the provider: the envelope without `provider`.
    pub fn provider_payload(&self) -> String {
        Value::Object(self.body.clone()).to_string()
    }
}

/// The `module` named by a provider payload, if any.
pub fn payload_module(payload: &str) -> Option<String> {
    let map = parse_object(payload).ok()?;
    string_field(&map, MODULE_FIELD).ok()
}

/// Overwrite `provider` on a callback payload.
pub fn stamp_provider(payload: &str, provider: &str) -> Result<String, EnvelopeError> {
    let mut map = parse_object(payload)?;
    map.insert(PROVIDER_FIELD.to_string(), Value::String(provider.to_string()));
    Ok(Value::Object(map).to_string())
}
