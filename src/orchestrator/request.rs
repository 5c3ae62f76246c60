use serde_json::Value;

use super::error::SimulationError;

/// A caller-supplied simulation configuration, forwarded to the engine as is.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationRequest {
    payload: Value,
}

impl SimulationRequest {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Accepts a body only when it is declared as JSON and parses as JSON.
    pub fn from_http(content_type: Option<&str>, body: &[u8]) -> Result<Self, SimulationError> {
        match content_type {
            Some(ct) if is_json_content_type(ct) => {}
            Some(ct) => {
                return Err(SimulationError::InvalidInput(format!(
                    "unsupported content type {ct}"
                )))
            }
            None => {
                return Err(SimulationError::InvalidInput(
                    "missing content type".to_string(),
                ))
            }
        }

        serde_json::from_slice(body)
            .map(Self::new)
            .map_err(|e| SimulationError::InvalidInput(e.to_string()))
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// `application/json` or any `application/*+json`, parameters ignored.
pub fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    mime == "application/json"
        || mime
            .strip_prefix("application/")
            .is_some_and(|sub| sub.ends_with("+json"))
}
