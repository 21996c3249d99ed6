use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;

/// One generation request: the opaque backend payload and how many times to run it.
///
/// Immutable once built. The serialized form is what gets embedded into every
/// produced image, so the field names follow the provenance format consumers
/// already read (`comfy_api`, `images_per_batch`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "comfy_api")]
    backend_payload: Value,
    #[serde(rename = "images_per_batch")]
    batch_count: u32,
}

impl Request {
    /// # Errors
    /// Returns [`FetchError::InvalidRequest`] when `batch_count` is zero.
    pub fn new(backend_payload: Value, batch_count: u32) -> Result<Self, FetchError> {
        if batch_count == 0 {
            return Err(FetchError::InvalidRequest(
                "batch count must be at least 1".into(),
            ));
        }
        Ok(Self {
            backend_payload,
            batch_count,
        })
    }

    pub fn backend_payload(&self) -> &Value {
        &self.backend_payload
    }

    pub const fn batch_count(&self) -> u32 {
        self.batch_count
    }

    /// Serialized snapshot stored alongside each generated image.
    pub fn to_metadata(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_zero_batch_count() {
        let err = Request::new(json!({}), 0).unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }

    #[test]
    fn metadata_uses_provenance_field_names() {
        let req = Request::new(json!({"6": {"inputs": {"text": "a lighthouse"}}}), 2).unwrap();
        let meta: Value = serde_json::from_str(&req.to_metadata().unwrap()).unwrap();
        assert_eq!(meta["images_per_batch"], 2);
        assert_eq!(meta["comfy_api"]["6"]["inputs"]["text"], "a lighthouse");
    }
}
