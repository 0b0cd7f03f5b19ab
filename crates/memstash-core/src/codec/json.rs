use super::Serializer;
use crate::error::StashResult;

/// Compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, value: &serde_json::Value) -> StashResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> StashResult<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn name(&self) -> &str {
        "json"
    }
}
