use super::Serializer;
use crate::error::StashResult;

/// YAML, for human-inspectable backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn encode(&self, value: &serde_json::Value) -> StashResult<Vec<u8>> {
        Ok(serde_yaml::to_string(value)?.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> StashResult<serde_json::Value> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    fn name(&self) -> &str {
        "yaml"
    }
}
