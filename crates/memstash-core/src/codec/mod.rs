//! Serializer and compressor seams plus the stock codecs.
//!
//! Serializers work on `serde_json::Value` so they stay object safe; the typed
//! helpers below bridge `T: Serialize` in and `T: DeserializeOwned` out.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StashError, StashResult};

mod gzip;
mod json;
mod yaml;

pub use gzip::{GzipCompressor, NoopCompressor};
pub use json::JsonSerializer;
pub use yaml::YamlSerializer;

/// Byte codec for values.
pub trait Serializer: Send + Sync {
    fn encode(&self, value: &serde_json::Value) -> StashResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> StashResult<serde_json::Value>;

    fn name(&self) -> &str;
}

/// Byte-to-byte compression transform.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> StashResult<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> StashResult<Vec<u8>>;

    fn name(&self) -> &str;
}

/// Serialize a typed value through `serializer`.
pub fn to_bytes<T: Serialize + ?Sized>(
    serializer: &dyn Serializer,
    value: &T,
) -> StashResult<Vec<u8>> {
    let tree = serde_json::to_value(value)?;
    serializer.encode(&tree)
}

/// Deserialize a typed value through `serializer`.
pub fn from_bytes<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> StashResult<T> {
    let tree = serializer.decode(bytes)?;
    serde_json::from_value(tree).map_err(|e| {
        StashError::serialization(format!(
            "payload does not match {}: {}",
            std::any::type_name::<T>(),
            e
        ))
    })
}
