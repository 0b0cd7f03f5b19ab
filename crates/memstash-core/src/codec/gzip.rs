use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::Compressor;
use crate::error::{StashError, StashResult};

/// Inflated size limit when none is configured.
const DEFAULT_MAX_OUTPUT: u64 = 64 * 1024 * 1024;

/// Gzip at the default level. Decompression stops with an error once the
/// output would exceed `max_output` bytes.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
    max_output: u64,
}

impl GzipCompressor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    /// Compression level 0-9.
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            ..Self::new()
        }
    }

    pub fn with_max_output(mut self, max_output: u64) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn max_output(&self) -> u64 {
        self.max_output
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> StashResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| StashError::Compression {
                message: format!("gzip compress failed: {}", e),
            })
    }

    fn decompress(&self, data: &[u8]) -> StashResult<Vec<u8>> {
        let cap = usize::try_from(self.max_output).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(cap));
        // one byte past the limit tells an exact fit from an overflow
        GzDecoder::new(data)
            .take(self.max_output.saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| StashError::Compression {
                message: format!("gzip decompress failed: {}", e),
            })?;
        if out.len() as u64 > self.max_output {
            return Err(StashError::Compression {
                message: format!(
                    "gzip payload inflates past the {} byte limit",
                    self.max_output
                ),
            });
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "gzip"
    }
}

/// Identity transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, data: &[u8]) -> StashResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> StashResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_shrinks_repetitive_payloads() {
        let data = "memstash ".repeat(500).into_bytes();
        let gzip = GzipCompressor::new();

        let packed = gzip.compress(&data).unwrap();
        assert!(packed.len() < data.len() / 4);
        assert_eq!(gzip.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let err = GzipCompressor::new().decompress(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, StashError::Compression { .. }));
    }

    #[test]
    fn test_inflation_past_limit_is_rejected() {
        // 1 MiB of zeros packs into about a kilobyte
        let bomb = GzipCompressor::new().compress(&vec![0u8; 1024 * 1024]).unwrap();
        assert!(bomb.len() < 8 * 1024);

        let bounded = GzipCompressor::new().with_max_output(64 * 1024);
        let err = bounded.decompress(&bomb).unwrap_err();
        match err {
            StashError::Compression { message } => assert!(message.contains("limit"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }

        let exact = GzipCompressor::new().with_max_output(1024 * 1024);
        assert_eq!(exact.decompress(&bomb).unwrap().len(), 1024 * 1024);
    }

    #[test]
    fn test_empty_input() {
        let gzip = GzipCompressor::with_level(9);
        let packed = gzip.compress(&[]).unwrap();
        assert!(gzip.decompress(&packed).unwrap().is_empty());
    }
}
