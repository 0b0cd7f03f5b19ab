//! Blob frame written in front of every stored payload.
//!
//! ```text
//! "MS" | version (1) | flags | [key_id_len: u16 BE | key_id] | body
//! ```
//!
//! Flags record which transforms the writer applied, so the reader reverses
//! exactly those regardless of the reader's own configuration. The key id
//! section is present iff the encrypted flag is set.

use crate::error::{StashError, StashResult};

const MAGIC: &[u8; 2] = b"MS";
const VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;
const KNOWN_FLAGS: u8 = FLAG_COMPRESSED | FLAG_ENCRYPTED;

/// Parsed frame borrowing its body from the stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame<'a> {
    pub compressed: bool,
    pub key_id: Option<String>,
    pub body: &'a [u8],
}

pub(crate) fn encode(compressed: bool, key_id: Option<&str>, body: &[u8]) -> StashResult<Vec<u8>> {
    let key_len = key_id.map(str::len).unwrap_or(0);
    let mut out = Vec::with_capacity(4 + 2 + key_len + body.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);

    let mut flags = 0;
    if compressed {
        flags |= FLAG_COMPRESSED;
    }
    if key_id.is_some() {
        flags |= FLAG_ENCRYPTED;
    }
    out.push(flags);

    if let Some(id) = key_id {
        let len = u16::try_from(id.len())
            .map_err(|_| StashError::serialization(format!("key id too long: {} bytes", id.len())))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(id.as_bytes());
    }

    out.extend_from_slice(body);
    Ok(out)
}

pub(crate) fn decode(blob: &[u8]) -> StashResult<Frame<'_>> {
    if blob.len() < 4 || &blob[..2] != MAGIC {
        return Err(StashError::serialization("missing memstash frame header"));
    }
    if blob[2] != VERSION {
        return Err(StashError::serialization(format!(
            "unsupported frame version {}",
            blob[2]
        )));
    }

    let flags = blob[3];
    if flags & !KNOWN_FLAGS != 0 {
        return Err(StashError::serialization(format!("unknown frame flags {:#04x}", flags)));
    }

    let mut rest = &blob[4..];
    let key_id = if flags & FLAG_ENCRYPTED != 0 {
        if rest.len() < 2 {
            return Err(StashError::serialization("truncated key id length"));
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(StashError::serialization("truncated key id"));
        }
        let id = std::str::from_utf8(&rest[..len])
            .map_err(|_| StashError::serialization("key id is not utf-8"))?
            .to_string();
        rest = &rest[len..];
        Some(id)
    } else {
        None
    };

    Ok(Frame {
        compressed: flags & FLAG_COMPRESSED != 0,
        key_id,
        body: rest,
    })
}
