//! Entry file format, parsed with nom
//!
//! Each cached frame lives in its own file named by the key's stable digest
//! (`<digest:016x>.frame`). File layout:
//!
//! ```text
//! REELFRM1
//! [version: u16]
//! [stage: u8]
//! [name_len: u16]
//! [frame_index_bits: u32]
//! [timeline_frame: i32]
//! [key_digest: u64]
//! [width: u32]
//! [height: u32]
//! [payload_len: u64]
//! [strip name: name_len bytes, UTF-8]
//! ...payload_len raw pixel bytes...
//! ```
//!
//! All integers are little-endian. The header repeats the digest the file is
//! named after and freezes the timeline frame the entry was written for, so
//! an index can be rebuilt and invalidated without touching live strips.

use nom::bytes::complete::take;
use nom::number::complete::{le_i32, le_u16, le_u32, le_u64, le_u8};

use reelcache::CacheStage;

use crate::error::{Error, Result};

/// Magic header for frame entry files
pub const FRAME_MAGIC: &[u8] = b"REELFRM1";

/// Current entry format version
pub const FORMAT_VERSION: u16 = 1;

/// Byte length of the header up to (not including) the strip name
pub const FIXED_HEADER_LEN: usize = 45;

/// Parsed frame entry header
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// Entry format version
    pub version: u16,
    /// Pipeline stage the frame was cached at
    pub stage: CacheStage,
    /// Bit pattern of the key's stored frame index
    pub frame_index_bits: u32,
    /// Timeline frame the entry resolved to when written
    pub timeline_frame: i32,
    /// Stable key digest, must match the file name
    pub key_digest: u64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Payload size in bytes
    pub payload_len: u64,
    /// Name of the strip the frame belongs to
    pub strip_name: String,
}

/// Parse a frame entry header
///
/// Returns the header and the total header length in bytes, so the payload
/// starts at `input[len..]`.
pub fn parse_header(input: &[u8]) -> Result<(FrameHeader, usize)> {
    if input.len() < FIXED_HEADER_LEN {
        return Err(Error::Format("input too short for header".to_string()));
    }

    if &input[..FRAME_MAGIC.len()] != FRAME_MAGIC {
        return Err(Error::Format("invalid entry magic".to_string()));
    }

    let rest = &input[FRAME_MAGIC.len()..];
    let (rest, version) = le_u16(rest)?;
    let (rest, stage_code) = le_u8(rest)?;
    let (rest, name_len) = le_u16(rest)?;
    let (rest, frame_index_bits) = le_u32(rest)?;
    let (rest, timeline_frame) = le_i32(rest)?;
    let (rest, key_digest) = le_u64(rest)?;
    let (rest, width) = le_u32(rest)?;
    let (rest, height) = le_u32(rest)?;
    let (rest, payload_len) = le_u64(rest)?;
    let (rest, name_bytes) = take(name_len as usize)(rest)?;

    if version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported entry version {}",
            version
        )));
    }

    let stage = CacheStage::from_code(stage_code)
        .ok_or_else(|| Error::Format(format!("unknown stage code {}", stage_code)))?;

    let strip_name = std::str::from_utf8(name_bytes)
        .map_err(|_| Error::Format("strip name is not UTF-8".to_string()))?
        .to_string();

    let header_len = input.len() - rest.len();

    Ok((
        FrameHeader {
            version,
            stage,
            frame_index_bits,
            timeline_frame,
            key_digest,
            width,
            height,
            payload_len,
            strip_name,
        },
        header_len,
    ))
}

/// Serialize a frame entry header
pub fn create_header(header: &FrameHeader) -> Result<Vec<u8>> {
    let name = header.strip_name.as_bytes();
    if name.len() > u16::MAX as usize {
        return Err(Error::NameTooLong(name.len()));
    }

    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + name.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(&header.version.to_le_bytes());
    out.push(header.stage.code());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&header.frame_index_bits.to_le_bytes());
    out.extend_from_slice(&header.timeline_frame.to_le_bytes());
    out.extend_from_slice(&header.key_digest.to_le_bytes());
    out.extend_from_slice(&header.width.to_le_bytes());
    out.extend_from_slice(&header.height.to_le_bytes());
    out.extend_from_slice(&header.payload_len.to_le_bytes());
    out.extend_from_slice(name);
    Ok(out)
}
