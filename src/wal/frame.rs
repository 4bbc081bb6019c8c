//! Binary frame codec for WAL entries.
//!
//! ```text
//! file   := magic[8] frame*
//! frame  := seq u64 | timestamp u64 | tag u8 | payload_len u32 | payload | crc32 u32
//! ```
//!
//! All integers are little-endian. The CRC32 covers the header and payload.
//! A frame that ends early or fails its checksum marks the end of the valid log.

use std::io::{self, Read};

use super::{OpTag, Operation, WalEntry, WalResult};

/// Magic bytes at the start of every WAL file.
pub const WAL_MAGIC: &[u8; 8] = b"MNEMWAL1";

/// seq (8) + timestamp (8) + tag (1) + payload_len (4).
pub const FRAME_HEADER_LEN: usize = 21;

/// Trailing CRC32.
pub const FRAME_TRAILER_LEN: usize = 4;

/// Upper bound on a single payload; anything larger is treated as damage.
pub const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete, checksummed entry occupying `len` bytes.
    Entry { entry: WalEntry, len: u64 },
    /// Clean end of file on a frame boundary.
    End,
    /// Partial or damaged frame; nothing from here on is valid.
    Torn { reason: String },
}

/// Encode an entry into a complete frame.
pub fn encode(entry: &WalEntry) -> WalResult<Vec<u8>> {
    let payload = entry.op.encode()?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_TRAILER_LEN);
    buf.extend_from_slice(&entry.seq.to_le_bytes());
    buf.extend_from_slice(&entry.timestamp.to_le_bytes());
    buf.push(entry.tag() as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Read the next frame from `reader`.
///
/// I/O errors other than a short read are returned as `Err`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let got = read_full(reader, &mut header)?;
    if got == 0 {
        return Ok(FrameRead::End);
    }
    if got < FRAME_HEADER_LEN {
        return Ok(FrameRead::Torn {
            reason: format!("truncated frame header ({got} of {FRAME_HEADER_LEN} bytes)"),
        });
    }

    let seq = u64::from_le_bytes(header[0..8].try_into().unwrap_or([0; 8]));
    let timestamp = u64::from_le_bytes(header[8..16].try_into().unwrap_or([0; 8]));
    let raw_tag = header[16];
    let payload_len = u32::from_le_bytes(header[17..21].try_into().unwrap_or([0; 4]));

    if payload_len > MAX_PAYLOAD_LEN {
        return Ok(FrameRead::Torn {
            reason: format!("implausible payload length {payload_len}"),
        });
    }

    let mut rest = vec![0u8; payload_len as usize + FRAME_TRAILER_LEN];
    let got = read_full(reader, &mut rest)?;
    if got < rest.len() {
        return Ok(FrameRead::Torn {
            reason: format!(
                "truncated frame body ({got} of {} bytes) for seq {seq}",
                rest.len()
            ),
        });
    }

    let (payload, trailer) = rest.split_at(payload_len as usize);
    let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap_or([0; 4]));
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(payload);
    let computed = hasher.finalize();
    if computed != stored_crc {
        return Ok(FrameRead::Torn {
            reason: format!(
                "checksum mismatch for seq {seq}: stored {stored_crc:#010x}, computed {computed:#010x}"
            ),
        });
    }

    let Some(tag) = OpTag::from_u8(raw_tag) else {
        return Ok(FrameRead::Torn {
            reason: format!("unknown operation tag {raw_tag} for seq {seq}"),
        });
    };
    let op = match Operation::decode(payload) {
        Ok(op) => op,
        Err(e) => {
            return Ok(FrameRead::Torn {
                reason: format!("undecodable payload for seq {seq}: {e}"),
            });
        }
    };
    if op.tag() != tag {
        return Ok(FrameRead::Torn {
            reason: format!("tag {tag} does not match payload {} for seq {seq}", op.tag()),
        });
    }

    let len = (FRAME_HEADER_LEN + payload_len as usize + FRAME_TRAILER_LEN) as u64;
    Ok(FrameRead::Entry {
        entry: WalEntry { seq, timestamp, op },
        len,
    })
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
