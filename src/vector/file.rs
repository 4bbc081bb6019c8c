//! Single-file vector index format.
//!
//! ```text
//! offset  size  field
//!      0     8  magic "MNEMVIDX"
//!      8     4  format version (u32)
//!     12     4  dimension (u32)
//!     16     4  m (u32)
//!     20     4  ef_construction (u32)
//!     24     4  ef_search (u32)
//!     28     4  max level (u32)
//!     32     8  level seed (u64)
//!     40     8  node count (u64)
//!     48     8  applied sequence (u64)
//!     56     4  entry point slot (u32, u32::MAX = empty)
//!     60     4  header crc32 (bytes 0..60)
//!     64     -  node table
//!      -     -  zero padding to a 64-byte boundary
//!      -     -  f32 vector slab, node count * dimension
//!      -     4  body crc32 (node table through slab)
//! ```
//!
//! A node record is `id_len u32 | id | level u8 | flags u8 | per level:
//! count u16 | count * u32 neighbor slot`. Flag bit 0 marks a tombstone.
//! All integers and floats are little-endian.

use crate::concept::ConceptId;

use super::IndexConfig;
use super::hnsw::{Hnsw, Node};

pub const INDEX_MAGIC: &[u8; 8] = b"MNEMVIDX";
pub const INDEX_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 64;
pub const SLAB_ALIGN: usize = 64;

const NO_ENTRY: u32 = u32::MAX;
const FLAG_TOMBSTONE: u8 = 0x01;

/// Header fields of an index file.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHeader {
    pub version: u32,
    pub dimension: usize,
    pub config: IndexConfig,
    pub max_level: usize,
    pub node_count: u64,
    pub applied_seq: u64,
    pub entry: Option<u32>,
}

pub(crate) fn encode(hnsw: &Hnsw, applied_seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + hnsw.vectors.len() * 4 + hnsw.nodes.len() * 64);
    out.extend_from_slice(INDEX_MAGIC);
    out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    out.extend_from_slice(&(hnsw.dimension as u32).to_le_bytes());
    out.extend_from_slice(&(hnsw.config.m as u32).to_le_bytes());
    out.extend_from_slice(&(hnsw.config.ef_construction as u32).to_le_bytes());
    out.extend_from_slice(&(hnsw.config.ef_search as u32).to_le_bytes());
    out.extend_from_slice(&(hnsw.max_level as u32).to_le_bytes());
    out.extend_from_slice(&hnsw.config.seed.to_le_bytes());
    out.extend_from_slice(&(hnsw.nodes.len() as u64).to_le_bytes());
    out.extend_from_slice(&applied_seq.to_le_bytes());
    out.extend_from_slice(&hnsw.entry.unwrap_or(NO_ENTRY).to_le_bytes());
    let header_crc = crc32fast::hash(&out[..60]);
    out.extend_from_slice(&header_crc.to_le_bytes());

    for node in &hnsw.nodes {
        let id = node.id.as_str().as_bytes();
        out.extend_from_slice(&(id.len() as u32).to_le_bytes());
        out.extend_from_slice(id);
        out.push(node.level);
        out.push(if node.deleted { FLAG_TOMBSTONE } else { 0 });
        for layer in &node.neighbors {
            out.extend_from_slice(&(layer.len() as u16).to_le_bytes());
            for nb in layer {
                out.extend_from_slice(&nb.to_le_bytes());
            }
        }
    }

    out.resize(align_up(out.len()), 0);
    for v in &hnsw.vectors {
        out.extend_from_slice(&v.to_le_bytes());
    }
    let body_crc = crc32fast::hash(&out[HEADER_LEN..]);
    out.extend_from_slice(&body_crc.to_le_bytes());
    out
}

fn align_up(n: usize) -> usize {
    n.div_ceil(SLAB_ALIGN) * SLAB_ALIGN
}

/// Bounds-checked little-endian reader.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| format!("unexpected end of data at offset {}", self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(a))
    }
}

/// Validate and parse the fixed header.
pub fn read_header(bytes: &[u8]) -> Result<IndexHeader, String> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(format!("file is {} bytes, shorter than the header", bytes.len()));
    }
    if &bytes[..8] != INDEX_MAGIC {
        return Err("bad magic".into());
    }
    let mut c = Cursor { bytes, pos: 8 };
    let version = c.u32()?;
    let dimension = c.u32()? as usize;
    let m = c.u32()? as usize;
    let ef_construction = c.u32()? as usize;
    let ef_search = c.u32()? as usize;
    let max_level = c.u32()? as usize;
    let seed = c.u64()?;
    let node_count = c.u64()?;
    let applied_seq = c.u64()?;
    let entry = c.u32()?;
    let stored_crc = c.u32()?;

    let computed = crc32fast::hash(&bytes[..60]);
    if stored_crc != computed {
        return Err(format!(
            "header checksum mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
        ));
    }
    if version != INDEX_VERSION {
        return Err(format!("unsupported index version {version}"));
    }
    Ok(IndexHeader {
        version,
        dimension,
        config: IndexConfig {
            m,
            ef_construction,
            ef_search,
            seed,
        },
        max_level,
        node_count,
        applied_seq,
        entry: (entry != NO_ENTRY).then_some(entry),
    })
}

/// Decode a full index, verifying both checksums and every slot reference.
pub(crate) fn decode(bytes: &[u8]) -> Result<(IndexHeader, Hnsw), String> {
    let header = read_header(bytes)?;
    let body_end = bytes.len() - 4;
    let stored = u32::from_le_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    let computed = crc32fast::hash(&bytes[HEADER_LEN..body_end]);
    if stored != computed {
        return Err(format!(
            "body checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        ));
    }

    let count = usize::try_from(header.node_count).map_err(|_| "node count overflows".to_string())?;
    let body = &bytes[..body_end];
    let mut c = Cursor {
        bytes: body,
        pos: HEADER_LEN,
    };
    let mut nodes = Vec::with_capacity(count.min(body.len() / 8));
    for slot in 0..count {
        let id_len = c.u32()? as usize;
        let raw = c.take(id_len)?;
        let id = std::str::from_utf8(raw)
            .map_err(|_| format!("slot {slot}: id is not UTF-8"))?;
        let id = ConceptId::new(id).map_err(|e| format!("slot {slot}: {e}"))?;
        let level = c.u8()?;
        let flags = c.u8()?;
        let mut neighbors = Vec::with_capacity(level as usize + 1);
        for _ in 0..=level {
            let n = c.u16()? as usize;
            let mut layer = Vec::with_capacity(n);
            for _ in 0..n {
                let nb = c.u32()?;
                if nb as usize >= count {
                    return Err(format!("slot {slot}: neighbor {nb} out of range"));
                }
                layer.push(nb);
            }
            neighbors.push(layer);
        }
        nodes.push(Node {
            id,
            level,
            deleted: flags & FLAG_TOMBSTONE != 0,
            neighbors,
        });
    }

    if let Some(entry) = header.entry {
        if entry as usize >= count {
            return Err(format!("entry point {entry} out of range"));
        }
    } else if count > 0 {
        return Err("non-empty index without an entry point".into());
    }

    c.pos = align_up(c.pos);
    let floats = count
        .checked_mul(header.dimension)
        .ok_or_else(|| "vector slab size overflows".to_string())?;
    let slab = c.take(floats * 4)?;
    if c.pos != body.len() {
        return Err(format!(
            "{} trailing bytes after vector slab",
            body.len() - c.pos
        ));
    }
    let vectors: Vec<f32> = slab
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let hnsw = Hnsw::restore(
        header.dimension,
        header.config.clone(),
        nodes,
        vectors,
        header.entry,
        header.max_level,
    );
    Ok((header, hnsw))
}
