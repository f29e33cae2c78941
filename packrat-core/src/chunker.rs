use crate::error::{EngineError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Default minimum chunk size (1 MiB).
pub const DEFAULT_MIN: u32 = 1 << 20;
/// Default average chunk size (2 MiB).
pub const DEFAULT_AVG: u32 = 2 << 20;
/// Default maximum chunk size (4 MiB).
pub const DEFAULT_MAX: u32 = 4 << 20;

/// FastCDC lower bounds for the three parameters.
const FLOOR_MIN: u32 = 64;
const FLOOR_AVG: u32 = 256;
const FLOOR_MAX: u32 = 1024;

/// Content-defined chunking parameters.
///
/// Boundaries are picked by a rolling fingerprint over the content, so an
/// edit in the middle of a file shifts at most the chunks around the edit;
/// unchanged regions keep their hashes and dedup against earlier
/// generations. The parameters must never change for an existing store,
/// otherwise identical data stops deduplicating.
#[derive(Clone, Copy, Debug)]
pub struct ChunkerConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { min_size: DEFAULT_MIN, avg_size: DEFAULT_AVG, max_size: DEFAULT_MAX }
    }
}

impl ChunkerConfig {
    /// Validated constructor; sizes must satisfy the FastCDC floors and
    /// `min <= avg <= max`.
    pub fn new(min_size: u32, avg_size: u32, max_size: u32) -> Result<Self> {
        if min_size < FLOOR_MIN || avg_size < FLOOR_AVG || max_size < FLOOR_MAX {
            return Err(EngineError::Other(anyhow::anyhow!(
                "chunk sizes below FastCDC floors ({FLOOR_MIN}/{FLOOR_AVG}/{FLOOR_MAX}): {min_size}/{avg_size}/{max_size}"
            )));
        }
        if !(min_size <= avg_size && avg_size <= max_size) {
            return Err(EngineError::Other(anyhow::anyhow!(
                "chunk sizes must be ordered min <= avg <= max, got {min_size}/{avg_size}/{max_size}"
            )));
        }
        Ok(Self { min_size, avg_size, max_size })
    }

    /// Derive a config from a target (average) size with a fixed 1:2 band
    /// on either side, keeping the default shape of the size distribution.
    pub fn from_target(avg_size: u32) -> Result<Self> {
        let avg = avg_size.max(FLOOR_AVG * 2);
        Self::new(avg / 2, avg, avg.saturating_mul(2))
    }
}

/// One content-defined chunk of a source file.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub offset: u64,
    pub len: u32,
    pub hash_hex: String,
    pub bytes: Vec<u8>,
}

/// Split a buffer into content-defined chunks. Deterministic for a given
/// config; empty input yields no chunks.
pub fn chunk_bytes(cfg: &ChunkerConfig, data: &[u8]) -> Vec<Chunk> {
    if data.is_empty() {
        return Vec::new();
    }
    fastcdc::v2020::FastCDC::new(data, cfg.min_size, cfg.avg_size, cfg.max_size)
        .map(|entry| {
            let bytes = &data[entry.offset..entry.offset + entry.length];
            Chunk {
                offset: entry.offset as u64,
                len: entry.length as u32,
                hash_hex: blake3::hash(bytes).to_hex().to_string(),
                bytes: bytes.to_vec(),
            }
        })
        .collect()
}

/// Chunk a regular file by memory-mapping it. An empty file yields an
/// empty chunk list.
pub fn chunk_file(cfg: &ChunkerConfig, path: &Path) -> std::io::Result<Vec<Chunk>> {
    let f = File::open(path)?;
    if f.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }
    // Safety: the map is read-only and dropped before this call returns
    // ownership of the chunks; concurrent truncation of the source is the
    // same hazard every mmap-based reader accepts.
    let map = unsafe { Mmap::map(&f)? };
    Ok(chunk_bytes(cfg, &map))
}
