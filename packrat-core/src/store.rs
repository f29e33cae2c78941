use crate::error::{EngineError, Result};
use anyhow::Context;
use crc32fast::Hasher as Crc32;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Guarded refcounts file: magic (8) + schema_version (u32 LE) +
/// crc32 (u32 LE, over the compressed payload) + zstd(bincode entries).
const REFCOUNTS_MAGIC: &[u8] = b"PKRTREFS"; // 8 bytes
const REFCOUNTS_VERSION: u32 = 1;
const REFCOUNTS_FILE: &str = "refcounts.bin";

const HASH_HEX_LEN: usize = 64;

/// Deduplicating chunk store: one file per chunk under a 2-level fan-out
/// (`aa/bb/<hex>`), payloads zstd-compressed on disk. The content hash is
/// always over the uncompressed bytes.
///
/// Refcounts are kept in memory and persisted only by [`flush`]; the engine
/// flushes at publish points so an interrupted backup leaves the persisted
/// counts at their pre-call state. The file is derived state: missing,
/// unreadable, or stale counts are reconciled against live manifests by the
/// engine at every startup.
///
/// [`flush`]: ContentStore::flush
pub struct ContentStore {
    root: PathBuf,
    refcounts: HashMap<String, u64>,
    recovered: bool,
}

impl ContentStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create store dir {:?}", root))?;
        let rc_path = root.join(REFCOUNTS_FILE);
        let (refcounts, recovered) = if rc_path.exists() {
            match load_refcounts(&rc_path) {
                Ok(map) => (map, false),
                Err(err) => {
                    warn!("refcounts file unreadable, will rebuild from manifests: {err:#}");
                    (HashMap::new(), true)
                }
            }
        } else {
            (HashMap::new(), true)
        };
        Ok(Self { root: root.to_path_buf(), refcounts, recovered })
    }

    /// True when the refcounts file was absent or unreadable at open; the
    /// engine must then rebuild counts from live manifests.
    pub fn needs_rebuild(&self) -> bool {
        self.recovered
    }

    /// Replace the refcount map when `counts` disagrees with what was
    /// loaded. Returns true when a rebuild was applied, either because the
    /// file was absent or unreadable at open or because the loaded counts
    /// had gone stale (crash between a manifest write and the flush).
    pub fn reconcile_refcounts(&mut self, counts: HashMap<String, u64>) -> bool {
        if !self.recovered && self.refcounts == counts {
            return false;
        }
        self.refcounts = counts;
        self.recovered = false;
        true
    }

    pub(crate) fn refcounts_snapshot(&self) -> HashMap<String, u64> {
        self.refcounts.clone()
    }

    /// Roll the in-memory counts back to an earlier snapshot (failed
    /// backup; nothing was published).
    pub(crate) fn restore_refcounts(&mut self, counts: HashMap<String, u64>) {
        self.refcounts = counts;
    }

    fn chunk_path(&self, hash_hex: &str) -> PathBuf {
        self.root.join(&hash_hex[0..2]).join(&hash_hex[2..4]).join(hash_hex)
    }

    /// Store `bytes`, returning the content hash. Idempotent with respect
    /// to content: an already-present chunk only gets its refcount bumped.
    pub fn put(&mut self, bytes: &[u8]) -> Result<String> {
        let hash_hex = blake3::hash(bytes).to_hex().to_string();
        self.put_hashed(&hash_hex, bytes)?;
        Ok(hash_hex)
    }

    /// `put` for callers that already computed the blake3 hex of `bytes`
    /// (the chunker does). Returns true when the chunk was newly written.
    pub fn put_hashed(&mut self, hash_hex: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.chunk_path(hash_hex);
        let count = self.refcounts.entry(hash_hex.to_string()).or_insert(0);
        let newly_written = if *count == 0 && !path.exists() {
            write_chunk_atomic(&path, bytes)?;
            debug!(hash = hash_hex, size = bytes.len(), "stored new chunk");
            true
        } else {
            false
        };
        *count += 1;
        Ok(newly_written)
    }

    /// Fetch and decompress a chunk, verifying its hash on the way out.
    pub fn get(&self, hash_hex: &str) -> Result<Vec<u8>> {
        let path = self.chunk_path(hash_hex);
        let compressed = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound { hash: hash_hex.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        let bytes = zstd::stream::decode_all(&compressed[..]).map_err(|e| {
            EngineError::corrupt(format!("chunk {hash_hex}"), format!("zstd decode: {e}"))
        })?;
        let actual = blake3::hash(&bytes).to_hex().to_string();
        if actual != hash_hex {
            return Err(EngineError::corrupt(
                format!("chunk {hash_hex}"),
                format!("content hashes to {actual}"),
            ));
        }
        Ok(bytes)
    }

    /// Whether a chunk's payload exists on disk.
    pub fn contains(&self, hash_hex: &str) -> bool {
        self.chunk_path(hash_hex).exists()
    }

    /// Current reference count for a hash (0 if untracked).
    pub fn refcount(&self, hash_hex: &str) -> u64 {
        self.refcounts.get(hash_hex).copied().unwrap_or(0)
    }

    /// Drop one reference; the payload is unlinked when the count reaches
    /// zero. Releasing an untracked hash is an error.
    pub fn release(&mut self, hash_hex: &str) -> Result<()> {
        match self.refcounts.get_mut(hash_hex) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                self.refcounts.remove(hash_hex);
                let path = self.chunk_path(hash_hex);
                match fs::remove_file(&path) {
                    Ok(()) => debug!(hash = hash_hex, "released last reference, chunk removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(hash = hash_hex, "chunk already absent at release")
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            None => Err(EngineError::NotFound { hash: hash_hex.to_string() }),
        }
    }

    /// Recompute the hash over the stored bytes; false on any mismatch or
    /// undecodable payload.
    pub fn verify(&self, hash_hex: &str) -> Result<bool> {
        match self.get(hash_hex) {
            Ok(_) => Ok(true),
            Err(EngineError::Corrupt { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Total on-disk (compressed) bytes of all chunk payloads.
    pub fn disk_usage(&self) -> Result<u64> {
        let mut total = 0u64;
        for ent in walkdir::WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let ent = ent.map_err(|e| EngineError::Other(e.into()))?;
            if ent.file_type().is_file() {
                total += ent.metadata().map_err(|e| EngineError::Other(e.into()))?.len();
            }
        }
        Ok(total)
    }

    /// Number of chunk payloads on disk.
    pub fn chunk_count(&self) -> Result<u64> {
        let mut n = 0u64;
        for ent in walkdir::WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let ent = ent.map_err(|e| EngineError::Other(e.into()))?;
            if ent.file_type().is_file() {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Remove chunk payloads no live manifest references (refcount zero or
    /// untracked). Used after a rebuild, where an interrupted backup may
    /// have left unpublished chunks behind.
    pub fn sweep_orphans(&mut self) -> Result<u64> {
        let mut removed = 0u64;
        for ent in walkdir::WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let ent = ent.map_err(|e| EngineError::Other(e.into()))?;
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if name.len() != HASH_HEX_LEN || self.refcount(&name) > 0 {
                continue;
            }
            fs::remove_file(ent.path())?;
            removed += 1;
            debug!(hash = %name, "swept orphan chunk");
        }
        Ok(removed)
    }

    /// Persist the refcount map (guarded binary file, atomic replace).
    pub fn flush(&self) -> Result<()> {
        let mut entries: Vec<(&String, &u64)> = self.refcounts.iter().collect();
        entries.sort();
        let raw = bincode::serialize(&entries).context("serialize refcounts")?;
        let compressed = zstd::stream::encode_all(&raw[..], 0).context("compress refcounts")?;
        let mut h = Crc32::new();
        h.update(&compressed);
        let crc = h.finalize();

        let mut buf = Vec::with_capacity(16 + compressed.len());
        buf.extend_from_slice(REFCOUNTS_MAGIC);
        buf.extend_from_slice(&REFCOUNTS_VERSION.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&compressed);

        let path = self.root.join(REFCOUNTS_FILE);
        replace_file_atomic(&path, &buf)
    }
}

fn load_refcounts(path: &Path) -> anyhow::Result<HashMap<String, u64>> {
    let buf = fs::read(path).with_context(|| format!("read {:?}", path))?;
    if buf.len() < 16 || &buf[0..8] != REFCOUNTS_MAGIC {
        anyhow::bail!("bad refcounts magic");
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != REFCOUNTS_VERSION {
        anyhow::bail!("unsupported refcounts schema {version}");
    }
    let crc = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let mut h = Crc32::new();
    h.update(&buf[16..]);
    if h.finalize() != crc {
        anyhow::bail!("refcounts CRC mismatch");
    }
    let raw = zstd::stream::decode_all(&buf[16..]).context("decompress refcounts")?;
    let entries: Vec<(String, u64)> = bincode::deserialize(&raw).context("decode refcounts")?;
    Ok(entries.into_iter().collect())
}

/// Write-to-temp-then-rename so an interrupted write leaves either no trace
/// or a complete chunk, never a partial one.
fn write_chunk_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let compressed =
        zstd::stream::encode_all(bytes, 0).map_err(|e| EngineError::Other(e.into()))?;
    replace_file_atomic(path, &compressed)
}

pub(crate) fn replace_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("create {:?}", tmp))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("publish {:?}", path))?;
    Ok(())
}
