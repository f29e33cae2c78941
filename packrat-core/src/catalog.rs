use crate::error::Result;
use crate::manifest::{self, Manifest};
use crate::store::replace_file_atomic;
use anyhow::Context;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Catalog file: magic (8) + schema_version (u32 LE) + crc32 (u32 LE, over
/// the compressed payload) + zstd(bincode entries).
const CATALOG_MAGIC: &[u8] = b"PKRTCAT\0"; // 8 bytes
const CATALOG_VERSION: u32 = 1;

/// Denormalized per-generation summary kept for fast listing without
/// loading full manifests.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GenerationSummary {
    pub generation_id: String,
    pub name: String,
    pub created_utc: String,
    pub logical_bytes: u64,
    pub stored_bytes: u64,
    pub file_count: u64,
    pub partial: bool,
}

impl GenerationSummary {
    pub fn from_manifest(m: &Manifest) -> Self {
        Self {
            generation_id: m.generation_id.clone(),
            name: format!("backup_{}", m.generation_id),
            created_utc: m.created_utc.clone(),
            logical_bytes: m.total_bytes,
            stored_bytes: m.stored_bytes,
            file_count: m.file_count(),
            partial: m.partial,
        }
    }
}

/// Durable index of all generations. Derived state: the manifests
/// directory is the source of truth, and a missing or damaged catalog file
/// is rebuilt from it at open.
pub struct Catalog {
    path: PathBuf,
    entries: BTreeMap<String, GenerationSummary>,
}

impl Catalog {
    /// Open the catalog at `path`, rebuilding from `manifests_dir` when the
    /// file is absent or fails its guards.
    pub fn open(path: &Path, manifests_dir: &Path) -> Result<Self> {
        match load_entries(path) {
            Ok(entries) => Ok(Self { path: path.to_path_buf(), entries }),
            Err(err) => {
                if path.exists() {
                    warn!("catalog unreadable, rebuilding from manifests: {err:#}");
                }
                let mut catalog =
                    Self { path: path.to_path_buf(), entries: BTreeMap::new() };
                catalog.rebuild(manifests_dir)?;
                Ok(catalog)
            }
        }
    }

    /// Re-scan the manifests directory and rewrite the catalog file.
    /// Unreadable manifests are skipped with a warning; they will surface
    /// again as errors when addressed directly.
    pub fn rebuild(&mut self, manifests_dir: &Path) -> Result<()> {
        self.entries.clear();
        if manifests_dir.exists() {
            for ent in fs::read_dir(manifests_dir)? {
                let p = ent?.path();
                if p.extension().map(|s| s == "json").unwrap_or(false) {
                    match manifest::load(&p) {
                        Ok(m) => {
                            self.entries.insert(
                                m.generation_id.clone(),
                                GenerationSummary::from_manifest(&m),
                            );
                        }
                        Err(err) => warn!("skipping manifest {:?} during rebuild: {err}", p),
                    }
                }
            }
        }
        self.save()
    }

    pub fn insert(&mut self, summary: GenerationSummary) {
        self.entries.insert(summary.generation_id.clone(), summary);
    }

    pub fn remove(&mut self, generation_id: &str) -> Option<GenerationSummary> {
        self.entries.remove(generation_id)
    }

    pub fn contains(&self, generation_id: &str) -> bool {
        self.entries.contains_key(generation_id)
    }

    pub fn get(&self, generation_id: &str) -> Option<&GenerationSummary> {
        self.entries.get(generation_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All summaries in generation-id order.
    pub fn entries(&self) -> impl Iterator<Item = &GenerationSummary> {
        self.entries.values()
    }

    /// Persist the catalog (atomic replace + fsync). Called right after a
    /// manifest write or delete, never before.
    pub fn save(&self) -> Result<()> {
        let list: Vec<&GenerationSummary> = self.entries.values().collect();
        let raw = bincode::serialize(&list).context("serialize catalog")?;
        let compressed = zstd::stream::encode_all(&raw[..], 0).context("compress catalog")?;
        let mut h = Crc32::new();
        h.update(&compressed);
        let crc = h.finalize();

        let mut buf = Vec::with_capacity(16 + compressed.len());
        buf.extend_from_slice(CATALOG_MAGIC);
        buf.extend_from_slice(&CATALOG_VERSION.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&compressed);
        replace_file_atomic(&self.path, &buf)
    }
}

fn load_entries(path: &Path) -> anyhow::Result<BTreeMap<String, GenerationSummary>> {
    let buf = fs::read(path).with_context(|| format!("read {:?}", path))?;
    if buf.len() < 16 || &buf[0..8] != CATALOG_MAGIC {
        anyhow::bail!("bad catalog magic");
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != CATALOG_VERSION {
        anyhow::bail!("unsupported catalog schema {version}");
    }
    let crc = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let mut h = Crc32::new();
    h.update(&buf[16..]);
    if h.finalize() != crc {
        anyhow::bail!("catalog CRC mismatch");
    }
    let raw = zstd::stream::decode_all(&buf[16..]).context("decompress catalog")?;
    let list: Vec<GenerationSummary> = bincode::deserialize(&raw).context("decode catalog")?;
    Ok(list.into_iter().map(|s| (s.generation_id.clone(), s)).collect())
}
