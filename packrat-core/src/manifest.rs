use crate::error::{EngineError, Result};
use crate::store::replace_file_atomic;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

const HASH_HEX_LEN: usize = 64;

/// What a manifest entry describes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file; `chunks` reconstructs its contents.
    File,
    /// Symbolic link; only the target string is recorded, never chunked.
    Symlink { target: String },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileEntry {
    pub rel_path: String,
    pub size: u64,
    pub mtime_unix: i64,
    pub kind: EntryKind,
    /// Ordered chunk hashes whose concatenation reconstructs the file.
    pub chunks: Vec<String>,
}

/// A source path that did not make it into the generation, with the reason.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SkippedFile {
    pub rel_path: String,
    pub reason: String,
}

/// One immutable backup generation. Written once at publish time, read by
/// restore/verify/analyze, removed by delete.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Manifest {
    pub generation_id: String,
    pub created_utc: String,
    pub source_root: String,
    /// Logical bytes of all regular files in the generation.
    pub total_bytes: u64,
    /// Uncompressed bytes of chunks first stored by this generation.
    pub stored_bytes: u64,
    /// Set when at least one file was skipped due to a read error.
    pub partial: bool,
    pub files: Vec<FileEntry>,
    pub skipped: Vec<SkippedFile>,
}

impl Manifest {
    /// Every chunk hash the generation cites, one item per citation.
    pub fn chunk_hashes(&self) -> impl Iterator<Item = &str> {
        self.files.iter().flat_map(|fe| fe.chunks.iter().map(String::as_str))
    }

    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }

    /// Structural invariants checked on every read.
    pub fn validate(&self) -> Result<()> {
        if self.generation_id.is_empty() {
            return Err(EngineError::corrupt("manifest", "empty generation id"));
        }
        if self.source_root.is_empty() {
            return Err(EngineError::corrupt(
                format!("manifest {}", self.generation_id),
                "empty source root",
            ));
        }
        for fe in &self.files {
            if fe.rel_path.is_empty() {
                return Err(EngineError::corrupt(
                    format!("manifest {}", self.generation_id),
                    "entry with empty path",
                ));
            }
            match &fe.kind {
                EntryKind::File => {
                    if fe.size > 0 && fe.chunks.is_empty() {
                        return Err(EngineError::corrupt(
                            format!("manifest {}", self.generation_id),
                            format!("'{}' has {} bytes but no chunks", fe.rel_path, fe.size),
                        ));
                    }
                    for h in &fe.chunks {
                        if h.len() != HASH_HEX_LEN
                            || !h.bytes().all(|b| b.is_ascii_hexdigit())
                        {
                            return Err(EngineError::corrupt(
                                format!("manifest {}", self.generation_id),
                                format!("'{}' cites malformed hash '{}'", fe.rel_path, h),
                            ));
                        }
                    }
                }
                EntryKind::Symlink { .. } => {
                    if !fe.chunks.is_empty() {
                        return Err(EngineError::corrupt(
                            format!("manifest {}", self.generation_id),
                            format!("symlink '{}' carries chunks", fe.rel_path),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn manifest_file_name(generation_id: &str) -> String {
    format!("{generation_id}.json")
}

/// Serialize a manifest to `dir/<generation_id>.json` (pretty JSON, atomic
/// replace + fsync). This is the publish step: until it returns, the
/// generation does not exist.
pub fn write(dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let path = dir.join(manifest_file_name(&manifest.generation_id));
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| EngineError::Other(e.into()))?;
    replace_file_atomic(&path, json.as_bytes())?;
    Ok(path)
}

/// Load and validate a manifest file. A parse failure is `Corrupt`; a
/// missing file surfaces as `Io` (the engine maps it to
/// `UnknownGeneration` where an id was asked for).
pub fn load(path: &Path) -> Result<Manifest> {
    let f = File::open(path)?;
    let manifest: Manifest = serde_json::from_reader(f).map_err(|e| {
        EngineError::corrupt(format!("manifest file {:?}", path), e.to_string())
    })?;
    manifest.validate()?;
    Ok(manifest)
}
