use anyhow::{anyhow, Context};
use fs2::FileExt;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::{Catalog, GenerationSummary};
use crate::chunker::{self, Chunk, ChunkerConfig};
use crate::error::{EngineError, Result};
use crate::manifest::{self, EntryKind, FileEntry, Manifest, SkippedFile};
use crate::path_safety;
use crate::progress::Progress;
use crate::store::ContentStore;

const LOCK_FILE: &str = ".lock";
const CATALOG_FILE: &str = "catalog.bin";
const STORE_DIR: &str = "store";
const MANIFESTS_DIR: &str = "manifests";

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub chunker: ChunkerConfig,
}

/// Filters applied to the source tree during `create`.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreOptions {
    /// Replace existing files at the target instead of reporting a
    /// per-file collision failure.
    pub overwrite: bool,
}

#[derive(Debug)]
pub struct CreateReport {
    pub generation_id: String,
    pub file_count: u64,
    pub logical_bytes: u64,
    /// Bytes of chunk content first stored by this generation (0 when
    /// everything deduplicated against earlier generations).
    pub stored_bytes: u64,
    pub partial: bool,
    pub skipped: Vec<SkippedFile>,
}

/// A per-file problem collected during restore; never aborts the run.
#[derive(Debug)]
pub struct FileFailure {
    pub rel_path: String,
    pub error: EngineError,
}

#[derive(Debug)]
pub struct RestoreReport {
    pub generation_id: String,
    pub files_restored: u64,
    pub symlinks_restored: u64,
    pub bytes_written: u64,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug)]
pub struct DeleteReport {
    pub generation_id: String,
    pub chunks_released: u64,
}

#[derive(Debug)]
pub struct VerifyReport {
    pub chunks_ok: u64,
    pub chunks_bad: u64,
    pub files_ok: u64,
    pub files_bad: u64,
}

/// Aggregate statistics over all live generations.
#[derive(Clone, Debug)]
pub struct Stats {
    pub generations: u64,
    pub logical_bytes: u64,
    /// On-disk (deduplicated, compressed) size of the chunk store.
    pub physical_bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub mean_bytes: u64,
}

struct ChunkedFile {
    rel_path: String,
    mtime_unix: i64,
    chunks: Vec<Chunk>,
}

/// The backup engine: one handle per repository, holding the advisory
/// write lock for its lifetime. `create` and `delete` take `&mut self`;
/// `restore`, `verify`, `list` and `analyze` are read-only.
pub struct Engine {
    root: PathBuf,
    manifests_dir: PathBuf,
    store: ContentStore,
    catalog: Catalog,
    chunker: ChunkerConfig,
    _lock: File,
}

impl Engine {
    /// Open (creating if needed) the backup repository at `root`.
    ///
    /// Startup is self-healing: the catalog and refcounts are reconciled
    /// against the manifests directory on every open, so a crash between a
    /// manifest write (or removal) and the index update is repaired here;
    /// unpublished chunks are swept in the same pass.
    pub fn open(root: &Path, cfg: EngineConfig) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create repository {:?}", root))?;
        let lock = File::create(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| EngineError::Locked(root.to_path_buf()))?;

        let manifests_dir = root.join(MANIFESTS_DIR);
        fs::create_dir_all(&manifests_dir)?;
        let mut store = ContentStore::open(&root.join(STORE_DIR))?;
        let mut catalog = Catalog::open(&root.join(CATALOG_FILE), &manifests_dir)?;

        // The manifests directory is the source of truth; the catalog and
        // refcounts are derived from it. A readable-but-stale index (the
        // process died right after a manifest landed, or right after one
        // was removed) must be caught here, not just a damaged one.
        let on_disk = manifest_ids(&manifests_dir)?;
        let indexed: BTreeSet<String> =
            catalog.entries().map(|s| s.generation_id.clone()).collect();
        if on_disk != indexed {
            warn!("catalog out of step with manifests, rebuilding");
            catalog.rebuild(&manifests_dir)?;
        }

        let mut counts: HashMap<String, u64> = HashMap::new();
        for summary in catalog.entries() {
            let mpath =
                manifests_dir.join(manifest::manifest_file_name(&summary.generation_id));
            match manifest::load(&mpath) {
                Ok(m) => {
                    for h in m.chunk_hashes() {
                        *counts.entry(h.to_string()).or_insert(0) += 1;
                    }
                }
                Err(err) => {
                    warn!("manifest {:?} unreadable during recovery: {err}", mpath)
                }
            }
        }
        if store.reconcile_refcounts(counts) {
            let swept = store.sweep_orphans()?;
            if swept > 0 {
                warn!(swept, "removed unreferenced chunks during recovery");
            }
            store.flush()?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            manifests_dir,
            store,
            catalog,
            chunker: cfg.chunker,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Direct access to the chunk store (verification tooling, tests).
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Snapshot `source` into a new generation.
    ///
    /// Phases: walk -> chunk -> store -> finalize. Nothing is published
    /// before the finalize step, so an interrupted or failed call leaves
    /// the catalog and refcounts at their pre-call state. A failed call
    /// sweeps its unpublished chunks before returning; a crash leaves
    /// them for the next recovery pass.
    pub fn create(
        &mut self,
        source: &Path,
        opts: &CreateOptions,
        progress: &Progress,
    ) -> Result<CreateReport> {
        let meta = fs::metadata(source)
            .with_context(|| format!("source directory {:?}", source))?;
        if !meta.is_dir() {
            return Err(EngineError::Other(anyhow!(
                "source {:?} is not a directory",
                source
            )));
        }
        let source_root = fs::canonicalize(source)?;
        let (include, exclude) = build_globsets(&opts.include, &opts.exclude)?;

        // Walk in lexicographic order so identical trees produce
        // identically ordered manifests.
        progress.set_stage("walking");
        let mut candidates: Vec<(PathBuf, String, u64, i64)> = Vec::new();
        let mut symlinks: Vec<FileEntry> = Vec::new();
        let mut skipped: Vec<SkippedFile> = Vec::new();
        let mut partial = false;

        for ent in WalkDir::new(&source_root).min_depth(1).sort_by_file_name() {
            let ent = match ent {
                Ok(e) => e,
                Err(err) => {
                    let rel = err
                        .path()
                        .and_then(|p| pathdiff::diff_paths(p, &source_root))
                        .map(|p| unix_rel(&p))
                        .unwrap_or_else(|| "<unknown>".to_string());
                    warn!(path = %rel, "skipping unreadable entry: {err}");
                    skipped.push(SkippedFile { rel_path: rel, reason: err.to_string() });
                    partial = true;
                    continue;
                }
            };
            if ent.file_type().is_dir() {
                continue;
            }
            let rel = pathdiff::diff_paths(ent.path(), &source_root)
                .unwrap_or_else(|| ent.path().to_path_buf());
            let rel_str = unix_rel(&rel);
            if !include.is_match(&rel_str) || exclude.is_match(&rel_str) {
                continue;
            }
            let md = match ent.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %rel_str, "skipping, cannot stat: {err}");
                    skipped.push(SkippedFile { rel_path: rel_str, reason: err.to_string() });
                    partial = true;
                    continue;
                }
            };
            let mtime = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if ent.file_type().is_symlink() {
                match fs::read_link(ent.path()) {
                    Ok(target) => symlinks.push(FileEntry {
                        rel_path: rel_str,
                        size: 0,
                        mtime_unix: mtime,
                        kind: EntryKind::Symlink {
                            target: target.to_string_lossy().to_string(),
                        },
                        chunks: Vec::new(),
                    }),
                    Err(err) => {
                        warn!(path = %rel_str, "skipping unreadable symlink: {err}");
                        skipped.push(SkippedFile { rel_path: rel_str, reason: err.to_string() });
                        partial = true;
                    }
                }
            } else if ent.file_type().is_file() {
                candidates.push((ent.path().to_path_buf(), rel_str, md.len(), mtime));
            } else {
                skipped.push(SkippedFile {
                    rel_path: rel_str,
                    reason: "special file (not a regular file or symlink)".to_string(),
                });
            }
        }

        progress.set_totals(
            candidates.len(),
            candidates.iter().map(|(_, _, size, _)| *size as usize).sum(),
        );

        // Chunk independent files in parallel; store mutation stays
        // serialized below.
        progress.set_stage("chunking");
        let cfg = self.chunker;
        let errors: Mutex<Vec<SkippedFile>> = Mutex::new(Vec::new());
        let chunked: Vec<ChunkedFile> = candidates
            .par_iter()
            .filter_map(|(path, rel_str, _, mtime)| {
                match chunker::chunk_file(&cfg, path) {
                    Ok(chunks) => {
                        progress.inc_file();
                        Some(ChunkedFile {
                            rel_path: rel_str.clone(),
                            mtime_unix: *mtime,
                            chunks,
                        })
                    }
                    Err(err) => {
                        warn!(path = %rel_str, "skipping unreadable file: {err}");
                        errors.lock().unwrap().push(SkippedFile {
                            rel_path: rel_str.clone(),
                            reason: err.to_string(),
                        });
                        None
                    }
                }
            })
            .collect();
        let read_errors = errors.into_inner().unwrap();
        if !read_errors.is_empty() {
            partial = true;
            skipped.extend(read_errors);
        }

        progress.set_stage("storing");
        // The storing loop bumps in-memory refcounts ahead of the publish.
        // If it or the manifest write fails, roll them back so a later
        // flush cannot persist counts for a generation that never landed.
        let snapshot = self.store.refcounts_snapshot();
        let m = match self
            .store_and_publish(&source_root, chunked, symlinks, skipped, partial, progress)
        {
            Ok(m) => m,
            Err(err) => {
                self.store.restore_refcounts(snapshot);
                if let Err(sweep_err) = self.store.sweep_orphans() {
                    warn!("orphan sweep after failed backup: {sweep_err}");
                }
                return Err(err);
            }
        };
        self.catalog.insert(GenerationSummary::from_manifest(&m));
        self.catalog.save()?;
        self.store.flush()?;
        debug!(generation = %m.generation_id, files = m.file_count(), "generation published");

        Ok(CreateReport {
            generation_id: m.generation_id.clone(),
            file_count: m.file_count(),
            logical_bytes: m.total_bytes,
            stored_bytes: m.stored_bytes,
            partial: m.partial,
            skipped: m.skipped,
        })
    }

    /// Store every chunk, then allocate the id and publish the manifest.
    /// The caller publishes the catalog entry and refcounts afterwards; the
    /// manifest write is the point at which the generation becomes live.
    fn store_and_publish(
        &mut self,
        source_root: &Path,
        chunked: Vec<ChunkedFile>,
        symlinks: Vec<FileEntry>,
        mut skipped: Vec<SkippedFile>,
        partial: bool,
        progress: &Progress,
    ) -> Result<Manifest> {
        let mut files: Vec<FileEntry> = Vec::with_capacity(chunked.len() + symlinks.len());
        let mut total_bytes = 0u64;
        let mut stored_bytes = 0u64;
        for cf in &chunked {
            let mut hashes = Vec::with_capacity(cf.chunks.len());
            let mut size = 0u64;
            for chunk in &cf.chunks {
                // An I/O failure here is store-wide and aborts the call;
                // nothing has been published yet.
                let newly_written = self.store.put_hashed(&chunk.hash_hex, &chunk.bytes)?;
                if newly_written {
                    stored_bytes += chunk.len as u64;
                }
                progress.add_bytes(chunk.len as usize);
                size += chunk.len as u64;
                hashes.push(chunk.hash_hex.clone());
            }
            total_bytes += size;
            files.push(FileEntry {
                rel_path: cf.rel_path.clone(),
                size,
                mtime_unix: cf.mtime_unix,
                kind: EntryKind::File,
                chunks: hashes,
            });
        }
        files.extend(symlinks);
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        skipped.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        progress.set_stage("finalizing");
        let m = Manifest {
            generation_id: self.alloc_generation_id(),
            created_utc: chrono::Utc::now().to_rfc3339(),
            source_root: source_root.to_string_lossy().to_string(),
            total_bytes,
            stored_bytes,
            partial,
            files,
            skipped,
        };
        manifest::write(&self.manifests_dir, &m)?;
        Ok(m)
    }

    /// Summaries of all live generations, in id (and therefore time) order.
    pub fn list(&self) -> Vec<GenerationSummary> {
        self.catalog.entries().cloned().collect()
    }

    /// Reassemble a generation under `target`, integrity-checking every
    /// chunk on the way. Per-file problems (missing chunk, collision,
    /// unsafe path) are collected in the report; only store-wide failures
    /// abort the call.
    pub fn restore(
        &self,
        generation_id: &str,
        target: &Path,
        opts: &RestoreOptions,
        progress: &Progress,
    ) -> Result<RestoreReport> {
        let m = self.read_manifest(generation_id)?;
        fs::create_dir_all(target)
            .with_context(|| format!("create restore target {:?}", target))?;
        progress.set_stage("restoring");
        progress.set_totals(m.files.len(), m.total_bytes as usize);

        let files_restored = AtomicU64::new(0);
        let symlinks_restored = AtomicU64::new(0);
        let bytes_written = AtomicU64::new(0);
        let failures: Mutex<Vec<FileFailure>> = Mutex::new(Vec::new());

        m.files.par_iter().for_each(|fe| {
            match self.restore_entry(target, fe, opts.overwrite, progress) {
                Ok(bytes) => {
                    match fe.kind {
                        EntryKind::File => {
                            files_restored.fetch_add(1, Ordering::Relaxed);
                        }
                        EntryKind::Symlink { .. } => {
                            symlinks_restored.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    bytes_written.fetch_add(bytes, Ordering::Relaxed);
                    progress.inc_file();
                }
                Err(error) => {
                    warn!(path = %fe.rel_path, "restore failure: {error}");
                    failures
                        .lock()
                        .unwrap()
                        .push(FileFailure { rel_path: fe.rel_path.clone(), error });
                }
            }
        });

        let mut failures = failures.into_inner().unwrap();
        failures.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(RestoreReport {
            generation_id: generation_id.to_string(),
            files_restored: files_restored.into_inner(),
            symlinks_restored: symlinks_restored.into_inner(),
            bytes_written: bytes_written.into_inner(),
            failures,
        })
    }

    fn restore_entry(
        &self,
        target: &Path,
        fe: &FileEntry,
        overwrite: bool,
        progress: &Progress,
    ) -> Result<u64> {
        let dest = path_safety::validate_restore_path(target, Path::new(&fe.rel_path))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match &fe.kind {
            EntryKind::Symlink { target: link_target } => {
                if fs::symlink_metadata(&dest).is_ok() {
                    if !overwrite {
                        return Err(EngineError::WouldOverwrite(dest));
                    }
                    fs::remove_file(&dest)?;
                }
                make_symlink(link_target, &dest)?;
                Ok(0)
            }
            EntryKind::File => {
                if fs::symlink_metadata(&dest).is_ok() && !overwrite {
                    return Err(EngineError::WouldOverwrite(dest));
                }
                let file_name = dest
                    .file_name()
                    .ok_or_else(|| {
                        EngineError::corrupt(
                            format!("entry '{}'", fe.rel_path),
                            "path has no file name",
                        )
                    })?
                    .to_string_lossy()
                    .to_string();
                let tmp = dest.with_file_name(format!(".{file_name}.pkrt-tmp"));
                let result = self.write_chunks(&tmp, fe, progress);
                if let Err(err) = result {
                    let _ = fs::remove_file(&tmp);
                    return Err(err);
                }
                fs::rename(&tmp, &dest)?;
                Ok(fe.size)
            }
        }
    }

    fn write_chunks(&self, tmp: &Path, fe: &FileEntry, progress: &Progress) -> Result<()> {
        let mut out = File::create(tmp)?;
        for h in &fe.chunks {
            let bytes = match self.store.get(h) {
                Ok(b) => b,
                Err(EngineError::NotFound { .. }) => {
                    return Err(EngineError::ChunkMissing {
                        rel_path: fe.rel_path.clone(),
                        hash: h.clone(),
                    })
                }
                Err(e) => return Err(e),
            };
            out.write_all(&bytes)?;
            progress.add_bytes(bytes.len());
        }
        out.sync_all()?;
        Ok(())
    }

    /// Remove a generation: catalog entry first, then the manifest file,
    /// then one `release` per chunk citation. Irreversible.
    pub fn delete(&mut self, generation_id: &str) -> Result<DeleteReport> {
        let mpath = self.manifest_path(generation_id);
        if !mpath.exists() {
            return Err(EngineError::UnknownGeneration(generation_id.to_string()));
        }
        let m = manifest::load(&mpath)?;

        self.catalog.remove(generation_id);
        self.catalog.save()?;
        fs::remove_file(&mpath)?;

        // A crash from here on leaves the persisted counts too high; the
        // reconcile at next open recomputes them from the surviving
        // manifests.
        let mut chunks_released = 0u64;
        for h in m.chunk_hashes() {
            match self.store.release(h) {
                Ok(()) => chunks_released += 1,
                Err(EngineError::NotFound { .. }) => {
                    warn!(hash = h, "chunk already untracked at delete");
                }
                Err(e) => return Err(e),
            }
        }
        self.store.flush()?;
        debug!(generation = generation_id, chunks_released, "generation deleted");
        Ok(DeleteReport { generation_id: generation_id.to_string(), chunks_released })
    }

    /// Aggregate size statistics; `None` when the repository holds no
    /// generations.
    pub fn analyze(&self) -> Result<Option<Stats>> {
        if self.catalog.is_empty() {
            return Ok(None);
        }
        let mut logical = 0u64;
        let mut min_bytes = u64::MAX;
        let mut max_bytes = 0u64;
        for s in self.catalog.entries() {
            logical += s.logical_bytes;
            min_bytes = min_bytes.min(s.logical_bytes);
            max_bytes = max_bytes.max(s.logical_bytes);
        }
        let generations = self.catalog.len() as u64;
        Ok(Some(Stats {
            generations,
            logical_bytes: logical,
            physical_bytes: self.store.disk_usage()?,
            min_bytes,
            max_bytes,
            mean_bytes: logical / generations,
        }))
    }

    /// Re-hash every chunk a generation cites without restoring anything.
    pub fn verify(&self, generation_id: &str) -> Result<VerifyReport> {
        let m = self.read_manifest(generation_id)?;
        let mut chunks_ok = 0u64;
        let mut chunks_bad = 0u64;
        let mut files_bad = 0u64;
        for fe in &m.files {
            let mut bad = false;
            for h in &fe.chunks {
                match self.store.verify(h) {
                    Ok(true) => chunks_ok += 1,
                    Ok(false) => {
                        chunks_bad += 1;
                        bad = true;
                    }
                    Err(EngineError::NotFound { .. }) => {
                        chunks_bad += 1;
                        bad = true;
                    }
                    Err(e) => return Err(e),
                }
            }
            if bad {
                files_bad += 1;
            }
        }
        Ok(VerifyReport {
            chunks_ok,
            chunks_bad,
            files_ok: m.file_count() - files_bad,
            files_bad,
        })
    }

    fn manifest_path(&self, generation_id: &str) -> PathBuf {
        self.manifests_dir.join(manifest::manifest_file_name(generation_id))
    }

    fn read_manifest(&self, generation_id: &str) -> Result<Manifest> {
        match manifest::load(&self.manifest_path(generation_id)) {
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::UnknownGeneration(generation_id.to_string()))
            }
            other => other,
        }
    }

    /// Timestamp-derived generation id, `YYYYMMDD_HHMMSS`; a same-second
    /// collision gets a monotonically increasing `-N` suffix.
    fn alloc_generation_id(&self) -> String {
        let base = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut id = base.clone();
        let mut n = 0u32;
        while self.catalog.contains(&id) || self.manifest_path(&id).exists() {
            n += 1;
            id = format!("{base}-{n}");
        }
        id
    }
}

#[cfg(target_family = "unix")]
fn make_symlink(link_target: &str, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link_target, dest)
}

#[cfg(not(target_family = "unix"))]
fn make_symlink(_link_target: &str, _dest: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlink restore is not supported on this platform",
    ))
}

/// Generation ids present in the manifests directory, by file stem.
fn manifest_ids(manifests_dir: &Path) -> Result<BTreeSet<String>> {
    let mut ids = BTreeSet::new();
    for ent in fs::read_dir(manifests_dir)? {
        let p = ent?.path();
        if p.extension().map(|s| s == "json").unwrap_or(false) {
            if let Some(stem) = p.file_stem().and_then(|s| s.to_str()) {
                ids.insert(stem.to_string());
            }
        }
    }
    Ok(ids)
}

fn build_globsets(includes: &[String], excludes: &[String]) -> Result<(GlobSet, GlobSet)> {
    let mut incb = GlobSetBuilder::new();
    let mut excb = GlobSetBuilder::new();
    if includes.is_empty() {
        incb.add(Glob::new("**/*").map_err(anyhow::Error::from)?);
    }
    for g in includes {
        incb.add(Glob::new(g).with_context(|| format!("include pattern '{g}'"))?);
    }
    for g in excludes {
        excb.add(Glob::new(g).with_context(|| format!("exclude pattern '{g}'"))?);
    }
    Ok((
        incb.build().map_err(anyhow::Error::from)?,
        excb.build().map_err(anyhow::Error::from)?,
    ))
}

fn unix_rel(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}
