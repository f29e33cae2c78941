use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Ensure a manifest `rel` path is safe to materialize under `target`:
/// no absolute paths, no `..` traversal, and no symlinked ancestor inside
/// the target (a hostile manifest must not redirect writes outside the
/// restore directory).
pub fn validate_restore_path(target: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.is_absolute() {
        bail!("absolute paths are not allowed: {:?}", rel);
    }
    for comp in rel.components() {
        match comp {
            Component::ParentDir => bail!("parent traversal not allowed: {:?}", rel),
            Component::Prefix(_) | Component::RootDir => {
                bail!("rooted component not allowed: {:?}", rel)
            }
            _ => {}
        }
    }
    let mut cur = target.to_path_buf();
    for comp in rel.components() {
        cur = cur.join(comp);
        if let Ok(m) = std::fs::symlink_metadata(&cur) {
            if m.file_type().is_symlink() && cur != target.join(rel) {
                bail!("symlink in restore path (not following): {:?}", cur);
            }
        }
    }
    Ok(target.join(rel))
}
