use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine and its stores.
///
/// Per-file problems during `create`/`restore` are collected into the
/// operation's report instead; only store-wide failures abort a call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chunk {hash} not found in store")]
    NotFound { hash: String },

    #[error("chunk {hash} cited by '{rel_path}' is missing from the store")]
    ChunkMissing { rel_path: String, hash: String },

    #[error("{what} is corrupt: {detail}")]
    Corrupt { what: String, detail: String },

    #[error("unknown generation '{0}'")]
    UnknownGeneration(String),

    #[error("refusing to overwrite existing file {0}")]
    WouldOverwrite(PathBuf),

    #[error("backup repository {0} is locked by another process")]
    Locked(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn corrupt(what: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::Corrupt { what: what.into(), detail: detail.into() }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
