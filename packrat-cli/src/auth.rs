//! Line-oriented user registry (`name,digest` per line). The engine never
//! sees credentials; this gate belongs entirely to the shell.

use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Register a user. Returns false when the username is already taken.
pub fn signup(users_file: &Path, username: &str, password: &str) -> Result<bool> {
    if username.is_empty() || username.contains(',') {
        bail!("invalid username '{username}'");
    }
    let users = read_users(users_file)?;
    if users.iter().any(|(name, _)| name == username) {
        return Ok(false);
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(users_file)
        .with_context(|| format!("open {:?}", users_file))?;
    writeln!(f, "{},{}", username, digest(password))?;
    Ok(true)
}

/// Check a username/password pair against the registry.
pub fn login(users_file: &Path, username: &str, password: &str) -> Result<bool> {
    let users = read_users(users_file)?;
    let wanted = digest(password);
    Ok(users.iter().any(|(name, hash)| name == username && *hash == wanted))
}

fn digest(password: &str) -> String {
    blake3::hash(password.as_bytes()).to_hex().to_string()
}

fn read_users(path: &Path) -> Result<Vec<(String, String)>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {:?}", path)),
    };
    let mut users = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((name, hash)) = line.split_once(',') else {
            bail!("malformed registry line in {:?}", path);
        };
        users.push((name.to_string(), hash.to_string()));
    }
    Ok(users)
}
