use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use packrat_core::chunker::ChunkerConfig;
use packrat_core::engine::{CreateOptions, Engine, EngineConfig, RestoreOptions};
use packrat_core::progress::Progress;

mod auth;

#[derive(Parser)]
#[command(name = "packrat", version, about = "content-addressed local backup manager")]
struct Cli {
    /// Backup repository directory
    #[arg(long, default_value = ".packrat")]
    repo: PathBuf,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Snapshot a source directory into a new backup generation
    Create {
        source: PathBuf,
        /// Glob of paths to include (repeatable; default everything)
        #[arg(long)]
        include: Vec<String>,
        /// Glob of paths to exclude (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
        /// Target (average) chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u32>,
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// List stored generations
    List,
    /// Restore a generation into a target directory
    Restore {
        generation: String,
        target: PathBuf,
        /// Replace existing files at the target
        #[arg(long, default_value_t = false)]
        overwrite: bool,
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Delete a generation and release its chunks
    Delete { generation: String },
    /// Summarize all stored generations
    Analyze,
    /// Re-hash every chunk a generation cites
    Verify { generation: String },
    /// Register a user in the registry
    Signup {
        username: String,
        /// User registry file
        #[arg(long, default_value = "users.txt")]
        users_file: PathBuf,
    },
    /// Check credentials against the registry
    Login {
        username: String,
        #[arg(long, default_value = "users.txt")]
        users_file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Create { source, include, exclude, chunk_size, progress } => {
            create(&cli.repo, &source, include, exclude, chunk_size, progress)
        }
        Cmd::List => list(&cli.repo),
        Cmd::Restore { generation, target, overwrite, progress } => {
            restore(&cli.repo, &generation, &target, overwrite, progress)
        }
        Cmd::Delete { generation } => delete(&cli.repo, &generation),
        Cmd::Analyze => analyze(&cli.repo),
        Cmd::Verify { generation } => verify(&cli.repo, &generation),
        Cmd::Signup { username, users_file } => {
            let password = read_password("Choose a password: ")?;
            if auth::signup(&users_file, &username, &password)? {
                println!("Signup successful! You can now log in.");
                Ok(())
            } else {
                bail!("username already exists, try logging in");
            }
        }
        Cmd::Login { username, users_file } => {
            let password = read_password("Password: ")?;
            if auth::login(&users_file, &username, &password)? {
                println!("Login successful! Welcome.");
                Ok(())
            } else {
                bail!("invalid credentials");
            }
        }
    }
}

fn open_engine(repo: &PathBuf, chunk_size: Option<u32>) -> Result<Engine> {
    let chunker = match chunk_size {
        Some(target) => ChunkerConfig::from_target(target)?,
        None => ChunkerConfig::default(),
    };
    let engine = Engine::open(repo, EngineConfig { chunker })?;
    Ok(engine)
}

fn create(
    repo: &PathBuf,
    source: &PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
    chunk_size: Option<u32>,
    show_progress: bool,
) -> Result<()> {
    let mut engine = open_engine(repo, chunk_size)?;
    let progress = Progress::new(show_progress);
    progress.start();
    let report = engine
        .create(source, &CreateOptions { include, exclude }, &progress)
        .with_context(|| format!("back up {:?}", source))?;
    progress.stop();

    println!(
        "Created generation {} ({} files, {} logical, {} newly stored)",
        report.generation_id,
        report.file_count,
        human_kb(report.logical_bytes),
        human_kb(report.stored_bytes),
    );
    if report.partial {
        println!("WARNING: partial backup, {} path(s) skipped:", report.skipped.len());
    }
    for s in &report.skipped {
        println!("  skipped {} ({})", s.rel_path, s.reason);
    }
    Ok(())
}

fn list(repo: &PathBuf) -> Result<()> {
    let engine = open_engine(repo, None)?;
    let generations = engine.list();
    if generations.is_empty() {
        println!("No backups found.");
        return Ok(());
    }
    println!("Available backups:");
    for s in generations {
        let partial = if s.partial { ", PARTIAL" } else { "" };
        println!(
            "- {} ({} files, {}, created {}{})",
            s.name,
            s.file_count,
            human_kb(s.logical_bytes),
            s.created_utc,
            partial,
        );
    }
    Ok(())
}

fn restore(
    repo: &PathBuf,
    generation: &str,
    target: &PathBuf,
    overwrite: bool,
    show_progress: bool,
) -> Result<()> {
    let engine = open_engine(repo, None)?;
    let progress = Progress::new(show_progress);
    progress.start();
    let report = engine.restore(generation, target, &RestoreOptions { overwrite }, &progress)?;
    progress.stop();

    println!(
        "Restored {} file(s) and {} symlink(s) ({}) to {:?}",
        report.files_restored,
        report.symlinks_restored,
        human_kb(report.bytes_written),
        target,
    );
    if !report.failures.is_empty() {
        println!("{} file(s) FAILED:", report.failures.len());
        for f in &report.failures {
            println!("  {}: {}", f.rel_path, f.error);
        }
        bail!("restore finished with failures");
    }
    Ok(())
}

fn delete(repo: &PathBuf, generation: &str) -> Result<()> {
    let mut engine = open_engine(repo, None)?;
    let report = engine.delete(generation)?;
    println!(
        "Deleted generation {} ({} chunk reference(s) released)",
        report.generation_id, report.chunks_released,
    );
    Ok(())
}

fn analyze(repo: &PathBuf) -> Result<()> {
    let engine = open_engine(repo, None)?;
    let Some(stats) = engine.analyze()? else {
        println!("No backups available for analysis.");
        return Ok(());
    };
    println!("=== Backup Analysis ===");
    println!("Total backups: {}", stats.generations);
    println!("Total size: {}", human_kb(stats.logical_bytes));
    println!("Stored size (deduplicated): {}", human_kb(stats.physical_bytes));
    println!("Average size: {}", human_kb(stats.mean_bytes));
    println!("Largest backup: {}", human_kb(stats.max_bytes));
    println!("Smallest backup: {}", human_kb(stats.min_bytes));

    let mut by_size = engine.list();
    by_size.sort_by_key(|s| s.logical_bytes);
    println!();
    println!("Sorted backups (by size):");
    for s in by_size {
        println!("- {} ({})", s.name, human_kb(s.logical_bytes));
    }
    Ok(())
}

fn verify(repo: &PathBuf, generation: &str) -> Result<()> {
    let engine = open_engine(repo, None)?;
    let report = engine.verify(generation)?;
    if report.chunks_bad == 0 {
        println!(
            "OK: {} chunk(s) across {} file(s) verified",
            report.chunks_ok, report.files_ok,
        );
        Ok(())
    } else {
        println!(
            "CORRUPT: {} bad chunk(s) affecting {} file(s) ({} chunk(s) ok)",
            report.chunks_bad, report.files_bad, report.chunks_ok,
        );
        bail!("verification failed");
    }
}

fn read_password(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).context("read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn human_kb(bytes: u64) -> String {
    format!("{:.2} KB", bytes as f64 / 1024.0)
}
