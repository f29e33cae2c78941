use packrat_core::chunker::ChunkerConfig;
use packrat_core::engine::{CreateOptions, Engine, EngineConfig, RestoreOptions};
use packrat_core::error::EngineError;
use packrat_core::manifest;
use packrat_core::progress::Progress;
use std::fs;

fn quiet() -> Progress {
    Progress::new(false)
}

#[test]
fn collision_fails_per_file_unless_overwrite() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"new content").unwrap();

    let mut engine = Engine::open(&td.path().join("repo"), EngineConfig::default()).unwrap();
    let id = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;

    let out = td.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("a.txt"), b"old content").unwrap();

    let rr = engine.restore(&id, &out, &RestoreOptions::default(), &quiet()).unwrap();
    assert_eq!(rr.files_restored, 0);
    assert_eq!(rr.failures.len(), 1);
    assert!(matches!(rr.failures[0].error, EngineError::WouldOverwrite(_)));
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"old content");

    let rr = engine
        .restore(&id, &out, &RestoreOptions { overwrite: true }, &quiet())
        .unwrap();
    assert!(rr.failures.is_empty());
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"new content");
}

#[test]
fn tampered_manifest_path_is_contained() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"innocuous").unwrap();

    let repo = td.path().join("repo");
    let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    let id = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;

    // Rewrite the stored manifest so one entry tries to escape the target.
    let mpath = repo.join("manifests").join(format!("{id}.json"));
    let mut m = manifest::load(&mpath).unwrap();
    m.files[0].rel_path = "../evil.txt".to_string();
    manifest::write(&repo.join("manifests"), &m).unwrap();

    let out = td.path().join("deep").join("out");
    let rr = engine.restore(&id, &out, &RestoreOptions::default(), &quiet()).unwrap();
    assert_eq!(rr.files_restored, 0);
    assert_eq!(rr.failures.len(), 1);
    assert!(!td.path().join("deep").join("evil.txt").exists());
}

#[test]
fn missing_chunk_is_fatal_for_that_file_only() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("victim.bin"), vec![0xabu8; 5000]).unwrap();
    fs::write(src.join("survivor.bin"), vec![0xcdu8; 5000]).unwrap();

    let repo = td.path().join("repo");
    let cfg = EngineConfig { chunker: ChunkerConfig::new(1024, 4096, 16384).unwrap() };
    let mut engine = Engine::open(&repo, cfg).unwrap();
    let id = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;

    // Unlink one chunk of victim.bin behind the store's back.
    let m = manifest::load(&repo.join("manifests").join(format!("{id}.json"))).unwrap();
    let victim = m.files.iter().find(|f| f.rel_path == "victim.bin").unwrap();
    let gone = &victim.chunks[0];
    let chunk_path = repo.join("store").join(&gone[0..2]).join(&gone[2..4]).join(gone);
    fs::remove_file(&chunk_path).unwrap();

    let out = td.path().join("out");
    let rr = engine.restore(&id, &out, &RestoreOptions::default(), &quiet()).unwrap();
    assert_eq!(rr.files_restored, 1);
    assert_eq!(rr.failures.len(), 1);
    assert_eq!(rr.failures[0].rel_path, "victim.bin");
    assert!(matches!(rr.failures[0].error, EngineError::ChunkMissing { .. }));
    assert_eq!(fs::read(out.join("survivor.bin")).unwrap(), vec![0xcdu8; 5000]);
    assert!(!out.join("victim.bin").exists());

    // verify() sees the same damage without touching the target.
    let vr = engine.verify(&id).unwrap();
    assert!(vr.chunks_bad > 0);
    assert_eq!(vr.files_bad, 1);
}
