use packrat_core::engine::{CreateOptions, Engine, EngineConfig, RestoreOptions};
use packrat_core::progress::Progress;
use std::fs;

fn quiet() -> Progress {
    Progress::new(false)
}

#[test]
fn catalog_and_refcounts_rebuild_from_manifests() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("shared.bin"), vec![1u8; 30_000]).unwrap();
    let repo = td.path().join("repo");

    let (g1, g2);
    {
        let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
        g1 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
        g2 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
    }

    // Lose the derived state; manifests stay authoritative.
    fs::remove_file(repo.join("catalog.bin")).unwrap();
    fs::remove_file(repo.join("store").join("refcounts.bin")).unwrap();

    let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    let ids: Vec<_> = engine.list().into_iter().map(|s| s.generation_id).collect();
    assert_eq!(ids, vec![g1.clone(), g2.clone()]);

    // Rebuilt refcounts must reflect both citations: deleting one
    // generation keeps the shared chunks alive for the other.
    engine.delete(&g1).unwrap();
    assert!(engine.store().chunk_count().unwrap() > 0);
    let out = td.path().join("out");
    let rr = engine.restore(&g2, &out, &RestoreOptions::default(), &quiet()).unwrap();
    assert!(rr.failures.is_empty());
    assert_eq!(fs::read(out.join("shared.bin")).unwrap(), vec![1u8; 30_000]);

    engine.delete(&g2).unwrap();
    assert_eq!(engine.store().chunk_count().unwrap(), 0);
}

#[test]
fn stale_catalog_and_refcounts_reconcile_at_open() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("f.bin"), vec![7u8; 20_000]).unwrap();
    let repo = td.path().join("repo");
    let catalog_path = repo.join("catalog.bin");
    let refcounts_path = repo.join("store").join("refcounts.bin");

    let g1;
    {
        let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
        g1 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
    }
    let catalog_before = fs::read(&catalog_path).unwrap();
    let refcounts_before = fs::read(&refcounts_path).unwrap();

    let g2;
    {
        let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
        g2 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
    }
    // Wind the derived files back to before the second backup, as if the
    // process died right after that manifest landed. Both files pass
    // their guards; they are merely stale.
    fs::write(&catalog_path, catalog_before).unwrap();
    fs::write(&refcounts_path, refcounts_before).unwrap();

    let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    let ids: Vec<_> = engine.list().into_iter().map(|s| s.generation_id).collect();
    assert_eq!(ids, vec![g1.clone(), g2.clone()]);

    // Reconciled counts credit both citations, so deleting one generation
    // keeps the shared chunks alive for the other.
    engine.delete(&g1).unwrap();
    let out = td.path().join("out");
    let rr = engine.restore(&g2, &out, &RestoreOptions::default(), &quiet()).unwrap();
    assert!(rr.failures.is_empty());
    assert_eq!(fs::read(out.join("f.bin")).unwrap(), vec![7u8; 20_000]);
}

#[test]
fn inflated_refcounts_after_interrupted_delete_reconcile_at_open() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("f.bin"), vec![3u8; 20_000]).unwrap();
    let repo = td.path().join("repo");
    let refcounts_path = repo.join("store").join("refcounts.bin");

    let (g1, g2);
    let refcounts_with_both;
    {
        let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
        g1 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
        g2 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
        refcounts_with_both = fs::read(&refcounts_path).unwrap();
        engine.delete(&g2).unwrap();
    }
    // As if the process died mid-delete: the manifest is gone but the
    // persisted counts still credit it.
    fs::write(&refcounts_path, refcounts_with_both).unwrap();

    let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    engine.delete(&g1).unwrap();
    assert_eq!(engine.store().chunk_count().unwrap(), 0, "stale citation leaked a chunk");
}

#[cfg(target_family = "unix")]
#[test]
fn failed_create_does_not_inflate_refcounts() {
    use std::os::unix::fs::PermissionsExt;

    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("f.bin"), vec![9u8; 20_000]).unwrap();
    let repo = td.path().join("repo");

    let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    let g1 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;

    // Make the manifest publish fail mid-create.
    let manifests = repo.join("manifests");
    fs::set_permissions(&manifests, fs::Permissions::from_mode(0o555)).unwrap();
    if fs::write(manifests.join("writable.check"), b"").is_ok() {
        // Privileged run ignores permission bits; nothing to exercise.
        fs::remove_file(manifests.join("writable.check")).unwrap();
        return;
    }
    assert!(engine.create(&src, &CreateOptions::default(), &quiet()).is_err());
    fs::set_permissions(&manifests, fs::Permissions::from_mode(0o755)).unwrap();

    // Counts are back at their pre-call state: deleting the only
    // generation empties the store instead of leaking its chunks.
    engine.delete(&g1).unwrap();
    assert_eq!(engine.store().chunk_count().unwrap(), 0);
    assert!(engine.list().is_empty());
}

#[test]
fn garbage_catalog_file_is_replaced() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("f.txt"), b"payload").unwrap();
    let repo = td.path().join("repo");

    let id;
    {
        let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
        id = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap().generation_id;
    }
    fs::write(repo.join("catalog.bin"), b"this is not a catalog").unwrap();

    let engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    let list = engine.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].generation_id, id);
}

#[test]
fn unpublished_chunks_are_swept_at_recovery() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("f.txt"), b"published payload").unwrap();
    let repo = td.path().join("repo");

    {
        let mut engine = Engine::open(&repo, EngineConfig::default()).unwrap();
        engine.create(&src, &CreateOptions::default(), &quiet()).unwrap();
    }

    // Simulate an interrupted backup: a chunk payload exists on disk but
    // no manifest cites it and the refcounts file is gone.
    let orphan_hash = blake3::hash(b"never published").to_hex().to_string();
    let orphan_dir =
        repo.join("store").join(&orphan_hash[0..2]).join(&orphan_hash[2..4]);
    fs::create_dir_all(&orphan_dir).unwrap();
    fs::write(orphan_dir.join(&orphan_hash), b"stale bytes").unwrap();
    fs::remove_file(repo.join("store").join("refcounts.bin")).unwrap();

    let engine = Engine::open(&repo, EngineConfig::default()).unwrap();
    assert!(!orphan_dir.join(&orphan_hash).exists());
    assert_eq!(engine.store().chunk_count().unwrap(), 1);
}
