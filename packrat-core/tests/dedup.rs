use packrat_core::chunker::ChunkerConfig;
use packrat_core::engine::{CreateOptions, Engine, EngineConfig, RestoreOptions};
use packrat_core::progress::Progress;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs;

fn quiet() -> Progress {
    Progress::new(false)
}

fn small_cfg() -> EngineConfig {
    EngineConfig { chunker: ChunkerConfig::new(1024, 4096, 16384).unwrap() }
}

// Non-repeating content, so chunks only dedup across generations, never
// within one file.
fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn identical_tree_backed_up_twice_stores_nothing_new() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("x.bin"), random_bytes(50_000, 1)).unwrap();
    fs::write(src.join("y.bin"), random_bytes(50_000, 2)).unwrap();

    let mut engine = Engine::open(&td.path().join("repo"), small_cfg()).unwrap();
    let g1 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap();
    assert!(g1.stored_bytes > 0);
    let usage_after_first = engine.store().disk_usage().unwrap();
    let chunks_after_first = engine.store().chunk_count().unwrap();

    let g2 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap();
    assert_eq!(g2.stored_bytes, 0, "identical content must fully dedup");
    assert_eq!(engine.store().disk_usage().unwrap(), usage_after_first);
    assert_eq!(engine.store().chunk_count().unwrap(), chunks_after_first);

    // Shared chunks survive deleting either generation alone.
    engine.delete(&g1.generation_id).unwrap();
    let out = td.path().join("out");
    let rr = engine
        .restore(&g2.generation_id, &out, &RestoreOptions::default(), &quiet())
        .unwrap();
    assert!(rr.failures.is_empty());
    assert_eq!(fs::read(out.join("x.bin")).unwrap(), random_bytes(50_000, 1));

    engine.delete(&g2.generation_id).unwrap();
    assert_eq!(engine.store().chunk_count().unwrap(), 0);
}

#[test]
fn interior_edit_dedups_unchanged_regions() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("src");
    fs::create_dir_all(&src).unwrap();
    let mut data = random_bytes(200_000, 3);
    fs::write(src.join("big.bin"), &data).unwrap();

    let mut engine = Engine::open(&td.path().join("repo"), small_cfg()).unwrap();
    let g1 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap();
    assert_eq!(g1.stored_bytes, 200_000);

    data[100_000] ^= 0xff;
    fs::write(src.join("big.bin"), &data).unwrap();
    let g2 = engine.create(&src, &CreateOptions::default(), &quiet()).unwrap();

    // Only the chunks around the edit should be new.
    assert!(g2.stored_bytes > 0);
    assert!(
        g2.stored_bytes < g2.logical_bytes / 2,
        "stored {} of {} logical bytes",
        g2.stored_bytes,
        g2.logical_bytes
    );

    let out = td.path().join("out");
    let rr = engine
        .restore(&g2.generation_id, &out, &RestoreOptions::default(), &quiet())
        .unwrap();
    assert!(rr.failures.is_empty());
    assert_eq!(fs::read(out.join("big.bin")).unwrap(), data);
}
