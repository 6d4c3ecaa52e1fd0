use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use marc_ai::embeddings::{Embedder, HashingEmbedder};
use marc_ai::index::{BuildParams, IndexedChunk, SidecarEntry, VectorIndex};
use marc_core::config::Settings;
use marc_core::domain::EntityKind;
use marc_core::error::{AppError, ErrorKind};
use marc_core::ingest::{IngestOptions, Ingestor};
use marc_core::store::EntityStore;
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/meetings")
        .join(name)
}

fn ingested_store(settings: &Settings) -> EntityStore {
    let store = EntityStore::open(settings.store_dir()).expect("open store");
    let paths = vec![
        fixture("m1_budget.json"),
        fixture("m2_website.json"),
        fixture("treasury_2024-05-07.json"),
    ];
    let report = Ingestor::new(&store, settings)
        .ingest_files(&paths, &IngestOptions::default())
        .expect("ingest");
    assert_eq!(report.ingested, 3);
    store
}

struct CountingEmbedder {
    inner: HashingEmbedder,
    calls: AtomicUsize,
}

impl Embedder for CountingEmbedder {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(model, input)
    }
}

fn artifact_bytes(root: &Path, generation: &str) -> Vec<(String, Vec<u8>)> {
    ["vectors.bin", "sidecar.json", "manifest.json"]
        .iter()
        .map(|f| {
            let p = root.join("generations").join(generation).join(f);
            (f.to_string(), fs::read(&p).expect("read artifact"))
        })
        .collect()
}

#[test]
fn identical_inputs_build_byte_identical_indexes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let params = BuildParams::from_settings(&settings);

    let a = VectorIndex::open(dir.path().join("index-a")).expect("open a");
    let b = VectorIndex::open(dir.path().join("index-b")).expect("open b");
    let out_a = a.build(&store, &HashingEmbedder::default(), &params).expect("build a");
    let out_b = b.build(&store, &HashingEmbedder::default(), &params).expect("build b");

    assert_eq!(out_a.generation, out_b.generation);
    assert_eq!(
        artifact_bytes(a.root(), &out_a.generation),
        artifact_bytes(b.root(), &out_b.generation)
    );
    assert_eq!(out_a.manifest.chunk_count, 3);
    assert_eq!(out_a.manifest.meeting_count, 3);

    // Rebuilding in place republishes the same generation.
    let again = a.build(&store, &HashingEmbedder::default(), &params).expect("rebuild");
    assert_eq!(again.generation, out_a.generation);
}

#[test]
fn seed_changes_the_generation_but_not_the_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");

    let mut params = BuildParams::from_settings(&settings);
    let first = idx.build(&store, &HashingEmbedder::default(), &params).expect("build");
    let snap_first = idx.load().expect("load");
    params.seed = 42;
    let second = idx.build(&store, &HashingEmbedder::default(), &params).expect("build");
    let snap_second = idx.load().expect("load");

    assert_ne!(first.generation, second.generation);
    assert_eq!(snap_first.entries(), snap_second.entries());
    assert_eq!(snap_second.manifest().seed, 42);
}

#[test]
fn chunks_are_ordered_by_meeting_then_offset_with_sidecar_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");
    let embedder = CountingEmbedder {
        inner: HashingEmbedder::default(),
        calls: AtomicUsize::new(0),
    };

    let status = idx.status().expect("status");
    assert!(!status.ready);

    idx.build(&store, &embedder, &BuildParams::from_settings(&settings))
        .expect("build");
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

    let snap = idx.load().expect("load");
    let ids: Vec<&str> = snap.entries().iter().map(|e| e.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["m1:0", "m2:0", "treasury-2024-05-07:0"]);

    let m1 = snap.entry("m1:0").expect("m1 chunk");
    assert_eq!(m1.meeting_id, "m1");
    assert_eq!(m1.date, "2024-03-15");
    assert_eq!(m1.offset, 0);
    // Two different speakers: no single attribution.
    assert_eq!(m1.speaker, None);
    assert!(m1.text.contains("Budget approved"));

    let status = idx.status().expect("status");
    assert!(status.ready);
    assert_eq!(status.model.as_deref(), Some("hashing-v1"));
    assert_eq!(status.dims, Some(384));
    assert_eq!(status.chunk_count, 3);
    assert_eq!(status.generation.as_deref(), Some(snap.generation()));
}

#[test]
fn deleted_meetings_disappear_after_rebuild_while_old_snapshots_stay_whole() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");
    let params = BuildParams::from_settings(&settings);
    idx.build(&store, &HashingEmbedder::default(), &params).expect("build");
    let old = idx.load().expect("load");

    store.delete(EntityKind::Meeting, "m2").expect("delete m2");
    assert_eq!(old.stale_chunks(&store).expect("stale"), vec!["m2:0".to_string()]);

    idx.build(&store, &HashingEmbedder::default(), &params).expect("rebuild");
    let new = idx.load().expect("load");
    assert_eq!(new.len(), 2);
    assert!(new.entry("m2:0").is_none());
    assert!(new.stale_chunks(&store).expect("stale").is_empty());

    // The earlier snapshot is untouched by the swap.
    assert_eq!(old.len(), 3);
    assert!(old.entry("m2:0").is_some());
}

fn entry(chunk_id: &str, meeting_id: &str, date: &str) -> SidecarEntry {
    SidecarEntry {
        chunk_id: chunk_id.to_string(),
        meeting_id: meeting_id.to_string(),
        date: date.to_string(),
        offset: 0,
        speaker: None,
        source_sha256: String::new(),
        text_sha256: String::new(),
        text: "text".to_string(),
    }
}

#[test]
fn invalid_corpora_are_rejected_without_publishing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let params = BuildParams::from_settings(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");

    let empty_store = EntityStore::open(dir.path().join("empty-store")).expect("open");
    let err = idx
        .build(&empty_store, &HashingEmbedder::default(), &params)
        .unwrap_err();
    assert_eq!(err.code, "AI_INDEX_EMPTY");

    let store = ingested_store(&settings);
    let mixed = vec![
        IndexedChunk {
            entry: entry("m1:0", "m1", "2024-03-15"),
            vector: vec![1.0, 0.0],
        },
        IndexedChunk {
            entry: entry("m2:0", "m2", "2024-04-02"),
            vector: vec![1.0, 0.0, 0.0],
        },
    ];
    let err = idx.build_from_pairs(&store, mixed, &params).unwrap_err();
    assert_eq!(err.code, "AI_INDEX_DIMS_MISMATCH");

    let orphan = vec![IndexedChunk {
        entry: entry("m9:0", "m9", "2024-01-01"),
        vector: vec![1.0, 0.0],
    }];
    let err = idx.build_from_pairs(&store, orphan, &params).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ReferentialIntegrity);

    let err = idx.load().unwrap_err();
    assert_eq!(err.code, "AI_INDEX_NOT_READY");
}

#[test]
fn tampered_artifacts_fail_to_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");
    let out = idx
        .build(&store, &HashingEmbedder::default(), &BuildParams::from_settings(&settings))
        .expect("build");

    let sidecar = idx
        .root()
        .join("generations")
        .join(&out.generation)
        .join("sidecar.json");
    let text = fs::read_to_string(&sidecar).expect("read");
    fs::write(&sidecar, text.replace("Budget approved", "Budget rejected")).expect("write");

    let err = idx.load().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Integrity);
    assert_eq!(err.code, "AI_INDEX_CORRUPT");
}

fn generation_dirs(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root.join("generations"))
        .expect("read generations")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn publishing_keeps_only_the_current_and_previous_generation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");
    let mut params = BuildParams::from_settings(&settings);

    let mut published = Vec::new();
    for seed in [1u64, 2, 3] {
        params.seed = seed;
        let out = idx.build(&store, &HashingEmbedder::default(), &params).expect("build");
        published.push(out.generation);
    }
    let mut expected = vec![published[1].clone(), published[2].clone()];
    expected.sort();
    assert_eq!(generation_dirs(idx.root()), expected);
    assert_eq!(idx.load().expect("load").generation(), published[2]);
}

#[test]
fn loads_racing_builds_always_get_a_complete_generation() {
    use std::sync::atomic::AtomicBool;

    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::offline(dir.path());
    let store = ingested_store(&settings);
    let idx = VectorIndex::open(settings.index_dir()).expect("open");
    let params = BuildParams::from_settings(&settings);
    idx.build(&store, &HashingEmbedder::default(), &params).expect("initial build");
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut loads = 0usize;
            loop {
                let finished = done.load(Ordering::SeqCst);
                let snap = idx.load().expect("load during rebuilds");
                assert_eq!(snap.len(), 3);
                assert_eq!(snap.vectors().len(), snap.entries().len());
                assert!(snap.manifest().seed < 20);
                loads += 1;
                if finished {
                    return loads;
                }
            }
        });
        s.spawn(|| {
            let mut p = params.clone();
            for seed in 0..20u64 {
                p.seed = seed;
                idx.build(&store, &HashingEmbedder::default(), &p).expect("rebuild");
            }
            done.store(true, Ordering::SeqCst);
        });
        assert!(reader.join().expect("reader") >= 1);
    });
    assert_eq!(generation_dirs(idx.root()).len(), 2);
}
