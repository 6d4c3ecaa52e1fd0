//! Flat exact-cosine vector index with a JSON metadata sidecar.
//!
//! Layout under the index root:
//! - `generations/<gen>/{vectors.bin, sidecar.json, manifest.json}`: one complete build.
//! - `CURRENT`: name of the generation readers should load.
//!
//! A build writes a fresh generation directory and only then swaps `CURRENT`, so readers
//! observe either the previous complete index or the new one. Artifacts carry no
//! timestamps: identical inputs produce identical bytes and the same generation id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use marc_core::config::Settings;
use marc_core::domain::{EntityKind, Meeting, Person};
use marc_core::error::{AppError, ErrorKind};
use marc_core::fsio::{ensure_dir, read_json_opt, write_bytes_atomic};
use marc_core::integrity::{canonical_json_string, sha256_hex};
use marc_core::store::EntityStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunking::{attribute_speaker, chunk};
use crate::embeddings::Embedder;

pub const INDEX_FORMAT_VERSION: u32 = 1;

const VECTORS_MAGIC: &[u8; 8] = b"MARCVEC1";
const VECTORS_FILE: &str = "vectors.bin";
const SIDECAR_FILE: &str = "sidecar.json";
const MANIFEST_FILE: &str = "manifest.json";
const CURRENT_FILE: &str = "CURRENT";
const LOAD_ATTEMPTS: usize = 16;

static BUILD_LOCK: Mutex<()> = Mutex::new(());

/// Sidecar row: where a vector's text came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SidecarEntry {
    pub chunk_id: String,
    pub meeting_id: String,
    pub date: String,
    pub offset: usize,
    pub speaker: Option<String>,
    pub source_sha256: String,
    pub text_sha256: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexManifest {
    pub format_version: u32,
    pub embedding_model: String,
    pub dims: usize,
    pub seed: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub meeting_count: usize,
    pub chunk_count: usize,
    pub vectors_sha256: String,
    pub sidecar_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStatus {
    pub ready: bool,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub chunk_count: usize,
    pub generation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildParams {
    pub model: String,
    pub seed: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl BuildParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model: settings.embedding.model_id.clone(),
            seed: settings.index.seed,
            chunk_size: settings.chunking.size,
            chunk_overlap: settings.chunking.overlap,
        }
    }
}

/// A chunk ready to be indexed: sidecar metadata plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub entry: SidecarEntry,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub generation: String,
    pub manifest: IndexManifest,
}

pub fn chunk_id(meeting_id: &str, offset: usize) -> String {
    format!("{meeting_id}:{offset}")
}

fn index_error(code: &str, message: &str) -> AppError {
    AppError::new(ErrorKind::InvalidInput, code, message)
}

fn corrupt(message: &str, details: String) -> AppError {
    AppError::new(ErrorKind::Integrity, "AI_INDEX_CORRUPT", message).with_details(details)
}

fn encode_vectors(dims: usize, rows: &[IndexedChunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + rows.len() * dims * 4);
    out.extend_from_slice(VECTORS_MAGIC);
    out.extend_from_slice(&(dims as u32).to_le_bytes());
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for r in rows {
        for x in r.vector.iter() {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }
    out
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(b))
}

fn decode_vectors(bytes: &[u8]) -> Result<(usize, Vec<Vec<f32>>), AppError> {
    if bytes.len() < 16 || &bytes[..8] != VECTORS_MAGIC {
        return Err(corrupt("Vector file header is invalid", format!("len={}", bytes.len())));
    }
    let dims = read_u32(bytes, 8).unwrap_or(0) as usize;
    let count = read_u32(bytes, 12).unwrap_or(0) as usize;
    let expected = dims
        .checked_mul(count)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(16))
        .ok_or_else(|| {
            corrupt(
                "Vector file header sizes overflow",
                format!("dims={dims}; count={count}"),
            )
        })?;
    if bytes.len() != expected {
        return Err(corrupt(
            "Vector file length does not match its header",
            format!("dims={dims}; count={count}; expected={expected}; got={}", bytes.len()),
        ));
    }
    let mut rows = Vec::with_capacity(count);
    for (i, raw) in bytes[16..].chunks_exact(4).enumerate() {
        if i % dims.max(1) == 0 {
            rows.push(Vec::with_capacity(dims));
        }
        if let Some(row) = rows.last_mut() {
            row.push(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        }
    }
    Ok((dims, rows))
}

/// Immutable, fully-loaded generation. Queries hold one of these for their whole run.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    generation: String,
    manifest: IndexManifest,
    entries: Vec<SidecarEntry>,
    vectors: Vec<Vec<f32>>,
    by_chunk: HashMap<String, usize>,
}

impl IndexSnapshot {
    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn model(&self) -> &str {
        &self.manifest.embedding_model
    }

    pub fn dims(&self) -> usize {
        self.manifest.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows in insertion order.
    pub fn entries(&self) -> &[SidecarEntry] {
        &self.entries
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn entry(&self, chunk_id: &str) -> Option<&SidecarEntry> {
        self.by_chunk.get(chunk_id).map(|i| &self.entries[*i])
    }

    /// Chunks whose meeting is no longer in the store. Empty after a rebuild.
    pub fn stale_chunks(&self, store: &EntityStore) -> Result<Vec<String>, AppError> {
        let mut out = Vec::new();
        for e in self.entries.iter() {
            if !store.exists(EntityKind::Meeting, &e.meeting_id)? {
                out.push(e.chunk_id.clone());
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    root: PathBuf,
}

impl VectorIndex {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        ensure_dir(&root.join("generations"), "AI_INDEX_IO")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, gen: &str) -> PathBuf {
        self.root.join("generations").join(gen)
    }

    fn current_generation(&self) -> Result<Option<String>, AppError> {
        let path = self.root.join(CURRENT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| {
            AppError::storage("AI_INDEX_IO", "Failed to read CURRENT")
                .with_details(format!("path={}; err={}", path.display(), e))
        })?;
        let gen = raw.trim().to_string();
        Ok(if gen.is_empty() { None } else { Some(gen) })
    }

    pub fn status(&self) -> Result<IndexStatus, AppError> {
        let Some(gen) = self.current_generation()? else {
            return Ok(IndexStatus {
                ready: false,
                model: None,
                dims: None,
                chunk_count: 0,
                generation: None,
            });
        };
        let manifest: Option<IndexManifest> =
            read_json_opt(&self.generation_dir(&gen).join(MANIFEST_FILE), "AI_INDEX_IO")?;
        Ok(match manifest {
            Some(m) => IndexStatus {
                ready: true,
                model: Some(m.embedding_model),
                dims: Some(m.dims),
                chunk_count: m.chunk_count,
                generation: Some(gen),
            },
            None => IndexStatus {
                ready: false,
                model: None,
                dims: None,
                chunk_count: 0,
                generation: Some(gen),
            },
        })
    }

    /// Chunk and embed every stored meeting, then publish a new generation.
    pub fn build(
        &self,
        store: &EntityStore,
        embedder: &dyn Embedder,
        params: &BuildParams,
    ) -> Result<BuildOutcome, AppError> {
        let mut meetings: Vec<Meeting> = store.list()?;
        meetings.sort_by(|a, b| a.id.cmp(&b.id));

        let mut pairs: Vec<IndexedChunk> = Vec::new();
        for m in meetings.iter() {
            let names = known_names(store, m)?;
            for c in chunk(&m.transcript, params.chunk_size, params.chunk_overlap)? {
                if c.text.trim().is_empty() {
                    continue;
                }
                let vector = embedder.embed(&params.model, &c.text)?;
                pairs.push(IndexedChunk {
                    entry: SidecarEntry {
                        chunk_id: chunk_id(&m.id, c.offset),
                        meeting_id: m.id.clone(),
                        date: m.date.clone(),
                        offset: c.offset,
                        speaker: attribute_speaker(&c.text, &names),
                        source_sha256: m.source_sha256.clone(),
                        text_sha256: sha256_hex(c.text.as_bytes()),
                        text: c.text,
                    },
                    vector,
                });
            }
        }
        debug!(meetings = meetings.len(), chunks = pairs.len(), "embedded corpus");
        self.build_from_pairs(store, pairs, params)
    }

    /// Publish already-embedded chunks, in the given order.
    pub fn build_from_pairs(
        &self,
        store: &EntityStore,
        pairs: Vec<IndexedChunk>,
        params: &BuildParams,
    ) -> Result<BuildOutcome, AppError> {
        let _guard = BUILD_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let Some(first) = pairs.first() else {
            return Err(index_error("AI_INDEX_EMPTY", "No chunks to index"));
        };
        let dims = first.vector.len();
        if dims == 0 {
            return Err(index_error("AI_INDEX_DIMS_MISMATCH", "Embeddings must not be empty"));
        }
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut meeting_ids: Vec<&str> = Vec::new();
        for (i, p) in pairs.iter().enumerate() {
            if p.vector.len() != dims {
                return Err(index_error(
                    "AI_INDEX_DIMS_MISMATCH",
                    "Embedding dimensions differ across chunks",
                )
                .with_details(format!(
                    "chunk_id={}; expected={dims}; got={}",
                    p.entry.chunk_id,
                    p.vector.len()
                )));
            }
            if seen.insert(&p.entry.chunk_id, i).is_some() {
                return Err(index_error("AI_INDEX_DUPLICATE_CHUNK", "Chunk id appears twice")
                    .with_details(format!("chunk_id={}", p.entry.chunk_id)));
            }
            if !meeting_ids.contains(&p.entry.meeting_id.as_str()) {
                meeting_ids.push(&p.entry.meeting_id);
            }
        }
        for mid in meeting_ids.iter() {
            if !store.exists(EntityKind::Meeting, mid)? {
                return Err(AppError::new(
                    ErrorKind::ReferentialIntegrity,
                    "AI_INDEX_MEETING_MISSING",
                    "Chunk refers to a meeting that is not in the store",
                )
                .with_details(format!("meeting_id={mid}")));
            }
        }

        let vectors = encode_vectors(dims, &pairs);
        let entries: Vec<&SidecarEntry> = pairs.iter().map(|p| &p.entry).collect();
        let sidecar = serde_json::to_vec_pretty(&entries).map_err(|e| {
            AppError::storage("AI_INDEX_IO", "Failed to encode sidecar").with_details(e.to_string())
        })?;
        let manifest = IndexManifest {
            format_version: INDEX_FORMAT_VERSION,
            embedding_model: params.model.clone(),
            dims,
            seed: params.seed,
            chunk_size: params.chunk_size,
            chunk_overlap: params.chunk_overlap,
            meeting_count: meeting_ids.len(),
            chunk_count: pairs.len(),
            vectors_sha256: sha256_hex(&vectors),
            sidecar_sha256: sha256_hex(&sidecar),
        };
        let manifest_value = serde_json::to_value(&manifest).map_err(|e| {
            AppError::storage("AI_INDEX_IO", "Failed to encode manifest").with_details(e.to_string())
        })?;
        let canonical = canonical_json_string(&manifest_value)?;
        let generation = format!("gen-{}", &sha256_hex(canonical.as_bytes())[..16]);

        let final_dir = self.generation_dir(&generation);
        if !final_dir.join(MANIFEST_FILE).exists() {
            let tmp_dir = self
                .root
                .join("generations")
                .join(format!(".tmp-{generation}-{}", std::process::id()));
            if tmp_dir.exists() {
                fs::remove_dir_all(&tmp_dir).map_err(|e| {
                    AppError::storage("AI_INDEX_IO", "Failed to clear stale build directory")
                        .with_details(format!("path={}; err={}", tmp_dir.display(), e))
                })?;
            }
            ensure_dir(&tmp_dir, "AI_INDEX_IO")?;
            write_bytes_atomic(&tmp_dir.join(VECTORS_FILE), &vectors, "AI_INDEX_IO")?;
            write_bytes_atomic(&tmp_dir.join(SIDECAR_FILE), &sidecar, "AI_INDEX_IO")?;
            let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(|e| {
                AppError::storage("AI_INDEX_IO", "Failed to encode manifest").with_details(e.to_string())
            })?;
            write_bytes_atomic(&tmp_dir.join(MANIFEST_FILE), &manifest_json, "AI_INDEX_IO")?;
            if final_dir.exists() {
                // Leftover from an interrupted publish.
                fs::remove_dir_all(&final_dir).map_err(|e| {
                    AppError::storage("AI_INDEX_IO", "Failed to clear partial generation")
                        .with_details(format!("path={}; err={}", final_dir.display(), e))
                })?;
            }
            fs::rename(&tmp_dir, &final_dir).map_err(|e| {
                AppError::storage("AI_INDEX_IO", "Failed to publish generation").with_details(format!(
                    "tmp={}; dest={}; err={}",
                    tmp_dir.display(),
                    final_dir.display(),
                    e
                ))
            })?;
        }
        let previous = self.current_generation()?;
        write_bytes_atomic(&self.root.join(CURRENT_FILE), generation.as_bytes(), "AI_INDEX_IO")?;
        self.prune_generations(&generation, previous.as_deref());

        info!(
            generation = %generation,
            model = %manifest.embedding_model,
            dims,
            chunks = manifest.chunk_count,
            meetings = manifest.meeting_count,
            "index generation published"
        );
        Ok(BuildOutcome { generation, manifest })
    }

    /// Remove published generations other than `current` and `previous`. Failures only warn:
    /// the new generation is already live.
    fn prune_generations(&self, current: &str, previous: Option<&str>) {
        let dir = self.root.join("generations");
        let names: Vec<String> = match fs::read_dir(&dir) {
            Ok(rd) => rd
                .filter_map(|ent| ent.ok())
                .filter(|ent| ent.path().is_dir())
                .filter_map(|ent| ent.file_name().to_str().map(|s| s.to_string()))
                .collect(),
            Err(e) => {
                warn!(path = %dir.display(), err = %e, "failed to list index generations");
                return;
            }
        };
        for name in names {
            if name.starts_with('.') || name == current || Some(name.as_str()) == previous {
                continue;
            }
            match fs::remove_dir_all(dir.join(&name)) {
                Ok(()) => debug!(generation = %name, "pruned index generation"),
                Err(e) => warn!(generation = %name, err = %e, "failed to prune index generation"),
            }
        }
    }

    /// Load the generation named by `CURRENT`, verifying artifact hashes.
    ///
    /// A generation pruned between reading `CURRENT` and opening its files is retried against
    /// the newer `CURRENT`.
    pub fn load(&self) -> Result<IndexSnapshot, AppError> {
        let mut attempt = 0;
        loop {
            let Some(generation) = self.current_generation()? else {
                return Err(AppError::new(
                    ErrorKind::NotFound,
                    "AI_INDEX_NOT_READY",
                    "Index not built; build the index before querying",
                ));
            };
            match self.load_generation(&generation) {
                Ok(snap) => return Ok(snap),
                Err(e) => {
                    attempt += 1;
                    let moved = self.current_generation()?.as_deref() != Some(generation.as_str());
                    if !moved || attempt >= LOAD_ATTEMPTS {
                        return Err(e);
                    }
                    debug!(generation = %generation, code = %e.code, "generation replaced during load; retrying");
                }
            }
        }
    }

    fn load_generation(&self, generation: &str) -> Result<IndexSnapshot, AppError> {
        let generation = generation.to_string();
        let dir = self.generation_dir(&generation);
        let manifest: IndexManifest = read_json_opt(&dir.join(MANIFEST_FILE), "AI_INDEX_IO")?
            .ok_or_else(|| corrupt("Generation has no manifest", format!("generation={generation}")))?;

        let read = |name: &str| -> Result<Vec<u8>, AppError> {
            let path = dir.join(name);
            fs::read(&path).map_err(|e| {
                AppError::storage("AI_INDEX_IO", "Failed to read index artifact")
                    .with_details(format!("path={}; err={}", path.display(), e))
            })
        };
        let vector_bytes = read(VECTORS_FILE)?;
        let sidecar_bytes = read(SIDECAR_FILE)?;
        if sha256_hex(&vector_bytes) != manifest.vectors_sha256 {
            return Err(corrupt("Vector file hash mismatch", format!("generation={generation}")));
        }
        if sha256_hex(&sidecar_bytes) != manifest.sidecar_sha256 {
            return Err(corrupt("Sidecar hash mismatch", format!("generation={generation}")));
        }

        let (dims, vectors) = decode_vectors(&vector_bytes)?;
        let entries: Vec<SidecarEntry> = serde_json::from_slice(&sidecar_bytes).map_err(|e| {
            corrupt("Sidecar does not decode", format!("generation={generation}; err={e}"))
        })?;
        if dims != manifest.dims || vectors.len() != entries.len() {
            return Err(corrupt(
                "Index artifacts disagree",
                format!(
                    "manifest_dims={}; dims={dims}; vectors={}; entries={}",
                    manifest.dims,
                    vectors.len(),
                    entries.len()
                ),
            ));
        }
        let by_chunk = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.chunk_id.clone(), i))
            .collect();
        debug!(generation = %generation, chunks = entries.len(), "index snapshot loaded");
        Ok(IndexSnapshot {
            generation,
            manifest,
            entries,
            vectors,
            by_chunk,
        })
    }
}

fn known_names(store: &EntityStore, m: &Meeting) -> Result<Vec<String>, AppError> {
    let mut ids: Vec<&String> = m.attendee_ids.iter().collect();
    ids.extend(m.host_id.iter());
    ids.extend(m.documenter_id.iter());
    let mut names = Vec::new();
    for id in ids {
        let p: Person = store.load(id)?;
        names.push(p.display_name.clone());
        names.extend(p.aliases.iter().cloned());
    }
    names.sort();
    names.dedup();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, v: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            entry: SidecarEntry {
                chunk_id: id.to_string(),
                meeting_id: "m".to_string(),
                date: "2024-01-01".to_string(),
                offset: 0,
                speaker: None,
                source_sha256: String::new(),
                text_sha256: String::new(),
                text: String::new(),
            },
            vector: v,
        }
    }

    #[test]
    fn vector_file_roundtrip_preserves_rows() {
        let rows = vec![row("a", vec![1.0, 0.5]), row("b", vec![-2.0, 0.25])];
        let bytes = encode_vectors(2, &rows);
        assert_eq!(&bytes[..8], b"MARCVEC1");
        let (dims, back) = decode_vectors(&bytes).unwrap();
        assert_eq!(dims, 2);
        assert_eq!(back, vec![vec![1.0, 0.5], vec![-2.0, 0.25]]);
    }

    #[test]
    fn truncated_vector_file_is_corrupt() {
        let bytes = encode_vectors(2, &[row("a", vec![1.0, 0.5])]);
        let err = decode_vectors(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Integrity);
    }

    #[test]
    fn oversized_header_counts_are_corrupt_not_a_panic() {
        let mut bytes = Vec::from(&VECTORS_MAGIC[..]);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_vectors(&bytes).unwrap_err();
        assert_eq!(err.code, "AI_INDEX_CORRUPT");
    }
}
