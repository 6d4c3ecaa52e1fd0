use marc_core::error::AppError;
use sha2::{Digest, Sha256};

use super::Embedder;

pub const DEFAULT_HASHING_DIMS: usize = 384;

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from",
    "has", "have", "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "we",
    "were", "what", "when", "which", "who", "with",
];

/// Deterministic bag-of-words feature hashing. Needs no network, so it is the builtin
/// embedder and the last resort when no model service is reachable.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMS)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut b = [0u8; 8];
        b.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(b) % self.dims as u64) as usize
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, _model: &str, input: &str) -> Result<Vec<f32>, AppError> {
        let all = tokens(input);
        let content: Vec<&String> = all
            .iter()
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .collect();
        // A text made only of stopwords still gets a vector.
        let used: Vec<&String> = if content.is_empty() {
            all.iter().collect()
        } else {
            content
        };

        let mut v = vec![0.0f32; self.dims];
        for t in used {
            v[self.bucket(t)] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        Ok(v)
    }
}
