use marc_core::error::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

use crate::index::IndexSnapshot;

mod similarity;

pub use similarity::{cosine_similarity, l2_norm};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

/// Exact cosine search over a loaded snapshot.
///
/// Scores below `min_score` are dropped before the top-k cut. Equal scores keep index
/// insertion order. An empty result is not an error.
pub fn search(
    snapshot: &IndexSnapshot,
    query: &[f32],
    k: usize,
    min_score: f32,
) -> Result<Vec<SearchHit>, AppError> {
    if query.len() != snapshot.dims() {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "AI_RETRIEVAL_DIMS_MISMATCH",
            "Query embedding dims do not match index dims",
        )
        .with_details(format!("index_dims={}; query_dims={}", snapshot.dims(), query.len())));
    }
    let qnorm = l2_norm(query);
    if qnorm == 0.0 {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            "AI_RETRIEVAL_ZERO_QUERY",
            "Query embedding norm is zero",
        ));
    }

    let mut hits: Vec<(usize, f32)> = Vec::new();
    for (i, v) in snapshot.vectors().iter().enumerate() {
        let vnorm = l2_norm(v);
        if vnorm == 0.0 {
            continue;
        }
        let score = cosine_similarity(query, v, qnorm, vnorm);
        if score >= min_score {
            hits.push((i, score));
        }
    }

    // Stable sort: ties stay in insertion order.
    hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(k);

    let entries = snapshot.entries();
    Ok(hits
        .into_iter()
        .map(|(i, score)| SearchHit {
            chunk_id: entries[i].chunk_id.clone(),
            score,
        })
        .collect())
}
