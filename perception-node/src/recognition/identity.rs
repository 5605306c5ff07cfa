//! Cosine nearest-neighbour lookup over registered face embeddings.

use arc_swap::ArcSwap;
use ndarray::{Array1, Array2, ArrayView1};
use std::sync::Arc;
use tracing::{info, warn};

use gatewatch_common::IdentityMatch;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

/// One registered person as delivered by the identity source.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEntry {
    pub id: String,
    pub name: String,
    pub embedding: Vec<f32>,
}

fn l2_normalized(v: ArrayView1<f32>) -> Option<Array1<f32>> {
    let norm = v.dot(&v).sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return None;
    }
    Some(&v / norm)
}

/// Immutable registry contents: row `i` of `embeddings` is the unit-length
/// vector of `ids[i]`.
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    ids: Vec<String>,
    names: Vec<String>,
    embeddings: Array2<f32>,
}

impl IdentitySnapshot {
    pub fn empty() -> Self {
        Self {
            ids: Vec::new(),
            names: Vec::new(),
            embeddings: Array2::zeros((0, 0)),
        }
    }

    /// Normalise every entry. The first usable vector fixes the dimension;
    /// zero-norm vectors and vectors of another length are skipped.
    pub fn from_entries(entries: Vec<IdentityEntry>) -> Self {
        let mut dim = None;
        let mut ids = Vec::with_capacity(entries.len());
        let mut names = Vec::with_capacity(entries.len());
        let mut values = Vec::new();

        for entry in entries {
            if let Some(d) = dim {
                if entry.embedding.len() != d {
                    warn!(id = %entry.id, "Skipping embedding of length {} (expected {})", entry.embedding.len(), d);
                    continue;
                }
            }
            let Some(unit) = l2_normalized(ArrayView1::from(entry.embedding.as_slice())) else {
                warn!(id = %entry.id, "Skipping zero-norm embedding");
                continue;
            };
            dim.get_or_insert(unit.len());
            values.extend(unit.iter().copied());
            ids.push(entry.id);
            names.push(entry.name);
        }

        let dim = dim.unwrap_or(0);
        match Array2::from_shape_vec((ids.len(), dim), values) {
            Ok(embeddings) => Self { ids, names, embeddings },
            Err(e) => {
                warn!("Failed to assemble embedding matrix: {}", e);
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    /// Best entry with cosine similarity `>= threshold`. Ties go to the entry
    /// that appears first.
    pub fn find_match(&self, embedding: &[f32], threshold: f32) -> Option<IdentityMatch> {
        if self.is_empty() || embedding.len() != self.dim() {
            return None;
        }
        let query = l2_normalized(ArrayView1::from(embedding))?;
        let scores = self.embeddings.dot(&query);

        let mut best: Option<(usize, f32)> = None;
        for (i, &score) in scores.iter().enumerate() {
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((i, score));
            }
        }

        let (index, similarity) = best?;
        if similarity < threshold {
            return None;
        }
        Some(IdentityMatch {
            employee_id: self.ids[index].clone(),
            name: self.names[index].clone(),
            similarity,
        })
    }
}

impl Default for IdentitySnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Shared matcher. Readers load the current snapshot without locking;
/// `reload` swaps it wholesale so a lookup never sees a half-loaded registry.
pub struct IdentityMatcher {
    current: ArcSwap<IdentitySnapshot>,
}

impl IdentityMatcher {
    pub fn new(snapshot: IdentitySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn snapshot(&self) -> Arc<IdentitySnapshot> {
        self.current.load_full()
    }

    pub fn reload(&self, snapshot: IdentitySnapshot) {
        let count = snapshot.len();
        self.current.store(Arc::new(snapshot));
        info!("Identity registry now holds {} embeddings", count);
    }

    pub fn find_match(&self, embedding: &[f32], threshold: f32) -> Option<IdentityMatch> {
        self.current.load().find_match(embedding, threshold)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(IdentitySnapshot::empty())
    }
}
