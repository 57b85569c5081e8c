use std::collections::HashSet;

use crate::ingest::{MetaValue, Metadata};

// ---------------------------------------------------------------------------
// In-memory vector index. Rows are scanned linearly — the corpus is hundreds
// to low thousands of segments, so brute-force cosine beats any index setup
// cost. Nothing is persisted; embeddings are recomputed each launch.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VectorRow {
    pub file_id: String,
    pub segment_id: String,
    /// L2-normalized embedding; dot product equals cosine similarity.
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

/// Conjunctive equality filter over row metadata.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, String),
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    /// Fold `(key, value)` pairs into a right-nested conjunction.
    /// Empty input yields no filter.
    pub fn conjunction<I>(pairs: I) -> Option<Filter>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut iter = pairs.into_iter();
        let first = iter.next()?;
        let mut filter = Filter::Eq(first.0, first.1);
        for (key, value) in iter {
            filter = Filter::And(Box::new(filter), Box::new(Filter::Eq(key, value)));
        }
        Some(filter)
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Filter::Eq(key, value) => matches!(
                metadata.get(key),
                Some(MetaValue::Str(s)) if s == value
            ),
            Filter::And(left, right) => left.matches(metadata) && right.matches(metadata),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Default)]
pub struct VectorStore {
    rows: Vec<VectorRow>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: VectorRow) {
        self.rows.push(row);
    }

    /// Delete every row belonging to `file_id`. Returns how many went away.
    pub fn remove_all(&mut self, file_id: &str) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| r.file_id != file_id);
        before - self.rows.len()
    }

    /// Swap in a fresh ingestion of one file. Callers hold the store's write
    /// lock, so no search ever observes the file half-removed.
    pub fn replace_file(&mut self, file_id: &str, rows: Vec<VectorRow>) -> usize {
        let removed = self.remove_all(file_id);
        self.rows.extend(rows);
        removed
    }

    pub fn segment_count(&self) -> usize {
        self.rows.len()
    }

    pub fn document_count(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.file_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Brute-force cosine scan: score every row, apply the filter, sort
    /// descending, truncate. Ties keep insertion order (the sort is stable).
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Vec<SearchHit> {
        let mut scored: Vec<(f32, &VectorRow)> = self
            .rows
            .iter()
            .filter(|row| filter.map_or(true, |f| f.matches(&row.metadata)))
            .map(|row| (dot(query, &row.embedding), row))
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        scored
            .into_iter()
            .map(|(score, row)| SearchHit {
                score,
                text: row.text.clone(),
                metadata: row.metadata.clone(),
            })
            .collect()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
