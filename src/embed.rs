use anyhow::{Context, Result};
use model2vec_rs::model::StaticModel;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Embedding seam. The same embedder instance serves ingestion and queries so
// cosine comparisons stay meaningful. All vectors leave here L2-normalized.
// ---------------------------------------------------------------------------

pub const DEFAULT_MODEL: &str = "minishlab/potion-base-8M";

/// Reserved model id selecting the built-in bag-of-words embedder: no model
/// download, fully deterministic. Used for offline runs and by the test suite.
pub const BOW_MODEL: &str = "bow";

pub trait Embedder: Send + Sync {
    fn id(&self) -> &str;
    fn dim(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string()))?;
        vectors
            .pop()
            .context("embedding model returned no vector")
    }
}

/// Load the embedder named by `model_id`. Failure here is fatal at startup.
pub fn load_embedder(model_id: &str) -> Result<Box<dyn Embedder>> {
    if model_id == BOW_MODEL {
        Ok(Box::new(HashedBowEmbedder::new()))
    } else {
        Ok(Box::new(Model2VecEmbedder::load(model_id)?))
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// model2vec static embeddings
// ---------------------------------------------------------------------------

pub struct Model2VecEmbedder {
    id: String,
    dim: usize,
    // StaticModel is kept behind a lock; both the request thread and the
    // ingestion worker embed through this one instance.
    model: Mutex<StaticModel>,
}

impl Model2VecEmbedder {
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .with_context(|| format!("failed to load embedding model `{model_id}`"))?;
        let dim = model.encode_single("dimension probe").len();
        Ok(Self {
            id: model_id.to_string(),
            dim,
            model: Mutex::new(model),
        })
    }
}

impl Embedder for Model2VecEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.lock().expect("embedding model poisoned");
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vector = model.encode_single(text);
            l2_normalize(&mut vector);
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// Hashed bag-of-words
// ---------------------------------------------------------------------------

const BOW_DIM: usize = 256;

/// Tokens hashed into a fixed-width histogram, L2-normalized. Similarity is
/// plain token overlap — crude, but deterministic and dependency-free.
pub struct HashedBowEmbedder {
    dim: usize,
}

impl HashedBowEmbedder {
    pub fn new() -> Self {
        Self { dim: BOW_DIM }
    }
}

impl Default for HashedBowEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashedBowEmbedder {
    fn id(&self) -> &str {
        BOW_MODEL
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dim];
                for token in text
                    .split(|c: char| !c.is_alphanumeric() && c != '_')
                    .filter(|t| t.len() >= 2)
                {
                    let bucket =
                        xxhash_rust::xxh3::xxh3_64(token.to_lowercase().as_bytes()) as usize
                            % self.dim;
                    vector[bucket] += 1.0;
                }
                l2_normalize(&mut vector);
                vector
            })
            .collect())
    }
}
