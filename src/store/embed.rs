use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// Identity of an embedding space. Vectors from different profiles are not
/// comparable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedderProfile {
    pub id: String,
    pub dimensions: usize,
}

impl std::fmt::Display for EmbedderProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} dims)", self.id, self.dimensions)
    }
}

pub trait Embedder: Send + Sync {
    fn profile(&self) -> EmbedderProfile;

    /// Must return exactly `profile().dimensions` values.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Signed feature hashing over lowercase word unigrams and bigrams,
/// L2-normalized. Deterministic and offline.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const ID: &'static str = "hashing-sha256-v1";

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = sha2::Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn profile(&self) -> EmbedderProfile {
        EmbedderProfile {
            id: Self::ID.to_owned(),
            dimensions: self.dimensions,
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            self.add_feature(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

/// Cosine similarity; zero when either vector is all zeros or the lengths
/// differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
