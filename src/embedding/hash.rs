//! Offline feature-hashing embedder.
//!
//! Lowercased alphanumeric tokens are hashed with 64-bit FNV-1a into
//! `dims` buckets with a hash-derived sign, then L2-normalised. Texts that
//! share words get similar vectors. There is no network and no model
//! download, so it suits tests, demos, and air-gapped smoke runs.

use async_trait::async_trait;

use super::{l2_normalize, EmbeddingProvider, ProviderError};
use crate::models::ImageRef;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub struct HashProvider {
    dims: usize,
    model: String,
}

impl HashProvider {
    pub fn new(dims: usize, model: impl Into<String>) -> Self {
        Self {
            dims: dims.max(1),
            model: model.into(),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn supports_images(&self) -> bool {
        true
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    /// Hashes the image digest in 8-char pieces.
    async fn embed_image(&self, image: &ImageRef) -> Result<Vec<f32>, ProviderError> {
        let pieces: Vec<&str> = image
            .digest
            .as_bytes()
            .chunks(8)
            .filter_map(|c| std::str::from_utf8(c).ok())
            .collect();
        Ok(self.embed_one(&pieces.join(" ")))
    }
}
