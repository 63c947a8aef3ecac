//! Text → fixed-dimension, L2-normalized vector. Two variants: the
//! deterministic hash embedder (always available) and an optional learned
//! embedder behind the `learned-embedder` feature.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::config::{EmbeddingBackend, EngineConfig};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9_./-]+").unwrap());

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Deterministic SHA-256-bucketed bag-of-tokens embedding. Tokenizes on
/// `[A-Za-z0-9_./-]+`, lowercased. For each token's digest: first 4 bytes
/// (big-endian) select the bucket modulo `dim`, the 5th byte's low bit picks
/// a sign, the 6th byte contributes a weight in `[1.0, 2.0)`.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut vec = vec![0.0f32; dim];

    for m in TOKEN_RE.find_iter(&lower) {
        let token = m.as_str();
        let digest = Sha256::digest(token.as_bytes());
        let index = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % dim;
        let sign = if digest[4] & 1 != 0 { -1.0 } else { 1.0 };
        let weight = 1.0 + (digest[5] as f32 / 255.0);
        vec[index] += sign * weight;
    }

    l2_normalize(&mut vec);
    vec
}

/// Truncate or zero-pad `vec` to `target_dim`, then L2-normalize.
pub fn normalize_dim(mut vec: Vec<f32>, target_dim: usize) -> Vec<f32> {
    vec.resize(target_dim, 0.0);
    l2_normalize(&mut vec);
    vec
}

/// A resolved embedding capability plus a human-readable label persisted
/// alongside each embedding so inconsistent models are detectable.
pub enum Embedder {
    Hash { dim: usize },
    #[cfg(feature = "learned-embedder")]
    Learned {
        model: fastembed::TextEmbedding,
        dim: usize,
        label: String,
    },
}

impl Embedder {
    pub fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        match self {
            Embedder::Hash { dim } => Ok(hash_embed(text, *dim)),
            #[cfg(feature = "learned-embedder")]
            Embedder::Learned { model, dim, .. } => {
                let mut out = model.embed(vec![text], None)?;
                let raw = out.pop().ok_or_else(|| anyhow::anyhow!("no embedding returned"))?;
                Ok(normalize_dim(raw, *dim))
            }
        }
    }

    pub fn model_label(&self) -> String {
        match self {
            Embedder::Hash { dim } => format!("hash-{}", dim),
            #[cfg(feature = "learned-embedder")]
            Embedder::Learned { label, .. } => label.clone(),
        }
    }
}

/// Resolve the configured backend to a concrete embedder. `"hash"` always
/// forces the hash embedder; `"onnx"` and `"auto"` both prefer the learned
/// embedder, falling back to hash when it is unavailable (feature not
/// compiled in, or the model failed to load).
pub fn resolve_embedder(config: &EngineConfig) -> Embedder {
    match config.embedding_backend {
        EmbeddingBackend::Hash => Embedder::Hash {
            dim: config.embedding_dim,
        },
        EmbeddingBackend::Onnx | EmbeddingBackend::Auto => {
            try_learned_embedder(config).unwrap_or(Embedder::Hash {
                dim: config.embedding_dim,
            })
        }
    }
}

#[cfg(feature = "learned-embedder")]
fn try_learned_embedder(config: &EngineConfig) -> Option<Embedder> {
    use fastembed::{InitOptions, TextEmbedding};

    let model = TextEmbedding::try_new(InitOptions::new(config.embedding_model.parse().ok()?))
        .inspect_err(|e| tracing::warn!(error = %e, "learned embedder unavailable, falling back to hash"))
        .ok()?;
    let label = format!(
        "onnx-{}-{}",
        config.embedding_model.replace('/', "-"),
        config.embedding_dim
    );
    Some(Embedder::Learned {
        model,
        dim: config.embedding_dim,
        label,
    })
}

#[cfg(not(feature = "learned-embedder"))]
fn try_learned_embedder(_config: &EngineConfig) -> Option<Embedder> {
    None
}
