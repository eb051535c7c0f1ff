use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dense (N, D) descriptor matrix type accepted by the encoders.
pub mod descriptors;
pub use descriptors::Descriptors;

/// Codebook learning (k-means), nearest-centroid assignment and persistence.
pub mod codebook;
pub use codebook::{Codebook, Convergence, KMeansConfig, Metric, SquaredEuclidean};

/// Bag-of-Words encoder: occurrence histogram over codebook clusters.
pub mod bow;
pub use bow::BowEncoder;

/// VLAD encoder: per-cluster summed residuals, concatenated.
pub mod vlad;
pub use vlad::VladEncoder;

/// Fixed-length encoding of a descriptor set.
///
/// For BoW the length is the codebook size `K` and each entry is the
/// occurrence count of that cluster. For VLAD the length is `K * D`,
/// laid out as `K` contiguous `D`-wide residual-sum blocks, both in
/// centroid-index order.
pub type FeatureVector = Vec<f32>;

/// Post-processing applied to a raw feature vector.
///
/// Raw (unnormalized) output is the canonical contract for both encoders;
/// normalization is opt-in. The signed square-root variants are the usual
/// VLAD power normalization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    None,
    L1,
    L2,
    SignedSqrt,
    /// Signed square-root followed by L2.
    SignedSqrtL2,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::None
    }
}

impl Normalization {
    /// Apply this normalization to `v` in place. A zero vector is left
    /// unchanged rather than divided by a zero norm.
    pub fn apply(self, v: &mut [f32]) {
        match self {
            Normalization::None => {}
            Normalization::L1 => {
                let norm = v.iter().map(|x| x.abs()).sum();
                scale_by_inv(v, norm);
            }
            Normalization::L2 => {
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                scale_by_inv(v, norm);
            }
            Normalization::SignedSqrt => signed_sqrt(v),
            Normalization::SignedSqrtL2 => {
                signed_sqrt(v);
                Normalization::L2.apply(v);
            }
        }
    }
}

fn signed_sqrt(v: &mut [f32]) {
    for x in v.iter_mut() {
        *x = x.signum() * x.abs().sqrt();
    }
}

fn scale_by_inv(v: &mut [f32], norm: f32) {
    if norm > 0. {
        let inv = 1. / norm;
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}

pub type Result<T> = std::result::Result<T, EncodeErr>;

#[derive(Error, Debug)]
pub enum EncodeErr {
    /// Encoding was requested before a codebook exists. The codebook is
    /// never learned implicitly; run `learn_codebook` first.
    #[error("no codebook learned, run learn_codebook first")]
    NotFitted,
    /// Malformed or insufficient input: fewer training descriptors than
    /// clusters, an empty training set, or non-rectangular matrix data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Encode-time descriptor width differs from the fitted codebook's.
    #[error("descriptor dimensionality {got} does not match codebook dimensionality {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Codebook Serialization Error")]
    Bincode(#[from] bincode::Error),
}
