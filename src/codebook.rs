use std::sync::Arc;

use rand::{rngs::StdRng, seq::index, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::descriptors::Descriptors;
use crate::{EncodeErr, Result};

/// Distance metric used for nearest-centroid assignment and clustering.
///
/// Only the ordering of distances matters to assignment, so a metric may
/// return squared or otherwise monotone-transformed values. The mean-update
/// step of the learner assumes the metric is minimized by the arithmetic
/// mean, which holds for (squared) Euclidean distance.
pub trait Metric {
    fn distance(a: &[f32], b: &[f32]) -> f32;
}

/// Squared Euclidean distance. The default metric everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredEuclidean;

impl Metric for SquaredEuclidean {
    #[inline]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).fold(0., |acc, (x, y)| {
            let d = x - y;
            acc + d * d
        })
    }
}

/// Clustering configuration for `learn_codebook`.
///
/// The default seed is fixed so that unconfigured runs are reproducible;
/// pass a different seed to vary the centroid initialization.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KMeansConfig {
    /// Iteration cap. Hitting it is not an error; the best centroids found
    /// so far are accepted and reported via [`Convergence`].
    pub max_iterations: usize,
    /// Convergence threshold on the largest per-iteration centroid shift,
    /// in the units of the metric.
    pub tolerance: f32,
    /// Seed for centroid initialization.
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// Outcome of a `learn_codebook` call.
///
/// `converged` is false when the iteration cap was reached while centroids
/// were still moving more than the tolerance. The learned codebook is valid
/// either way; clustering is inherently approximate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub converged: bool,
    pub iterations: usize,
}

/// A set of K centroid vectors of dimensionality D, learned by k-means
/// clustering over a training set of descriptors.
///
/// Immutable once built. Encoders hold the current codebook behind an
/// `Arc` snapshot, so re-learning replaces the whole codebook rather than
/// mutating one that a concurrent encode call may be reading.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Codebook {
    centroids: Vec<f32>,
    k: usize,
    dim: usize,
}

impl Codebook {
    /// Cluster `descriptors` into `k` centroids with Lloyd's k-means.
    ///
    /// Initial centroids are `k` distinct training rows sampled with the
    /// configured seed. Each iteration assigns every row to its nearest
    /// centroid under `M` (ties to the lowest index) and moves each
    /// centroid to the mean of its assigned rows; a cluster that ends up
    /// empty keeps its previous centroid. Iteration stops when assignments
    /// repeat, when the largest centroid shift is within the tolerance, or
    /// at the iteration cap.
    pub fn learn<M: Metric>(
        k: usize,
        descriptors: &Descriptors,
        config: &KMeansConfig,
    ) -> Result<(Self, Convergence)> {
        if k == 0 {
            return Err(EncodeErr::InvalidInput(
                "codebook size must be at least 1".into(),
            ));
        }
        let n = descriptors.len();
        if n == 0 {
            return Err(EncodeErr::InvalidInput("training set is empty".into()));
        }
        if n < k {
            return Err(EncodeErr::InvalidInput(format!(
                "{} training descriptors cannot fill {} clusters",
                n, k
            )));
        }
        let dim = descriptors.dim();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut centroids = Vec::with_capacity(k * dim);
        for i in index::sample(&mut rng, n, k) {
            centroids.extend_from_slice(descriptors.row(i));
        }

        let mut assignment = vec![0usize; n];
        let mut sums = vec![0f32; k * dim];
        let mut counts = vec![0usize; k];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < config.max_iterations {
            iterations += 1;

            // Assignment step
            let mut changed = false;
            for (i, row) in descriptors.rows().enumerate() {
                let (best, _) = nearest::<M>(row, &centroids, dim);
                if assignment[i] != best {
                    assignment[i] = best;
                    changed = true;
                }
            }
            // assignment starts zeroed, so "unchanged" is only meaningful
            // after the centroids have been updated at least once
            if iterations > 1 && !changed {
                converged = true;
                break;
            }

            // Update step: move each centroid to the mean of its rows
            sums.iter_mut().for_each(|s| *s = 0.);
            counts.iter_mut().for_each(|c| *c = 0);
            for (i, row) in descriptors.rows().enumerate() {
                let c = assignment[i];
                counts[c] += 1;
                for (s, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(row) {
                    *s += x;
                }
            }
            let mut shift = 0f32;
            for c in 0..k {
                if counts[c] == 0 {
                    continue;
                }
                let inv = 1. / counts[c] as f32;
                let block = &mut sums[c * dim..(c + 1) * dim];
                for s in block.iter_mut() {
                    *s *= inv;
                }
                let old = &mut centroids[c * dim..(c + 1) * dim];
                shift = shift.max(M::distance(block, old));
                old.copy_from_slice(block);
            }
            if shift <= config.tolerance {
                converged = true;
                break;
            }
        }

        Ok((
            Self { centroids, k, dim },
            Convergence {
                converged,
                iterations,
            },
        ))
    }

    /// Build a codebook from externally produced centroid rows.
    pub fn from_centroids(rows: &[Vec<f32>]) -> Result<Self> {
        if rows.is_empty() {
            return Err(EncodeErr::InvalidInput(
                "a codebook needs at least one centroid".into(),
            ));
        }
        let d = Descriptors::from_rows(rows)?;
        Ok(Self {
            k: d.len(),
            dim: d.dim(),
            centroids: d.rows().flatten().copied().collect(),
        })
    }

    /// Number of centroids K.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Centroid dimensionality D.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.centroids[i * self.dim..(i + 1) * self.dim]
    }

    /// Iterate over centroids in index order.
    pub fn centroids(&self) -> impl Iterator<Item = &[f32]> {
        self.centroids.chunks_exact(self.dim)
    }

    /// Index of the centroid nearest to `descriptor` under `M`, plus the
    /// centroid itself. Ties break to the lowest index. Assumes the
    /// descriptor width matches `dim`; the encoders check it.
    pub fn assign<M: Metric>(&self, descriptor: &[f32]) -> (usize, &[f32]) {
        let (i, _) = nearest::<M>(descriptor, &self.centroids, self.dim);
        (i, self.centroid(i))
    }

    /// Load a codebook from a file.
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> Result<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }

    /// Save the codebook to a file.
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> Result<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

fn nearest<M: Metric>(row: &[f32], centroids: &[f32], dim: usize) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (j, c) in centroids.chunks_exact(dim).enumerate() {
        let d = M::distance(row, c);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// Fitted/unfitted lifecycle shared by both encoders. Only the `Fitted`
/// state carries a codebook; encode operations go through `fitted()` and
/// surface `NotFitted` otherwise.
#[derive(Debug, Clone)]
pub(crate) enum CodebookState {
    Unfitted,
    Fitted(Arc<Codebook>),
}

impl CodebookState {
    pub(crate) fn fitted(&self) -> Result<&Arc<Codebook>> {
        match self {
            CodebookState::Unfitted => Err(EncodeErr::NotFitted),
            CodebookState::Fitted(codebook) => Ok(codebook),
        }
    }

    pub(crate) fn replace(&mut self, codebook: Codebook) {
        *self = CodebookState::Fitted(Arc::new(codebook));
    }

    pub(crate) fn snapshot(&self) -> Option<Arc<Codebook>> {
        match self {
            CodebookState::Unfitted => None,
            CodebookState::Fitted(codebook) => Some(Arc::clone(codebook)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_descriptors(n: usize, dim: usize, seed: u64) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..n * dim).map(|_| rng.gen::<f32>()).collect();
        Descriptors::from_flat(data, dim).unwrap()
    }

    #[test]
    fn learned_codebook_has_k_centroids_of_training_width() {
        let train = random_descriptors(100, 16, 7);
        let (cb, _) = Codebook::learn::<SquaredEuclidean>(8, &train, &KMeansConfig::default())
            .unwrap();
        assert_eq!(cb.k(), 8);
        assert_eq!(cb.dim(), 16);
        assert_eq!(cb.centroids().count(), 8);
        assert!(cb.centroids().all(|c| c.len() == 16));
    }

    #[test]
    fn fewer_points_than_clusters_is_invalid() {
        let train = random_descriptors(10, 8, 7);
        let err = Codebook::learn::<SquaredEuclidean>(32, &train, &KMeansConfig::default())
            .unwrap_err();
        assert!(matches!(err, EncodeErr::InvalidInput(_)));
    }

    #[test]
    fn empty_training_set_is_invalid() {
        let train = Descriptors::from_rows(&[]).unwrap();
        let err =
            Codebook::learn::<SquaredEuclidean>(4, &train, &KMeansConfig::default()).unwrap_err();
        assert!(matches!(err, EncodeErr::InvalidInput(_)));
    }

    #[test]
    fn learning_is_deterministic_for_a_fixed_seed() {
        let train = random_descriptors(60, 8, 3);
        let config = KMeansConfig::default();
        let (a, ca) = Codebook::learn::<SquaredEuclidean>(6, &train, &config).unwrap();
        let (b, cb) = Codebook::learn::<SquaredEuclidean>(6, &train, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(ca, cb);
    }

    #[test]
    fn single_cluster_centroid_is_the_global_mean() {
        let train =
            Descriptors::from_rows(&[vec![0., 0.], vec![2., 4.], vec![4., 2.]]).unwrap();
        let (cb, conv) =
            Codebook::learn::<SquaredEuclidean>(1, &train, &KMeansConfig::default()).unwrap();
        assert!(conv.converged);
        assert_eq!(cb.centroid(0), &[2., 2.]);
    }

    #[test]
    fn assignment_ties_break_to_lowest_index() {
        let cb =
            Codebook::from_centroids(&[vec![0., 0.], vec![1., 1.], vec![0., 0.]]).unwrap();
        let (i, centroid) = cb.assign::<SquaredEuclidean>(&[0.1, 0.]);
        assert_eq!(i, 0);
        assert_eq!(centroid, &[0., 0.]);
    }

    #[test]
    fn zero_iteration_cap_still_yields_a_codebook() {
        let train = random_descriptors(20, 4, 1);
        let config = KMeansConfig {
            max_iterations: 0,
            ..KMeansConfig::default()
        };
        let (cb, conv) = Codebook::learn::<SquaredEuclidean>(5, &train, &config).unwrap();
        assert_eq!(cb.k(), 5);
        assert!(!conv.converged);
        assert_eq!(conv.iterations, 0);
    }

    #[test]
    fn empty_centroid_set_rejected() {
        assert!(matches!(
            Codebook::from_centroids(&[]),
            Err(EncodeErr::InvalidInput(_))
        ));
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn codebook_serialization_round_trip() {
        let train = random_descriptors(30, 4, 9);
        let (cb, _) =
            Codebook::learn::<SquaredEuclidean>(3, &train, &KMeansConfig::default()).unwrap();
        let bytes = bincode::serialize(&cb).unwrap();
        let back: Codebook = bincode::deserialize(&bytes).unwrap();
        assert_eq!(cb, back);
    }
}
