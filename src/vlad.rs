use std::marker::PhantomData;
use std::sync::Arc;

use crate::codebook::{Codebook, CodebookState, Convergence, KMeansConfig, Metric};
use crate::descriptors::Descriptors;
use crate::{EncodeErr, FeatureVector, Normalization, Result, SquaredEuclidean};

/// VLAD (Vector of Locally Aggregated Descriptors) encoder.
///
/// Shares the Bag-of-Words lifecycle but aggregates residuals instead of
/// counts: each descriptor contributes `descriptor - centroid` to the
/// accumulator of its nearest centroid, and the `k` accumulators are
/// concatenated into one length `k * d` vector in centroid-index order.
///
/// Residuals are sign- and magnitude-sensitive, so the raw output is
/// unnormalized. The standard VLAD refinements are available through
/// [`Normalization`]: signed square-root (power normalization), L2, or
/// both in sequence.
#[derive(Debug, Clone)]
pub struct VladEncoder<M = SquaredEuclidean> {
    k: usize,
    kmeans: KMeansConfig,
    normalization: Normalization,
    state: CodebookState,
    metric: PhantomData<M>,
}

impl VladEncoder {
    /// Encoder with codebook size `k`, default clustering configuration,
    /// the default metric and no output normalization.
    pub fn new(k: usize) -> Self {
        Self::with_config(k, KMeansConfig::default())
    }

    /// Encoder with codebook size `k` and explicit clustering
    /// configuration.
    pub fn with_config(k: usize, kmeans: KMeansConfig) -> Self {
        Self::with_metric(k, kmeans)
    }
}

impl<M: Metric> VladEncoder<M> {
    /// Encoder over a caller-chosen metric, selected by turbofish:
    /// `VladEncoder::<MyMetric>::with_metric(k, config)`.
    pub fn with_metric(k: usize, kmeans: KMeansConfig) -> Self {
        Self {
            k,
            kmeans,
            normalization: Normalization::None,
            state: CodebookState::Unfitted,
            metric: PhantomData,
        }
    }

    /// Normalization applied to every computed vector. The raw residual
    /// sums are the default.
    pub fn normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Cluster `descriptors` into the codebook used by subsequent encode
    /// calls, replacing any previously learned one.
    pub fn learn_codebook(&mut self, descriptors: &Descriptors) -> Result<Convergence> {
        let (codebook, convergence) = Codebook::learn::<M>(self.k, descriptors, &self.kmeans)?;
        self.state.replace(codebook);
        Ok(convergence)
    }

    /// Install an externally built codebook. Its size must match this
    /// encoder's `k`.
    pub fn set_codebook(&mut self, codebook: Codebook) -> Result<()> {
        if codebook.k() != self.k {
            return Err(EncodeErr::InvalidInput(format!(
                "codebook has {} centroids, encoder expects {}",
                codebook.k(),
                self.k
            )));
        }
        self.state.replace(codebook);
        Ok(())
    }

    /// Encode `descriptors` as concatenated per-cluster residual sums.
    ///
    /// The result always has length `k * d`; clusters no descriptor maps
    /// to hold all-zero blocks. An empty descriptor set encodes to the
    /// zero vector. Fails with `NotFitted` before `learn_codebook` and
    /// with `DimensionMismatch` when the descriptor width differs from
    /// the codebook's.
    pub fn compute_feature_vector(&self, descriptors: &Descriptors) -> Result<FeatureVector> {
        let codebook = self.state.fitted()?;
        let dim = codebook.dim();
        let mut vlad = vec![0f32; codebook.k() * dim];
        if !descriptors.is_empty() {
            if descriptors.dim() != dim {
                return Err(EncodeErr::DimensionMismatch {
                    expected: dim,
                    got: descriptors.dim(),
                });
            }
            for row in descriptors.rows() {
                let (i, centroid) = codebook.assign::<M>(row);
                let block = &mut vlad[i * dim..(i + 1) * dim];
                for ((acc, x), c) in block.iter_mut().zip(row).zip(centroid) {
                    *acc += x - c;
                }
            }
        }
        self.normalization.apply(&mut vlad);
        Ok(vlad)
    }

    /// Snapshot of the current codebook, if one has been learned. The
    /// snapshot stays valid and unchanged across later re-learns.
    pub fn codebook(&self) -> Option<Arc<Codebook>> {
        self.state.snapshot()
    }

    pub fn is_fitted(&self) -> bool {
        self.codebook().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_descriptors(n: usize, dim: usize, seed: u64) -> Descriptors {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..n * dim).map(|_| rng.gen::<f32>()).collect();
        Descriptors::from_flat(data, dim).unwrap()
    }

    #[test]
    fn output_length_is_k_times_d() {
        let train = random_descriptors(50, 16, 21);
        let mut vlad = VladEncoder::new(4);
        vlad.learn_codebook(&train).unwrap();

        let out = vlad.compute_feature_vector(&train).unwrap();
        assert_eq!(out.len(), 4 * 16);
    }

    #[test]
    fn residuals_accumulate_per_cluster() {
        let mut vlad = VladEncoder::new(2);
        vlad.set_codebook(Codebook::from_centroids(&[vec![0., 0.], vec![10., 10.]]).unwrap())
            .unwrap();

        // cluster 0 gets (1, 0); cluster 1 gets (-1, 0) + (1, 0) = (0, 0)
        let query =
            Descriptors::from_rows(&[vec![1., 0.], vec![9., 10.], vec![11., 10.]]).unwrap();
        let out = vlad.compute_feature_vector(&query).unwrap();
        assert_eq!(out, vec![1., 0., 0., 0.]);
    }

    #[test]
    fn compute_before_learn_is_not_fitted() {
        let vlad = VladEncoder::new(4);
        let query = random_descriptors(10, 8, 1);
        let err = vlad.compute_feature_vector(&query).unwrap_err();
        assert!(matches!(err, EncodeErr::NotFitted));
    }

    #[test]
    fn empty_descriptor_set_encodes_to_zero_vector() {
        let train = random_descriptors(40, 8, 2);
        let mut vlad = VladEncoder::new(4);
        vlad.learn_codebook(&train).unwrap();

        let empty = Descriptors::from_flat(Vec::new(), 8).unwrap();
        assert_eq!(
            vlad.compute_feature_vector(&empty).unwrap(),
            vec![0.; 4 * 8]
        );
    }

    #[test]
    fn wrong_descriptor_width_is_a_dimension_mismatch() {
        let train = random_descriptors(40, 8, 2);
        let mut vlad = VladEncoder::new(4);
        vlad.learn_codebook(&train).unwrap();

        let query = random_descriptors(5, 12, 3);
        let err = vlad.compute_feature_vector(&query).unwrap_err();
        assert!(matches!(
            err,
            EncodeErr::DimensionMismatch {
                expected: 8,
                got: 12
            }
        ));
    }

    #[test]
    fn signed_sqrt_l2_output_has_unit_norm() {
        let mut vlad = VladEncoder::new(2).normalization(Normalization::SignedSqrtL2);
        vlad.set_codebook(Codebook::from_centroids(&[vec![0., 0.], vec![10., 10.]]).unwrap())
            .unwrap();

        let query = Descriptors::from_rows(&[vec![4., -1.], vec![9., 10.]]).unwrap();
        let out = vlad.compute_feature_vector(&query).unwrap();
        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.).abs() < 1e-5);
        // power normalization keeps residual signs
        assert!(out[0] > 0.);
        assert!(out[1] < 0.);
        assert!(out[2] < 0.);
    }

    #[test]
    fn encoding_is_deterministic_across_relearns_with_one_seed() {
        let train = random_descriptors(60, 8, 4);
        let query = random_descriptors(25, 8, 5);

        let mut vlad = VladEncoder::new(6);
        vlad.learn_codebook(&train).unwrap();
        let first = vlad.compute_feature_vector(&query).unwrap();

        vlad.learn_codebook(&train).unwrap();
        let second = vlad.compute_feature_vector(&query).unwrap();
        assert_eq!(first, second);
    }
}
