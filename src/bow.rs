use std::marker::PhantomData;
use std::sync::Arc;

use crate::codebook::{Codebook, CodebookState, Convergence, KMeansConfig, Metric};
use crate::descriptors::Descriptors;
use crate::{EncodeErr, FeatureVector, Normalization, Result, SquaredEuclidean};

/// Bag-of-Words encoder.
///
/// Learns a codebook of `k` centroids from training descriptors, then
/// encodes any descriptor set as the length-`k` histogram of
/// nearest-centroid occurrences, in centroid-index order. The codebook
/// must be learned (or installed) before encoding:
///
/// ```
/// use featcode::{BowEncoder, Descriptors};
///
/// let train = Descriptors::from_rows(&[
///     vec![0., 0.], vec![0.1, 0.], vec![5., 5.], vec![5., 5.1],
/// ])?;
/// let mut bow = BowEncoder::new(2);
/// bow.learn_codebook(&train)?;
/// let hist = bow.compute_feature_vector(&train)?;
/// assert_eq!(hist.len(), 2);
/// assert_eq!(hist.iter().sum::<f32>(), 4.);
/// # Ok::<(), featcode::EncodeErr>(())
/// ```
#[derive(Debug, Clone)]
pub struct BowEncoder<M = SquaredEuclidean> {
    k: usize,
    kmeans: KMeansConfig,
    normalization: Normalization,
    state: CodebookState,
    metric: PhantomData<M>,
}

impl BowEncoder {
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

impl<M: Metric> BowEncoder<M> {
    /// Encoder over a caller-chosen metric, selected by turbofish:
    /// `BowEncoder::<MyMetric>::with_metric(k, config)`.
    pub fn with_metric(k: usize, kmeans: KMeansConfig) -> Self {
        Self {
            k,
            kmeans,
            normalization: Normalization::None,
            state: CodebookState::Unfitted,
            metric: PhantomData,
        }
    }

    /// Normalization applied to every computed histogram. Raw counts are
    /// the default.
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

    /// Encode `descriptors` as an occurrence histogram over the codebook.
    ///
    /// The result always has length `k`; clusters no descriptor maps to
    /// hold zero. An empty descriptor set encodes to the zero histogram.
    /// Fails with `NotFitted` before `learn_codebook` and with
    /// `DimensionMismatch` when the descriptor width differs from the
    /// codebook's.
    pub fn compute_feature_vector(&self, descriptors: &Descriptors) -> Result<FeatureVector> {
        let codebook = self.state.fitted()?;
        let mut hist = vec![0f32; codebook.k()];
        if !descriptors.is_empty() {
            if descriptors.dim() != codebook.dim() {
                return Err(EncodeErr::DimensionMismatch {
                    expected: codebook.dim(),
                    got: descriptors.dim(),
                });
            }
            for row in descriptors.rows() {
                let (i, _) = codebook.assign::<M>(row);
                hist[i] += 1.;
            }
        }
        self.normalization.apply(&mut hist);
        Ok(hist)
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
