use serde::{Deserialize, Serialize};

use crate::{EncodeErr, Result};

/// Dense row-major (N, D) matrix of local descriptors.
///
/// Every row is one descriptor of dimensionality D. D is fixed for the
/// whole matrix; the constructors reject non-rectangular data. N = 0 is a
/// valid matrix (no keypoints detected in an image, for example).
///
/// The crate makes no assumption about where descriptors come from, only
/// that they are numeric vectors of consistent width.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Descriptors {
    data: Vec<f32>,
    dim: usize,
}

impl Descriptors {
    /// Build a matrix from descriptor rows. Fails if the rows have uneven
    /// lengths or a row is empty.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = rows.first().map_or(0, |r| r.len());
        if !rows.is_empty() && dim == 0 {
            return Err(EncodeErr::InvalidInput(
                "descriptors must have nonzero dimensionality".into(),
            ));
        }
        let mut data = Vec::with_capacity(rows.len() * dim);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(EncodeErr::InvalidInput(format!(
                    "descriptor {} has length {}, expected {}",
                    i,
                    row.len(),
                    dim
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { data, dim })
    }

    /// Build a matrix from a flat row-major buffer of width `dim`. Fails
    /// if the buffer does not divide evenly into `dim`-wide rows.
    ///
    /// `dim` may be nonzero with an empty buffer; this is the way to make
    /// an empty descriptor set of known width.
    pub fn from_flat(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 && !data.is_empty() {
            return Err(EncodeErr::InvalidInput(
                "descriptors must have nonzero dimensionality".into(),
            ));
        }
        if dim != 0 && data.len() % dim != 0 {
            return Err(EncodeErr::InvalidInput(format!(
                "{} values do not divide into rows of width {}",
                data.len(),
                dim
            )));
        }
        Ok(Self { data, dim })
    }

    /// Number of descriptors (rows).
    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Descriptor dimensionality D. Zero only for a matrix built from an
    /// empty row set, where the width is unknowable.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Iterate over descriptor rows in order.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // max(1) keeps chunks_exact well-defined for the dim = 0 empty case
        self.data.chunks_exact(self.dim.max(1))
    }
}
