use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::FederationError;

/// Ordered list of tensors holding one model's trainable state.
///
/// Position matters: two sets combine only when they have the same number of
/// tensors and the same shape at every position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    tensors: Vec<ArrayD<f32>>,
}

impl ParameterSet {
    /// Wraps tensors in their model order.
    #[must_use]
    pub fn new(tensors: Vec<ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    /// Builds a set from `(shape, flat values)` pairs.
    pub fn from_flat(layers: Vec<(Vec<usize>, Vec<f32>)>) -> Result<Self, FederationError> {
        let tensors = layers
            .into_iter()
            .enumerate()
            .map(|(position, (shape, values))| {
                ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|err| {
                    FederationError::ShapeMismatch(format!("tensor {position}: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { tensors })
    }

    /// Tensors in model order.
    #[must_use]
    pub fn tensors(&self) -> &[ArrayD<f32>] {
        &self.tensors
    }

    /// Consumes the set, returning its tensors.
    #[must_use]
    pub fn into_tensors(self) -> Vec<ArrayD<f32>> {
        self.tensors
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True when the set holds no tensor.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Shape of every tensor.
    #[must_use]
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape().to_vec()).collect()
    }

    /// Total scalar count across tensors.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(ArrayD::len).sum()
    }

    /// True when every element is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.tensors
            .iter()
            .all(|t| t.iter().all(|value| value.is_finite()))
    }

    /// Checks that `other` can be combined with `self`.
    pub fn ensure_compatible(&self, other: &Self) -> Result<(), FederationError> {
        if self.len() != other.len() {
            return Err(FederationError::ShapeMismatch(format!(
                "expected {} tensors, found {}",
                self.len(),
                other.len()
            )));
        }
        for (position, (expected, found)) in self.tensors.iter().zip(&other.tensors).enumerate() {
            if expected.shape() != found.shape() {
                return Err(FederationError::ShapeMismatch(format!(
                    "tensor {position}: expected {:?}, found {:?}",
                    expected.shape(),
                    found.shape()
                )));
            }
        }
        Ok(())
    }

    /// Largest absolute elementwise difference, `None` when incompatible.
    #[must_use]
    pub fn max_abs_diff(&self, other: &Self) -> Option<f32> {
        self.ensure_compatible(other).ok()?;
        Some(
            self.tensors
                .iter()
                .zip(&other.tensors)
                .flat_map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()))
                .fold(0.0_f32, f32::max),
        )
    }
}
