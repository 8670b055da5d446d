//! Uniform contiguous partitioning and prefix/suffix train/validation splits.
//!
//! Nothing is shuffled: partition `i` is the `i`-th block of `len / n`
//! samples, and inside a partition the train slice is the prefix and the
//! validation slice the suffix.

use crate::{
    dataset::{DataSlice, Dataset},
    error::FederationError,
};

/// Contiguous block of the dataset owned by one participant index.
#[derive(Debug, Clone)]
pub struct Partition {
    index: usize,
    data: DataSlice,
}

impl Partition {
    /// Participant index the block belongs to.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Samples of the block.
    #[must_use]
    pub const fn data(&self) -> &DataSlice {
        &self.data
    }

    /// Block length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an empty block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Train prefix and validation suffix of one partition.
#[derive(Debug, Clone)]
pub struct Split {
    /// Participant index.
    pub index: usize,
    /// Prefix used by `fit`.
    pub train: DataSlice,
    /// Suffix used by `evaluate`; never overlaps `train`.
    pub validation: DataSlice,
}

/// Cuts `dataset` into `n` equal contiguous partitions.
pub fn partition(dataset: &Dataset, n: usize) -> Result<Vec<Partition>, FederationError> {
    let len = dataset.len();
    if n == 0 || len % n != 0 {
        return Err(FederationError::SizeMismatch { len, parts: n });
    }
    let size = len / n;
    let view = dataset.view();
    Ok((0..n)
        .map(|index| Partition {
            index,
            data: view.slice(index * size, (index + 1) * size),
        })
        .collect())
}

/// Validation length for a partition of `len` samples: `round(fraction * len)`.
#[must_use]
pub fn validation_len(len: usize, fraction: f64) -> usize {
    let rounded = (fraction * len as f64).round() as usize;
    rounded.min(len)
}

/// Splits a partition into train prefix and validation suffix.
pub fn split(partition: &Partition, fraction: f64) -> Result<Split, FederationError> {
    if !(0.0..1.0).contains(&fraction) {
        return Err(FederationError::InvalidConfig(format!(
            "validation fraction must be in [0, 1), got {fraction}"
        )));
    }
    let len = partition.len();
    let boundary = len - validation_len(len, fraction);
    Ok(Split {
        index: partition.index,
        train: partition.data.slice(0, boundary),
        validation: partition.data.slice(boundary, len),
    })
}

/// Partitions `dataset` into `n` shards and splits each one.
pub fn federate(dataset: &Dataset, n: usize, fraction: f64) -> Result<Vec<Split>, FederationError> {
    partition(dataset, n)?
        .iter()
        .map(|part| split(part, fraction))
        .collect()
}
