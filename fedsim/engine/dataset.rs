use std::{
    fs::File,
    io::{BufRead, BufReader},
    ops::Range,
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::FederationError;

/// One labelled example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Dense feature vector.
    pub features: Vec<f32>,
    /// Class index.
    pub label: usize,
}

/// Immutable ordered collection of samples, cheap to clone.
#[derive(Debug, Clone)]
pub struct Dataset {
    samples: Arc<[Sample]>,
    feature_dim: usize,
    num_classes: usize,
}

impl Dataset {
    /// Builds a dataset; the class count is one past the largest label.
    pub fn new(samples: Vec<Sample>) -> Result<Self, FederationError> {
        let num_classes = samples.iter().map(|s| s.label + 1).max().unwrap_or(0);
        Self::with_classes(samples, num_classes)
    }

    /// Builds a dataset with an explicit class count.
    pub fn with_classes(samples: Vec<Sample>, num_classes: usize) -> Result<Self, FederationError> {
        let feature_dim = samples.first().map_or(0, |s| s.features.len());
        for (index, sample) in samples.iter().enumerate() {
            if sample.features.len() != feature_dim {
                return Err(FederationError::Dataset(format!(
                    "sample {index} has {} features, expected {feature_dim}",
                    sample.features.len()
                )));
            }
            if sample.label >= num_classes {
                return Err(FederationError::Dataset(format!(
                    "sample {index} has label {} but only {num_classes} classes",
                    sample.label
                )));
            }
        }
        Ok(Self {
            samples: samples.into(),
            feature_dim,
            num_classes,
        })
    }

    /// Loads `{"features": [...], "label": n}` records, one per line.
    pub fn from_jsonl(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening dataset {}", path.display()))?;
        let mut samples = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(&line)
                .with_context(|| format!("parsing {} line {}", path.display(), line_no + 1))?;
            samples.push(sample);
        }
        Ok(Self::new(samples)?)
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when there is no sample.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Common feature dimensionality.
    #[must_use]
    pub const fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Number of label classes.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// All samples in order.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// View over the whole dataset.
    #[must_use]
    pub fn view(&self) -> DataSlice {
        DataSlice {
            source: Arc::clone(&self.samples),
            range: 0..self.samples.len(),
        }
    }
}

/// Read-only window into a dataset. Clones share the underlying samples.
#[derive(Debug, Clone)]
pub struct DataSlice {
    source: Arc<[Sample]>,
    range: Range<usize>,
}

impl DataSlice {
    /// Samples in the window.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.source[self.range.clone()]
    }

    /// Window bounds within the source dataset.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Number of samples in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// True for an empty window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Sub-window relative to this one. Bounds are clamped to the window.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.len());
        let start = start.min(end);
        Self {
            source: Arc::clone(&self.source),
            range: self.range.start + start..self.range.start + end,
        }
    }
}

/// Class-centred clusters in feature space, used as a stand-in for a
/// downloaded image dataset. Centres depend only on the generator seed, so
/// draws with different sample seeds come from the same distribution.
#[derive(Debug, Clone)]
pub struct SyntheticBlobs {
    centres: Vec<Vec<f32>>,
    spread: f32,
}

impl SyntheticBlobs {
    /// Places one centre per class in `[-1, 1]^features`.
    pub fn new(features: usize, classes: usize, spread: f32, seed: u64) -> Result<Self, FederationError> {
        if features == 0 || classes < 2 {
            return Err(FederationError::InvalidConfig(format!(
                "synthetic data needs at least one feature and two classes (got {features}, {classes})"
            )));
        }
        if !(spread.is_finite() && spread > 0.0) {
            return Err(FederationError::InvalidConfig(format!(
                "synthetic spread must be positive, got {spread}"
            )));
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let centres = (0..classes)
            .map(|_| (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        Ok(Self { centres, spread })
    }

    /// Draws `count` samples with uniformly drawn labels.
    #[must_use]
    pub fn sample(&self, count: usize, seed: u64) -> Dataset {
        let mut rng = SmallRng::seed_from_u64(seed);
        let classes = self.centres.len();
        let samples = (0..count)
            .map(|_| {
                let label = rng.gen_range(0..classes);
                let features = self.centres[label]
                    .iter()
                    .map(|centre| centre + rng.gen_range(-self.spread..self.spread))
                    .collect();
                Sample { features, label }
            })
            .collect::<Vec<_>>();
        let feature_dim = self.centres[0].len();
        Dataset {
            samples: samples.into(),
            feature_dim,
            num_classes: classes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn rejects_ragged_features_and_bad_labels() {
        let ragged = vec![
            Sample { features: vec![1.0, 2.0], label: 0 },
            Sample { features: vec![1.0], label: 1 },
        ];
        assert_eq!(Dataset::new(ragged).unwrap_err().code(), "dataset");
        let labels = vec![Sample { features: vec![1.0], label: 3 }];
        assert!(Dataset::with_classes(labels, 2).is_err());
    }

    #[test]
    fn slices_share_source() {
        let blobs = SyntheticBlobs::new(3, 4, 0.2, 7).unwrap();
        let data = blobs.sample(20, 1);
        let view = data.view();
        let window = view.slice(5, 10);
        assert_eq!(window.range(), 5..10);
        assert_eq!(window.samples(), &data.samples()[5..10]);
        let inner = window.slice(1, 100);
        assert_eq!(inner.range(), 6..10);
    }

    #[test]
    fn synthetic_draws_are_reproducible() {
        let blobs = SyntheticBlobs::new(2, 3, 0.1, 11).unwrap();
        let a = blobs.sample(10, 5);
        let b = blobs.sample(10, 5);
        assert_eq!(a.samples(), b.samples());
        assert_eq!(a.num_classes(), 3);
        assert!(SyntheticBlobs::new(2, 1, 0.1, 0).is_err());
    }

    #[test]
    fn loads_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"features":[0.1,0.2],"label":1}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"features":[0.3,0.4],"label":0}}"#).unwrap();
        let data = Dataset::from_jsonl(&path).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.feature_dim(), 2);
        assert_eq!(data.num_classes(), 2);
    }
}
