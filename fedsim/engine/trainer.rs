//! Local trainer boundary and the bundled softmax-regression trainer.
//!
//! The round engine only ever sees a [`ParameterSet`] and example counts; the
//! trainer decides what the tensors mean.

use ndarray::{Array1, Array2, ArrayView1, Axis, Ix1, Ix2};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{DataSlice, Sample},
    error::FederationError,
    parameters::ParameterSet,
    scalar::ConfigMap,
};

/// Bounded local training settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainOptions {
    /// Passes over the train slice per `fit`.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// SGD step size.
    pub learning_rate: f32,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 32,
            learning_rate: 0.1,
        }
    }
}

impl TrainOptions {
    /// Overrides fields present in a round config (`local_epochs`,
    /// `batch_size`, `learning_rate`).
    #[must_use]
    pub fn merged(mut self, config: &ConfigMap) -> Self {
        if let Some(epochs) = config.get("local_epochs").and_then(|v| v.as_u64()) {
            self.epochs = epochs as usize;
        }
        if let Some(batch) = config.get("batch_size").and_then(|v| v.as_u64()) {
            self.batch_size = (batch as usize).max(1);
        }
        if let Some(lr) = config.get("learning_rate").and_then(|v| v.as_f64()) {
            self.learning_rate = lr as f32;
        }
        self
    }
}

/// Outcome of one local training call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    /// Distinct training examples used.
    pub examples: usize,
    /// Mean loss over the last epoch.
    pub loss: f64,
    /// Accuracy over the last epoch.
    pub accuracy: f64,
}

/// Outcome of inference-only evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    /// Examples evaluated.
    pub examples: usize,
    /// Mean loss.
    pub loss: f64,
    /// Fraction of correct predictions.
    pub accuracy: f64,
}

/// Model plus its training and inference step.
pub trait LocalTrainer: Send {
    /// Current parameters in model order.
    fn parameters(&self) -> ParameterSet;
    /// Replaces the parameters; fails with `ShapeMismatch` on a foreign layout.
    fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), FederationError>;
    /// Trains on `data` in order.
    fn train(&mut self, data: &DataSlice, options: &TrainOptions) -> Result<TrainSummary, FederationError>;
    /// Evaluates on `data` without changing the parameters.
    fn evaluate(&self, data: &DataSlice) -> Result<EvalSummary, FederationError>;
}

/// Builds fresh trainers and the initial global parameters.
pub trait TrainerFactory: Send + Sync + 'static {
    /// Trainer type produced.
    type Trainer: LocalTrainer + 'static;
    /// New trainer with untouched parameters.
    fn create(&self) -> Self::Trainer;
    /// Parameters the first round starts from.
    fn initial_parameters(&self) -> ParameterSet;
}

/// Multinomial logistic regression: `softmax(x · W + b)` trained with
/// mini-batch SGD on cross-entropy.
#[derive(Debug, Clone)]
pub struct SoftmaxTrainer {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl SoftmaxTrainer {
    /// Zero-initialised trainer.
    #[must_use]
    pub fn new(features: usize, classes: usize) -> Self {
        Self {
            weights: Array2::zeros((features, classes)),
            bias: Array1::zeros(classes),
        }
    }

    fn probabilities(&self, samples: &[Sample]) -> Array2<f32> {
        let x = batch_matrix(samples, self.weights.nrows());
        let mut logits = x.dot(&self.weights) + &self.bias;
        softmax_rows(&mut logits);
        logits
    }
}

impl LocalTrainer for SoftmaxTrainer {
    fn parameters(&self) -> ParameterSet {
        ParameterSet::new(vec![
            self.weights.clone().into_dyn(),
            self.bias.clone().into_dyn(),
        ])
    }

    fn set_parameters(&mut self, parameters: &ParameterSet) -> Result<(), FederationError> {
        self.parameters().ensure_compatible(parameters)?;
        let tensors = parameters.tensors();
        let shape_err = |err: ndarray::ShapeError| FederationError::ShapeMismatch(err.to_string());
        self.weights = tensors[0].clone().into_dimensionality::<Ix2>().map_err(shape_err)?;
        self.bias = tensors[1].clone().into_dimensionality::<Ix1>().map_err(shape_err)?;
        Ok(())
    }

    fn train(&mut self, data: &DataSlice, options: &TrainOptions) -> Result<TrainSummary, FederationError> {
        let samples = data.samples();
        check_samples(samples, self.weights.nrows(), self.weights.ncols())?;
        let batch_size = options.batch_size.max(1);
        let mut summary = TrainSummary {
            examples: if options.epochs == 0 { 0 } else { samples.len() },
            loss: 0.0,
            accuracy: 0.0,
        };
        for _ in 0..options.epochs {
            let mut loss_sum = 0.0_f64;
            let mut correct = 0_usize;
            for batch in samples.chunks(batch_size) {
                let x = batch_matrix(batch, self.weights.nrows());
                let mut probs = x.dot(&self.weights) + &self.bias;
                softmax_rows(&mut probs);
                for (row, sample) in probs.rows().into_iter().zip(batch) {
                    loss_sum += cross_entropy(row, sample.label);
                    correct += usize::from(argmax(row) == sample.label);
                }
                // dL/dlogits = p - onehot(y)
                for (i, sample) in batch.iter().enumerate() {
                    probs[[i, sample.label]] -= 1.0;
                }
                let scale = 1.0 / batch.len() as f32;
                let grad_w = x.t().dot(&probs) * scale;
                let grad_b = probs.sum_axis(Axis(0)) * scale;
                self.weights.scaled_add(-options.learning_rate, &grad_w);
                self.bias.scaled_add(-options.learning_rate, &grad_b);
            }
            if !samples.is_empty() {
                summary.loss = loss_sum / samples.len() as f64;
                summary.accuracy = correct as f64 / samples.len() as f64;
            }
        }
        if !self.weights.iter().all(|w| w.is_finite()) {
            return Err(FederationError::Trainer("training diverged to non-finite weights".into()));
        }
        Ok(summary)
    }

    fn evaluate(&self, data: &DataSlice) -> Result<EvalSummary, FederationError> {
        let samples = data.samples();
        check_samples(samples, self.weights.nrows(), self.weights.ncols())?;
        if samples.is_empty() {
            return Ok(EvalSummary {
                examples: 0,
                loss: 0.0,
                accuracy: 0.0,
            });
        }
        let mut loss_sum = 0.0_f64;
        let mut correct = 0_usize;
        for batch in samples.chunks(256) {
            let probs = self.probabilities(batch);
            for (row, sample) in probs.rows().into_iter().zip(batch) {
                loss_sum += cross_entropy(row, sample.label);
                correct += usize::from(argmax(row) == sample.label);
            }
        }
        Ok(EvalSummary {
            examples: samples.len(),
            loss: loss_sum / samples.len() as f64,
            accuracy: correct as f64 / samples.len() as f64,
        })
    }
}

/// Factory for [`SoftmaxTrainer`] with seeded initial weights.
#[derive(Debug, Clone, Copy)]
pub struct SoftmaxTrainerFactory {
    features: usize,
    classes: usize,
    seed: u64,
}

impl SoftmaxTrainerFactory {
    /// Creates a factory for the given input/output sizes.
    #[must_use]
    pub const fn new(features: usize, classes: usize, seed: u64) -> Self {
        Self {
            features,
            classes,
            seed,
        }
    }
}

impl TrainerFactory for SoftmaxTrainerFactory {
    type Trainer = SoftmaxTrainer;

    fn create(&self) -> SoftmaxTrainer {
        SoftmaxTrainer::new(self.features, self.classes)
    }

    fn initial_parameters(&self) -> ParameterSet {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let weights =
            Array2::from_shape_fn((self.features, self.classes), |_| rng.gen_range(-0.05..0.05));
        ParameterSet::new(vec![weights.into_dyn(), Array1::<f32>::zeros(self.classes).into_dyn()])
    }
}

fn check_samples(samples: &[Sample], features: usize, classes: usize) -> Result<(), FederationError> {
    match samples
        .iter()
        .find(|s| s.features.len() != features || s.label >= classes)
    {
        Some(sample) => Err(FederationError::Trainer(format!(
            "sample with {} features and label {} does not fit a {features}x{classes} model",
            sample.features.len(),
            sample.label
        ))),
        None => Ok(()),
    }
}

fn batch_matrix(samples: &[Sample], features: usize) -> Array2<f32> {
    Array2::from_shape_fn((samples.len(), features), |(i, j)| samples[i].features[j])
}

fn softmax_rows(logits: &mut Array2<f32>) {
    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
}

fn cross_entropy(probs: ArrayView1<'_, f32>, label: usize) -> f64 {
    -f64::from(probs[label].max(1e-12)).ln()
}

fn argmax(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
