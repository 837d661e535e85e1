//! Components to build a neural network

use std::sync::atomic::{self, AtomicUsize};

use rand::Rng;
use rand::distr::{Uniform, uniform};
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Layer dimensions must be non-zero, got {n_inputs} -> {n_outputs}")]
    ZeroDimension { n_inputs: usize, n_outputs: usize },
    #[error("Invalid initialization range")]
    Init(#[from] uniform::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    /// Total number of learnable scalars
    fn n_parameters(&self) -> usize {
        self.parameters().iter().map(Tensor::numel).sum()
    }

    fn parameters(&self) -> Vec<Tensor>;
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError>;
}

/// Affine layer `y = W x + b`, analogous to `torch.nn.Linear`
pub struct Linear {
    /// shape `[n_outputs, n_inputs]`
    pub weight: Tensor,
    /// shape `[n_outputs]`
    pub bias: Tensor,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a layer initialized like PyTorch does, weights and bias drawn from
    /// `U(-1/sqrt(n_inputs), 1/sqrt(n_inputs))`
    pub fn new<R: Rng + ?Sized>(
        n_inputs: usize,
        n_outputs: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if n_inputs == 0 || n_outputs == 0 {
            return Err(NNError::ZeroDimension {
                n_inputs,
                n_outputs,
            });
        }
        let bound = 1.0 / (n_inputs as f32).sqrt();
        let uniform = Uniform::new_inclusive(-bound, bound)?;
        Ok(Self::from_parts(
            Tensor::sample(&[n_outputs, n_inputs], &uniform, rng),
            Tensor::sample(&[n_outputs], &uniform, rng),
        ))
    }

    fn from_parts(weight: Tensor, bias: Tensor) -> Self {
        Self {
            weight: weight.with_requires_grad(true),
            bias: bias.with_requires_grad(true),
            n_output_nans: AtomicUsize::new(0),
        }
    }

    // Testing utility for a deterministic layer
    #[cfg(test)]
    pub(crate) fn new_constant(n_inputs: usize, n_outputs: usize, value: f32) -> Self {
        Self::from_parts(
            Tensor::full(&[n_outputs, n_inputs], value),
            Tensor::full(&[n_outputs], value),
        )
    }

    pub fn n_inputs(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn n_outputs(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Number of NaN outputs seen in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        if input.shape() != [self.n_inputs()] {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs(),
                got: input.numel(),
            });
        }
        let output = self.weight.matvec(input)?.add(&self.bias)?;
        let n_output_nans = output.0.borrow().data.iter().filter(|v| v.is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        log::debug!(
            "linear {}x{}: n_output_nans: {}",
            self.n_outputs(),
            self.n_inputs(),
            n_output_nans
        );
        Ok(output)
    }
}

/// Applies ReLU elementwise, works for arbitrary shapes
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of dead neurons in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.0.borrow().data.iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        log::debug!("relu: n_dead_neurons: {}", n_dead_neurons);
        Ok(input.relu())
    }
}

/// Wraps a layer with a shortcut: `y = inner(x) + relu(x)`
///
/// The wrapped layer must preserve the width of its input.
pub struct Residual<M: Module> {
    inner: M,
}

impl<M: Module> Residual<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<M: Module> Module for Residual<M> {
    fn parameters(&self) -> Vec<Tensor> {
        self.inner.parameters()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let output = self.inner.forward(input)?;
        if output.shape() != input.shape() {
            return Err(NNError::InputSizeMismatch {
                expected: output.numel(),
                got: input.numel(),
            });
        }
        Ok(output.add(&input.relu())?)
    }
}

/// Ordered stack of layers, analogous to `torch.nn.Sequential`
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: vec![] }
    }

    /// Appends a layer, builder style
    pub fn push<M: Module + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        self.layers
            .iter()
            .try_fold(input.clone(), |x, layer| layer.forward(&x))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    #[test]
    fn test_linear_forward() {
        let layer = Linear::new_constant(2, 3, 1.0);
        let input = Tensor::from_vec(vec![1.0, 2.0]);
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.shape(), vec![3]);
        assert_eq!(output.data(), vec![4.0, 4.0, 4.0]);
        assert_eq!(layer.n_output_nans(), 0);
    }

    #[test]
    fn test_linear_init_range() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let layer = Linear::new(16, 4, &mut rng).unwrap();
        assert_eq!(layer.weight.shape(), vec![4, 16]);
        assert_eq!(layer.bias.shape(), vec![4]);
        assert!(layer.weight.requires_grad());
        assert!(
            layer
                .weight
                .data()
                .iter()
                .chain(layer.bias.data().iter())
                .all(|v| v.abs() <= 0.25)
        );
        assert_eq!(layer.n_parameters(), 16 * 4 + 4);
    }

    #[test]
    fn test_zero_dimension() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        assert!(matches!(
            Linear::new(0, 3, &mut rng),
            Err(NNError::ZeroDimension {
                n_inputs: 0,
                n_outputs: 3
            })
        ));
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_constant(2, 3, 1.0);
        let input = Tensor::from_vec(vec![1.0]);
        let outputs = layer.forward(&input).unwrap_err();
        assert!(matches!(
            outputs,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_relu_counts_dead_neurons() {
        let relu = ReLU::new();
        let output = relu
            .forward(&Tensor::from_vec(vec![-1.0, 0.0, 3.0]))
            .unwrap();
        assert_eq!(output.data(), vec![0.0, 0.0, 3.0]);
        assert_eq!(relu.n_dead_neurons(), 2);
        assert!(relu.parameters().is_empty());
    }

    #[test]
    fn test_residual_adds_activated_input() {
        let layer = Residual::new(Linear::new_constant(2, 2, 1.0));
        let input = Tensor::from_vec(vec![2.0, -1.0]);
        let output = layer.forward(&input).unwrap();
        // linear gives 2 - 1 + 1 = 2 per unit, shortcut adds relu(input) = [2, 0]
        assert_eq!(output.data(), vec![4.0, 2.0]);
        assert_eq!(layer.parameters().len(), 2);
    }

    #[test]
    fn test_residual_backward_sums_both_paths() {
        let layer = Residual::new(Linear::new_constant(2, 2, 1.0));
        let input = Tensor::from_vec(vec![2.0, -1.0]).with_requires_grad(true);
        layer.forward(&input).unwrap().mean().backward().unwrap();
        // linear path gives W^T [0.5, 0.5] = [1, 1], the shortcut passes 0.5 where input > 0
        assert_eq!(input.grad().unwrap(), vec![1.5, 1.0]);
        let params = layer.parameters();
        assert_eq!(params[0].grad().unwrap(), vec![1.0, -0.5, 1.0, -0.5]);
        assert_eq!(params[1].grad().unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_residual_rejects_width_change() {
        let layer = Residual::new(Linear::new_constant(2, 3, 1.0));
        let input = Tensor::from_vec(vec![1.0, 1.0]);
        assert!(matches!(
            layer.forward(&input),
            Err(NNError::InputSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_sequential_forward_and_zero_grad() {
        let mut model = Sequential::new()
            .push(Linear::new_constant(2, 2, 0.5))
            .push(ReLU::new())
            .push(Linear::new_constant(2, 1, 1.0));
        assert_eq!(model.len(), 3);
        assert_eq!(model.parameters().len(), 4);

        let output = model.forward(&Tensor::from_vec(vec![1.0, 1.0])).unwrap();
        // first layer: 0.5 + 0.5 + 0.5 = 1.5 per unit, second: 1.5 + 1.5 + 1 = 4
        assert_eq!(output.data(), vec![4.0]);

        output.backward().unwrap();
        assert!(model.parameters().iter().all(|p| p.grad().is_some()));
        model.zero_grad();
        assert!(model.parameters().iter().all(|p| p.grad().is_none()));
    }
}
