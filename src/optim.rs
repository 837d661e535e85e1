//! Optimizer(s)

use std::fmt::{self, Display};

use clap::ValueEnum;

use crate::tensor::Tensor;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Clears gradients for all parameters
    fn zero_grad(&mut self);
}

/// Toggles between optimizer types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

fn zero_grads(params: &mut [Tensor]) {
    for param in params.iter_mut() {
        param.zero_grad();
    }
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter element
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter_mut()) {
            let mut inner = param.0.borrow_mut();
            let inner = &mut *inner;
            let Some(grad) = inner.grad.as_ref() else {
                continue;
            };
            for ((p, v), g) in inner.data.iter_mut().zip(velocity.iter_mut()).zip(grad) {
                *v = self.momentum * *v - self.lr * g;
                *p += *v;
            }
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }
}

/// Hyperparameters for [`Adam`], defaults match `torch.optim.Adam`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Adam with bias correction
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Tensor>,
    config: AdamConfig,
    /// first moment per parameter element
    m: Vec<Vec<f32>>,
    /// second moment per parameter element
    v: Vec<Vec<f32>>,
    /// number of steps taken
    t: i32,
}

impl Adam {
    pub fn new(params: Vec<Tensor>, config: AdamConfig) -> Self {
        let m = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        let v = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            config,
            m,
            v,
            t: 0,
        }
    }

    /// Number of optimizer steps taken so far
    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Bytes held by the moment estimates
    pub fn state_bytes(&self) -> usize {
        self.m
            .iter()
            .chain(self.v.iter())
            .map(|s| s.len() * std::mem::size_of::<f32>())
            .sum()
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.t);
        let bias_correction2 = 1.0 - beta2.powi(self.t);
        let step_size = lr / bias_correction1;
        let bias_correction2_sqrt = bias_correction2.sqrt();

        for ((param, m), v) in self
            .params
            .iter()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let mut inner = param.0.borrow_mut();
            let inner = &mut *inner;
            // parameters that took no part in the loss are left untouched
            let Some(grad) = inner.grad.as_ref() else {
                continue;
            };
            for (((p, m), v), g) in inner
                .data
                .iter_mut()
                .zip(m.iter_mut())
                .zip(v.iter_mut())
                .zip(grad)
            {
                let g = g + weight_decay * *p;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / bias_correction2_sqrt + eps;
                *p -= step_size * *m / denom;
            }
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    fn param(data: Vec<f32>) -> Tensor {
        Tensor::from_vec(data).with_requires_grad(true)
    }

    #[test]
    fn test_sgd_no_momentum() {
        let a = param(vec![1.0, 2.0]);
        a.mean().backward().unwrap();

        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad().unwrap(), vec![0.5, 0.5]);
        let data = a.data();
        assert_eq_float!(data[0], 0.95);
        assert_eq_float!(data[1], 1.95);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = param(vec![1.0]);
        a.mean().backward().unwrap();

        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.9);
        optim.step();
        assert_eq_float!(a.data()[0], 0.9);
        assert_eq_float!(optim.velocities()[0][0], -0.1);
        optim.step();
        assert_eq_float!(a.data()[0], 0.71);
        assert_eq_float!(optim.velocities()[0][0], -0.19);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let a = param(vec![1.0, -1.0]);
        // gradient of mean(a^2) is a, so the signs differ per element
        a.powf(2.0).mean().backward().unwrap();

        let mut optim = Adam::new(vec![a.clone()], AdamConfig::default());
        optim.step();
        assert_eq!(optim.steps(), 1);
        // with bias correction the first update is lr * g / (|g| + eps)
        let data = a.data();
        assert_eq_float!(data[0], 1.0 - 1e-3);
        assert_eq_float!(data[1], -1.0 + 1e-3);
    }

    #[test]
    fn test_adam_skips_params_without_grad() {
        let a = param(vec![1.0]);
        let b = param(vec![2.0]);
        a.mean().backward().unwrap();

        let mut optim = Adam::new(vec![a.clone(), b.clone()], AdamConfig::default());
        optim.step();
        assert!(a.data()[0] < 1.0);
        assert_eq!(b.data(), vec![2.0]);
        assert_eq!(optim.state_bytes(), 2 * 2 * 4);
    }

    #[test]
    fn test_adam_weight_decay() {
        let a = param(vec![1.0]);
        a.mean().backward().unwrap();
        let config = AdamConfig {
            weight_decay: 1.0,
            ..AdamConfig::default()
        };
        let mut optim = Adam::new(vec![a.clone()], config);
        optim.step();
        // effective gradient 2.0 still gives a step of lr
        assert_eq_float!(a.data()[0], 1.0 - 1e-3);
    }

    #[test]
    fn test_zero_grad() {
        let a = param(vec![1.0]);
        a.mean().backward().unwrap();
        let mut optim = Adam::new(vec![a.clone()], AdamConfig::default());
        optim.zero_grad();
        assert!(a.grad().is_none());
    }
}
