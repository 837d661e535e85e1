//! A single optimization step and the fixed data it is run on

use std::{
    fmt::{self, Display},
    time::{Duration, Instant},
};

use rand::Rng;

use crate::{
    loss::Loss,
    nn::{Module, NNError},
    optim::Optim,
    tensor::Tensor,
};

/// Stages of a training step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Loss,
    ZeroGrad,
    Backward,
    Step,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Forward,
        Phase::Loss,
        Phase::ZeroGrad,
        Phase::Backward,
        Phase::Step,
    ];
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Forward => write!(f, "forward"),
            Phase::Loss => write!(f, "loss"),
            Phase::ZeroGrad => write!(f, "zero_grad"),
            Phase::Backward => write!(f, "backward"),
            Phase::Step => write!(f, "step"),
        }
    }
}

/// Input and target of the step, created once and reused by every call
pub struct StepInputs {
    pub x: Tensor,
    pub y: Tensor,
}

impl StepInputs {
    /// Standard normal input of `in_dim` and target of `out_dim`
    pub fn random<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        Self {
            x: Tensor::randn(&[in_dim], rng),
            y: Tensor::randn(&[out_dim], rng),
        }
    }
}

/// One optimization step: loss of the model output against the target, clear previous
/// gradients, backpropagate, update the parameters. Returns the loss before the update.
///
/// The computation graph built for the step is dropped on return, so only the
/// parameters, their gradients and the optimizer state outlive it.
pub fn train_single<M, L, O>(
    model: &M,
    loss_fn: &L,
    optimizer: &mut O,
    inputs: &StepInputs,
) -> Result<f32, NNError>
where
    M: Module + ?Sized,
    L: Loss + ?Sized,
    O: Optim + ?Sized,
{
    train_single_with(model, loss_fn, optimizer, inputs, |_| {})
}

/// [`train_single`] with `on_phase` called after each [`Phase`] completes
pub fn train_single_with<M, L, O>(
    model: &M,
    loss_fn: &L,
    optimizer: &mut O,
    inputs: &StepInputs,
    mut on_phase: impl FnMut(Phase),
) -> Result<f32, NNError>
where
    M: Module + ?Sized,
    L: Loss + ?Sized,
    O: Optim + ?Sized,
{
    let y_pred = model.forward(&inputs.x)?;
    on_phase(Phase::Forward);
    let loss = loss_fn.call(&y_pred, &inputs.y)?;
    on_phase(Phase::Loss);
    optimizer.zero_grad();
    on_phase(Phase::ZeroGrad);
    loss.backward()?;
    on_phase(Phase::Backward);
    optimizer.step();
    on_phase(Phase::Step);
    Ok(loss.item())
}

/// Average wall time of `runs` consecutive steps, `None` when `runs` is zero
pub fn time_steps<M, L, O>(
    model: &M,
    loss_fn: &L,
    optimizer: &mut O,
    inputs: &StepInputs,
    runs: usize,
) -> Result<Option<Duration>, NNError>
where
    M: Module + ?Sized,
    L: Loss + ?Sized,
    O: Optim + ?Sized,
{
    if runs == 0 {
        return Ok(None);
    }
    let start = Instant::now();
    for run in 0..runs {
        let loss = train_single(model, loss_fn, optimizer, inputs)?;
        log::trace!("run {}: loss {}", run + 1, loss);
    }
    Ok(Some(start.elapsed().div_f64(runs as f64)))
}
