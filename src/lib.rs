//! A feedforward network built on a minimal tensor autodiff with a PyTorch-like API,
//! and a profiler measuring the memory of a single training step.

pub mod backprop_fns;
pub mod loss;
pub mod memory;
pub mod model;
pub mod nn;
pub mod optim;
pub mod profile;
pub mod tensor;
pub mod train;
