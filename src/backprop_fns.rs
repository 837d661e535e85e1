//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Each function reads the output gradient and adds
//! the operand gradients into their buffers; operands which do not require a
//! gradient are skipped.

use crate::tensor::Tensor;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackpropFunc {
    Add,
    Sub,
    MatVec,
    ReLU,
    /// elementwise power with a constant exponent
    Pow(f32),
    Mean,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add => 2,
            BackpropFunc::Sub => 2,
            BackpropFunc::MatVec => 2,
            BackpropFunc::ReLU => 1,
            BackpropFunc::Pow(_) => 1,
            BackpropFunc::Mean => 1,
        }
    }
}

fn out_grad(out: &Tensor) -> Option<Vec<f32>> {
    out.0.borrow().grad.clone()
}

/// Takes two tensors and updates their gradients
/// Represents backprop for the operation `in1 + in2 = out`
pub fn add(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else {
        return;
    };
    in1.accumulate_grad(grad.clone());
    in2.accumulate_grad(grad);
}

/// Represents backprop for the operation `in1 - in2 = out`
pub fn sub(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else {
        return;
    };
    in1.accumulate_grad(grad.clone());
    in2.accumulate_grad(grad.into_iter().map(|g| -g).collect());
}

/// Represents backprop for the operation `w · x = out` with `w` of shape `[rows, cols]`
///
/// `dw[i][j] = out_grad[i] * x[j]` and `dx[j] = sum_i w[i][j] * out_grad[i]`
pub fn matvec(w: &Tensor, x: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else {
        return;
    };
    let (dw, dx) = {
        let w_inner = w.0.borrow();
        let x_inner = x.0.borrow();
        let cols = x_inner.data.len();
        let dw = w_inner.requires_grad.then(|| {
            let mut dw = Vec::with_capacity(w_inner.data.len());
            for g in grad.iter() {
                dw.extend(x_inner.data.iter().map(|v| g * v));
            }
            dw
        });
        // the network input never requires a gradient, which skips the largest transpose product
        let dx = x_inner.requires_grad.then(|| {
            let mut dx = vec![0.0; cols];
            if cols > 0 {
                for (row, g) in w_inner.data.chunks_exact(cols).zip(grad.iter()) {
                    dx.iter_mut().zip(row).for_each(|(d, w)| *d += w * g);
                }
            }
            dx
        });
        (dw, dx)
    };
    if let Some(dw) = dw {
        w.accumulate_grad(dw);
    }
    if let Some(dx) = dx {
        x.accumulate_grad(dx);
    }
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else {
        return;
    };
    let delta = in1
        .0
        .borrow()
        .data
        .iter()
        .zip(grad)
        .map(|(v, g)| if *v > 0.0 { g } else { 0.0 })
        .collect();
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `in^exponent = out`
/// only the base receives a gradient, the exponent is a constant
pub fn pow(in1: &Tensor, exponent: f32, out: &Tensor) {
    let Some(grad) = out_grad(out) else {
        return;
    };
    let delta = in1
        .0
        .borrow()
        .data
        .iter()
        .zip(grad)
        .map(|(v, g)| exponent * v.powf(exponent - 1.0) * g)
        .collect();
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `mean(in) = out`
pub fn mean(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else {
        return;
    };
    let n = in1.numel();
    in1.accumulate_grad(vec![grad[0] / n as f32; n]);
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Add) => add(in1, in2, out),
        Some(BackpropFunc::Sub) => sub(in1, in2, out),
        Some(BackpropFunc::MatVec) => matvec(in1, in2, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Pow(exponent)) => pow(in1, exponent, out),
        Some(BackpropFunc::Mean) => mean(in1, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}
