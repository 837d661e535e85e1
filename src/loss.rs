//! Loss function(s)

use crate::tensor::{Tensor, TensorError};

/// Common interface for losses, reducing a prediction and a target to a single-element tensor
pub trait Loss {
    fn call(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<Tensor, TensorError>;
}

/// Mean Squared Error Loss between two tensors of the same shape
/// Analogous to `torch.nn.MSELoss` with the default `mean` reduction
#[derive(Debug, Default, Clone, Copy)]
pub struct MSELoss;

impl Loss for MSELoss {
    fn call(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<Tensor, TensorError> {
        Ok(y_pred.sub(y_true)?.powf(2.0).mean())
    }
}
