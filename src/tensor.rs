//! Dense tensors which form a computation graph

use std::{
    cell::RefCell,
    collections::HashSet,
    fmt::{self, Display},
    rc::Rc,
};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

use crate::backprop_fns::{
    BackpropFunc, update_gradients_one_operand, update_gradients_two_operands,
};

/// Errors raised by tensor operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("Data of length {len} does not fit shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },
    #[error("Backward needs a single-element output, got shape {shape:?}")]
    NonScalarBackward { shape: Vec<usize> },
}

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// Newtype representing a shared tensor in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

impl Tensor {
    /// Create a leaf tensor with the given row-major data and shape
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        if data.len() != numel(shape) {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Self::leaf(data, shape.to_vec()))
    }

    /// Create a 1-D leaf tensor
    pub fn from_vec(data: Vec<f32>) -> Self {
        let shape = vec![data.len()];
        Self::leaf(data, shape)
    }

    /// Create a single-element leaf tensor with an empty shape
    pub fn scalar(value: f32) -> Self {
        Self::leaf(vec![value], vec![])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self::leaf(vec![value; numel(shape)], shape.to_vec())
    }

    /// Create a leaf tensor with every element drawn from `dist`
    pub fn sample<D, R>(shape: &[usize], dist: &D, rng: &mut R) -> Self
    where
        D: Distribution<f32>,
        R: Rng + ?Sized,
    {
        let data = (0..numel(shape)).map(|_| dist.sample(rng)).collect();
        Self::leaf(data, shape.to_vec())
    }

    /// Standard normal samples, the equivalent of `torch.randn`
    pub fn randn<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        Self::sample(shape, &StandardNormal, rng)
    }

    fn leaf(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self(Rc::new(RefCell::new(InnerTensor::new(data, shape, None))))
    }

    /// Create a tensor derived from an operation on other tensors (i.e. not a leaf node)
    fn new_derived(
        data: Vec<f32>,
        shape: Vec<usize>,
        backprop_fn: BackpropFunc,
        children: &[&Tensor],
    ) -> Self {
        let mut inner = InnerTensor::new(data, shape, Some(backprop_fn));
        inner.requires_grad = children.iter().any(|c| c.requires_grad());
        inner.children = children.iter().map(|c| c.0.clone()).collect();
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    /// Copy of the underlying data
    pub fn data(&self) -> Vec<f32> {
        self.0.borrow().data.clone()
    }

    /// First element, meant for single-element tensors such as a loss
    pub fn item(&self) -> f32 {
        self.0.borrow().data[0]
    }

    /// Copy of the accumulated gradient, `None` if nothing was accumulated since the last clear
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.0.borrow().grad.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Marks a tensor as a trainable parameter. Builder style, meant for leaf tensors.
    pub fn with_requires_grad(self, requires_grad: bool) -> Self {
        self.0.borrow_mut().requires_grad = requires_grad;
        self
    }

    /// Drops the gradient buffer. As with `set_to_none=True` in PyTorch the
    /// next backward pass allocates a fresh buffer instead of adding into zeros.
    pub fn zero_grad(&mut self) {
        self.0.borrow_mut().grad = None;
    }

    /// Adds `delta` into the gradient buffer, allocating it on first use
    pub(crate) fn accumulate_grad(&self, delta: Vec<f32>) {
        let mut inner = self.0.borrow_mut();
        let inner = &mut *inner;
        if !inner.requires_grad {
            return;
        }
        debug_assert_eq!(inner.data.len(), delta.len());
        match inner.grad.as_mut() {
            Some(grad) => grad.iter_mut().zip(delta).for_each(|(g, d)| *g += d),
            None => inner.grad = Some(delta),
        }
    }

    /// Backpropagates from this tensor through the graph that produced it
    pub fn backward(&self) -> Result<(), TensorError> {
        if self.numel() != 1 {
            return Err(TensorError::NonScalarBackward {
                shape: self.shape(),
            });
        }
        // d out / d out = 1
        self.0.borrow_mut().grad = Some(vec![1.0]);

        let backprop_order = self.post_order();

        // apply backprop, reversed to start from root first
        for tensor in backprop_order.into_iter().rev() {
            let n_operands = tensor.0.borrow().children.len();
            if let Some(f) = tensor.0.borrow().backprop_fn {
                debug_assert!(f.n_operands() == n_operands);
            }
            match n_operands {
                0 => {}
                1 => {
                    let in1 = Tensor(tensor.0.borrow().children[0].clone());
                    update_gradients_one_operand(&in1, &tensor);
                }
                2 => {
                    let in1 = Tensor(tensor.0.borrow().children[0].clone());
                    let in2 = Tensor(tensor.0.borrow().children[1].clone());
                    update_gradients_two_operands(&in1, &in2, &tensor);
                }
                _ => unreachable!("no operation takes {} operands", n_operands),
            }
        }
        Ok(())
    }

    /// Nodes reachable through operands that require a gradient, operands before their users
    fn post_order(&self) -> Vec<Tensor> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        // explicit stack of (node, index of the next operand to visit) so deep graphs
        // do not recurse once per layer
        let mut stack = vec![(self.clone(), 0)];
        while let Some((tensor, next)) = stack.pop() {
            let child = tensor.0.borrow().children.get(next).cloned();
            let Some(child) = child else {
                order.push(tensor);
                continue;
            };
            stack.push((tensor, next + 1));
            let (requires_grad, id) = {
                let c = child.borrow();
                (c.requires_grad, c.id)
            };
            // constants such as the input batch need no traversal
            if requires_grad && visited.insert(id) {
                stack.push((Tensor(child), 0));
            }
        }
        order
    }
}

// Differentiable operations
impl Tensor {
    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let data = self.zip_with(other, "add", |a, b| a + b)?;
        Ok(Tensor::new_derived(
            data,
            self.shape(),
            BackpropFunc::Add,
            &[self, other],
        ))
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let data = self.zip_with(other, "sub", |a, b| a - b)?;
        Ok(Tensor::new_derived(
            data,
            self.shape(),
            BackpropFunc::Sub,
            &[self, other],
        ))
    }

    /// Matrix-vector product of a `[rows, cols]` matrix with a `[cols]` vector
    pub fn matvec(&self, x: &Tensor) -> Result<Tensor, TensorError> {
        let data = {
            let m = self.0.borrow();
            let v = x.0.borrow();
            let cols = match (m.shape.as_slice(), v.shape.as_slice()) {
                ([_, cols], [len]) if cols == len => *cols,
                _ => {
                    return Err(TensorError::ShapeMismatch {
                        op: "matvec",
                        lhs: m.shape.clone(),
                        rhs: v.shape.clone(),
                    });
                }
            };
            if cols == 0 {
                vec![0.0; m.shape[0]]
            } else {
                m.data
                    .chunks_exact(cols)
                    .map(|row| row.iter().zip(v.data.iter()).map(|(w, i)| w * i).sum())
                    .collect::<Vec<f32>>()
            }
        };
        let shape = vec![data.len()];
        Ok(Tensor::new_derived(
            data,
            shape,
            BackpropFunc::MatVec,
            &[self, x],
        ))
    }

    pub fn relu(&self) -> Tensor {
        let data = self.map(|v| v.max(0.0));
        Tensor::new_derived(data, self.shape(), BackpropFunc::ReLU, &[self])
    }

    /// Elementwise power with a constant exponent
    pub fn powf(&self, exponent: f32) -> Tensor {
        let data = self.map(|v| v.powf(exponent));
        Tensor::new_derived(data, self.shape(), BackpropFunc::Pow(exponent), &[self])
    }

    /// Mean over all elements, as a single-element tensor
    pub fn mean(&self) -> Tensor {
        let mean = {
            let inner = self.0.borrow();
            inner.data.iter().sum::<f32>() / inner.data.len() as f32
        };
        Tensor::new_derived(vec![mean], vec![], BackpropFunc::Mean, &[self])
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Vec<f32> {
        self.0.borrow().data.iter().map(|v| f(*v)).collect()
    }

    fn zip_with(
        &self,
        other: &Tensor,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Vec<f32>, TensorError> {
        let lhs = self.0.borrow();
        let rhs = other.0.borrow();
        if lhs.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                op,
                lhs: lhs.shape.clone(),
                rhs: rhs.shape.clone(),
            });
        }
        Ok(lhs
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect())
    }
}

// pretty print a tensor and its operands, without dumping the data
// a node reached a second time is printed as a one-line reference to its first listing
impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printed: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.0.clone(), 0)];
        while let Some((node, indent)) = stack.pop() {
            let inner = node.borrow();
            let op = match inner.backprop_fn {
                Some(op) => format!("{:?}", op),
                None => "Leaf".to_string(),
            };
            if !printed.insert(inner.id) {
                writeln!(
                    f,
                    "{}{} shape={:?} (repeated)",
                    " ".repeat(indent),
                    op,
                    inner.shape
                )?;
                continue;
            }
            writeln!(
                f,
                "{}{} shape={:?} requires_grad={} has_grad={}",
                " ".repeat(indent),
                op,
                inner.shape,
                inner.requires_grad,
                inner.grad.is_some()
            )?;
            // reversed so the first operand is printed first
            for child in inner.children.iter().rev() {
                stack.push((child.clone(), indent + 2));
            }
        }
        Ok(())
    }
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug)]
pub(crate) struct InnerTensor {
    /// row-major elements
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Vec<usize>,
    /// gradient of the root with respect to this tensor, allocated lazily by backward
    pub(crate) grad: Option<Vec<f32>>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedTensor>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

// unlinks operands iteratively, a long chain of nested `Rc`s would otherwise be
// dropped with one stack frame per node
impl Drop for InnerTensor {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(child) = stack.pop() {
            if let Ok(cell) = Rc::try_unwrap(child) {
                let mut inner = cell.into_inner();
                stack.append(&mut inner.children);
            }
        }
    }
}

impl InnerTensor {
    fn new(data: Vec<f32>, shape: Vec<usize>, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            shape,
            grad: None,
            requires_grad: false,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}
