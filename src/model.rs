//! The benchmarked feedforward network, in a plain and a residual flavor

use std::fmt::{self, Display};

use clap::ValueEnum;
use rand::Rng;

use crate::{
    nn::{Linear, Module, NNError, ReLU, Residual, Sequential},
    tensor::Tensor,
};

/// Toggles between network variants
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// `Linear, ReLU` repeated, then an output `Linear`
    Plain,
    /// interior hidden layers wrapped with a shortcut, see [`Residual`]
    Residual,
}

impl Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Plain => write!(f, "plain"),
            Variant::Residual => write!(f, "residual"),
        }
    }
}

/// Shape of the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub in_dim: usize,
    pub hidden_dim: usize,
    pub out_dim: usize,
    /// number of `hidden_dim -> hidden_dim` layers between the input and output layers
    pub n_hidden_layers: usize,
    pub variant: Variant,
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            in_dim: 4000,
            hidden_dim: 1200,
            out_dim: 221,
            n_hidden_layers: 7,
            variant: Variant::Plain,
        }
    }
}

/// `Linear(in, hidden), ReLU, n_hidden_layers x [Linear(hidden, hidden), ReLU], Linear(hidden, out)`
pub struct FeedForward {
    config: FeedForwardConfig,
    model: Sequential,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(config: FeedForwardConfig, rng: &mut R) -> Result<Self, NNError> {
        let mut model = Sequential::new()
            .push(Linear::new(config.in_dim, config.hidden_dim, rng)?)
            .push(ReLU::new());
        for _ in 0..config.n_hidden_layers {
            let hidden = Linear::new(config.hidden_dim, config.hidden_dim, rng)?;
            model = match config.variant {
                Variant::Plain => model.push(hidden),
                Variant::Residual => model.push(Residual::new(hidden)),
            };
            model = model.push(ReLU::new());
        }
        model = model.push(Linear::new(config.hidden_dim, config.out_dim, rng)?);
        log::debug!(
            "built {} network with {} layers",
            config.variant,
            model.len()
        );
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Bytes held by the parameter data
    pub fn parameter_bytes(&self) -> usize {
        self.n_parameters() * std::mem::size_of::<f32>()
    }
}

impl Module for FeedForward {
    fn parameters(&self) -> Vec<Tensor> {
        self.model.parameters()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        self.model.forward(input)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn small(variant: Variant) -> FeedForwardConfig {
        FeedForwardConfig {
            in_dim: 6,
            hidden_dim: 5,
            out_dim: 3,
            n_hidden_layers: 2,
            variant,
        }
    }

    #[test]
    fn test_default_matches_benchmark_shape() {
        let config = FeedForwardConfig::default();
        assert_eq!((config.in_dim, config.hidden_dim, config.out_dim), (4000, 1200, 221));
        assert_eq!(config.n_hidden_layers, 7);
    }

    #[test]
    fn test_parameter_layout() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let network = FeedForward::new(small(Variant::Plain), &mut rng).unwrap();
        let shapes = network
            .parameters()
            .iter()
            .map(|p| p.shape())
            .collect::<Vec<_>>();
        assert_eq!(
            shapes,
            vec![
                vec![5, 6],
                vec![5],
                vec![5, 5],
                vec![5],
                vec![5, 5],
                vec![5],
                vec![3, 5],
                vec![3],
            ]
        );
        assert_eq!(network.config(), &small(Variant::Plain));
        assert_eq!(network.n_parameters(), 35 + 30 + 30 + 18);
        assert_eq!(network.parameter_bytes(), network.n_parameters() * 4);
    }

    #[test]
    fn test_variants_share_parameter_count() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let plain = FeedForward::new(small(Variant::Plain), &mut rng).unwrap();
        let residual = FeedForward::new(small(Variant::Residual), &mut rng).unwrap();
        assert_eq!(plain.n_parameters(), residual.n_parameters());
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        for variant in [Variant::Plain, Variant::Residual] {
            let network = FeedForward::new(small(variant), &mut rng).unwrap();
            let x = Tensor::randn(&[6], &mut rng);
            let y = network.forward(&x).unwrap();
            assert_eq!(y.shape(), vec![3]);
            assert!(y.data().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_same_seed_same_network() {
        let a = FeedForward::new(small(Variant::Plain), &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        let b = FeedForward::new(small(Variant::Plain), &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        for (pa, pb) in a.parameters().iter().zip(b.parameters().iter()) {
            assert_eq!(pa.data(), pb.data());
        }
    }

    #[test]
    fn test_wrong_input_width() {
        let mut rng = Pcg64Mcg::seed_from_u64(2);
        let network = FeedForward::new(small(Variant::Residual), &mut rng).unwrap();
        let x = Tensor::zeros(&[4]);
        assert!(matches!(
            network.forward(&x),
            Err(NNError::InputSizeMismatch {
                expected: 6,
                got: 4
            })
        ));
    }

    #[test]
    fn test_zero_width_rejected() {
        let mut rng = Pcg64Mcg::seed_from_u64(2);
        let config = FeedForwardConfig {
            hidden_dim: 0,
            ..small(Variant::Plain)
        };
        assert!(matches!(
            FeedForward::new(config, &mut rng),
            Err(NNError::ZeroDimension { .. })
        ));
    }
}
