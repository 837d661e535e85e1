//! Measures the memory of a single training step of a deep feedforward network
//! using the library provided by `ffn_memprof`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release
//! cargo run --release -- --variant residual --runs 100
//! RUST_LOG=debug cargo run --release -- -h
//! ```
//!
//! The defaults build `Linear(4000, 1200)`, seven `Linear(1200, 1200)` layers and
//! `Linear(1200, 221)` with ReLU in between, trained with Adam on a fixed random input.

use std::error::Error;

use ffn_memprof::{
    loss::MSELoss,
    memory::{MiB, TrackingAllocator},
    model::{FeedForward, FeedForwardConfig, Variant},
    nn::Module,
    optim::{Adam, AdamConfig, Optim, OptimizerKind, SGD},
    profile::profile_step,
    train::{StepInputs, time_steps},
};

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

#[global_allocator]
static ALLOCATOR: TrackingAllocator = TrackingAllocator::new();

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 4000, value_parser = clap::value_parser!(u32).range(1..))]
    in_dim: u32,
    #[clap(long, default_value_t = 1200, value_parser = clap::value_parser!(u32).range(1..))]
    hidden_dim: u32,
    #[clap(long, default_value_t = 221, value_parser = clap::value_parser!(u32).range(1..))]
    out_dim: u32,
    /// number of hidden -> hidden layers
    #[clap(long, default_value_t = 7)]
    hidden_layers: usize,
    #[clap(short, long, default_value_t = Variant::Plain)]
    variant: Variant,
    #[clap(short, long, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,
    #[clap(short, long, default_value_t = 1e-3)]
    lr: f32,
    /// only used by sgd
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    /// seed for initialization and the fixed input, random when omitted
    #[clap(short, long)]
    seed: Option<u64>,
    /// additional steps to time after the profiled one
    #[clap(short, long, default_value_t = 0)]
    runs: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    log::info!("seed: {}", seed);
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    let network = FeedForward::new(
        FeedForwardConfig {
            in_dim: args.in_dim as usize,
            hidden_dim: args.hidden_dim as usize,
            out_dim: args.out_dim as usize,
            n_hidden_layers: args.hidden_layers,
            variant: args.variant,
        },
        &mut rng,
    )?;
    let config = *network.config();
    log::info!("config: {:?}", config);
    let inputs = StepInputs::random(config.in_dim, config.out_dim, &mut rng);
    let mut optimizer: Box<dyn Optim> = match args.optimizer {
        OptimizerKind::Adam => {
            let adam_config = AdamConfig {
                lr: args.lr,
                ..AdamConfig::default()
            };
            Box::new(Adam::new(network.parameters(), adam_config))
        }
        OptimizerKind::Sgd => Box::new(SGD::new(network.parameters(), args.lr, args.momentum)),
    };
    log::info!(
        "{} network: {} parameters ({}), optimizer: {}",
        config.variant,
        network.n_parameters(),
        MiB(network.parameter_bytes() as u64),
        args.optimizer
    );

    let profile = profile_step(
        &ALLOCATOR,
        &network,
        &MSELoss,
        optimizer.as_mut(),
        &inputs,
    )?;
    println!("{}", profile);

    if let Some(average) = time_steps(
        &network,
        &MSELoss,
        optimizer.as_mut(),
        &inputs,
        args.runs,
    )? {
        println!("average step time over {} runs: {:.2?}", args.runs, average);
    }
    Ok(())
}
