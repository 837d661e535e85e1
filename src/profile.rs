//! Memory profile of a single training step
//!
//! Memory is sampled after every [`Phase`] of the step, the equivalent of a line-by-line
//! memory profile of the training function. Heap figures come from a
//! [`TrackingAllocator`], resident set sizes from the kernel when available.

use std::{
    fmt::{self, Display},
    time::{Duration, Instant},
};

use crate::{
    loss::Loss,
    memory::{MiB, MiBDelta, ProcessMemory, TrackingAllocator},
    nn::{Module, NNError},
    optim::Optim,
    train::{Phase, StepInputs, train_single_with},
};

/// Memory reading taken right after a phase finished
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSample {
    pub phase: Phase,
    /// live heap bytes
    pub heap: usize,
    pub process: Option<ProcessMemory>,
    /// time since the step started
    pub elapsed: Duration,
}

/// Result of [`profile_step`]
#[derive(Debug, Clone, PartialEq)]
pub struct StepProfile {
    /// live heap bytes before the step
    pub baseline_heap: usize,
    pub baseline_process: Option<ProcessMemory>,
    /// one sample per phase, in execution order
    pub samples: Vec<PhaseSample>,
    /// highest live heap bytes during the step
    pub peak_heap: usize,
    pub loss: f32,
    pub elapsed: Duration,
}

impl StepProfile {
    /// Heap bytes the step needed on top of what was live before it
    pub fn peak_increment(&self) -> usize {
        self.peak_heap.saturating_sub(self.baseline_heap)
    }

    /// Heap bytes still live after the step compared to before it, e.g. gradients
    pub fn retained(&self) -> i64 {
        self.samples
            .last()
            .map_or(0, |s| s.heap as i64 - self.baseline_heap as i64)
    }
}

/// Runs one training step and samples memory after every phase
pub fn profile_step<M, L, O>(
    allocator: &TrackingAllocator,
    model: &M,
    loss_fn: &L,
    optimizer: &mut O,
    inputs: &StepInputs,
) -> Result<StepProfile, NNError>
where
    M: Module + ?Sized,
    L: Loss + ?Sized,
    O: Optim + ?Sized,
{
    profile_step_with(
        allocator,
        model,
        loss_fn,
        optimizer,
        inputs,
        ProcessMemory::sample,
    )
}

/// [`profile_step`] with the process reading taken by `sample_process`
///
/// The heap and its peak are read before `sample_process` runs, and peak tracking is
/// restarted after it, so whatever the sampler allocates is not part of `peak_heap`.
pub fn profile_step_with<M, L, O>(
    allocator: &TrackingAllocator,
    model: &M,
    loss_fn: &L,
    optimizer: &mut O,
    inputs: &StepInputs,
    mut sample_process: impl FnMut() -> Option<ProcessMemory>,
) -> Result<StepProfile, NNError>
where
    M: Module + ?Sized,
    L: Loss + ?Sized,
    O: Optim + ?Sized,
{
    let mut samples = Vec::with_capacity(Phase::ALL.len());
    let baseline_process = sample_process();
    let baseline_heap = allocator.reset_peak();
    let mut peak_heap = baseline_heap;
    let start = Instant::now();
    let loss = train_single_with(model, loss_fn, optimizer, inputs, |phase| {
        let heap = allocator.current();
        peak_heap = peak_heap.max(allocator.peak());
        let elapsed = start.elapsed();
        let sample = PhaseSample {
            phase,
            heap,
            process: sample_process(),
            elapsed,
        };
        log::debug!("{}: heap {}", phase, MiB(sample.heap as u64));
        samples.push(sample);
        allocator.reset_peak();
    })?;
    let elapsed = start.elapsed();
    Ok(StepProfile {
        baseline_heap,
        baseline_process,
        samples,
        peak_heap: peak_heap.max(allocator.peak()),
        loss,
        elapsed,
    })
}

fn format_rss(process: Option<ProcessMemory>) -> String {
    process.map_or_else(|| "n/a".to_string(), |p| MiB(p.rss).to_string())
}

impl Display for StepProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<10} {:>14} {:>14} {:>14} {:>12}",
            "Phase", "Heap", "Increment", "RSS", "Time"
        )?;
        writeln!(f, "{}", "=".repeat(68))?;
        writeln!(
            f,
            "{:<10} {:>14} {:>14} {:>14} {:>12}",
            "start",
            MiB(self.baseline_heap as u64).to_string(),
            "",
            format_rss(self.baseline_process),
            ""
        )?;
        let mut previous = self.baseline_heap;
        for sample in &self.samples {
            writeln!(
                f,
                "{:<10} {:>14} {:>14} {:>14} {:>12}",
                sample.phase.to_string(),
                MiB(sample.heap as u64).to_string(),
                MiBDelta(sample.heap as i64 - previous as i64).to_string(),
                format_rss(sample.process),
                format!("{:.2?}", sample.elapsed),
            )?;
            previous = sample.heap;
        }
        writeln!(f)?;
        writeln!(
            f,
            "peak heap: {} ({} above start)",
            MiB(self.peak_heap as u64),
            MiB(self.peak_increment() as u64)
        )?;
        if let Some(process) = self.samples.last().and_then(|s| s.process) {
            writeln!(f, "peak rss: {}", MiB(process.peak_rss))?;
        }
        writeln!(f, "retained after step: {}", MiBDelta(self.retained()))?;
        write!(f, "loss: {:.6}, step time: {:.2?}", self.loss, self.elapsed)
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::{GlobalAlloc, Layout};

    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        loss::MSELoss,
        model::{FeedForward, FeedForwardConfig, Variant},
        optim::{Adam, AdamConfig},
    };

    fn small_network() -> (FeedForward, StepInputs) {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let config = FeedForwardConfig {
            in_dim: 32,
            hidden_dim: 16,
            out_dim: 4,
            n_hidden_layers: 2,
            variant: Variant::Plain,
        };
        let model = FeedForward::new(config, &mut rng).unwrap();
        let inputs = StepInputs::random(config.in_dim, config.out_dim, &mut rng);
        (model, inputs)
    }

    #[test]
    fn test_profile_samples_every_phase() {
        let (model, inputs) = small_network();
        let mut optim = Adam::new(model.parameters(), AdamConfig::default());
        let allocator = TrackingAllocator::new();
        let profile = profile_step(&allocator, &model, &MSELoss, &mut optim, &inputs).unwrap();

        let phases = profile.samples.iter().map(|s| s.phase).collect::<Vec<_>>();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(profile.loss.is_finite());
        assert!(profile.samples.iter().all(|s| s.elapsed <= profile.elapsed));
        // this allocator is not registered globally, so it saw nothing
        assert_eq!(profile.peak_heap, 0);
        assert_eq!(profile.peak_increment(), 0);
    }

    #[test]
    fn test_process_sampling_is_not_counted_as_peak() {
        let (model, inputs) = small_network();
        let mut optim = Adam::new(model.parameters(), AdamConfig::default());
        let allocator = TrackingAllocator::new();
        let layout = Layout::from_size_align(1024 * 1024, 8).unwrap();
        let mut calls = 0;
        let profile = profile_step_with(&allocator, &model, &MSELoss, &mut optim, &inputs, || {
            calls += 1;
            unsafe {
                let buffer = allocator.alloc(layout);
                allocator.dealloc(buffer, layout);
            }
            None
        })
        .unwrap();

        assert_eq!(calls, 1 + Phase::ALL.len());
        assert_eq!(allocator.current(), 0);
        assert_eq!(profile.peak_heap, 0);
        assert!(profile.samples.iter().all(|s| s.process.is_none()));
    }

    #[test]
    fn test_report_layout() {
        let sample = |phase, heap| PhaseSample {
            phase,
            heap,
            process: None,
            elapsed: Duration::from_millis(1),
        };
        let mib = 1024 * 1024;
        let profile = StepProfile {
            baseline_heap: 10 * mib,
            baseline_process: None,
            samples: vec![
                sample(Phase::Forward, 12 * mib),
                sample(Phase::Loss, 12 * mib),
                sample(Phase::ZeroGrad, 11 * mib),
                sample(Phase::Backward, 15 * mib),
                sample(Phase::Step, 14 * mib),
            ],
            peak_heap: 18 * mib,
            loss: 0.5,
            elapsed: Duration::from_millis(2),
        };
        assert_eq!(profile.peak_increment(), 8 * mib);
        assert_eq!(profile.retained(), 4 * mib as i64);

        let report = profile.to_string();
        let lines = report.lines().collect::<Vec<_>>();
        assert!(lines[0].starts_with("Phase"));
        assert!(lines[2].starts_with("start"));
        assert!(lines[3].starts_with("forward"));
        assert!(lines[3].contains("+2.0 MiB"));
        assert!(lines[5].starts_with("zero_grad"));
        assert!(lines[5].contains("-1.0 MiB"));
        assert!(lines[5].contains("n/a"));
        assert!(report.contains("peak heap: 18.0 MiB (8.0 MiB above start)"));
        assert!(report.contains("retained after step: +4.0 MiB"));
        assert!(!report.contains("peak rss"));
    }
}
