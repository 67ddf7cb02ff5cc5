//! Repeated, independent estimates of the log marginal likelihood.

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::debug;

use crate::{
    error::Error,
    math::logaddexp,
    problem::Problem,
    sampling_type::{IndependentUniform, Permutation, SamplingType},
};

/// Settings for [`Problem::estimate`].
#[derive(Debug, Clone, Copy)]
pub struct EstimatorSettings<S: SamplingType> {
    /// Number of particles drawn for every latent group.
    pub num_particles: usize,
    /// Draw pathwise samples. Every distribution in Q must support them.
    pub reparam: bool,
    /// Number of independent estimates.
    pub num_repeats: u64,
    /// Worker threads. Zero lets rayon choose.
    pub num_threads: usize,
    pub seed: u64,
    pub sampling_type: S,
}

pub type UniformSettings = EstimatorSettings<IndependentUniform>;
pub type PermutationSettings = EstimatorSettings<Permutation>;

impl<S: SamplingType> Default for EstimatorSettings<S> {
    fn default() -> Self {
        Self {
            num_particles: 32,
            reparam: false,
            num_repeats: 8,
            num_threads: 0,
            seed: 0,
            sampling_type: S::default(),
        }
    }
}

/// Independent estimates of `log P(data)`, one per repeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub log_marginals: Vec<f64>,
}

impl Estimate {
    /// Mean of the log estimates. Biased low for `log P(data)`.
    ///
    /// NaN when there are no estimates; [`Problem::estimate`] never returns
    /// an empty one.
    pub fn mean(&self) -> f64 {
        self.log_marginals.iter().sum::<f64>() / self.log_marginals.len() as f64
    }

    /// Log of the mean of the estimates, which combines the repeats into a
    /// single estimate with `num_repeats` times the particles.
    pub fn log_mean_exp(&self) -> f64 {
        let total = self
            .log_marginals
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &x| logaddexp(acc, x));
        total - (self.log_marginals.len() as f64).ln()
    }

    /// Standard error of [`Self::mean`].
    pub fn std_err(&self) -> f64 {
        let n = self.log_marginals.len() as f64;
        if n < 2. {
            return f64::NAN;
        }
        let mean = self.mean();
        let var = self
            .log_marginals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / (n - 1.);
        (var / n).sqrt()
    }
}

impl Problem {
    /// Run `settings.num_repeats` independent sample and reduce passes in
    /// parallel.
    ///
    /// Repeat `i` uses a ChaCha8 stream `i` seeded with `settings.seed`, so
    /// the result does not depend on the number of threads.
    pub fn estimate<S: SamplingType>(&self, settings: &EstimatorSettings<S>) -> Result<Estimate> {
        if settings.num_repeats == 0 {
            return Err(Error::InvalidRepeatCount.into());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.num_threads)
            .thread_name(|i| format!("plated-is-worker-{}", i))
            .build()
            .context("Could not start thread pool")?;

        debug!(
            repeats = settings.num_repeats,
            k = settings.num_particles,
            "estimating log marginal likelihood"
        );
        let log_marginals = pool.install(|| {
            (0..settings.num_repeats)
                .into_par_iter()
                .map(|repeat| {
                    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
                    rng.set_stream(repeat);
                    let sample = self.sample(
                        &mut rng,
                        settings.num_particles,
                        settings.reparam,
                        settings.sampling_type.clone(),
                    )?;
                    sample
                        .log_marginal()
                        .with_context(|| format!("Repeat {} failed", repeat))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(Estimate { log_marginals })
    }
}
