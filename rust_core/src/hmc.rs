use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::leapfrog::Leapfrog;
use crate::model::ProbabilisticModelWithGradient;
use crate::nuts::{latent_position, sample_momentum, StepSizeAdaptation};
use crate::samples::NetworkSamples;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Configuration for the Hamiltonian sampler.
#[derive(Debug, Clone)]
pub struct HmcConfig {
    pub step_size: f64,
    pub leapfrog_count: usize,
    /// Iterations of dual-averaging step-size adaptation. 0 keeps `step_size`.
    pub adapt_count: usize,
    pub target_acceptance_prob: f64,
    pub seed: u64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            leapfrog_count: 20,
            adapt_count: 0,
            target_acceptance_prob: 0.65,
            seed: 42,
        }
    }
}

/// Hamiltonian Monte Carlo with a fixed number of leapfrog steps per draw.
pub struct Hamiltonian {
    config: HmcConfig,
    rng: ChaCha8Rng,
    accepted: usize,
    total: usize,
}

impl Hamiltonian {
    pub fn new(config: HmcConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            accepted: 0,
            total: 0,
        }
    }

    /// Fraction of accepted trajectories in the last run.
    pub fn accept_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.accepted as f64 / self.total as f64
        }
    }

    pub fn get_posterior_samples<M: ProbabilisticModelWithGradient>(
        &mut self,
        model: &mut M,
        vertices: &[VertexId],
        count: usize,
    ) -> Result<NetworkSamples> {
        if !(self.config.step_size > 0.0) || self.config.leapfrog_count == 0 {
            return Err(Error::InvalidArgument {
                arg: "config",
                reason: "step_size and leapfrog_count must be positive".to_string(),
            });
        }
        self.accepted = 0;
        self.total = 0;

        let latents = model.latent_variables().to_vec();
        let mut log_prob = model.log_prob()?;
        if !log_prob.is_finite() {
            return Err(Error::ZeroProbability { algorithm: "Hamiltonian" });
        }
        let mut position = latent_position(model, &latents)?;
        let mut gradient = model.log_prob_gradients()?;
        let mut adaptation = StepSizeAdaptation::new(
            self.config.step_size,
            self.config.target_acceptance_prob,
            self.config.adapt_count,
        );

        tracing::info!(count, leapfrog_count = self.config.leapfrog_count, "starting Hamiltonian");
        let mut samples = NetworkSamples::new(vertices);

        for iteration in 0..count {
            let momentum = sample_momentum(&latents, &position, &mut self.rng)?;
            let start = Leapfrog::new(position.clone(), momentum, gradient.clone());
            let h_current = -log_prob + start.half_dot_product_momentum();

            let trajectory = simulate(model, &latents, start, self.config.leapfrog_count, adaptation.step_size);
            let state = match trajectory {
                Ok(state) => state,
                Err(e) => {
                    model.set_values(&position)?;
                    return Err(e);
                }
            };
            let log_prob_proposed = model.log_prob()?;
            let h_proposed = -log_prob_proposed + state.half_dot_product_momentum();
            let log_accept_ratio = h_current - h_proposed;
            let accept_prob = if log_accept_ratio.is_finite() {
                log_accept_ratio.min(0.0).exp()
            } else {
                0.0
            };

            self.total += 1;
            if log_accept_ratio.is_finite() && self.rng.gen::<f64>().ln() < log_accept_ratio {
                position = state.position;
                gradient = state.gradient;
                log_prob = log_prob_proposed;
                self.accepted += 1;
            } else {
                model.set_values(&position)?;
            }
            adaptation.update(accept_prob, iteration);

            let values = vertices
                .iter()
                .map(|&id| Ok((id, model.value(id).ok_or(Error::MissingValue(id))?.clone())))
                .collect::<Result<HashMap<_, _>>>()?;
            samples.push(&values, log_prob)?;
        }

        tracing::info!(count, accept_rate = self.accept_rate(), "finished Hamiltonian");
        Ok(samples)
    }
}

fn simulate<M: ProbabilisticModelWithGradient>(
    model: &mut M,
    latents: &[VertexId],
    start: Leapfrog,
    steps: usize,
    step_size: f64,
) -> Result<Leapfrog> {
    let mut state = start;
    for _ in 0..steps {
        state = state.step(model, latents, step_size)?;
    }
    Ok(state)
}
