//! No-U-Turn Sampler (NUTS): Hoffman & Gelman (2014), efficient slice
//! sampling variant.
//!
//!   - Recursive tree doubling, extending forward or backward at random
//!   - Slice variable: a leaf is a candidate when ln(u) - H0 <= -H
//!   - Candidate replacement weighted by the subtree's candidate count
//!   - Divergence when a leaf's energy leaves the slice by more than 1000
//!   - U-turn check on the edges of every merged subtree
//!   - Dual-averaging step-size adaptation for the first `adapt_count` draws

use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::leapfrog::Leapfrog;
use crate::model::ProbabilisticModelWithGradient;
use crate::progress::ChainProgress;
use crate::samples::{Metrics, NetworkSamples, Statistics};
use crate::tensor::{self, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::HashMap;

const MAX_DELTA_H: f64 = 1000.0;
const STARTING_STEP_SIZE: f64 = 1.0;

// Dual averaging
const GAMMA: f64 = 0.05;
const T0: f64 = 10.0;
const KAPPA: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct NutsConfig {
    pub adapt_enabled: bool,
    /// `None` picks one with the doubling / halving heuristic.
    pub initial_step_size: Option<f64>,
    pub max_tree_height: usize,
    pub target_acceptance_prob: f64,
    pub adapt_count: usize,
    pub save_statistics: bool,
    pub seed: u64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            adapt_enabled: true,
            initial_step_size: None,
            max_tree_height: 10,
            target_acceptance_prob: 0.8,
            adapt_count: 1000,
            save_statistics: false,
            seed: 42,
        }
    }
}

impl NutsConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_tree_height == 0 {
            return Err(Error::InvalidArgument {
                arg: "max_tree_height",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.target_acceptance_prob > 0.0 && self.target_acceptance_prob < 1.0) {
            return Err(Error::InvalidArgument {
                arg: "target_acceptance_prob",
                reason: format!("{} is not in (0, 1)", self.target_acceptance_prob),
            });
        }
        if let Some(eps) = self.initial_step_size {
            if !(eps > 0.0 && eps.is_finite()) {
                return Err(Error::InvalidArgument {
                    arg: "initial_step_size",
                    reason: format!("{eps} is not a positive step size"),
                });
            }
        }
        Ok(())
    }
}

/// A point on the trajectory together with the model's log probability there.
#[derive(Debug, Clone)]
struct PhasePoint {
    state: Leapfrog,
    log_prob: f64,
}

impl PhasePoint {
    fn energy(&self) -> f64 {
        -self.log_prob + self.state.half_dot_product_momentum()
    }
}

/// A built (sub)tree of the trajectory.
struct Tree {
    backward: PhasePoint,
    forward: PhasePoint,
    proposal: PhasePoint,
    /// Leaves inside the slice.
    accepted: usize,
    sum_accept_prob: f64,
    /// Leapfrog steps taken.
    tree_size: usize,
    should_continue: bool,
    diverged: bool,
}

impl Tree {
    fn root(point: PhasePoint) -> Self {
        Tree {
            backward: point.clone(),
            forward: point.clone(),
            proposal: point,
            accepted: 1,
            sum_accept_prob: 0.0,
            tree_size: 0,
            should_continue: true,
            diverged: false,
        }
    }

    /// Attach `other` at the forward or backward edge.
    fn join(&mut self, other: Tree, forward: bool, take_proposal: bool) {
        if forward {
            self.forward = other.forward;
        } else {
            self.backward = other.backward;
        }
        if take_proposal {
            self.proposal = other.proposal;
        }
        self.accepted += other.accepted;
        self.sum_accept_prob += other.sum_accept_prob;
        self.tree_size += other.tree_size;
        self.diverged |= other.diverged;
        self.should_continue = other.should_continue && !is_turning(&self.backward, &self.forward);
    }
}

/// State shared by every recursive call while growing one tree.
struct TreeBuilder<'a, M> {
    model: &'a mut M,
    latents: &'a [VertexId],
    rng: &'a mut ChaCha8Rng,
    log_u: f64,
    h0: f64,
    /// Signed step size.
    epsilon: f64,
}

impl<M: ProbabilisticModelWithGradient> TreeBuilder<'_, M> {
    fn build(&mut self, start: &PhasePoint, height: usize) -> Result<Tree> {
        if height == 0 {
            return self.leaf(start);
        }

        let mut first = self.build(start, height - 1)?;
        if !first.should_continue {
            return Ok(first);
        }

        let forward = self.epsilon > 0.0;
        let edge = if forward { first.forward.clone() } else { first.backward.clone() };
        let second = self.build(&edge, height - 1)?;

        let total = first.accepted + second.accepted;
        let take = total > 0 && self.rng.gen::<f64>() < second.accepted as f64 / total as f64;
        first.join(second, forward, take);
        Ok(first)
    }

    fn leaf(&mut self, start: &PhasePoint) -> Result<Tree> {
        let state = start.state.step(self.model, self.latents, self.epsilon)?;
        let log_prob = self.model.log_prob()?;
        let point = PhasePoint { state, log_prob };
        let energy = point.energy();

        let accepted = usize::from(self.log_u <= -energy);
        let diverged = !(self.log_u < MAX_DELTA_H - energy);
        if diverged {
            tracing::debug!(energy, h0 = self.h0, "divergent leapfrog step");
        }
        let accept_prob = if energy.is_finite() {
            (self.h0 - energy).min(0.0).exp()
        } else {
            0.0
        };

        Ok(Tree {
            backward: point.clone(),
            forward: point.clone(),
            proposal: point,
            accepted,
            sum_accept_prob: accept_prob,
            tree_size: 1,
            should_continue: !diverged,
            diverged,
        })
    }
}

/// The trajectory is turning if the momentum at either edge would bring the
/// edges closer together.
fn is_turning(backward: &PhasePoint, forward: &PhasePoint) -> bool {
    let mut dot_backward = 0.0;
    let mut dot_forward = 0.0;
    let mut ids: Vec<&VertexId> = forward.state.position.keys().collect();
    ids.sort();
    for id in ids {
        let (Some(q_forward), Some(q_backward), Some(p_backward), Some(p_forward)) = (
            forward.state.position.get(id),
            backward.state.position.get(id),
            backward.state.momentum.get(id),
            forward.state.momentum.get(id),
        ) else {
            continue;
        };
        let dq = q_forward - q_backward;
        dot_backward += tensor::dot(&dq, p_backward);
        dot_forward += tensor::dot(&dq, p_forward);
    }
    dot_backward < 0.0 || dot_forward < 0.0
}

/// Standard-normal momentum shaped like each latent, drawn in latent order.
pub(crate) fn sample_momentum(
    latents: &[VertexId],
    position: &HashMap<VertexId, Tensor>,
    rng: &mut ChaCha8Rng,
) -> Result<HashMap<VertexId, Tensor>> {
    latents
        .iter()
        .map(|&id| {
            let q = position.get(&id).ok_or(Error::MissingValue(id))?;
            let p = Tensor::from_shape_simple_fn(q.raw_dim(), || rng.sample::<f64, _>(StandardNormal));
            Ok((id, p))
        })
        .collect()
}

/// Dual averaging of the log step size toward a target acceptance rate.
/// Adapts during the first `adapt_count` iterations, then holds the averaged
/// step size.
pub(crate) struct StepSizeAdaptation {
    pub(crate) step_size: f64,
    mu: f64,
    log_eps_bar: f64,
    h_bar: f64,
    target: f64,
    adapt_count: usize,
}

impl StepSizeAdaptation {
    pub(crate) fn new(step_size: f64, target: f64, adapt_count: usize) -> Self {
        Self {
            step_size,
            mu: (10.0 * step_size).ln(),
            log_eps_bar: step_size.ln(),
            h_bar: 0.0,
            target,
            adapt_count,
        }
    }

    pub(crate) fn update(&mut self, accept_prob: f64, iteration: usize) {
        if iteration >= self.adapt_count {
            return;
        }
        let m = (iteration + 1) as f64;
        let w = 1.0 / (m + T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_prob);
        let log_eps = self.mu - (m.sqrt() / GAMMA) * self.h_bar;
        let m_pow = m.powf(-KAPPA);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        self.step_size = log_eps.exp();

        if iteration + 1 == self.adapt_count {
            self.step_size = self.log_eps_bar.exp();
            tracing::debug!(step_size = self.step_size, "step size adaptation finished");
        }
    }
}

/// No-U-Turn sampler. Owns its random stream, so repeated calls continue it.
pub struct Nuts {
    config: NutsConfig,
    rng: ChaCha8Rng,
    statistics: Statistics,
    divergences: usize,
}

impl Nuts {
    pub fn new(config: NutsConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            statistics: Statistics::new(),
            divergences: 0,
        }
    }

    pub fn config(&self) -> &NutsConfig {
        &self.config
    }

    /// Statistics of the last run. Empty unless `save_statistics` is set.
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Divergent iterations in the last run.
    pub fn divergences(&self) -> usize {
        self.divergences
    }

    /// Draw `count` samples of `vertices`. Adaptation iterations are
    /// included; use [`NetworkSamples::drop`] to discard them.
    pub fn get_posterior_samples<M: ProbabilisticModelWithGradient>(
        &mut self,
        model: &mut M,
        vertices: &[VertexId],
        count: usize,
    ) -> Result<NetworkSamples> {
        self.run(model, vertices, count, None)
    }

    pub fn get_posterior_samples_with_progress<M: ProbabilisticModelWithGradient>(
        &mut self,
        model: &mut M,
        vertices: &[VertexId],
        count: usize,
        progress: &ChainProgress,
    ) -> Result<NetworkSamples> {
        self.run(model, vertices, count, Some(progress))
    }

    fn run<M: ProbabilisticModelWithGradient>(
        &mut self,
        model: &mut M,
        vertices: &[VertexId],
        count: usize,
        progress: Option<&ChainProgress>,
    ) -> Result<NetworkSamples> {
        self.config.validate()?;
        self.statistics.clear();
        self.divergences = 0;

        let latents = model.latent_variables().to_vec();
        if latents.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "model",
                reason: "no latent variables to sample".to_string(),
            });
        }

        let log_prob = model.log_prob()?;
        if !log_prob.is_finite() {
            return Err(Error::ZeroProbability { algorithm: "NUTS" });
        }

        let position = latent_position(model, &latents)?;
        let gradient = model.log_prob_gradients()?;
        let mut current = PhasePoint {
            state: Leapfrog::new(position, HashMap::new(), gradient),
            log_prob,
        };

        let initial_step_size = match self.config.initial_step_size {
            Some(eps) => eps,
            None => find_initial_step_size(model, &latents, &current, &mut self.rng)?,
        };
        let adapt_count = if self.config.adapt_enabled { self.config.adapt_count } else { 0 };
        let mut adaptation =
            StepSizeAdaptation::new(initial_step_size, self.config.target_acceptance_prob, adapt_count);
        let max_tree_height = self.config.max_tree_height;
        let save_statistics = self.config.save_statistics;

        tracing::info!(
            count,
            latents = latents.len(),
            step_size = initial_step_size,
            "starting NUTS"
        );

        let mut samples = NetworkSamples::new(vertices);

        for iteration in 0..count {
            let step_size = adaptation.step_size;
            current.state.momentum = sample_momentum(&latents, &current.state.position, &mut self.rng)?;

            let h0 = current.energy();
            let log_u = self.rng.gen::<f64>().ln() - h0;
            let start_position = current.state.position.clone();
            let mut tree = Tree::root(current);
            let mut height = 0;

            while tree.should_continue && height < max_tree_height {
                let forward = self.rng.gen::<bool>();
                let start = if forward { &tree.forward } else { &tree.backward };
                let mut builder = TreeBuilder {
                    model: &mut *model,
                    latents: &latents,
                    rng: &mut self.rng,
                    log_u,
                    h0,
                    epsilon: if forward { step_size } else { -step_size },
                };
                let subtree = match builder.build(start, height) {
                    Ok(subtree) => subtree,
                    Err(e) => {
                        model.set_values(&start_position)?;
                        return Err(e);
                    }
                };

                let take = subtree.should_continue
                    && self.rng.gen::<f64>() < subtree.accepted as f64 / tree.accepted as f64;
                tree.join(subtree, forward, take);
                height += 1;
            }

            let diverged = tree.diverged;
            if diverged {
                self.divergences += 1;
            }

            let mean_tree_accept = tree.sum_accept_prob / tree.tree_size.max(1) as f64;
            let tree_size = tree.tree_size;
            current = tree.proposal;
            model.set_values(&current.state.position)?;
            adaptation.update(mean_tree_accept, iteration);

            if save_statistics {
                self.statistics.store(Metrics::StepSize, step_size);
                self.statistics.store(Metrics::LogProb, current.log_prob);
                self.statistics.store(Metrics::MeanTreeAccept, mean_tree_accept);
                self.statistics.store(Metrics::TreeSize, tree_size as f64);
            }

            let values = vertices
                .iter()
                .map(|&id| Ok((id, model.value(id).ok_or(Error::MissingValue(id))?.clone())))
                .collect::<Result<HashMap<_, _>>>()?;
            samples.push(&values, current.log_prob)?;

            if let Some(p) = progress {
                p.record(step_size, tree_size, diverged);
            }
        }

        tracing::info!(
            count,
            divergences = self.divergences,
            step_size = adaptation.step_size,
            "finished NUTS"
        );
        Ok(samples)
    }
}

pub(crate) fn latent_position<M: ProbabilisticModelWithGradient>(
    model: &M,
    latents: &[VertexId],
) -> Result<HashMap<VertexId, Tensor>> {
    latents
        .iter()
        .map(|&id| Ok((id, model.value(id).ok_or(Error::MissingValue(id))?.clone())))
        .collect()
}

/// Double or halve a trial step size until a single leapfrog step crosses an
/// acceptance ratio of one half. The model is restored afterwards, also when
/// the search fails.
fn find_initial_step_size<M: ProbabilisticModelWithGradient>(
    model: &mut M,
    latents: &[VertexId],
    start: &PhasePoint,
    rng: &mut ChaCha8Rng,
) -> Result<f64> {
    let found = search_step_size(model, latents, start, rng);
    model.set_values(&start.state.position)?;
    let eps = found?.clamp(1e-10, 1e3);
    tracing::debug!(step_size = eps, "found initial step size");
    Ok(eps)
}

fn search_step_size<M: ProbabilisticModelWithGradient>(
    model: &mut M,
    latents: &[VertexId],
    start: &PhasePoint,
    rng: &mut ChaCha8Rng,
) -> Result<f64> {
    let mut point = start.clone();
    point.state.momentum = sample_momentum(latents, &point.state.position, rng)?;
    let h0 = point.energy();
    let threshold = 0.5f64.ln();

    let log_ratio = |model: &mut M, eps: f64| -> Result<f64> {
        let state = point.state.step(model, latents, eps)?;
        let log_prob = model.log_prob()?;
        let ratio = h0 - (-log_prob + state.half_dot_product_momentum());
        Ok(if ratio.is_nan() { f64::NEG_INFINITY } else { ratio })
    };

    let mut eps = STARTING_STEP_SIZE;
    let direction = if log_ratio(model, eps)? > threshold { 1.0 } else { -1.0 };

    for _ in 0..50 {
        let lr = log_ratio(model, eps)?;
        if direction > 0.0 && lr < threshold {
            break;
        }
        if direction < 0.0 && lr > threshold {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }
    Ok(eps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Gaussian, HalfGaussian};
    use crate::graph::Graph;
    use crate::model::{BayesianNetwork, GradientBudget, ProbabilisticModel};

    fn simple_gaussian(start: f64) -> (BayesianNetwork, VertexId) {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_value(a, tensor::scalar(start)).unwrap();
        (BayesianNetwork::new(g).unwrap(), a)
    }

    fn mean_and_std(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    #[test]
    fn test_default_config() {
        let config = NutsConfig::default();
        assert!(config.adapt_enabled);
        assert_eq!(config.adapt_count, 1000);
        assert_eq!(config.max_tree_height, 10);
        assert!((config.target_acceptance_prob - 0.8).abs() < 1e-12);
        assert!(config.initial_step_size.is_none());
    }

    #[test]
    fn test_records_statistics() {
        let (mut net, a) = simple_gaussian(0.5);
        let mut nuts = Nuts::new(NutsConfig {
            adapt_enabled: false,
            initial_step_size: Some(1.0),
            max_tree_height: 4,
            save_statistics: true,
            ..Default::default()
        });
        let samples = nuts.get_posterior_samples(&mut net, &[a], 2).unwrap();
        assert_eq!(samples.len(), 2);

        let stats = nuts.statistics();
        assert_eq!(stats.get(Metrics::StepSize), &[1.0, 1.0]);
        assert!(stats.get(Metrics::LogProb).iter().all(|&lp| lp < 0.0));
        assert!(stats
            .get(Metrics::MeanTreeAccept)
            .iter()
            .all(|&m| (0.0..=1.0).contains(&m)));
        assert_eq!(stats.get(Metrics::TreeSize).len(), 2);
        assert!(stats.get(Metrics::TreeSize).iter().all(|&t| t >= 1.0 && t < 16.0));
    }

    #[test]
    fn test_tree_size_bounded_by_height() {
        for height in [1usize, 2, 3] {
            let (mut net, a) = simple_gaussian(0.5);
            let mut nuts = Nuts::new(NutsConfig {
                adapt_enabled: false,
                initial_step_size: Some(0.05),
                max_tree_height: height,
                save_statistics: true,
                ..Default::default()
            });
            nuts.get_posterior_samples(&mut net, &[a], 20).unwrap();
            let bound = ((1usize << height) - 1) as f64;
            let sizes = nuts.statistics().get(Metrics::TreeSize);
            assert!(sizes.iter().all(|&t| t >= 1.0 && t <= bound), "height {height}: {sizes:?}");
            if height == 1 {
                assert!(sizes.iter().all(|&t| t == 1.0));
            }
        }
    }

    fn start_point(net: &mut BayesianNetwork, latents: &[VertexId], rng: &mut ChaCha8Rng) -> PhasePoint {
        let position = latent_position(&*net, latents).unwrap();
        let gradient = net.log_prob_gradients().unwrap();
        let momentum = sample_momentum(latents, &position, rng).unwrap();
        PhasePoint {
            state: Leapfrog::new(position, momentum, gradient),
            log_prob: net.log_prob().unwrap(),
        }
    }

    #[test]
    fn test_divergent_leaf_stops_tree_building() {
        let (mut net, a) = simple_gaussian(0.5);
        let latents = [a];
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let start = start_point(&mut net, &latents, &mut rng);
        let h0 = start.energy();

        // A zero step keeps every leaf at energy h0 and never turns.
        let within = TreeBuilder {
            model: &mut net,
            latents: &latents,
            rng: &mut rng,
            log_u: MAX_DELTA_H - h0 - 1.0,
            h0,
            epsilon: 0.0,
        }
        .build(&start, 3)
        .unwrap();
        assert!(!within.diverged);
        assert!(within.should_continue);
        assert_eq!(within.tree_size, 8);

        let beyond = TreeBuilder {
            model: &mut net,
            latents: &latents,
            rng: &mut rng,
            log_u: MAX_DELTA_H - h0 + 1.0,
            h0,
            epsilon: 0.0,
        }
        .build(&start, 3)
        .unwrap();
        assert!(beyond.diverged);
        assert!(!beyond.should_continue);
        assert_eq!(beyond.tree_size, 1);
    }

    #[test]
    fn test_progress_follows_iterations() {
        let (mut net, a) = simple_gaussian(0.5);
        let progress = ChainProgress::default();
        let mut nuts = Nuts::new(NutsConfig {
            adapt_count: 5,
            save_statistics: true,
            ..Default::default()
        });
        nuts.get_posterior_samples_with_progress(&mut net, &[a], 12, &progress).unwrap();

        let stats = nuts.statistics();
        assert_eq!(progress.iterations(), 12);
        assert_eq!(progress.divergences(), nuts.divergences());
        let leapfrogs: f64 = stats.get(Metrics::TreeSize).iter().sum();
        assert_eq!(progress.gradient_evaluations(), leapfrogs as usize);
        assert_eq!(progress.step_size(), stats.get(Metrics::StepSize).last().copied());
    }

    #[test]
    fn test_statistics_not_saved_by_default() {
        let (mut net, a) = simple_gaussian(0.5);
        let mut nuts = Nuts::new(NutsConfig {
            adapt_count: 2,
            ..Default::default()
        });
        nuts.get_posterior_samples(&mut net, &[a], 3).unwrap();
        assert!(nuts.statistics().get(Metrics::StepSize).is_empty());
    }

    #[test]
    fn test_zero_probability_start_fails() {
        let mut g = Graph::new();
        let a = HalfGaussian::prior(&mut g, 1.0).unwrap();
        g.set_value(a, tensor::scalar(-1.0)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();
        let mut nuts = Nuts::new(NutsConfig::default());
        let err = nuts.get_posterior_samples(&mut net, &[a], 2).unwrap_err();
        assert!(matches!(err, Error::ZeroProbability { algorithm: "NUTS" }));
        assert_eq!(tensor::first(net.graph().value(a).unwrap()), -1.0);
    }

    #[test]
    fn test_failed_step_size_search_restores_model() {
        let (net, a) = simple_gaussian(0.7);
        // initial gradient and one trial step, then the second trial step fails
        let mut model = GradientBudget::new(net, 2);
        let mut nuts = Nuts::new(NutsConfig::default());
        assert!(nuts.get_posterior_samples(&mut model, &[a], 5).is_err());
        assert_eq!(tensor::first(model.network.graph().value(a).unwrap()), 0.7);
    }

    #[test]
    fn test_failed_tree_build_restores_model() {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        let two = g.scalar(2.0);
        let b = g.mul(a, two).unwrap();
        g.set_value(a, tensor::scalar(0.7)).unwrap();
        let net = BayesianNetwork::new(g).unwrap();

        let mut model = GradientBudget::new(net, 1);
        let mut nuts = Nuts::new(NutsConfig {
            initial_step_size: Some(0.5),
            ..Default::default()
        });
        assert!(nuts.get_posterior_samples(&mut model, &[a], 5).is_err());
        let graph = model.network.graph();
        assert_eq!(tensor::first(graph.value(a).unwrap()), 0.7);
        assert_eq!(tensor::first(graph.value(b).unwrap()), 1.4);
    }

    #[test]
    fn test_rejects_zero_tree_height() {
        let (mut net, a) = simple_gaussian(0.0);
        let mut nuts = Nuts::new(NutsConfig {
            max_tree_height: 0,
            ..Default::default()
        });
        assert!(matches!(
            nuts.get_posterior_samples(&mut net, &[a], 1),
            Err(Error::InvalidArgument { arg: "max_tree_height", .. })
        ));
    }

    #[test]
    fn test_samples_standard_gaussian() {
        let (mut net, a) = simple_gaussian(3.0);
        let mut nuts = Nuts::new(NutsConfig {
            adapt_count: 200,
            ..Default::default()
        });
        let samples = nuts.get_posterior_samples(&mut net, &[a], 1000).unwrap().drop(200);
        let values = samples.get(a).unwrap().element(0);
        assert_eq!(values.len(), 800);
        let (mean, std) = mean_and_std(&values);
        assert!(mean.abs() < 0.25, "mean {mean}");
        assert!((std - 1.0).abs() < 0.25, "std {std}");
    }

    #[test]
    fn test_samples_posterior_with_observation() {
        // A ~ N(0, 1), C ~ N(A, 1) observed at 2 => A | C ~ N(1, 1/2)
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        Gaussian::observed(&mut g, a, 1.0, tensor::scalar(2.0)).unwrap();
        g.set_value(a, tensor::scalar(0.0)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();

        let mut nuts = Nuts::new(NutsConfig {
            adapt_count: 200,
            ..Default::default()
        });
        let samples = nuts.get_posterior_samples(&mut net, &[a], 1000).unwrap().drop(200);
        let (mean, std) = mean_and_std(&samples.get(a).unwrap().element(0));
        assert!((mean - 1.0).abs() < 0.2, "mean {mean}");
        assert!((std - 0.5f64.sqrt()).abs() < 0.2, "std {std}");
    }

    #[test]
    fn test_samples_deterministic_vertices() {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        let two = g.scalar(2.0);
        let b = g.mul(a, two).unwrap();
        g.set_value(a, tensor::scalar(0.1)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();

        let mut nuts = Nuts::new(NutsConfig {
            adapt_count: 5,
            ..Default::default()
        });
        let samples = nuts.get_posterior_samples(&mut net, &[a, b], 20).unwrap();
        let a_values = samples.get(a).unwrap().element(0);
        let b_values = samples.get(b).unwrap().element(0);
        for (x, y) in a_values.iter().zip(&b_values) {
            assert!((2.0 * x - y).abs() < 1e-12);
        }
        // the model is left at the last sample
        assert_eq!(tensor::first(net.graph().value(a).unwrap()), a_values[19]);
    }

    #[test]
    fn test_same_seed_same_samples() {
        let run = || {
            let (mut net, a) = simple_gaussian(0.5);
            let mut nuts = Nuts::new(NutsConfig {
                adapt_count: 10,
                seed: 7,
                ..Default::default()
            });
            let samples = nuts.get_posterior_samples(&mut net, &[a], 30).unwrap();
            samples.get(a).unwrap().element(0)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_adaptation_changes_step_size() {
        let (mut net, a) = simple_gaussian(0.5);
        let mut nuts = Nuts::new(NutsConfig {
            initial_step_size: Some(0.01),
            adapt_count: 20,
            save_statistics: true,
            ..Default::default()
        });
        nuts.get_posterior_samples(&mut net, &[a], 30).unwrap();
        let steps = nuts.statistics().get(Metrics::StepSize);
        assert_eq!(steps[0], 0.01);
        assert!(steps[1..].iter().any(|&s| s != 0.01));
        // frozen after adaptation
        assert!(steps[21..].iter().all(|&s| s == steps[20]));
    }
}
