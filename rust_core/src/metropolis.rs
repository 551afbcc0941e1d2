//! Metropolis-Hastings over a [`BayesianNetwork`].
//!
//! A step proposes new values for a set of latents, applies and cascades
//! them, and either keeps them or rolls every touched vertex back.

use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::model::{BayesianNetwork, ProbabilisticModel};
use crate::samples::NetworkSamples;
use crate::tensor::Tensor;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Proposal ────────────────────────────────────────────────────────

/// Proposed values for some vertices, and the values they held before the
/// proposal was applied.
#[derive(Debug, Clone, Default)]
pub struct Proposal {
    to: BTreeMap<VertexId, Tensor>,
    from: BTreeMap<VertexId, Tensor>,
}

impl Proposal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_proposal(&mut self, id: VertexId, value: Tensor) {
        self.to.insert(id, value);
    }

    pub fn proposal_to(&self, id: VertexId) -> Option<&Tensor> {
        self.to.get(&id)
    }

    /// Value before [`Proposal::apply`]. `None` until applied.
    pub fn proposal_from(&self, id: VertexId) -> Option<&Tensor> {
        self.from.get(&id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.to.keys().copied()
    }

    /// Write the proposed values and cascade, remembering the old ones.
    pub fn apply(&mut self, network: &mut BayesianNetwork) -> Result<()> {
        self.from = self
            .to
            .keys()
            .map(|&id| Ok((id, network.value(id).ok_or(Error::MissingValue(id))?.clone())))
            .collect::<Result<_>>()?;
        network.set_values(&to_map(&self.to))
    }

    /// Restore the values held before [`Proposal::apply`] and cascade.
    pub fn reject(&self, network: &mut BayesianNetwork) -> Result<()> {
        network.set_values(&to_map(&self.from))
    }
}

fn to_map(values: &BTreeMap<VertexId, Tensor>) -> HashMap<VertexId, Tensor> {
    values.iter().map(|(&id, v)| (id, v.clone())).collect()
}

// ── Proposal distributions ──────────────────────────────────────────

pub trait ProposalDistribution: Send + Sync {
    fn get_proposal(
        &self,
        network: &BayesianNetwork,
        vertices: &[VertexId],
        rng: &mut dyn RngCore,
    ) -> Result<Proposal>;

    /// ln q(to | from), with the network in the proposed state.
    fn log_prob_at_to_given_from(&self, network: &BayesianNetwork, proposal: &Proposal) -> Result<f64>;

    /// ln q(from | to), with the network in the proposed state.
    fn log_prob_at_from_given_to(&self, network: &BayesianNetwork, proposal: &Proposal) -> Result<f64>;
}

/// Propose each vertex from its own distribution given its parents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorProposalDistribution;

impl ProposalDistribution for PriorProposalDistribution {
    fn get_proposal(
        &self,
        network: &BayesianNetwork,
        vertices: &[VertexId],
        rng: &mut dyn RngCore,
    ) -> Result<Proposal> {
        let mut proposal = Proposal::new();
        for &id in vertices {
            proposal.set_proposal(id, network.graph().sample_from_prior(id, rng)?);
        }
        Ok(proposal)
    }

    fn log_prob_at_to_given_from(&self, network: &BayesianNetwork, proposal: &Proposal) -> Result<f64> {
        proposal
            .to
            .iter()
            .map(|(&id, value)| network.graph().log_prob_at(id, value))
            .sum()
    }

    fn log_prob_at_from_given_to(&self, network: &BayesianNetwork, proposal: &Proposal) -> Result<f64> {
        proposal
            .from
            .iter()
            .map(|(&id, value)| network.graph().log_prob_at(id, value))
            .sum()
    }
}

/// Symmetric Gaussian random walk around the current value.
#[derive(Debug, Clone, Copy)]
pub struct GaussianProposalDistribution {
    pub sigma: f64,
}

impl GaussianProposalDistribution {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    fn log_density(&self, a: &BTreeMap<VertexId, Tensor>, b: &BTreeMap<VertexId, Tensor>) -> f64 {
        let ln_norm = -self.sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln();
        a.iter()
            .filter_map(|(id, x)| b.get(id).map(|y| (x, y)))
            .flat_map(|(x, y)| x.iter().zip(y.iter()))
            .map(|(x, y)| {
                let z = (x - y) / self.sigma;
                -0.5 * z * z + ln_norm
            })
            .sum()
    }
}

impl ProposalDistribution for GaussianProposalDistribution {
    fn get_proposal(
        &self,
        network: &BayesianNetwork,
        vertices: &[VertexId],
        rng: &mut dyn RngCore,
    ) -> Result<Proposal> {
        let mut proposal = Proposal::new();
        for &id in vertices {
            let current = network.value(id).ok_or(Error::MissingValue(id))?;
            let step = current.map(|_| self.sigma * rng.sample::<f64, _>(StandardNormal));
            proposal.set_proposal(id, current + &step);
        }
        Ok(proposal)
    }

    fn log_prob_at_to_given_from(&self, _network: &BayesianNetwork, proposal: &Proposal) -> Result<f64> {
        Ok(self.log_density(&proposal.to, &proposal.from))
    }

    fn log_prob_at_from_given_to(&self, _network: &BayesianNetwork, proposal: &Proposal) -> Result<f64> {
        Ok(self.log_density(&proposal.from, &proposal.to))
    }
}

// ── Listeners ───────────────────────────────────────────────────────

pub trait ProposalListener: Send + Sync {
    fn on_proposal_created(&self, proposal: &Proposal);
    fn on_proposal_rejected(&self, proposal: &Proposal);
}

/// Fans proposal events out to every registered listener.
#[derive(Clone, Default)]
pub struct ProposalNotifier {
    listeners: Vec<Arc<dyn ProposalListener>>,
}

impl ProposalNotifier {
    pub fn new(listeners: Vec<Arc<dyn ProposalListener>>) -> Self {
        Self { listeners }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ProposalListener>) {
        self.listeners.push(listener);
    }

    pub fn notify_proposal_created(&self, proposal: &Proposal) {
        for listener in &self.listeners {
            listener.on_proposal_created(proposal);
        }
    }

    pub fn notify_proposal_rejected(&self, proposal: &Proposal) {
        for listener in &self.listeners {
            listener.on_proposal_rejected(proposal);
        }
    }
}

/// Per-vertex acceptance counts.
#[derive(Debug, Default)]
pub struct AcceptanceRateTracker {
    proposals: AtomicUsize,
    rejections: AtomicUsize,
    per_vertex: Mutex<HashMap<VertexId, (usize, usize)>>,
}

impl AcceptanceRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted fraction of all proposals, 0 if none were made.
    pub fn acceptance_rate(&self) -> f64 {
        let proposals = self.proposals.load(Ordering::Relaxed);
        if proposals == 0 {
            return 0.0;
        }
        let rejections = self.rejections.load(Ordering::Relaxed);
        (proposals - rejections) as f64 / proposals as f64
    }

    pub fn acceptance_rate_of(&self, id: VertexId) -> Option<f64> {
        let counts = self.per_vertex.lock().unwrap_or_else(|e| e.into_inner());
        let &(proposed, rejected) = counts.get(&id)?;
        Some((proposed - rejected) as f64 / proposed as f64)
    }
}

impl ProposalListener for AcceptanceRateTracker {
    fn on_proposal_created(&self, proposal: &Proposal) {
        self.proposals.fetch_add(1, Ordering::Relaxed);
        let mut counts = self.per_vertex.lock().unwrap_or_else(|e| e.into_inner());
        for id in proposal.vertices() {
            counts.entry(id).or_default().0 += 1;
        }
    }

    fn on_proposal_rejected(&self, proposal: &Proposal) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        let mut counts = self.per_vertex.lock().unwrap_or_else(|e| e.into_inner());
        for id in proposal.vertices() {
            counts.entry(id).or_default().1 += 1;
        }
    }
}

// ── Step ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepResult {
    pub accepted: bool,
    pub log_probability_after_step: f64,
}

pub struct MetropolisHastingsStep {
    proposal_distribution: Box<dyn ProposalDistribution>,
    notifier: ProposalNotifier,
}

impl MetropolisHastingsStep {
    pub fn new(proposal_distribution: Box<dyn ProposalDistribution>) -> Self {
        Self {
            proposal_distribution,
            notifier: ProposalNotifier::default(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProposalListener>) -> Self {
        self.notifier.add_listener(listener);
        self
    }

    /// Propose new values for `vertices` and accept with probability
    /// `min(1, exp((new - old) / temperature + ln q(from|to) - ln q(to|from)))`.
    /// A rejected proposal leaves the network as it was.
    pub fn step(
        &self,
        network: &mut BayesianNetwork,
        vertices: &[VertexId],
        log_prob_before: f64,
        temperature: f64,
        rng: &mut dyn RngCore,
    ) -> Result<StepResult> {
        if !(temperature > 0.0) {
            return Err(Error::InvalidArgument {
                arg: "temperature",
                reason: format!("{temperature} is not positive"),
            });
        }

        let mut proposal = self.proposal_distribution.get_proposal(network, vertices, rng)?;
        self.notifier.notify_proposal_created(&proposal);
        proposal.apply(network)?;

        let log_prob_after = network.log_prob()?;
        if log_prob_after > f64::NEG_INFINITY {
            let q_forward = self.proposal_distribution.log_prob_at_to_given_from(network, &proposal)?;
            let q_backward = self.proposal_distribution.log_prob_at_from_given_to(network, &proposal)?;
            let log_r = (log_prob_after - log_prob_before) / temperature + q_backward - q_forward;
            if rng.gen::<f64>() < log_r.exp() {
                return Ok(StepResult {
                    accepted: true,
                    log_probability_after_step: log_prob_after,
                });
            }
        }

        proposal.reject(network)?;
        self.notifier.notify_proposal_rejected(&proposal);
        tracing::debug!(log_prob_after, log_prob_before, "proposal rejected");
        Ok(StepResult {
            accepted: false,
            log_probability_after_step: log_prob_before,
        })
    }
}

// ── Samplers ────────────────────────────────────────────────────────

/// Which latents each step proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariableSelection {
    /// One latent per step, drawn uniformly.
    #[default]
    SingleVariable,
    /// Every latent at once.
    Full,
}

impl VariableSelection {
    fn select<R: Rng + ?Sized>(&self, latents: &[VertexId], rng: &mut R) -> Vec<VertexId> {
        match self {
            VariableSelection::SingleVariable => vec![latents[rng.gen_range(0..latents.len())]],
            VariableSelection::Full => latents.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetropolisConfig {
    pub variable_selection: VariableSelection,
    pub seed: u64,
}

impl Default for MetropolisConfig {
    fn default() -> Self {
        Self {
            variable_selection: VariableSelection::SingleVariable,
            seed: 42,
        }
    }
}

fn latents_of(network: &BayesianNetwork) -> Result<Vec<VertexId>> {
    let latents = network.latent_vertices().to_vec();
    if latents.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "network",
            reason: "no latent variables to sample".to_string(),
        });
    }
    Ok(latents)
}

pub struct MetropolisHastings {
    config: MetropolisConfig,
    step: MetropolisHastingsStep,
    rng: ChaCha8Rng,
}

impl MetropolisHastings {
    /// Sampler proposing from each vertex's prior.
    pub fn new(config: MetropolisConfig) -> Self {
        Self::with_proposal_distribution(config, Box::new(PriorProposalDistribution))
    }

    pub fn with_proposal_distribution(
        config: MetropolisConfig,
        proposal_distribution: Box<dyn ProposalDistribution>,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            step: MetropolisHastingsStep::new(proposal_distribution),
            rng,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProposalListener>) -> Self {
        self.step = self.step.with_listener(listener);
        self
    }

    /// `count` samples of `vertices`, one per step. Burn-in is kept; remove
    /// it with [`NetworkSamples::drop`].
    pub fn get_posterior_samples(
        &mut self,
        network: &mut BayesianNetwork,
        vertices: &[VertexId],
        count: usize,
    ) -> Result<NetworkSamples> {
        let latents = latents_of(network)?;
        let mut log_prob = network.log_prob()?;
        if !(log_prob > f64::NEG_INFINITY) {
            return Err(Error::ZeroProbability {
                algorithm: "MetropolisHastings",
            });
        }

        tracing::info!(count, latents = latents.len(), "starting Metropolis-Hastings");
        let mut samples = NetworkSamples::new(vertices);
        let mut accepted = 0usize;

        for _ in 0..count {
            let chosen = self.config.variable_selection.select(&latents, &mut self.rng);
            let result = self.step.step(network, &chosen, log_prob, 1.0, &mut self.rng)?;
            log_prob = result.log_probability_after_step;
            accepted += usize::from(result.accepted);

            let values = vertices
                .iter()
                .map(|&id| Ok((id, network.value(id).ok_or(Error::MissingValue(id))?.clone())))
                .collect::<Result<HashMap<_, _>>>()?;
            samples.push(&values, log_prob)?;
        }

        tracing::info!(count, accepted, "finished Metropolis-Hastings");
        Ok(samples)
    }
}

// ── Simulated annealing ─────────────────────────────────────────────

/// Exponential cooling from `max_temperature` to `min_temperature` over
/// `iterations` steps.
#[derive(Debug, Clone, Copy)]
pub struct AnnealingSchedule {
    pub iterations: usize,
    pub max_temperature: f64,
    pub min_temperature: f64,
}

impl AnnealingSchedule {
    pub fn exponential(iterations: usize, max_temperature: f64, min_temperature: f64) -> Self {
        Self {
            iterations,
            max_temperature,
            min_temperature,
        }
    }

    pub fn temperature(&self, iteration: usize) -> f64 {
        if self.iterations == 0 {
            return self.min_temperature;
        }
        let rate = (self.max_temperature / self.min_temperature).ln() / self.iterations as f64;
        self.max_temperature * (-rate * iteration as f64).exp()
    }
}

impl Default for AnnealingSchedule {
    fn default() -> Self {
        Self::exponential(10_000, 2.0, 0.01)
    }
}

/// Metropolis-Hastings under a cooling schedule, keeping the most probable
/// state visited.
pub struct SimulatedAnnealing {
    config: MetropolisConfig,
    step: MetropolisHastingsStep,
    rng: ChaCha8Rng,
}

impl SimulatedAnnealing {
    pub fn new(config: MetropolisConfig) -> Self {
        Self::with_proposal_distribution(config, Box::new(PriorProposalDistribution))
    }

    pub fn with_proposal_distribution(
        config: MetropolisConfig,
        proposal_distribution: Box<dyn ProposalDistribution>,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            step: MetropolisHastingsStep::new(proposal_distribution),
            rng,
        }
    }

    /// Anneal and leave the network at the most probable latent state seen,
    /// which is also returned.
    pub fn get_max_a_posteriori(
        &mut self,
        network: &mut BayesianNetwork,
        schedule: AnnealingSchedule,
    ) -> Result<HashMap<VertexId, Tensor>> {
        let latents = latents_of(network)?;
        let mut log_prob = network.log_prob()?;
        if !(log_prob > f64::NEG_INFINITY) {
            return Err(Error::ZeroProbability {
                algorithm: "SimulatedAnnealing",
            });
        }

        let mut best_log_prob = log_prob;
        let mut best = network.latent_values()?;

        for iteration in 0..schedule.iterations {
            let chosen = self.config.variable_selection.select(&latents, &mut self.rng);
            let temperature = schedule.temperature(iteration);
            let result = self.step.step(network, &chosen, log_prob, temperature, &mut self.rng)?;
            log_prob = result.log_probability_after_step;
            if log_prob > best_log_prob {
                best_log_prob = log_prob;
                best = network.latent_values()?;
            }
        }

        network.set_values(&best)?;
        tracing::info!(best_log_prob, iterations = schedule.iterations, "finished simulated annealing");
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Gaussian, Uniform};
    use crate::graph::Graph;
    use crate::tensor;
    use rand::rngs::mock::StepRng;

    fn always_accept() -> StepRng {
        StepRng::new(0, 0)
    }

    fn always_reject() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }

    struct ConstantProposalDistribution(f64);

    impl ProposalDistribution for ConstantProposalDistribution {
        fn get_proposal(
            &self,
            _network: &BayesianNetwork,
            vertices: &[VertexId],
            _rng: &mut dyn RngCore,
        ) -> Result<Proposal> {
            let mut proposal = Proposal::new();
            for &id in vertices {
                proposal.set_proposal(id, tensor::scalar(self.0));
            }
            Ok(proposal)
        }

        fn log_prob_at_to_given_from(&self, _: &BayesianNetwork, _: &Proposal) -> Result<f64> {
            Ok(0.0)
        }

        fn log_prob_at_from_given_to(&self, _: &BayesianNetwork, _: &Proposal) -> Result<f64> {
            Ok(0.0)
        }
    }

    fn linear_model(start: f64) -> (BayesianNetwork, VertexId) {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        let two = g.scalar(2.0);
        let b = g.mul(a, two).unwrap();
        Gaussian::observed(&mut g, b, 1.0, tensor::scalar(5.0)).unwrap();
        g.set_value(a, tensor::scalar(start)).unwrap();
        (BayesianNetwork::new(g).unwrap(), a)
    }

    #[test]
    fn test_single_variable_selection_is_uniform() {
        let latents = [VertexId(2), VertexId(5), VertexId(9)];
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut counts: BTreeMap<VertexId, usize> = BTreeMap::new();
        let mut picks = Vec::new();
        for _ in 0..3000 {
            let chosen = VariableSelection::SingleVariable.select(&latents, &mut rng);
            assert_eq!(chosen.len(), 1);
            *counts.entry(chosen[0]).or_default() += 1;
            picks.push(chosen[0]);
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n > 850 && n < 1150), "{counts:?}");
        // not a fixed rotation
        assert!(picks.windows(2).any(|w| w[0] == w[1]));
        assert_eq!(VariableSelection::Full.select(&latents, &mut rng), latents.to_vec());
    }

    #[test]
    fn test_log_prob_after_step_matches_network() {
        let (mut net, a) = linear_model(1.0);
        let step = MetropolisHastingsStep::new(Box::new(PriorProposalDistribution));
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut log_prob = net.log_prob().unwrap();
        for _ in 0..20 {
            let result = step.step(&mut net, &[a], log_prob, 1.0, &mut rng).unwrap();
            log_prob = result.log_probability_after_step;
            assert!((net.log_prob().unwrap() - log_prob).abs() < 1e-10);
        }
    }

    #[test]
    fn test_accepts_custom_proposal() {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_value(a, tensor::scalar(0.0)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();

        let step = MetropolisHastingsStep::new(Box::new(ConstantProposalDistribution(1.0)));
        let before = net.log_prob().unwrap();
        let result = step.step(&mut net, &[a], before, 1.0, &mut always_accept()).unwrap();
        assert!(result.accepted);
        assert_eq!(tensor::first(net.value(a).unwrap()), 1.0);
        assert!((result.log_probability_after_step - net.log_prob().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_impossible_proposal() {
        let mut g = Graph::new();
        let a = Uniform::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_value(a, tensor::scalar(0.5)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();

        let step = MetropolisHastingsStep::new(Box::new(ConstantProposalDistribution(-1.0)));
        let before = net.log_prob().unwrap();
        let result = step.step(&mut net, &[a], before, 1.0, &mut always_accept()).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.log_probability_after_step, before);
        assert_eq!(tensor::first(net.value(a).unwrap()), 0.5);
    }

    #[test]
    fn test_rejects_and_rolls_back_cascade() {
        let (mut net, a) = linear_model(0.5);
        let b = *net.graph().children(a).iter().next().unwrap();
        let step = MetropolisHastingsStep::new(Box::new(ConstantProposalDistribution(10.0)));
        let before = net.log_prob().unwrap();
        let result = step.step(&mut net, &[a], before, 1.0, &mut always_reject()).unwrap();
        assert!(!result.accepted);
        assert_eq!(tensor::first(net.value(a).unwrap()), 0.5);
        assert_eq!(tensor::first(net.value(b).unwrap()), 1.0);
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        let (mut net, a) = linear_model(0.5);
        let step = MetropolisHastingsStep::new(Box::new(ConstantProposalDistribution(1.0)));
        assert!(step.step(&mut net, &[a], 0.0, 0.0, &mut always_accept()).is_err());
    }

    #[test]
    fn test_listeners_track_acceptance() {
        let mut g = Graph::new();
        let a = Uniform::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_value(a, tensor::scalar(0.5)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();

        let tracker = Arc::new(AcceptanceRateTracker::new());
        let inside = MetropolisHastingsStep::new(Box::new(ConstantProposalDistribution(0.25)))
            .with_listener(tracker.clone());
        let outside = MetropolisHastingsStep::new(Box::new(ConstantProposalDistribution(2.0)))
            .with_listener(tracker.clone());

        let lp = net.log_prob().unwrap();
        inside.step(&mut net, &[a], lp, 1.0, &mut always_accept()).unwrap();
        outside.step(&mut net, &[a], lp, 1.0, &mut always_accept()).unwrap();

        assert!((tracker.acceptance_rate() - 0.5).abs() < 1e-12);
        assert!((tracker.acceptance_rate_of(a).unwrap() - 0.5).abs() < 1e-12);
        assert!(tracker.acceptance_rate_of(VertexId(99)).is_none());
    }

    #[test]
    fn test_gaussian_proposal_is_symmetric() {
        let (net, a) = linear_model(0.5);
        let dist = GaussianProposalDistribution::new(0.3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut proposal = dist.get_proposal(&net, &[a], &mut rng).unwrap();
        let mut net = net;
        proposal.apply(&mut net).unwrap();
        let forward = dist.log_prob_at_to_given_from(&net, &proposal).unwrap();
        let backward = dist.log_prob_at_from_given_to(&net, &proposal).unwrap();
        assert!((forward - backward).abs() < 1e-12);
        assert_eq!(tensor::first(proposal.proposal_from(a).unwrap()), 0.5);
    }

    #[test]
    fn test_sampler_matches_posterior() {
        // A ~ N(0, 1), C ~ N(A, 1) observed at 2 => A | C ~ N(1, 1/2)
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        Gaussian::observed(&mut g, a, 1.0, tensor::scalar(2.0)).unwrap();
        g.set_value(a, tensor::scalar(0.0)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();

        let mut mh = MetropolisHastings::new(MetropolisConfig::default());
        let samples = mh.get_posterior_samples(&mut net, &[a], 5000).unwrap().drop(500);
        let values = samples.get(a).unwrap().element(0);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!((mean - 1.0).abs() < 0.15, "mean {mean}");
    }

    #[test]
    fn test_sampler_zero_probability_start_fails() {
        let mut g = Graph::new();
        let a = Uniform::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_value(a, tensor::scalar(3.0)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();
        let mut mh = MetropolisHastings::new(MetropolisConfig::default());
        assert!(matches!(
            mh.get_posterior_samples(&mut net, &[a], 10),
            Err(Error::ZeroProbability { .. })
        ));
    }

    #[test]
    fn test_schedule_cools_exponentially() {
        let schedule = AnnealingSchedule::exponential(100, 2.0, 0.01);
        assert!((schedule.temperature(0) - 2.0).abs() < 1e-12);
        assert!((schedule.temperature(100) - 0.01).abs() < 1e-12);
        assert!(schedule.temperature(50) < schedule.temperature(49));
    }

    #[test]
    fn test_annealing_finds_map() {
        let (mut net, a) = linear_model(0.0);
        let mut annealing = SimulatedAnnealing::with_proposal_distribution(
            MetropolisConfig::default(),
            Box::new(GaussianProposalDistribution::new(0.1)),
        );
        let best = annealing
            .get_max_a_posteriori(&mut net, AnnealingSchedule::exponential(3000, 2.0, 0.01))
            .unwrap();
        let a_best = tensor::first(&best[&a]);
        assert!((a_best - 2.0).abs() < 0.15, "a {a_best}");
        assert_eq!(tensor::first(net.value(a).unwrap()), a_best);
    }
}
