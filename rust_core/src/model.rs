use crate::autodiff::LogProbGradientCalculator;
use crate::error::{Error, Result};
use crate::graph::{Graph, VertexId};
use crate::propagation::{cascade_update, lazy_eval, lazy_eval_all};
use crate::tensor::Tensor;
use rand::Rng;
use std::collections::HashMap;

/// What sampling and optimization algorithms need from a model.
pub trait ProbabilisticModel {
    /// Latent vertices in ascending id order.
    fn latent_variables(&self) -> &[VertexId];

    fn value(&self, id: VertexId) -> Option<&Tensor>;

    /// Set values and propagate them to deterministic descendants.
    fn set_values(&mut self, values: &HashMap<VertexId, Tensor>) -> Result<()>;

    /// Joint log probability of every probabilistic vertex at the current state.
    fn log_prob(&self) -> Result<f64>;

    /// Log probability of the observed vertices only.
    fn log_likelihood(&self) -> Result<f64>;

    fn log_prob_at(&mut self, inputs: &HashMap<VertexId, Tensor>) -> Result<f64> {
        self.set_values(inputs)?;
        self.log_prob()
    }
}

pub trait ProbabilisticModelWithGradient: ProbabilisticModel {
    /// d(log prob)/d(latent) for every latent.
    fn log_prob_gradients(&self) -> Result<HashMap<VertexId, Tensor>>;

    /// d(log likelihood)/d(latent) for every latent.
    fn log_likelihood_gradients(&self) -> Result<HashMap<VertexId, Tensor>>;
}

/// Evaluate chosen outputs of a model for given inputs.
pub trait ComputableModel {
    fn compute(
        &mut self,
        inputs: &HashMap<VertexId, Tensor>,
        outputs: &[VertexId],
    ) -> Result<HashMap<VertexId, Tensor>>;

    fn get_input(&self, input: VertexId) -> Option<&Tensor>;
}

impl ComputableModel for Graph {
    fn compute(
        &mut self,
        inputs: &HashMap<VertexId, Tensor>,
        outputs: &[VertexId],
    ) -> Result<HashMap<VertexId, Tensor>> {
        let mut roots: Vec<VertexId> = inputs.keys().copied().collect();
        roots.sort();
        for &id in &roots {
            self.set_value(id, inputs[&id].clone())?;
        }
        cascade_update(self, &roots)?;
        lazy_eval(self, outputs)?;
        outputs
            .iter()
            .map(|&id| Ok((id, self.value_of(id)?.clone())))
            .collect()
    }

    fn get_input(&self, input: VertexId) -> Option<&Tensor> {
        self.get(input).ok()?.value()
    }
}

/// A graph viewed as a joint distribution over its probabilistic vertices.
///
/// Latent vertices are the probabilistic vertices that are not observed.
/// Construction gives every vertex a value, sampling latents that have none.
///
/// The latent / observed partition and the gradient calculators are fixed at
/// construction. The network only hands out a shared view of its graph, so
/// observing or unobserving a vertex means taking the graph back with
/// [`BayesianNetwork::into_graph`] and building a new network from it.
#[derive(Debug, Clone)]
pub struct BayesianNetwork {
    graph: Graph,
    latent: Vec<VertexId>,
    observed: Vec<VertexId>,
    probabilistic: Vec<VertexId>,
    log_prob_gradient: LogProbGradientCalculator,
    log_likelihood_gradient: LogProbGradientCalculator,
}

impl BayesianNetwork {
    pub fn new(mut graph: Graph) -> Result<Self> {
        lazy_eval_all(&mut graph)?;
        let latent = graph.latent_vertices();
        let observed = graph.observed_vertices();
        let probabilistic = graph.probabilistic_vertices();
        let log_prob_gradient = LogProbGradientCalculator::new(&graph, &probabilistic, &latent)?;
        let log_likelihood_gradient = LogProbGradientCalculator::new(&graph, &observed, &latent)?;
        Ok(Self {
            graph,
            latent,
            observed,
            probabilistic,
            log_prob_gradient,
            log_likelihood_gradient,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Reseed the generator the graph uses for its own prior draws.
    pub fn reseed(&mut self, seed: u64) {
        self.graph.reseed(seed);
    }

    pub fn latent_vertices(&self) -> &[VertexId] {
        &self.latent
    }

    pub fn observed_vertices(&self) -> &[VertexId] {
        &self.observed
    }

    pub fn deterministic_vertices(&self) -> Vec<VertexId> {
        self.graph
            .vertices()
            .filter(|v| !v.is_probabilistic())
            .map(|v| v.id)
            .collect()
    }

    pub fn vertex_by_label(&self, label: &str) -> Result<VertexId> {
        self.graph.vertex_by_label(label)
    }

    /// Set one value and cascade it.
    pub fn set_and_cascade(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        self.graph.set_and_cascade(id, value)
    }

    /// Sum of log densities of `vertices`, short-circuiting on an impossible one.
    pub fn log_prob_of(&self, vertices: &[VertexId]) -> Result<f64> {
        let mut total = 0.0;
        for &id in vertices {
            total += self.graph.log_prob(id)?;
            if total == f64::NEG_INFINITY {
                break;
            }
        }
        Ok(total)
    }

    /// Log likelihood plus the log priors of the given latents only.
    pub fn log_likelihood_with_priors_of(&self, latents: &[VertexId]) -> Result<f64> {
        Ok(self.log_prob_of(&self.observed)? + self.log_prob_of(latents)?)
    }

    /// Resample latents from their priors, in id order, until the joint
    /// log probability is finite.
    pub fn probe_for_non_zero_probability<R: Rng + ?Sized>(&mut self, attempts: usize, rng: &mut R) -> Result<()> {
        if self.log_prob()?.is_finite() {
            return Ok(());
        }
        for attempt in 0..attempts {
            for &id in &self.latent {
                let value = self.graph.sample_from_prior(id, rng)?;
                self.graph.set_and_cascade(id, value)?;
            }
            if self.log_prob()?.is_finite() {
                tracing::debug!(attempt, "found non-zero probability state");
                return Ok(());
            }
        }
        tracing::warn!(attempts, "no non-zero probability state found");
        Err(Error::ProbeFailed(attempts))
    }

    /// Snapshot of the latent values.
    pub fn latent_values(&self) -> Result<HashMap<VertexId, Tensor>> {
        self.latent
            .iter()
            .map(|&id| Ok((id, self.graph.value_of(id)?.clone())))
            .collect()
    }
}

impl ProbabilisticModel for BayesianNetwork {
    fn latent_variables(&self) -> &[VertexId] {
        &self.latent
    }

    fn value(&self, id: VertexId) -> Option<&Tensor> {
        self.graph.get(id).ok()?.value()
    }

    fn set_values(&mut self, values: &HashMap<VertexId, Tensor>) -> Result<()> {
        let mut roots: Vec<VertexId> = values.keys().copied().collect();
        roots.sort();
        for &id in &roots {
            self.graph.set_value(id, values[&id].clone())?;
        }
        cascade_update(&mut self.graph, &roots)
    }

    fn log_prob(&self) -> Result<f64> {
        self.log_prob_of(&self.probabilistic)
    }

    fn log_likelihood(&self) -> Result<f64> {
        self.log_prob_of(&self.observed)
    }
}

impl ProbabilisticModelWithGradient for BayesianNetwork {
    fn log_prob_gradients(&self) -> Result<HashMap<VertexId, Tensor>> {
        self.log_prob_gradient.gradient(&self.graph)
    }

    fn log_likelihood_gradients(&self) -> Result<HashMap<VertexId, Tensor>> {
        self.log_likelihood_gradient.gradient(&self.graph)
    }
}

/// Delegates to a network but fails every gradient request once `remaining`
/// has run out.
#[cfg(test)]
pub(crate) struct GradientBudget {
    pub(crate) network: BayesianNetwork,
    pub(crate) remaining: std::cell::Cell<usize>,
}

#[cfg(test)]
impl GradientBudget {
    pub(crate) fn new(network: BayesianNetwork, remaining: usize) -> Self {
        Self {
            network,
            remaining: std::cell::Cell::new(remaining),
        }
    }

    fn spend(&self) -> Result<()> {
        match self.remaining.get() {
            0 => Err(Error::InvalidArgument {
                arg: "gradient",
                reason: "budget exhausted".to_string(),
            }),
            n => {
                self.remaining.set(n - 1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
impl ProbabilisticModel for GradientBudget {
    fn latent_variables(&self) -> &[VertexId] {
        self.network.latent_variables()
    }

    fn value(&self, id: VertexId) -> Option<&Tensor> {
        self.network.value(id)
    }

    fn set_values(&mut self, values: &HashMap<VertexId, Tensor>) -> Result<()> {
        self.network.set_values(values)
    }

    fn log_prob(&self) -> Result<f64> {
        self.network.log_prob()
    }

    fn log_likelihood(&self) -> Result<f64> {
        self.network.log_likelihood()
    }
}

#[cfg(test)]
impl ProbabilisticModelWithGradient for GradientBudget {
    fn log_prob_gradients(&self) -> Result<HashMap<VertexId, Tensor>> {
        self.spend()?;
        self.network.log_prob_gradients()
    }

    fn log_likelihood_gradients(&self) -> Result<HashMap<VertexId, Tensor>> {
        self.spend()?;
        self.network.log_likelihood_gradients()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Gaussian, Uniform};
    use crate::tensor;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn linear_model() -> (BayesianNetwork, VertexId, VertexId) {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        let two = g.scalar(2.0);
        let b = g.mul(a, two).unwrap();
        let c = Gaussian::observed(&mut g, b, 1.0, tensor::scalar(5.0)).unwrap();
        g.set_value(a, tensor::scalar(1.0)).unwrap();
        (BayesianNetwork::new(g).unwrap(), a, c)
    }

    #[test]
    fn test_partition() {
        let (net, a, c) = linear_model();
        assert_eq!(net.latent_vertices(), &[a]);
        assert_eq!(net.observed_vertices(), &[c]);
        assert!(net.graph().value(c).is_some());
    }

    #[test]
    fn test_partition_follows_graph_after_rebuild() {
        let (net, a, c) = linear_model();
        let mut g = net.into_graph();
        g.unobserve(c).unwrap();
        g.observe(a, tensor::scalar(0.5)).unwrap();

        let net = BayesianNetwork::new(g).unwrap();
        assert_eq!(net.latent_vertices(), &[c]);
        assert_eq!(net.observed_vertices(), &[a]);
        let gradient = net.log_prob_gradients().unwrap();
        assert_eq!(gradient.keys().copied().collect::<Vec<_>>(), vec![c]);
        // c = 5 under N(2 * 0.5, 1)
        assert!((tensor::first(&gradient[&c]) + 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_log_prob_and_likelihood() {
        let (net, _, _) = linear_model();
        let ln_norm = -(2.0 * std::f64::consts::PI).sqrt().ln();
        let expected_likelihood = -4.5 + ln_norm;
        let expected_prior = -0.5 + ln_norm;
        assert!((net.log_likelihood().unwrap() - expected_likelihood).abs() < 1e-12);
        assert!((net.log_prob().unwrap() - expected_likelihood - expected_prior).abs() < 1e-12);
    }

    #[test]
    fn test_likelihood_gradient_excludes_prior() {
        let (net, a, _) = linear_model();
        let full = net.log_prob_gradients().unwrap();
        let likelihood = net.log_likelihood_gradients().unwrap();
        assert!((tensor::first(&full[&a]) - 5.0).abs() < 1e-12);
        assert!((tensor::first(&likelihood[&a]) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_probe_finds_support() {
        let mut g = Graph::new();
        let u = Uniform::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_value(u, tensor::scalar(-1.0)).unwrap();
        let mut net = BayesianNetwork::new(g).unwrap();
        assert_eq!(net.log_prob().unwrap(), f64::NEG_INFINITY);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        net.probe_for_non_zero_probability(10, &mut rng).unwrap();
        assert!(net.log_prob().unwrap().is_finite());
    }

    #[test]
    fn test_compute_outputs_from_inputs() {
        let mut g = Graph::new();
        let x = g.scalar(1.0);
        let y = g.scalar(2.0);
        let z = g.mul(x, y).unwrap();
        let mut inputs = HashMap::new();
        inputs.insert(x, tensor::scalar(3.0));
        let out = g.compute(&inputs, &[z]).unwrap();
        assert_eq!(tensor::first(&out[&z]), 6.0);
        assert_eq!(tensor::first(g.get_input(x).unwrap()), 3.0);
    }
}
