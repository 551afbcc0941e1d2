use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::model::BayesianNetwork;
use crate::nuts::{Nuts, NutsConfig};
use crate::progress::{spawn_progress_thread, ChainProgress, ProgressState};
use crate::samples::{Metrics, NetworkSamples};
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::sync::Arc;

/// Configuration for the multi-chain sampler.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub num_chains: usize,
    /// Iterations per chain, adaptation included.
    pub num_samples: usize,
    /// Per-chain NUTS settings. The chain seed overrides `nuts.seed`.
    pub nuts: NutsConfig,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
    /// Prior resampling attempts when a dispersed start has zero probability.
    pub probe_attempts: usize,
    pub show_progress: bool,
    /// Discard the adaptation iterations from each chain.
    pub drop_adaptation: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_samples: 1000,
            nuts: NutsConfig::default(),
            seed: 42,
            num_threads: 0,
            probe_attempts: 100,
            show_progress: false,
            drop_adaptation: true,
        }
    }
}

/// Samples from every chain, kept separate for convergence diagnostics.
#[derive(Debug, Clone)]
pub struct MultiChainSamples {
    pub chains: Vec<NetworkSamples>,
    /// Divergent transitions per chain.
    pub divergences: Vec<usize>,
    /// Mean tree acceptance per chain over the retained iterations.
    pub accept_rates: Vec<f64>,
}

impl MultiChainSamples {
    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    /// Retained draws per chain.
    pub fn num_draws(&self) -> usize {
        self.chains.first().map_or(0, NetworkSamples::len)
    }

    pub fn total_divergences(&self) -> usize {
        self.divergences.iter().sum()
    }

    /// Element-wise posterior mean of a vertex pooled over all chains.
    pub fn mean(&self, id: VertexId) -> Option<Tensor> {
        let mut total: Option<Tensor> = None;
        let mut count = 0usize;
        for chain in &self.chains {
            for sample in chain.get(id)?.as_list() {
                match total.as_mut() {
                    Some(t) => *t += sample,
                    None => total = Some(sample.clone()),
                }
                count += 1;
            }
        }
        total.map(|t| t / count as f64)
    }

    /// traces[chain][draw] of one flattened element of a vertex.
    pub fn element_chains(&self, id: VertexId, index: usize) -> Option<Vec<Vec<f64>>> {
        self.chains
            .iter()
            .map(|chain| chain.get(id).map(|s| s.element(index)))
            .collect()
    }
}

/// Run parallel NUTS chains on clones of `network`.
///
/// Each chain draws its starting point from the priors and samples with a
/// generator seeded from `config.seed + chain_index`, so results do not depend
/// on thread scheduling. `network` itself is left untouched.
pub fn sample(
    network: &BayesianNetwork,
    vertices: &[VertexId],
    config: &SamplerConfig,
) -> Result<MultiChainSamples> {
    if config.num_chains == 0 {
        return Err(Error::InvalidArgument {
            arg: "num_chains",
            reason: "must be at least 1".to_string(),
        });
    }
    config.nuts.validate()?;

    if config.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build_global()
            .ok();
    }

    let adapt_count = if config.nuts.adapt_enabled { config.nuts.adapt_count } else { 0 };
    let progress = Arc::new(ProgressState::new(config.num_chains, config.num_samples, adapt_count));
    let renderer = config.show_progress.then(|| spawn_progress_thread(Arc::clone(&progress)));

    tracing::info!(
        chains = config.num_chains,
        samples = config.num_samples,
        "starting multi-chain NUTS"
    );

    let results: Result<Vec<ChainResult>> = progress
        .chains()
        .par_iter()
        .enumerate()
        .map(|(chain_idx, chain_progress)| run_chain(network, vertices, config, chain_idx, chain_progress))
        .collect();

    progress.finish();
    if let Some(handle) = renderer {
        handle.join().ok();
    }
    let results = results?;

    let mut chains = Vec::with_capacity(results.len());
    let mut divergences = Vec::with_capacity(results.len());
    let mut accept_rates = Vec::with_capacity(results.len());
    for r in results {
        chains.push(r.samples);
        divergences.push(r.divergences);
        accept_rates.push(r.accept_rate);
    }

    tracing::info!(
        divergences = divergences.iter().sum::<usize>(),
        "finished multi-chain NUTS"
    );

    Ok(MultiChainSamples {
        chains,
        divergences,
        accept_rates,
    })
}

struct ChainResult {
    samples: NetworkSamples,
    divergences: usize,
    accept_rate: f64,
}

fn run_chain(
    network: &BayesianNetwork,
    vertices: &[VertexId],
    config: &SamplerConfig,
    chain_idx: usize,
    progress: &ChainProgress,
) -> Result<ChainResult> {
    let chain_seed = config.seed + chain_idx as u64;
    let mut rng = ChaCha8Rng::seed_from_u64(chain_seed);
    let mut chain = network.clone();
    chain.reseed(chain_seed);

    for id in chain.latent_vertices().to_vec() {
        let start = chain.graph().sample_from_prior(id, &mut rng)?;
        chain.set_and_cascade(id, start)?;
    }
    chain.probe_for_non_zero_probability(config.probe_attempts, &mut rng)?;

    let mut nuts = Nuts::new(NutsConfig {
        seed: chain_seed,
        save_statistics: true,
        ..config.nuts.clone()
    });
    let samples = nuts.get_posterior_samples_with_progress(&mut chain, vertices, config.num_samples, progress)?;

    let warmup = if config.drop_adaptation && config.nuts.adapt_enabled {
        config.nuts.adapt_count
    } else {
        0
    };
    let accepts = nuts.statistics().get(Metrics::MeanTreeAccept);
    let retained = &accepts[warmup.min(accepts.len())..];
    let accept_rate = if retained.is_empty() {
        0.0
    } else {
        retained.iter().sum::<f64>() / retained.len() as f64
    };
    tracing::debug!(chain = chain_idx, accept_rate, divergences = nuts.divergences(), "chain finished");

    Ok(ChainResult {
        samples: samples.drop(warmup),
        divergences: nuts.divergences(),
        accept_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Gaussian;
    use crate::graph::Graph;
    use crate::tensor;

    fn posterior_network() -> (BayesianNetwork, VertexId) {
        // A ~ N(0, 1), B ~ N(A, 1) observed at 2 gives A | B ~ N(1, 1/2).
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        let one = g.scalar(1.0);
        let b = g.gaussian(a, one).unwrap();
        g.observe(b, tensor::scalar(2.0)).unwrap();
        (BayesianNetwork::new(g).unwrap(), a)
    }

    fn small_config() -> SamplerConfig {
        SamplerConfig {
            num_chains: 2,
            num_samples: 600,
            nuts: NutsConfig {
                adapt_count: 200,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_chains_are_separate_and_adaptation_dropped() {
        let (net, a) = posterior_network();
        let result = sample(&net, &[a], &small_config()).unwrap();
        assert_eq!(result.num_chains(), 2);
        assert_eq!(result.num_draws(), 400);
        assert_eq!(result.divergences.len(), 2);
        assert_eq!(result.accept_rates.len(), 2);
        for rate in &result.accept_rates {
            assert!((0.0..=1.0).contains(rate));
        }
        let traces = result.element_chains(a, 0).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].len(), 400);
    }

    #[test]
    fn test_pooled_mean_matches_posterior() {
        let (net, a) = posterior_network();
        let result = sample(&net, &[a], &small_config()).unwrap();
        let mean = tensor::first(&result.mean(a).unwrap());
        assert!((mean - 1.0).abs() < 0.2, "mean {mean}");
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let (net, a) = posterior_network();
        let config = SamplerConfig {
            num_samples: 50,
            nuts: NutsConfig {
                adapt_count: 20,
                ..Default::default()
            },
            ..small_config()
        };
        let first = sample(&net, &[a], &config).unwrap();
        let second = sample(&net, &[a], &config).unwrap();
        assert_eq!(first.element_chains(a, 0), second.element_chains(a, 0));
    }

    #[test]
    fn test_input_network_untouched() {
        let (net, a) = posterior_network();
        let before = net.graph().value(a).cloned();
        sample(&net, &[a], &small_config()).unwrap();
        assert_eq!(net.graph().value(a).cloned(), before);
    }

    #[test]
    fn test_zero_chains_rejected() {
        let (net, a) = posterior_network();
        let config = SamplerConfig {
            num_chains: 0,
            ..Default::default()
        };
        assert!(matches!(
            sample(&net, &[a], &config),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_invalid_nuts_config_rejected_before_sampling() {
        let (net, a) = posterior_network();
        let config = SamplerConfig {
            nuts: NutsConfig {
                target_acceptance_prob: 1.5,
                ..Default::default()
            },
            ..small_config()
        };
        assert!(matches!(
            sample(&net, &[a], &config),
            Err(Error::InvalidArgument { arg: "target_acceptance_prob", .. })
        ));
    }

    #[test]
    fn test_unknown_vertex_is_missing() {
        let (net, _) = posterior_network();
        let config = SamplerConfig {
            num_chains: 1,
            num_samples: 5,
            ..Default::default()
        };
        assert!(sample(&net, &[VertexId(99)], &config).is_err());
    }
}
