//! Convergence diagnostics for multi-chain NUTS runs: split R-hat, bulk and
//! tail ESS, MCSE and central quantiles.
//!
//! - Every statistic is computed per flattened element of a vertex.
//! - Definitions follow Vehtari et al. (2021) "Rank-normalization, folding,
//!   and localization: An improved R-hat for assessing convergence of MCMC".
//! - Statistics that need at least two draws per split chain come back NaN
//!   when there are fewer.

use crate::graph::{Graph, VertexId};
use crate::sampler::MultiChainSamples;
use statrs::distribution::{ContinuousCDF, Normal};

/// Summary of one flattened element of a sampled vertex.
#[derive(Debug, Clone)]
pub struct ElementDiagnostics {
    /// `label` for scalars, `label[i]` for elements of larger tensors.
    pub name: String,
    pub vertex: VertexId,
    pub index: usize,
    pub mean: f64,
    pub std: f64,
    pub q3: f64,
    pub q97: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
    pub mcse_mean: f64,
}

/// Full diagnostic report for a sampling run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub elements: Vec<ElementDiagnostics>,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

impl DiagnosticsReport {
    pub fn get(&self, name: &str) -> Option<&ElementDiagnostics> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// True when every R-hat is finite and at most `threshold`.
    pub fn converged(&self, threshold: f64) -> bool {
        self.elements.iter().all(|e| e.r_hat.is_finite() && e.r_hat <= threshold)
    }

    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{} chains × {} draws per chain",
            self.num_chains, self.num_draws
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<12} {:>8} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8} {:>10}",
            "Vertex", "mean", "std", "q3%", "q97%", "ess_bulk", "ess_tail", "r_hat", "mcse_mean"
        ));
        lines.push("─".repeat(96));

        for e in &self.elements {
            lines.push(format!(
                "{:<12} {:>8.4} {:>8.4} {:>10.4} {:>10.4} {:>10} {:>10} {:>8.4} {:>10.6}",
                e.name,
                e.mean,
                e.std,
                e.q3,
                e.q97,
                fmt_ess(e.ess_bulk),
                fmt_ess(e.ess_tail),
                e.r_hat,
                e.mcse_mean,
            ));
        }

        lines.push("─".repeat(96));

        if !self.accept_rates.is_empty() {
            let avg_accept = self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64;
            lines.push(format!(
                "Mean accept rate: {:.2}  │  Divergences: {}",
                avg_accept, self.divergences
            ));
        } else {
            lines.push(format!("Divergences: {}", self.divergences));
        }

        if self.elements.iter().any(|e| e.r_hat > 1.05 || !e.r_hat.is_finite()) {
            lines.push("⚠  Some R-hat values > 1.05, chains may not have converged.".to_string());
        }
        if self.elements.iter().any(|e| e.ess_bulk < 400.0 || e.ess_tail < 400.0) {
            lines.push("⚠  Some ESS values < 400, consider more samples.".to_string());
        }
        if self.divergences > 0 {
            lines.push(format!(
                "⚠  {} divergent transitions, results may be unreliable.",
                self.divergences
            ));
        }

        lines.join("\n")
    }
}

fn fmt_ess(ess: f64) -> String {
    if ess.is_finite() {
        format!("{:.0}", ess)
    } else {
        "NaN".to_string()
    }
}

/// Diagnose every element of each vertex in `vertices`. Vertices that were
/// not sampled are skipped. `graph` supplies display names.
pub fn compute_diagnostics(
    samples: &MultiChainSamples,
    graph: &Graph,
    vertices: &[VertexId],
) -> DiagnosticsReport {
    let mut elements = Vec::new();

    for &id in vertices {
        let Some(first) = samples
            .chains
            .first()
            .and_then(|c| c.get(id))
            .and_then(|s| s.as_list().first())
        else {
            continue;
        };
        let count = first.len();
        let label = graph.display_name(id);

        for index in 0..count {
            let Some(chains) = samples.element_chains(id, index) else {
                continue;
            };
            let name = if count == 1 {
                label.clone()
            } else {
                format!("{label}[{index}]")
            };
            elements.push(diagnose(name, id, index, &chains));
        }
    }

    DiagnosticsReport {
        elements,
        num_chains: samples.num_chains(),
        num_draws: samples.num_draws(),
        accept_rates: samples.accept_rates.clone(),
        divergences: samples.total_divergences(),
    }
}

fn diagnose(name: String, vertex: VertexId, index: usize, chains: &[Vec<f64>]) -> ElementDiagnostics {
    let pooled: Vec<f64> = chains.iter().flatten().copied().collect();
    let mean = mean(&pooled);
    let std = sample_std(&pooled, mean);
    let sorted = sorted(&pooled);
    let ess_bulk = ess_bulk(chains);
    let mcse_mean = if ess_bulk > 0.0 { std / ess_bulk.sqrt() } else { f64::NAN };

    ElementDiagnostics {
        name,
        vertex,
        index,
        mean,
        std,
        q3: quantile(&sorted, 0.03),
        q97: quantile(&sorted, 0.97),
        ess_bulk,
        ess_tail: ess_tail(chains),
        r_hat: split_r_hat(chains),
        mcse_mean,
    }
}

// ── Statistics ──────────────────────────────────────────────────────

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn sample_variance(data: &[f64], mean: f64) -> f64 {
    if data.len() < 2 {
        return f64::NAN;
    }
    data.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (data.len() - 1) as f64
}

fn sample_std(data: &[f64], mean: f64) -> f64 {
    sample_variance(data, mean).sqrt()
}

fn sorted(data: &[f64]) -> Vec<f64> {
    let mut s = data.to_vec();
    s.sort_unstable_by(f64::total_cmp);
    s
}

/// Linear interpolation between closest ranks.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (pos.ceil() as usize).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Each chain cut into its first and second half, so within-chain trends
/// show up as between-chain disagreement.
fn split_halves(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    chains
        .iter()
        .flat_map(|c| {
            let (first, second) = c.split_at(c.len() / 2);
            // Odd lengths drop the middle draw so both halves match.
            let second = &second[second.len() - first.len()..];
            [first, second]
        })
        .collect()
}

/// Mean within-chain variance W, or None when it is undefined or zero.
fn within_variance(halves: &[&[f64]]) -> Option<f64> {
    let n = halves.first()?.len();
    if n < 2 {
        return None;
    }
    let w = halves.iter().map(|h| sample_variance(h, mean(h))).sum::<f64>() / halves.len() as f64;
    (w > 1e-30).then_some(w)
}

fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let halves = split_halves(chains);
    let Some(w) = within_variance(&halves) else {
        return f64::NAN;
    };
    let m = halves.len() as f64;
    let n = halves[0].len() as f64;

    let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
    let grand = mean(&means);
    let b = n / (m - 1.0) * means.iter().map(|&cm| (cm - grand).powi(2)).sum::<f64>();

    let var_plus = (n - 1.0) / n * w + b / n;
    (var_plus / w).sqrt()
}

/// ESS of the rank-normalized draws.
fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    ess(&rank_normalize(chains))
}

/// Smaller of the ESS of the 5% and 95% quantile indicators.
fn ess_tail(chains: &[Vec<f64>]) -> f64 {
    let pooled: Vec<f64> = chains.iter().flatten().copied().collect();
    let sorted = sorted(&pooled);
    let q05 = quantile(&sorted, 0.05);
    let q95 = quantile(&sorted, 0.95);

    let indicator = |hit: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if hit(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = ess(&indicator(&|x: f64| x <= q05));
    let upper = ess(&indicator(&|x: f64| x >= q95));
    lower.min(upper)
}

/// Replace every draw with the normal score of its pooled rank, averaging
/// the ranks of ties.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut order: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| c.iter().enumerate().map(move |(di, &x)| (x, ci, di)))
        .collect();
    order.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let total = order.len() as f64;
    let mut scores: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return scores;
    };

    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end < order.len() && order[end].0 == order[start].0 {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        let score = normal.inverse_cdf((rank - 0.375) / (total + 0.25));
        for &(_, ci, di) in &order[start..end] {
            scores[ci][di] = score;
        }
        start = end;
    }
    scores
}

/// Split-chain ESS from autocorrelations, truncated by Geyer's initial
/// positive sequence.
fn ess(chains: &[Vec<f64>]) -> f64 {
    let halves = split_halves(chains);
    let Some(w) = within_variance(&halves) else {
        return f64::NAN;
    };
    let m = halves.len() as f64;
    let n = halves[0].len();
    let nf = n as f64;
    let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();

    let autocorrelation = |lag: usize| -> f64 {
        let gamma = halves
            .iter()
            .zip(&means)
            .map(|(h, &cm)| (0..n - lag).map(|t| (h[t] - cm) * (h[t + lag] - cm)).sum::<f64>())
            .sum::<f64>()
            / (m * (nf - 1.0));
        1.0 - (w - gamma) / w
    };

    let mut tau = -1.0;
    let mut lag = 1;
    while lag + 1 < n {
        let pair = autocorrelation(lag) + autocorrelation(lag + 1);
        if pair < 0.0 {
            break;
        }
        tau += pair;
        lag += 2;
    }
    let tau = f64::max(tau, 1.0 / (m * nf));
    m * nf / (1.0 + 2.0 * tau)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Gaussian;
    use crate::samples::NetworkSamples;
    use crate::tensor;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};
    use std::collections::HashMap;

    fn iid_chains(num_chains: usize, draws: usize, offset: impl Fn(usize) -> f64) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        (0..num_chains)
            .map(|c| {
                (0..draws)
                    .map(|_| {
                        let z: f64 = StandardNormal.sample(&mut rng);
                        z + offset(c)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_r_hat_converged() {
        let chains = iid_chains(4, 1000, |_| 0.0);
        let rh = split_r_hat(&chains);
        assert!(rh < 1.02, "R-hat should be near 1.0 for converged chains, got {}", rh);
    }

    #[test]
    fn test_r_hat_diverged() {
        let chains = iid_chains(2, 500, |c| 100.0 * c as f64);
        let rh = split_r_hat(&chains);
        assert!(rh > 1.5, "R-hat should be large for diverged chains, got {}", rh);
    }

    #[test]
    fn test_ess_of_independent_draws_is_near_total() {
        let chains = iid_chains(4, 500, |_| 0.0);
        let bulk = ess_bulk(&chains);
        assert!(bulk > 1000.0 && bulk < 3000.0, "bulk ESS {}", bulk);
        assert!(ess_tail(&chains) > 0.0);
    }

    #[test]
    fn test_ess_of_sticky_chain_is_small() {
        // Long runs of repeated values are strongly autocorrelated.
        let chains: Vec<Vec<f64>> = (0..2)
            .map(|c| (0..400).map(|i| ((i / 50 + c) % 3) as f64).collect())
            .collect();
        assert!(ess_bulk(&chains) < 100.0);
    }

    #[test]
    fn test_quantile_interpolates() {
        let s = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&s, 0.5), 2.0);
        assert!((quantile(&s, 0.1) - 0.4).abs() < 1e-12);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn test_too_few_draws_is_nan() {
        let chains = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert!(split_r_hat(&chains).is_nan());
        assert!(ess_bulk(&chains).is_nan());
    }

    #[test]
    fn test_report_names_vector_elements() {
        let mut g = Graph::new();
        let a = Gaussian::prior(&mut g, 0.0, 1.0).unwrap();
        g.set_label(a, "theta").unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let chains = (0..2)
            .map(|_| {
                let mut s = NetworkSamples::new(&[a]);
                for _ in 0..100 {
                    let x: f64 = StandardNormal.sample(&mut rng);
                    let values = HashMap::from([(a, tensor::create(vec![x, x + 5.0], &[2]).unwrap())]);
                    s.push(&values, 0.0).unwrap();
                }
                s
            })
            .collect();
        let samples = MultiChainSamples {
            chains,
            divergences: vec![0, 1],
            accept_rates: Vec::new(),
        };

        let report = compute_diagnostics(&samples, &g, &[a]);
        assert_eq!(report.elements.len(), 2);
        assert_eq!(report.num_chains, 2);
        assert_eq!(report.num_draws, 100);
        assert_eq!(report.divergences, 1);
        let second = report.get("theta[1]").unwrap();
        assert!((second.mean - 5.0).abs() < 0.5);
        assert!(second.q3 < second.mean && second.mean < second.q97);

        let table = report.to_table();
        assert!(table.contains("theta[0]"));
        assert!(table.contains("Divergences: 1"));
        assert!(!table.contains("Mean accept rate"));
    }
}
