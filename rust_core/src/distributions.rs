use crate::error::{Error, Result};
use crate::graph::{Graph, VertexId};
use crate::tensor::{self, Tensor};
use rand::Rng;
use rand_distr::{Beta, Distribution as _, Exp, StandardNormal};
use statrs::function::gamma::{digamma, ln_gamma};
use std::f64::consts::PI;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// The distribution attached to a probabilistic vertex, with its parameter vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Gaussian { mu: VertexId, sigma: VertexId },
    /// Gaussian folded at zero, support `x >= 0`.
    HalfGaussian { sigma: VertexId },
    /// Support `lower <= x < upper`.
    Uniform { lower: VertexId, upper: VertexId },
    Exponential { rate: VertexId },
    Beta { alpha: VertexId, beta: VertexId },
}

/// Derivatives of a vertex's log density.
///
/// `wrt_value` has the vertex's shape; `wrt_params[i]` has the shape of the
/// i-th parameter vertex, already summed down when that parameter was
/// broadcast.
#[derive(Debug, Clone)]
pub struct DLogProb {
    pub wrt_value: Tensor,
    pub wrt_params: Vec<Tensor>,
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Gaussian { .. } => "Gaussian",
            Distribution::HalfGaussian { .. } => "HalfGaussian",
            Distribution::Uniform { .. } => "Uniform",
            Distribution::Exponential { .. } => "Exponential",
            Distribution::Beta { .. } => "Beta",
        }
    }

    pub fn named_parameters(&self) -> Vec<(&'static str, VertexId)> {
        match *self {
            Distribution::Gaussian { mu, sigma } => vec![("mu", mu), ("sigma", sigma)],
            Distribution::HalfGaussian { sigma } => vec![("sigma", sigma)],
            Distribution::Uniform { lower, upper } => vec![("lower", lower), ("upper", upper)],
            Distribution::Exponential { rate } => vec![("rate", rate)],
            Distribution::Beta { alpha, beta } => vec![("alpha", alpha), ("beta", beta)],
        }
    }

    pub fn parameters(&self) -> Vec<VertexId> {
        self.named_parameters().into_iter().map(|(_, id)| id).collect()
    }

    /// Joint log density of every element of `value`.
    pub fn log_prob(&self, value: &Tensor, params: &[&Tensor]) -> Result<f64> {
        let flat = broadcast_params(value.shape(), params)?;
        let mut total = 0.0;
        for (i, &x) in value.iter().enumerate() {
            let p: Vec<f64> = flat.iter().map(|f| f[i]).collect();
            total += self.element_log_prob(x, &p);
        }
        Ok(total)
    }

    pub fn d_log_prob(&self, value: &Tensor, params: &[&Tensor]) -> Result<DLogProb> {
        let shape = value.shape().to_vec();
        let flat = broadcast_params(&shape, params)?;
        let mut d_value = Vec::with_capacity(value.len());
        let mut d_params: Vec<Vec<f64>> = vec![Vec::with_capacity(value.len()); params.len()];
        for (i, &x) in value.iter().enumerate() {
            let p: Vec<f64> = flat.iter().map(|f| f[i]).collect();
            let (dx, dp) = self.element_d_log_prob(x, &p);
            d_value.push(dx);
            for (acc, d) in d_params.iter_mut().zip(dp) {
                acc.push(d);
            }
        }
        let wrt_params = d_params
            .into_iter()
            .zip(params.iter())
            .map(|(d, param)| tensor::sum_to_shape(&tensor::create(d, &shape)?, param.shape()))
            .collect::<Result<Vec<_>>>()?;
        Ok(DLogProb {
            wrt_value: tensor::create(d_value, &shape)?,
            wrt_params,
        })
    }

    /// Draw a tensor of `shape` given the parameters' current values.
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], params: &[&Tensor], rng: &mut R) -> Result<Tensor> {
        let flat = broadcast_params(shape, params)?;
        let n = tensor::element_count(shape);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let p: Vec<f64> = flat.iter().map(|f| f[i]).collect();
            out.push(self.element_sample(&p, rng)?);
        }
        tensor::create(out, shape)
    }

    fn element_log_prob(&self, x: f64, p: &[f64]) -> f64 {
        match self {
            Distribution::Gaussian { .. } => {
                let (mu, sigma) = (p[0], p[1]);
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
            }
            Distribution::HalfGaussian { .. } => {
                if x < 0.0 {
                    return f64::NEG_INFINITY;
                }
                let sigma = p[0];
                let z = x / sigma;
                -0.5 * z * z - sigma.ln() + (2.0 / PI).sqrt().ln()
            }
            Distribution::Uniform { .. } => {
                let (lower, upper) = (p[0], p[1]);
                if x >= lower && x < upper {
                    -(upper - lower).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            Distribution::Exponential { .. } => {
                let rate = p[0];
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    rate.ln() - rate * x
                }
            }
            Distribution::Beta { .. } => {
                let (a, b) = (p[0], p[1]);
                if x <= 0.0 || x >= 1.0 {
                    return f64::NEG_INFINITY;
                }
                (a - 1.0) * x.ln() + (b - 1.0) * (1.0 - x).ln() - ln_beta(a, b)
            }
        }
    }

    fn element_d_log_prob(&self, x: f64, p: &[f64]) -> (f64, Vec<f64>) {
        match self {
            Distribution::Gaussian { .. } => {
                let (mu, sigma) = (p[0], p[1]);
                let diff = x - mu;
                let s2 = sigma * sigma;
                (-diff / s2, vec![diff / s2, diff * diff / (s2 * sigma) - 1.0 / sigma])
            }
            Distribution::HalfGaussian { .. } => {
                let sigma = p[0];
                let s2 = sigma * sigma;
                (-x / s2, vec![x * x / (s2 * sigma) - 1.0 / sigma])
            }
            Distribution::Uniform { .. } => {
                let range = p[1] - p[0];
                (0.0, vec![1.0 / range, -1.0 / range])
            }
            Distribution::Exponential { .. } => {
                let rate = p[0];
                (-rate, vec![1.0 / rate - x])
            }
            Distribution::Beta { .. } => {
                let (a, b) = (p[0], p[1]);
                let common = digamma(a + b);
                (
                    (a - 1.0) / x - (b - 1.0) / (1.0 - x),
                    vec![x.ln() - digamma(a) + common, (1.0 - x).ln() - digamma(b) + common],
                )
            }
        }
    }

    fn element_sample<R: Rng + ?Sized>(&self, p: &[f64], rng: &mut R) -> Result<f64> {
        match self {
            Distribution::Gaussian { .. } => {
                let z: f64 = StandardNormal.sample(rng);
                Ok(p[0] + p[1] * z)
            }
            Distribution::HalfGaussian { .. } => {
                let z: f64 = StandardNormal.sample(rng);
                Ok((p[0] * z).abs())
            }
            Distribution::Uniform { .. } => Ok(p[0] + (p[1] - p[0]) * rng.gen::<f64>()),
            Distribution::Exponential { .. } => {
                let exp = Exp::new(p[0]).map_err(|e| self.invalid(e))?;
                Ok(exp.sample(rng))
            }
            Distribution::Beta { .. } => {
                let beta = Beta::new(p[0], p[1]).map_err(|e| self.invalid(e))?;
                Ok(beta.sample(rng))
            }
        }
    }

    fn invalid(&self, e: impl std::fmt::Display) -> Error {
        Error::InvalidParameter {
            distribution: self.name(),
            reason: e.to_string(),
        }
    }
}

fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// Expand every parameter to a flat vector with one entry per element of `shape`.
fn broadcast_params(shape: &[usize], params: &[&Tensor]) -> Result<Vec<Vec<f64>>> {
    params
        .iter()
        .map(|p| Ok(tensor::broadcast_to(p, shape)?.iter().copied().collect()))
        .collect()
}

// ── Gaussian ────────────────────────────────────────────────────────

pub struct Gaussian;

impl Gaussian {
    pub fn prior(graph: &mut Graph, mu: f64, sigma: f64) -> Result<VertexId> {
        let mu = graph.scalar(mu);
        let sigma = graph.scalar(sigma);
        graph.gaussian(mu, sigma)
    }

    /// Observe `data` as Gaussian noise around `mu`, one element per datum.
    pub fn observed(graph: &mut Graph, mu: VertexId, sigma: f64, data: Tensor) -> Result<VertexId> {
        let sigma = graph.scalar(sigma);
        let shape = data.shape().to_vec();
        let id = graph.random_with_shape(&shape, Distribution::Gaussian { mu, sigma })?;
        graph.observe(id, data)?;
        Ok(id)
    }
}

// ── HalfGaussian ────────────────────────────────────────────────────

pub struct HalfGaussian;

impl HalfGaussian {
    pub fn prior(graph: &mut Graph, sigma: f64) -> Result<VertexId> {
        let sigma = graph.scalar(sigma);
        graph.half_gaussian(sigma)
    }
}

// ── Uniform ─────────────────────────────────────────────────────────

pub struct Uniform;

impl Uniform {
    pub fn prior(graph: &mut Graph, lower: f64, upper: f64) -> Result<VertexId> {
        let lower = graph.scalar(lower);
        let upper = graph.scalar(upper);
        graph.uniform(lower, upper)
    }
}

// ── Exponential ─────────────────────────────────────────────────────

pub struct Exponential;

impl Exponential {
    pub fn prior(graph: &mut Graph, rate: f64) -> Result<VertexId> {
        let rate = graph.scalar(rate);
        graph.exponential(rate)
    }
}

// ── Beta ────────────────────────────────────────────────────────────

pub struct BetaPrior;

impl BetaPrior {
    pub fn prior(graph: &mut Graph, alpha: f64, beta: f64) -> Result<VertexId> {
        let alpha = graph.scalar(alpha);
        let beta = graph.scalar(beta);
        graph.beta(alpha, beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_diff(f: impl Fn(f64) -> f64, x: f64) -> f64 {
        let h = 1e-6;
        (f(x + h) - f(x - h)) / (2.0 * h)
    }

    #[test]
    fn test_gaussian_log_prob_matches_closed_form() {
        let d = Distribution::Gaussian { mu: VertexId(0), sigma: VertexId(1) };
        let lp = d
            .log_prob(&tensor::scalar(1.0), &[&tensor::scalar(0.0), &tensor::scalar(1.0)])
            .unwrap();
        assert!((lp - (-0.5 - LN_SQRT_2PI)).abs() < 1e-12);
    }

    #[test]
    fn test_d_log_prob_matches_finite_difference() {
        let cases = [
            (Distribution::Gaussian { mu: VertexId(0), sigma: VertexId(1) }, 0.7, vec![0.2, 1.3]),
            (Distribution::HalfGaussian { sigma: VertexId(0) }, 0.9, vec![1.7]),
            (Distribution::Exponential { rate: VertexId(0) }, 0.4, vec![2.5]),
            (Distribution::Beta { alpha: VertexId(0), beta: VertexId(1) }, 0.3, vec![2.0, 3.5]),
        ];
        for (d, x, params) in cases {
            let lp = |x: f64, p: &[f64]| d.element_log_prob(x, p);
            let (dx, dp) = d.element_d_log_prob(x, &params);
            assert!((dx - finite_diff(|v| lp(v, &params), x)).abs() < 1e-5, "{}", d.name());
            for i in 0..params.len() {
                let numeric = finite_diff(
                    |v| {
                        let mut p = params.clone();
                        p[i] = v;
                        lp(x, &p)
                    },
                    params[i],
                );
                assert!((dp[i] - numeric).abs() < 1e-5, "{} param {}", d.name(), i);
            }
        }
    }

    #[test]
    fn test_uniform_outside_support_is_impossible() {
        let d = Distribution::Uniform { lower: VertexId(0), upper: VertexId(1) };
        let params = [&tensor::scalar(0.0), &tensor::scalar(1.0)];
        assert_eq!(d.log_prob(&tensor::scalar(-1.0), &params).unwrap(), f64::NEG_INFINITY);
        assert_eq!(d.log_prob(&tensor::scalar(0.5), &params).unwrap(), 0.0);
    }

    #[test]
    fn test_broadcast_parameter_gradient_is_summed() {
        let d = Distribution::Gaussian { mu: VertexId(0), sigma: VertexId(1) };
        let x = tensor::create(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let dlp = d.d_log_prob(&x, &[&tensor::scalar(0.0), &tensor::scalar(1.0)]).unwrap();
        assert_eq!(dlp.wrt_value.shape(), &[3]);
        assert_eq!(dlp.wrt_params[0].shape(), &[] as &[usize]);
        assert!((tensor::first(&dlp.wrt_params[0]) - 6.0).abs() < 1e-12);
    }
}
