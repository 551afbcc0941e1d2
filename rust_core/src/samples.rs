//! Sample containers shared by every sampler.

use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::tensor::Tensor;
use std::collections::{BTreeMap, HashMap};

/// Per-iteration samples of a set of vertices, plus the joint log
/// probability of the model at each retained iteration.
#[derive(Debug, Clone, Default)]
pub struct NetworkSamples {
    samples: BTreeMap<VertexId, Vec<Tensor>>,
    log_probs: Vec<f64>,
}

impl NetworkSamples {
    pub fn new(vertices: &[VertexId]) -> Self {
        Self {
            samples: vertices.iter().map(|&id| (id, Vec::new())).collect(),
            log_probs: Vec::new(),
        }
    }

    /// Record one iteration. `values` must hold every tracked vertex.
    pub fn push(&mut self, values: &HashMap<VertexId, Tensor>, log_prob: f64) -> Result<()> {
        if let Some(&missing) = self.samples.keys().find(|id| !values.contains_key(id)) {
            return Err(Error::MissingValue(missing));
        }
        for (id, series) in self.samples.iter_mut() {
            series.push(values[id].clone());
        }
        self.log_probs.push(log_prob);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.samples.keys().copied()
    }

    pub fn get(&self, id: VertexId) -> Option<VertexSamples<'_>> {
        self.samples.get(&id).map(|s| VertexSamples { samples: s })
    }

    pub fn log_probs(&self) -> &[f64] {
        &self.log_probs
    }

    /// Discard the first `count` iterations.
    pub fn drop(mut self, count: usize) -> Self {
        let count = count.min(self.len());
        for series in self.samples.values_mut() {
            series.drain(..count);
        }
        self.log_probs.drain(..count);
        self
    }

    /// Keep every `by`-th iteration.
    pub fn down_sample(self, by: usize) -> Result<Self> {
        if by == 0 {
            return Err(Error::InvalidArgument {
                arg: "by",
                reason: "must be at least 1".to_string(),
            });
        }
        let keep = |v: Vec<Tensor>| v.into_iter().step_by(by).collect();
        Ok(Self {
            samples: self.samples.into_iter().map(|(id, s)| (id, keep(s))).collect(),
            log_probs: self.log_probs.into_iter().step_by(by).collect(),
        })
    }

    /// Values of every tracked vertex at the iteration with the highest log
    /// probability.
    pub fn most_probable(&self) -> Option<HashMap<VertexId, Tensor>> {
        let (best, _) = self
            .log_probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        Some(self.samples.iter().map(|(&id, s)| (id, s[best].clone())).collect())
    }

    /// Fraction of iterations for which `predicate` holds.
    pub fn probability(&self, predicate: impl Fn(&HashMap<VertexId, &Tensor>) -> bool) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let hits = (0..self.len())
            .filter(|&i| {
                let state: HashMap<VertexId, &Tensor> =
                    self.samples.iter().map(|(&id, s)| (id, &s[i])).collect();
                predicate(&state)
            })
            .count();
        hits as f64 / self.len() as f64
    }
}

/// Borrowed view of one vertex's samples.
#[derive(Debug, Clone, Copy)]
pub struct VertexSamples<'a> {
    samples: &'a [Tensor],
}

impl<'a> VertexSamples<'a> {
    pub fn as_list(&self) -> &'a [Tensor] {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Element-wise mean.
    pub fn mean(&self) -> Option<Tensor> {
        let first = self.samples.first()?;
        let mut total = Tensor::zeros(first.raw_dim());
        for s in self.samples {
            total += s;
        }
        Some(total / self.samples.len() as f64)
    }

    /// Samples of a single flattened element.
    pub fn element(&self, index: usize) -> Vec<f64> {
        self.samples
            .iter()
            .filter_map(|t| t.iter().nth(index).copied())
            .collect()
    }
}

// ── Sampler statistics ─────────────────────────────────────────────────────

/// Per-iteration quantities a sampler can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metrics {
    StepSize,
    LogProb,
    MeanTreeAccept,
    TreeSize,
}

impl Metrics {
    pub fn key(&self) -> &'static str {
        match self {
            Metrics::StepSize => "stepSize",
            Metrics::LogProb => "logProb",
            Metrics::MeanTreeAccept => "meanTreeAccept",
            Metrics::TreeSize => "treeSize",
        }
    }
}

/// Named per-iteration series.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    series: BTreeMap<String, Vec<f64>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, metric: Metrics, value: f64) {
        self.series.entry(metric.key().to_string()).or_default().push(value);
    }

    pub fn get(&self, metric: Metrics) -> &[f64] {
        self.get_by_key(metric.key())
    }

    pub fn get_by_key(&self, key: &str) -> &[f64] {
        self.series.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    fn samples() -> (NetworkSamples, VertexId, VertexId) {
        let a = VertexId(0);
        let b = VertexId(3);
        let mut s = NetworkSamples::new(&[a, b]);
        for i in 0..6 {
            let mut values = HashMap::new();
            values.insert(a, tensor::scalar(i as f64));
            values.insert(b, tensor::create(vec![i as f64, -(i as f64)], &[2]).unwrap());
            s.push(&values, -(i as f64 - 2.0).abs()).unwrap();
        }
        (s, a, b)
    }

    #[test]
    fn test_drop_removes_leading_iterations() {
        let (s, a, _) = samples();
        let s = s.drop(4);
        assert_eq!(s.len(), 2);
        let list: Vec<f64> = s.get(a).unwrap().as_list().iter().map(tensor::first).collect();
        assert_eq!(list, vec![4.0, 5.0]);
        assert_eq!(s.log_probs(), &[-2.0, -3.0]);
    }

    #[test]
    fn test_down_sample() {
        let (s, a, _) = samples();
        let s = s.down_sample(2).unwrap();
        let list: Vec<f64> = s.get(a).unwrap().as_list().iter().map(tensor::first).collect();
        assert_eq!(list, vec![0.0, 2.0, 4.0]);
        assert!(samples().0.down_sample(0).is_err());
    }

    #[test]
    fn test_mean_and_element() {
        let (s, _, b) = samples();
        let view = s.get(b).unwrap();
        let mean = view.mean().unwrap();
        assert_eq!(mean.as_slice().unwrap(), &[2.5, -2.5]);
        assert_eq!(view.element(1), vec![0.0, -1.0, -2.0, -3.0, -4.0, -5.0]);
    }

    #[test]
    fn test_most_probable_and_probability() {
        let (s, a, _) = samples();
        let best = s.most_probable().unwrap();
        assert_eq!(tensor::first(&best[&a]), 2.0);
        let p = s.probability(|state| tensor::first(state[&a]) >= 3.0);
        assert!((p - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_push_requires_every_vertex() {
        let mut s = NetworkSamples::new(&[VertexId(0), VertexId(1)]);
        let mut values = HashMap::new();
        values.insert(VertexId(0), tensor::scalar(1.0));
        assert!(s.push(&values, 0.0).is_err());
    }

    #[test]
    fn test_statistics_keys() {
        let mut stats = Statistics::new();
        stats.store(Metrics::StepSize, 0.5);
        stats.store(Metrics::StepSize, 0.25);
        assert_eq!(stats.get(Metrics::StepSize), &[0.5, 0.25]);
        assert_eq!(stats.get_by_key("stepSize"), &[0.5, 0.25]);
        assert!(stats.get(Metrics::TreeSize).is_empty());
    }
}
