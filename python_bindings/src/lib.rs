use bayesgraph_core::diagnostics::compute_diagnostics;
use bayesgraph_core::distributions::Distribution;
use bayesgraph_core::metropolis::{MetropolisConfig, MetropolisHastings};
use bayesgraph_core::nuts::NutsConfig;
use bayesgraph_core::optimizer::GradientOptimizer;
use bayesgraph_core::sampler::{self, MultiChainSamples, SamplerConfig};
use bayesgraph_core::tensor::{self, Tensor};
use bayesgraph_core::{BayesianNetwork, Error, Graph, VertexId};
use ndarray::{ArrayD, IxDyn};
use numpy::{IntoPyArray, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};

/// Bad input from the caller is a ValueError; anything that goes wrong while
/// running an algorithm is a RuntimeError.
fn to_py_err(e: Error) -> PyErr {
    match e {
        Error::ShapeMismatch { .. }
        | Error::BroadcastError { .. }
        | Error::UnknownVertex(_)
        | Error::UnknownLabel(_)
        | Error::DuplicateLabel(_)
        | Error::InvalidParameter { .. }
        | Error::InvalidArgument { .. }
        | Error::Config(_) => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Handle to a vertex of a `Model`.
#[pyclass]
#[derive(Debug, Clone, Copy)]
struct VertexRef {
    id: VertexId,
}

#[pymethods]
impl VertexRef {
    #[getter]
    fn id(&self) -> usize {
        self.id.0
    }

    fn __repr__(&self) -> String {
        format!("VertexRef({})", self.id)
    }
}

/// A vertex argument: an existing vertex or a plain number, which becomes a
/// constant.
#[derive(FromPyObject)]
enum Operand {
    Vertex(VertexRef),
    Value(f64),
}

/// Tensor argument from a float or a numpy array.
#[derive(FromPyObject)]
enum TensorArg<'py> {
    Scalar(f64),
    Array(PyReadonlyArrayDyn<'py, f64>),
}

impl TensorArg<'_> {
    fn into_tensor(self) -> Tensor {
        match self {
            TensorArg::Scalar(v) => tensor::scalar(v),
            TensorArg::Array(a) => a.as_array().to_owned(),
        }
    }
}

/// Stack per-draw tensors into one array shaped `lead ++ draw shape`.
fn stack(draws: &[&Tensor], lead: &[usize]) -> PyResult<ArrayD<f64>> {
    let draw_shape = draws.first().map_or(Vec::new(), |t| t.shape().to_vec());
    let shape = tensor::concat_shapes(lead, &draw_shape);
    let data: Vec<f64> = draws.iter().flat_map(|t| t.iter().copied()).collect();
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| PyValueError::new_err(e.to_string()))
}

#[pyclass]
struct Model {
    graph: Graph,
}

impl Model {
    fn operand(&mut self, operand: Operand) -> PyResult<VertexId> {
        match operand {
            Operand::Vertex(v) => {
                self.graph.get(v.id).map_err(to_py_err)?;
                Ok(v.id)
            }
            Operand::Value(x) => Ok(self.graph.scalar(x)),
        }
    }

    fn finish(&mut self, id: VertexId, label: Option<&str>) -> PyResult<VertexRef> {
        if let Some(label) = label {
            self.graph.set_label(id, label).map_err(to_py_err)?;
        }
        Ok(VertexRef { id })
    }

    fn random(
        &mut self,
        distribution: Distribution,
        shape: Option<Vec<usize>>,
        label: Option<&str>,
    ) -> PyResult<VertexRef> {
        let id = match shape {
            Some(shape) => self.graph.random_with_shape(&shape, distribution),
            None => self.graph.random(distribution),
        }
        .map_err(to_py_err)?;
        self.finish(id, label)
    }

    fn binary(
        &mut self,
        a: Operand,
        b: Operand,
        op: fn(&mut Graph, VertexId, VertexId) -> bayesgraph_core::Result<VertexId>,
    ) -> PyResult<VertexRef> {
        let a = self.operand(a)?;
        let b = self.operand(b)?;
        let id = op(&mut self.graph, a, b).map_err(to_py_err)?;
        Ok(VertexRef { id })
    }

    fn unary(
        &mut self,
        a: Operand,
        op: fn(&mut Graph, VertexId) -> bayesgraph_core::Result<VertexId>,
    ) -> PyResult<VertexRef> {
        let a = self.operand(a)?;
        let id = op(&mut self.graph, a).map_err(to_py_err)?;
        Ok(VertexRef { id })
    }

    fn network(&self) -> PyResult<BayesianNetwork> {
        BayesianNetwork::new(self.graph.clone()).map_err(to_py_err)
    }

    fn ids(vertices: &[VertexRef]) -> Vec<VertexId> {
        vertices.iter().map(|v| v.id).collect()
    }
}

#[pymethods]
impl Model {
    #[new]
    #[pyo3(signature = (seed=1))]
    fn new(seed: u64) -> Self {
        Self {
            graph: Graph::with_seed(seed),
        }
    }

    #[pyo3(signature = (value, label=None))]
    fn constant<'py>(&mut self, value: TensorArg<'py>, label: Option<&str>) -> PyResult<VertexRef> {
        let id = self.graph.constant(value.into_tensor());
        self.finish(id, label)
    }

    // ── Distributions ───────────────────────────────────────────────

    #[pyo3(signature = (mu, sigma, shape=None, label=None))]
    fn gaussian(
        &mut self,
        mu: Operand,
        sigma: Operand,
        shape: Option<Vec<usize>>,
        label: Option<&str>,
    ) -> PyResult<VertexRef> {
        let mu = self.operand(mu)?;
        let sigma = self.operand(sigma)?;
        self.random(Distribution::Gaussian { mu, sigma }, shape, label)
    }

    #[pyo3(signature = (sigma, shape=None, label=None))]
    fn half_gaussian(&mut self, sigma: Operand, shape: Option<Vec<usize>>, label: Option<&str>) -> PyResult<VertexRef> {
        let sigma = self.operand(sigma)?;
        self.random(Distribution::HalfGaussian { sigma }, shape, label)
    }

    #[pyo3(signature = (lower, upper, shape=None, label=None))]
    fn uniform(
        &mut self,
        lower: Operand,
        upper: Operand,
        shape: Option<Vec<usize>>,
        label: Option<&str>,
    ) -> PyResult<VertexRef> {
        let lower = self.operand(lower)?;
        let upper = self.operand(upper)?;
        self.random(Distribution::Uniform { lower, upper }, shape, label)
    }

    #[pyo3(signature = (rate, shape=None, label=None))]
    fn exponential(&mut self, rate: Operand, shape: Option<Vec<usize>>, label: Option<&str>) -> PyResult<VertexRef> {
        let rate = self.operand(rate)?;
        self.random(Distribution::Exponential { rate }, shape, label)
    }

    #[pyo3(signature = (alpha, beta, shape=None, label=None))]
    fn beta(
        &mut self,
        alpha: Operand,
        beta: Operand,
        shape: Option<Vec<usize>>,
        label: Option<&str>,
    ) -> PyResult<VertexRef> {
        let alpha = self.operand(alpha)?;
        let beta = self.operand(beta)?;
        self.random(Distribution::Beta { alpha, beta }, shape, label)
    }

    // ── Operations ──────────────────────────────────────────────────

    fn add(&mut self, a: Operand, b: Operand) -> PyResult<VertexRef> {
        self.binary(a, b, Graph::add)
    }

    fn sub(&mut self, a: Operand, b: Operand) -> PyResult<VertexRef> {
        self.binary(a, b, Graph::sub)
    }

    fn mul(&mut self, a: Operand, b: Operand) -> PyResult<VertexRef> {
        self.binary(a, b, Graph::mul)
    }

    fn div(&mut self, a: Operand, b: Operand) -> PyResult<VertexRef> {
        self.binary(a, b, Graph::div)
    }

    fn pow(&mut self, base: Operand, exponent: Operand) -> PyResult<VertexRef> {
        self.binary(base, exponent, Graph::pow)
    }

    fn max(&mut self, a: Operand, b: Operand) -> PyResult<VertexRef> {
        self.binary(a, b, Graph::max)
    }

    fn matmul(&mut self, a: Operand, b: Operand) -> PyResult<VertexRef> {
        self.binary(a, b, Graph::matmul)
    }

    fn exp(&mut self, a: Operand) -> PyResult<VertexRef> {
        self.unary(a, Graph::exp)
    }

    fn log(&mut self, a: Operand) -> PyResult<VertexRef> {
        self.unary(a, Graph::log)
    }

    fn arcsin(&mut self, a: Operand) -> PyResult<VertexRef> {
        self.unary(a, Graph::asin)
    }

    fn arccos(&mut self, a: Operand) -> PyResult<VertexRef> {
        self.unary(a, Graph::acos)
    }

    fn sigmoid(&mut self, a: Operand) -> PyResult<VertexRef> {
        self.unary(a, Graph::sigmoid)
    }

    fn sum(&mut self, a: Operand) -> PyResult<VertexRef> {
        self.unary(a, Graph::sum)
    }

    // ── Values ──────────────────────────────────────────────────────

    fn observe<'py>(&mut self, vertex: VertexRef, value: TensorArg<'py>) -> PyResult<()> {
        self.graph.observe(vertex.id, value.into_tensor()).map_err(to_py_err)
    }

    fn set_value<'py>(&mut self, vertex: VertexRef, value: TensorArg<'py>) -> PyResult<()> {
        self.graph
            .set_and_cascade(vertex.id, value.into_tensor())
            .map_err(to_py_err)
    }

    /// Current value, or None before the vertex has been evaluated.
    fn value<'py>(&self, py: Python<'py>, vertex: VertexRef) -> PyResult<Option<PyObject>> {
        let value = self.graph.get(vertex.id).map_err(to_py_err)?.value();
        Ok(value.map(|v| v.clone().into_pyarray(py).into_any().unbind()))
    }

    fn label(&self, vertex: VertexRef) -> PyResult<String> {
        self.graph.get(vertex.id).map_err(to_py_err)?;
        Ok(self.graph.display_name(vertex.id))
    }

    fn __getitem__(&self, label: &str) -> PyResult<VertexRef> {
        let id = self.graph.vertex_by_label(label).map_err(to_py_err)?;
        Ok(VertexRef { id })
    }

    // ── Inference ───────────────────────────────────────────────────

    #[pyo3(signature = (vertices, chains=4, samples=1000, adapt_count=500, target_accept=0.8, max_tree_height=10, seed=42, threads=0, progress=false))]
    #[allow(clippy::too_many_arguments)]
    fn sample_nuts(
        &self,
        py: Python<'_>,
        vertices: Vec<VertexRef>,
        chains: usize,
        samples: usize,
        adapt_count: usize,
        target_accept: f64,
        max_tree_height: usize,
        seed: u64,
        threads: usize,
        progress: bool,
    ) -> PyResult<FitResult> {
        let network = self.network()?;
        let ids = Self::ids(&vertices);
        let config = SamplerConfig {
            num_chains: chains,
            num_samples: samples,
            nuts: NutsConfig {
                adapt_count,
                target_acceptance_prob: target_accept,
                max_tree_height,
                ..Default::default()
            },
            seed,
            num_threads: threads,
            show_progress: progress,
            ..Default::default()
        };

        let result = py
            .allow_threads(|| sampler::sample(&network, &ids, &config))
            .map_err(to_py_err)?;
        let names = ids.iter().map(|&id| self.graph.display_name(id)).collect();
        Ok(FitResult {
            result,
            graph: self.graph.clone(),
            vertices: ids,
            names,
        })
    }

    /// Single-chain Metropolis-Hastings with prior proposals. Returns
    /// `{label: array[draws, ...]}`.
    #[pyo3(signature = (vertices, samples=10000, burn_in=1000, seed=42))]
    fn sample_metropolis<'py>(
        &self,
        py: Python<'py>,
        vertices: Vec<VertexRef>,
        samples: usize,
        burn_in: usize,
        seed: u64,
    ) -> PyResult<Bound<'py, PyDict>> {
        let mut network = self.network()?;
        let ids = Self::ids(&vertices);
        let mut mh = MetropolisHastings::new(MetropolisConfig {
            seed,
            ..Default::default()
        });
        let draws = py
            .allow_threads(|| mh.get_posterior_samples(&mut network, &ids, burn_in + samples))
            .map_err(to_py_err)?
            .drop(burn_in);

        let dict = PyDict::new(py);
        for &id in &ids {
            let Some(vertex_samples) = draws.get(id) else {
                continue;
            };
            let list: Vec<&Tensor> = vertex_samples.as_list().iter().collect();
            let arr = stack(&list, &[list.len()])?;
            dict.set_item(self.graph.display_name(id), arr.into_pyarray(py))?;
        }
        Ok(dict)
    }

    /// Gradient MAP (or maximum likelihood) estimate. The model is left at
    /// the optimum. Returns `(fitness, {label: value})`.
    #[pyo3(signature = (max_likelihood=false, max_evaluations=None))]
    fn optimize<'py>(
        &mut self,
        py: Python<'py>,
        max_likelihood: bool,
        max_evaluations: Option<usize>,
    ) -> PyResult<(f64, Bound<'py, PyDict>)> {
        let network = self.network()?;
        let mut builder = GradientOptimizer::builder().bayesian_network(network);
        if let Some(n) = max_evaluations {
            builder = builder.max_evaluations(n);
        }
        let mut optimizer = builder.build().map_err(to_py_err)?;
        let result = py
            .allow_threads(|| {
                if max_likelihood {
                    optimizer.max_likelihood()
                } else {
                    optimizer.max_a_posteriori()
                }
            })
            .map_err(to_py_err)?;
        self.graph = optimizer.into_network().into_graph();

        let dict = PyDict::new(py);
        let mut ids: Vec<&VertexId> = result.values.keys().collect();
        ids.sort();
        for id in ids {
            dict.set_item(self.graph.display_name(*id), result.values[id].clone().into_pyarray(py))?;
        }
        Ok((result.fitness, dict))
    }
}

#[pyclass]
struct FitResult {
    result: MultiChainSamples,
    graph: Graph,
    vertices: Vec<VertexId>,
    names: Vec<String>,
}

impl FitResult {
    fn draws_of(&self, id: VertexId) -> Vec<&Tensor> {
        self.result
            .chains
            .iter()
            .filter_map(|c| c.get(id))
            .flat_map(|s| s.as_list().iter())
            .collect()
    }
}

#[pymethods]
impl FitResult {
    /// `{label: array[chains * draws, ...]}`
    fn get_samples<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for (&id, name) in self.vertices.iter().zip(&self.names) {
            let draws = self.draws_of(id);
            let arr = stack(&draws, &[draws.len()])?;
            dict.set_item(name, arr.into_pyarray(py))?;
        }
        Ok(dict)
    }

    /// `{label: array[chains, draws, ...]}`
    fn get_samples_by_chain<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        let lead = [self.result.num_chains(), self.result.num_draws()];
        for (&id, name) in self.vertices.iter().zip(&self.names) {
            let arr = stack(&self.draws_of(id), &lead)?;
            dict.set_item(name, arr.into_pyarray(py))?;
        }
        Ok(dict)
    }

    fn mean<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for (&id, name) in self.vertices.iter().zip(&self.names) {
            if let Some(mean) = self.result.mean(id) {
                dict.set_item(name, mean.into_pyarray(py))?;
            }
        }
        Ok(dict)
    }

    fn accept_rates<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
        PyList::new(py, &self.result.accept_rates)
    }

    fn divergences(&self) -> usize {
        self.result.total_divergences()
    }

    /// Diagnostics table: mean, std, quantiles, ESS, R-hat.
    fn summary(&self) -> String {
        compute_diagnostics(&self.result, &self.graph, &self.vertices).to_table()
    }

    fn __repr__(&self) -> String {
        format!(
            "bayesgraph FitResult ({} chains × {} draws)\n{}",
            self.result.num_chains(),
            self.result.num_draws(),
            self.summary()
        )
    }
}

#[pymodule]
fn bayesgraph(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Model>()?;
    m.add_class::<VertexRef>()?;
    m.add_class::<FitResult>()?;
    Ok(())
}
