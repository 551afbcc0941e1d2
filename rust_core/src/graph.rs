use crate::distributions::Distribution;
use crate::error::{Error, Result};
use crate::ops;
use crate::tensor::{self, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

const DEFAULT_SEED: u64 = 1;

/// Unique identifier for a vertex, assigned in construction order.
///
/// Parents always have smaller ids than their children, so ordering by id is
/// a topological order of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexId(pub usize);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operations supported in the graph.
#[derive(Debug, Clone)]
pub enum Op {
    /// A fixed tensor baked into the graph.
    Constant(Tensor),
    Add(VertexId, VertexId),
    Sub(VertexId, VertexId),
    Mul(VertexId, VertexId),
    Div(VertexId, VertexId),
    /// `base ^ exponent`, elementwise.
    Pow(VertexId, VertexId),
    /// `atan2(y, x)` with operands stored as `(x, y)`.
    ArcTan2(VertexId, VertexId),
    /// Rank-2 matrix product.
    MatMul(VertexId, VertexId),
    /// Elementwise maximum. Ties send the whole derivative to the left operand.
    Max(VertexId, VertexId),
    Neg(VertexId),
    Exp(VertexId),
    Log(VertexId),
    Sin(VertexId),
    Cos(VertexId),
    ArcSin(VertexId),
    ArcCos(VertexId),
    Sigmoid(VertexId),
    /// Has no derivative rule; differentiating through it is an error.
    Abs(VertexId),
    /// Sum of every element, producing a scalar.
    Sum(VertexId),
    /// Passes its input through unchanged, so it can carry its own label.
    Proxy(VertexId),
    /// A random variable.
    Random(Distribution),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Constant(_) => "Constant",
            Op::Add(..) => "Add",
            Op::Sub(..) => "Sub",
            Op::Mul(..) => "Mul",
            Op::Div(..) => "Div",
            Op::Pow(..) => "Pow",
            Op::ArcTan2(..) => "ArcTan2",
            Op::MatMul(..) => "MatMul",
            Op::Max(..) => "Max",
            Op::Neg(_) => "Neg",
            Op::Exp(_) => "Exp",
            Op::Log(_) => "Log",
            Op::Sin(_) => "Sin",
            Op::Cos(_) => "Cos",
            Op::ArcSin(_) => "ArcSin",
            Op::ArcCos(_) => "ArcCos",
            Op::Sigmoid(_) => "Sigmoid",
            Op::Abs(_) => "Abs",
            Op::Sum(_) => "Sum",
            Op::Proxy(_) => "Proxy",
            Op::Random(d) => d.name(),
        }
    }

    /// Parents of the operation, each with the name it is known by.
    pub fn named_parents(&self) -> Vec<(&'static str, VertexId)> {
        match self {
            Op::Constant(_) => Vec::new(),
            Op::Add(l, r)
            | Op::Sub(l, r)
            | Op::Mul(l, r)
            | Op::Div(l, r)
            | Op::MatMul(l, r)
            | Op::Max(l, r) => {
                vec![("left", *l), ("right", *r)]
            }
            Op::Pow(base, exponent) => vec![("base", *base), ("exponent", *exponent)],
            Op::ArcTan2(x, y) => vec![("x", *x), ("y", *y)],
            Op::Neg(a)
            | Op::Exp(a)
            | Op::Log(a)
            | Op::Sin(a)
            | Op::Cos(a)
            | Op::ArcSin(a)
            | Op::ArcCos(a)
            | Op::Sigmoid(a)
            | Op::Abs(a)
            | Op::Sum(a)
            | Op::Proxy(a) => vec![("input", *a)],
            Op::Random(d) => d.named_parameters(),
        }
    }

    pub fn parents(&self) -> Vec<VertexId> {
        self.named_parents().into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_probabilistic(&self) -> bool {
        matches!(self, Op::Random(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Op::Constant(_))
    }

    /// Whether the op carries forward and reverse derivative rules.
    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Op::Abs(_))
    }
}

/// A single vertex of the graph.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub id: VertexId,
    pub op: Op,
    pub shape: Vec<usize>,
    pub label: Option<String>,
    value: Option<Tensor>,
    observed: bool,
    children: BTreeSet<VertexId>,
}

impl Vertex {
    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn is_probabilistic(&self) -> bool {
        self.op.is_probabilistic()
    }

    /// Probabilistic and not observed.
    pub fn is_latent(&self) -> bool {
        self.is_probabilistic() && !self.observed
    }

    pub fn parents(&self) -> Vec<VertexId> {
        self.op.parents()
    }

    pub fn children(&self) -> &BTreeSet<VertexId> {
        &self.children
    }
}

/// The vertex graph of a probabilistic model.
///
/// Stores vertices in construction order, which is also a topological order
/// since a vertex can only reference vertices that already exist. The graph
/// owns the random number generator used when evaluation has to sample a
/// probabilistic vertex that has no value yet.
#[derive(Debug, Clone)]
pub struct Graph {
    vertices: Vec<Vertex>,
    label_to_vertex: HashMap<String, VertexId>,
    rng: ChaCha8Rng,
}

impl Graph {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            vertices: Vec::new(),
            label_to_vertex: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Look up a vertex. Ids are only minted by this graph, so indexing with
    /// an id from another graph panics; use [`Graph::get`] for untrusted ids.
    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0]
    }

    pub fn get(&self, id: VertexId) -> Result<&Vertex> {
        self.vertices.get(id.0).ok_or(Error::UnknownVertex(id))
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices.iter().map(|v| v.id)
    }

    pub fn shape(&self, id: VertexId) -> &[usize] {
        &self.vertex(id).shape
    }

    pub fn value(&self, id: VertexId) -> Option<&Tensor> {
        self.vertex(id).value()
    }

    /// The value of `id`, or `MissingValue` if it has none.
    pub fn value_of(&self, id: VertexId) -> Result<&Tensor> {
        self.get(id)?.value().ok_or(Error::MissingValue(id))
    }

    pub fn scalar_value(&self, id: VertexId) -> Result<f64> {
        Ok(tensor::first(self.value_of(id)?))
    }

    pub fn parents(&self, id: VertexId) -> Vec<VertexId> {
        self.vertex(id).parents()
    }

    pub fn children(&self, id: VertexId) -> &BTreeSet<VertexId> {
        self.vertex(id).children()
    }

    // ── Construction ────────────────────────────────────────────────

    fn push(&mut self, op: Op, shape: Vec<usize>, value: Option<Tensor>) -> VertexId {
        let id = VertexId(self.vertices.len());
        for parent in op.parents() {
            self.vertices[parent.0].children.insert(id);
        }
        self.vertices.push(Vertex {
            id,
            op,
            shape,
            label: None,
            value,
            observed: false,
            children: BTreeSet::new(),
        });
        id
    }

    fn check_parents(&self, parents: &[VertexId]) -> Result<()> {
        for &p in parents {
            self.get(p)?;
        }
        Ok(())
    }

    pub fn constant(&mut self, value: Tensor) -> VertexId {
        let shape = value.shape().to_vec();
        self.push(Op::Constant(value.clone()), shape, Some(value))
    }

    pub fn scalar(&mut self, value: f64) -> VertexId {
        self.constant(tensor::scalar(value))
    }

    fn elementwise(&mut self, op: Op) -> Result<VertexId> {
        let parents = op.parents();
        self.check_parents(&parents)?;
        let shapes: Vec<&[usize]> = parents.iter().map(|&p| self.shape(p)).collect();
        let shape = tensor::check_has_one_non_length_one_shape_or_all_length_one(&shapes)?;
        Ok(self.push(op, shape, None))
    }

    pub fn add(&mut self, left: VertexId, right: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Add(left, right))
    }

    pub fn sub(&mut self, left: VertexId, right: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Sub(left, right))
    }

    pub fn mul(&mut self, left: VertexId, right: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Mul(left, right))
    }

    pub fn div(&mut self, left: VertexId, right: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Div(left, right))
    }

    pub fn pow(&mut self, base: VertexId, exponent: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Pow(base, exponent))
    }

    /// `atan2(y, x)`: the angle of the point `(x, y)`.
    pub fn atan2(&mut self, x: VertexId, y: VertexId) -> Result<VertexId> {
        self.elementwise(Op::ArcTan2(x, y))
    }

    pub fn neg(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Neg(a))
    }

    pub fn exp(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Exp(a))
    }

    pub fn log(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Log(a))
    }

    pub fn sin(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Sin(a))
    }

    pub fn cos(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Cos(a))
    }

    pub fn asin(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::ArcSin(a))
    }

    pub fn acos(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::ArcCos(a))
    }

    pub fn max(&mut self, left: VertexId, right: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Max(left, right))
    }

    /// A vertex mirroring `a`, with the same shape and derivatives.
    pub fn proxy(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Proxy(a))
    }

    pub fn sigmoid(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Sigmoid(a))
    }

    pub fn abs(&mut self, a: VertexId) -> Result<VertexId> {
        self.elementwise(Op::Abs(a))
    }

    pub fn matmul(&mut self, left: VertexId, right: VertexId) -> Result<VertexId> {
        self.check_parents(&[left, right])?;
        let shape = tensor::check_matmul(self.shape(left), self.shape(right))?;
        Ok(self.push(Op::MatMul(left, right), shape, None))
    }

    pub fn sum(&mut self, a: VertexId) -> Result<VertexId> {
        self.check_parents(&[a])?;
        Ok(self.push(Op::Sum(a), Vec::new(), None))
    }

    /// A random variable whose shape is inferred from its parameters.
    pub fn random(&mut self, distribution: Distribution) -> Result<VertexId> {
        let parents = distribution.parameters();
        self.check_parents(&parents)?;
        let shapes: Vec<&[usize]> = parents.iter().map(|&p| self.shape(p)).collect();
        let shape = tensor::check_has_one_non_length_one_shape_or_all_length_one(&shapes)?;
        Ok(self.push(Op::Random(distribution), shape, None))
    }

    /// A random variable of an explicit shape; parameters must be length-one
    /// or match it.
    pub fn random_with_shape(&mut self, shape: &[usize], distribution: Distribution) -> Result<VertexId> {
        let parents = distribution.parameters();
        self.check_parents(&parents)?;
        let shapes: Vec<&[usize]> = parents.iter().map(|&p| self.shape(p)).collect();
        tensor::check_parameters_match_shape(shape, &shapes)?;
        Ok(self.push(Op::Random(distribution), shape.to_vec(), None))
    }

    pub fn gaussian(&mut self, mu: VertexId, sigma: VertexId) -> Result<VertexId> {
        self.random(Distribution::Gaussian { mu, sigma })
    }

    pub fn half_gaussian(&mut self, sigma: VertexId) -> Result<VertexId> {
        self.random(Distribution::HalfGaussian { sigma })
    }

    pub fn uniform(&mut self, lower: VertexId, upper: VertexId) -> Result<VertexId> {
        self.random(Distribution::Uniform { lower, upper })
    }

    pub fn exponential(&mut self, rate: VertexId) -> Result<VertexId> {
        self.random(Distribution::Exponential { rate })
    }

    pub fn beta(&mut self, alpha: VertexId, beta: VertexId) -> Result<VertexId> {
        self.random(Distribution::Beta { alpha, beta })
    }

    // ── Labels ──────────────────────────────────────────────────────

    pub fn set_label(&mut self, id: VertexId, label: &str) -> Result<()> {
        self.get(id)?;
        match self.label_to_vertex.get(label) {
            Some(&existing) if existing != id => return Err(Error::DuplicateLabel(label.to_string())),
            _ => {}
        }
        if let Some(old) = self.vertices[id.0].label.take() {
            self.label_to_vertex.remove(&old);
        }
        self.vertices[id.0].label = Some(label.to_string());
        self.label_to_vertex.insert(label.to_string(), id);
        Ok(())
    }

    pub fn vertex_by_label(&self, label: &str) -> Result<VertexId> {
        self.label_to_vertex
            .get(label)
            .copied()
            .ok_or_else(|| Error::UnknownLabel(label.to_string()))
    }

    /// Label of the vertex, falling back to its id.
    pub fn display_name(&self, id: VertexId) -> String {
        match &self.vertex(id).label {
            Some(label) => label.clone(),
            None => id.to_string(),
        }
    }

    // ── Values ──────────────────────────────────────────────────────

    /// Set the value of a vertex without propagating it.
    ///
    /// The tensor must have the vertex's shape, or the same number of
    /// elements, in which case it is reshaped.
    pub fn set_value(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        let shape = self.get(id)?.shape.clone();
        let value = if value.shape() == shape.as_slice() {
            value
        } else if value.len() == tensor::element_count(&shape) {
            tensor::broadcast_to(&value, &shape)?
        } else {
            return Err(Error::ShapeMismatch {
                expected: shape,
                got: value.shape().to_vec(),
            });
        };
        self.vertices[id.0].value = Some(value);
        Ok(())
    }

    pub fn set_and_cascade(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        self.set_value(id, value)?;
        crate::propagation::cascade_update(self, &[id])
    }

    pub(crate) fn clear_value(&mut self, id: VertexId) {
        self.vertices[id.0].value = None;
    }

    /// Store a value produced internally, already of the right shape.
    pub(crate) fn store(&mut self, id: VertexId, value: Tensor) {
        self.vertices[id.0].value = Some(value);
    }

    /// Fix the value of a vertex as external data.
    pub fn observe(&mut self, id: VertexId, value: Tensor) -> Result<()> {
        self.set_value(id, value)?;
        self.vertices[id.0].observed = true;
        Ok(())
    }

    pub fn unobserve(&mut self, id: VertexId) -> Result<()> {
        self.get(id)?;
        self.vertices[id.0].observed = false;
        Ok(())
    }

    // ── Capabilities ────────────────────────────────────────────────

    /// Recompute a deterministic vertex from its parents' current values.
    pub fn calculate(&self, id: VertexId) -> Result<Tensor> {
        ops::calculate(self, id)
    }

    pub fn distribution(&self, id: VertexId) -> Option<&Distribution> {
        match &self.vertices.get(id.0)?.op {
            Op::Random(d) => Some(d),
            _ => None,
        }
    }

    fn require_distribution(&self, id: VertexId) -> Result<&Distribution> {
        self.distribution(id).ok_or_else(|| Error::InvalidArgument {
            arg: "id",
            reason: format!("vertex {} is not probabilistic", id),
        })
    }

    fn parameter_values(&self, distribution: &Distribution) -> Result<Vec<&Tensor>> {
        distribution.parameters().into_iter().map(|p| self.value_of(p)).collect()
    }

    /// Log density of a probabilistic vertex at its current value.
    pub fn log_prob(&self, id: VertexId) -> Result<f64> {
        let distribution = self.require_distribution(id)?;
        let params = self.parameter_values(distribution)?;
        distribution.log_prob(self.value_of(id)?, &params)
    }

    /// Log density `value` would have under the vertex's current parameters.
    pub fn log_prob_at(&self, id: VertexId, value: &Tensor) -> Result<f64> {
        let distribution = self.require_distribution(id)?;
        let params = self.parameter_values(distribution)?;
        distribution.log_prob(value, &params)
    }

    pub fn d_log_prob(&self, id: VertexId) -> Result<crate::distributions::DLogProb> {
        let distribution = self.require_distribution(id)?;
        let params = self.parameter_values(distribution)?;
        distribution.d_log_prob(self.value_of(id)?, &params)
    }

    /// Draw a value for a probabilistic vertex from its distribution, given
    /// the current values of its parameters. Does not store it.
    pub fn sample_from_prior<R: Rng + ?Sized>(&self, id: VertexId, rng: &mut R) -> Result<Tensor> {
        let distribution = self.require_distribution(id)?;
        let params = self.parameter_values(distribution)?;
        distribution.sample(self.shape(id), &params, rng)
    }

    /// Sample with the graph's own generator.
    pub(crate) fn sample_with_own_rng(&mut self, id: VertexId) -> Result<Tensor> {
        let mut rng = std::mem::replace(&mut self.rng, ChaCha8Rng::seed_from_u64(DEFAULT_SEED));
        let sampled = self.sample_from_prior(id, &mut rng);
        self.rng = rng;
        sampled
    }

    // ── Partitions ──────────────────────────────────────────────────

    pub fn probabilistic_vertices(&self) -> Vec<VertexId> {
        self.vertices.iter().filter(|v| v.is_probabilistic()).map(|v| v.id).collect()
    }

    pub fn latent_vertices(&self) -> Vec<VertexId> {
        self.vertices.iter().filter(|v| v.is_latent()).map(|v| v.id).collect()
    }

    pub fn observed_vertices(&self) -> Vec<VertexId> {
        self.vertices
            .iter()
            .filter(|v| v.is_probabilistic() && v.is_observed())
            .map(|v| v.id)
            .collect()
    }

    /// Every vertex reachable from `id` through parent or child edges.
    pub fn connected_graph(&self, id: VertexId) -> Result<BTreeSet<VertexId>> {
        self.get(id)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let v = self.vertex(current);
            stack.extend(v.parents().into_iter().filter(|p| !seen.contains(p)));
            stack.extend(v.children.iter().filter(|c| !seen.contains(c)));
        }
        Ok(seen)
    }

    /// Latent vertices whose values flow into `id` through deterministic
    /// vertices only. A latent `id` is its own source.
    pub fn latent_sources(&self, id: VertexId) -> BTreeSet<VertexId> {
        let mut sources = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let v = self.vertex(current);
            if v.is_probabilistic() {
                if v.is_latent() {
                    sources.insert(current);
                }
                continue;
            }
            if v.is_observed() {
                continue;
            }
            stack.extend(v.parents());
        }
        sources
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
