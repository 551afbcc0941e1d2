//! Gradient-based point estimates: maximum a posteriori and maximum
//! likelihood, by non-linear conjugate gradient ascent.
//!
//!   - Search direction: steepest ascent plus Polak-Ribière or
//!     Fletcher-Reeves β times the previous direction, reset every n steps
//!   - Line search: geometric bracketing then golden-section refinement
//!   - Convergence: successive fitness values within the relative or
//!     absolute threshold

use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::model::{BayesianNetwork, ProbabilisticModel, ProbabilisticModelWithGradient};
use crate::tensor::{self, Tensor};
use std::collections::HashMap;

const FLAT_GRADIENT: f64 = 1e-16;
const INITIAL_BRACKET_STEP: f64 = 1e-3;
const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;
const MAX_BRACKET_STEPS: usize = 100;
const LINE_SEARCH_TOLERANCE: f64 = 1e-10;

/// How β is computed from successive gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateFormula {
    #[default]
    PolakRibiere,
    FletcherReeves,
}

#[derive(Debug, Clone)]
pub struct OptimizedResult {
    pub values: HashMap<VertexId, Tensor>,
    pub fitness: f64,
}

pub type FitnessHandler = Box<dyn FnMut(&HashMap<VertexId, Tensor>, f64) + Send>;
pub type GradientHandler = Box<dyn FnMut(&HashMap<VertexId, Tensor>, &HashMap<VertexId, Tensor>) + Send>;

/// Handle returned when registering a callback, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(usize);

pub struct GradientOptimizerBuilder {
    network: Option<BayesianNetwork>,
    max_evaluations: usize,
    relative_threshold: f64,
    absolute_threshold: f64,
    update_formula: UpdateFormula,
}

impl Default for GradientOptimizerBuilder {
    fn default() -> Self {
        Self {
            network: None,
            max_evaluations: usize::MAX,
            relative_threshold: 1e-8,
            absolute_threshold: 1e-8,
            update_formula: UpdateFormula::PolakRibiere,
        }
    }
}

impl GradientOptimizerBuilder {
    pub fn bayesian_network(mut self, network: BayesianNetwork) -> Self {
        self.network = Some(network);
        self
    }

    pub fn max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    pub fn relative_threshold(mut self, threshold: f64) -> Self {
        self.relative_threshold = threshold;
        self
    }

    pub fn absolute_threshold(mut self, threshold: f64) -> Self {
        self.absolute_threshold = threshold;
        self
    }

    pub fn update_formula(mut self, formula: UpdateFormula) -> Self {
        self.update_formula = formula;
        self
    }

    pub fn build(self) -> Result<GradientOptimizer> {
        let network = self.network.ok_or_else(|| {
            Error::Config("Cannot build optimizer without specifying network to optimize.".to_string())
        })?;
        Ok(GradientOptimizer {
            network,
            max_evaluations: self.max_evaluations,
            relative_threshold: self.relative_threshold,
            absolute_threshold: self.absolute_threshold,
            update_formula: self.update_formula,
            fitness_handlers: Vec::new(),
            gradient_handlers: Vec::new(),
            next_handler: 0,
        })
    }
}

pub struct GradientOptimizer {
    network: BayesianNetwork,
    max_evaluations: usize,
    relative_threshold: f64,
    absolute_threshold: f64,
    update_formula: UpdateFormula,
    fitness_handlers: Vec<(HandlerId, FitnessHandler)>,
    gradient_handlers: Vec<(HandlerId, GradientHandler)>,
    next_handler: usize,
}

impl GradientOptimizer {
    pub fn builder() -> GradientOptimizerBuilder {
        GradientOptimizerBuilder::default()
    }

    pub fn network(&self) -> &BayesianNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut BayesianNetwork {
        &mut self.network
    }

    pub fn into_network(self) -> BayesianNetwork {
        self.network
    }

    /// Called with the point and its fitness at every fitness evaluation.
    pub fn add_fitness_calculation_handler(&mut self, handler: FitnessHandler) -> HandlerId {
        let id = self.new_handler_id();
        self.fitness_handlers.push((id, handler));
        id
    }

    /// Called with the point and its gradient at every gradient evaluation.
    pub fn add_gradient_calculation_handler(&mut self, handler: GradientHandler) -> HandlerId {
        let id = self.new_handler_id();
        self.gradient_handlers.push((id, handler));
        id
    }

    pub fn remove_handler(&mut self, id: HandlerId) {
        self.fitness_handlers.retain(|(h, _)| *h != id);
        self.gradient_handlers.retain(|(h, _)| *h != id);
    }

    fn new_handler_id(&mut self) -> HandlerId {
        self.next_handler += 1;
        HandlerId(self.next_handler)
    }

    /// Maximize the joint log probability.
    pub fn max_a_posteriori(&mut self) -> Result<OptimizedResult> {
        self.optimize(Objective::Posterior)
    }

    /// Maximize the log likelihood of the observations, ignoring priors.
    pub fn max_likelihood(&mut self) -> Result<OptimizedResult> {
        self.optimize(Objective::Likelihood)
    }

    fn optimize(&mut self, objective: Objective) -> Result<OptimizedResult> {
        let latents = self.network.latent_vertices().to_vec();
        if latents.is_empty() {
            return Err(Error::NoLatentVariables);
        }
        let shapes: Vec<Vec<usize>> = latents
            .iter()
            .map(|&id| self.network.graph().shape(id).to_vec())
            .collect();

        let mut problem = Problem {
            optimizer: self,
            objective,
            latents: &latents,
            shapes: &shapes,
            evaluations: 0,
        };

        let start = problem.current_point()?;
        let initial_fitness = problem.fitness(&start)?;
        if !(initial_fitness > f64::NEG_INFINITY) {
            return Err(Error::ZeroProbability { algorithm: "optimizer" });
        }
        let initial_gradient = problem.gradient(&start)?;
        let max_gradient = initial_gradient.iter().fold(0.0f64, |m, g| m.max(g.abs()));
        if max_gradient <= FLAT_GRADIENT {
            return Err(Error::FlatGradient { max_gradient });
        }

        tracing::info!(
            latents = latents.len(),
            dimensions = start.len(),
            initial_fitness,
            "starting gradient optimizer"
        );

        let (point, fitness) = problem.conjugate_gradient(start, initial_fitness, initial_gradient)?;
        let values = problem.values_at(&point)?;
        self.network.set_values(&values)?;

        tracing::info!(fitness, "finished gradient optimizer");
        Ok(OptimizedResult { values, fitness })
    }
}

#[derive(Debug, Clone, Copy)]
enum Objective {
    Posterior,
    Likelihood,
}

/// One optimization run: flattens latent values into a point and counts
/// evaluations.
struct Problem<'a> {
    optimizer: &'a mut GradientOptimizer,
    objective: Objective,
    latents: &'a [VertexId],
    shapes: &'a [Vec<usize>],
    evaluations: usize,
}

impl Problem<'_> {
    fn current_point(&self) -> Result<Vec<f64>> {
        let mut point = Vec::new();
        for &id in self.latents {
            point.extend(self.optimizer.network.graph().value_of(id)?.iter().copied());
        }
        Ok(point)
    }

    fn values_at(&self, point: &[f64]) -> Result<HashMap<VertexId, Tensor>> {
        let mut values = HashMap::with_capacity(self.latents.len());
        let mut offset = 0;
        for (&id, shape) in self.latents.iter().zip(self.shapes) {
            let n = tensor::element_count(shape);
            values.insert(id, tensor::create(point[offset..offset + n].to_vec(), shape)?);
            offset += n;
        }
        Ok(values)
    }

    fn fitness(&mut self, point: &[f64]) -> Result<f64> {
        self.evaluations += 1;
        if self.evaluations > self.optimizer.max_evaluations {
            return Err(Error::MaxEvaluationsExceeded(self.optimizer.max_evaluations));
        }
        let values = self.values_at(point)?;
        let network = &mut self.optimizer.network;
        network.set_values(&values)?;
        let fitness = match self.objective {
            Objective::Posterior => network.log_prob()?,
            Objective::Likelihood => network.log_likelihood()?,
        };
        for (_, handler) in self.optimizer.fitness_handlers.iter_mut() {
            handler(&values, fitness);
        }
        Ok(fitness)
    }

    fn gradient(&mut self, point: &[f64]) -> Result<Vec<f64>> {
        let values = self.values_at(point)?;
        let network = &mut self.optimizer.network;
        network.set_values(&values)?;
        let gradients = match self.objective {
            Objective::Posterior => network.log_prob_gradients()?,
            Objective::Likelihood => network.log_likelihood_gradients()?,
        };
        let mut flat = Vec::with_capacity(point.len());
        for &id in self.latents {
            let g = gradients.get(&id).ok_or(Error::MissingValue(id))?;
            flat.extend(g.iter().copied());
        }
        for (_, handler) in self.optimizer.gradient_handlers.iter_mut() {
            handler(&values, &gradients);
        }
        Ok(flat)
    }

    fn converged(&self, previous: f64, current: f64) -> bool {
        let difference = (previous - current).abs();
        let size = previous.abs().max(current.abs());
        difference <= size * self.optimizer.relative_threshold || difference <= self.optimizer.absolute_threshold
    }

    fn conjugate_gradient(&mut self, start: Vec<f64>, fitness: f64, gradient: Vec<f64>) -> Result<(Vec<f64>, f64)> {
        let n = start.len();
        let mut point = start;
        let mut fitness = fitness;
        let mut steepest = gradient;
        let mut search = steepest.clone();
        let mut delta = dot(&steepest, &steepest);
        let mut iteration = 0usize;

        loop {
            iteration += 1;
            let alpha = self.line_search(&point, fitness, &search)?;
            let next: Vec<f64> = point.iter().zip(&search).map(|(x, d)| x + alpha * d).collect();
            let next_fitness = self.fitness(&next)?;

            let previous_fitness = fitness;
            if next_fitness >= fitness {
                point = next;
                fitness = next_fitness;
            }
            tracing::debug!(iteration, fitness, step = alpha, "optimizer iteration");
            if alpha == 0.0 || self.converged(previous_fitness, fitness) {
                return Ok((point, fitness));
            }

            let r = self.gradient(&point)?;
            let delta_old = delta;
            delta = dot(&r, &r);
            let beta = match self.optimizer.update_formula {
                UpdateFormula::FletcherReeves => delta / delta_old,
                UpdateFormula::PolakRibiere => (delta - dot(&r, &steepest)) / delta_old,
            };
            steepest = r;

            if iteration % n == 0 || !(beta > 0.0) {
                search = steepest.clone();
            } else {
                search = steepest.iter().zip(&search).map(|(g, d)| g + beta * d).collect();
            }
        }
    }

    fn fitness_along(&mut self, point: &[f64], direction: &[f64], alpha: f64) -> Result<f64> {
        let trial: Vec<f64> = point.iter().zip(direction).map(|(x, d)| x + alpha * d).collect();
        let value = self.fitness(&trial)?;
        if value.is_nan() {
            tracing::warn!(alpha, "non-finite fitness in line search");
            return Ok(f64::NEG_INFINITY);
        }
        Ok(value)
    }

    /// Step length along `direction` that approximately maximizes the fitness.
    /// Zero when no step improves on `fitness`.
    fn line_search(&mut self, point: &[f64], fitness: f64, direction: &[f64]) -> Result<f64> {
        // Shrink until the first step improves, then grow until it stops improving.
        let mut b = INITIAL_BRACKET_STEP;
        let mut fb = self.fitness_along(point, direction, b)?;
        while fb <= fitness {
            b *= 0.5;
            if b < 1e-20 {
                return Ok(0.0);
            }
            fb = self.fitness_along(point, direction, b)?;
        }
        let mut a = 0.0;
        let mut c = b * (1.0 + GOLDEN_RATIO);
        let mut fc = self.fitness_along(point, direction, c)?;
        let mut steps = 0;
        while fc > fb && steps < MAX_BRACKET_STEPS {
            a = b;
            b = c;
            fb = fc;
            c = b + GOLDEN_RATIO * (b - a);
            fc = self.fitness_along(point, direction, c)?;
            steps += 1;
        }

        // Golden-section search on [a, c].
        let inv_phi = 1.0 / GOLDEN_RATIO;
        let mut lo = a;
        let mut hi = c;
        let mut x1 = hi - inv_phi * (hi - lo);
        let mut x2 = lo + inv_phi * (hi - lo);
        let mut f1 = self.fitness_along(point, direction, x1)?;
        let mut f2 = self.fitness_along(point, direction, x2)?;
        while (hi - lo) > LINE_SEARCH_TOLERANCE * (1.0 + hi.abs()) {
            if f1 > f2 {
                hi = x2;
                x2 = x1;
                f2 = f1;
                x1 = hi - inv_phi * (hi - lo);
                f1 = self.fitness_along(point, direction, x1)?;
            } else {
                lo = x1;
                x1 = x2;
                f1 = f2;
                x2 = lo + inv_phi * (hi - lo);
                f2 = self.fitness_along(point, direction, x2)?;
            }
        }

        let best = [(b, fb), (x1, f1), (x2, f2)]
            .into_iter()
            .fold((0.0, fitness), |acc, (x, f)| if f > acc.1 { (x, f) } else { acc });
        Ok(best.0)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
