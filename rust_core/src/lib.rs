//! Probabilistic programming on a vertex graph: tensor-valued vertices,
//! forward and reverse automatic differentiation, and inference by NUTS,
//! Hamiltonian Monte Carlo, Metropolis-Hastings, simulated annealing and
//! gradient-based MAP / maximum likelihood.

pub mod autodiff;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod hmc;
pub mod leapfrog;
pub mod metropolis;
pub mod model;
pub mod nuts;
pub mod ops;
pub mod optimizer;
pub mod partials;
pub mod progress;
pub mod propagation;
pub mod sampler;
pub mod samples;
pub mod tensor;

pub use error::{Error, Result};
pub use graph::{Graph, VertexId};
pub use model::{BayesianNetwork, ProbabilisticModel, ProbabilisticModelWithGradient};
pub use nuts::{Nuts, NutsConfig};
pub use samples::NetworkSamples;
pub use tensor::Tensor;
