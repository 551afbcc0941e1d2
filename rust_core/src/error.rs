//! Error types for bayesgraph

use crate::graph::VertexId;
use thiserror::Error;

/// Result type alias using the crate's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, evaluating, differentiating or sampling a graph.
///
/// Every variant is fatal for the call that produced it. NUTS divergences are
/// handled inside the sampler and never surface here.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Operand or value shape does not match what the vertex expects
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Operand shapes cannot be reconciled by length-one broadcasting
    #[error("Cannot broadcast shapes {lhs:?} and {rhs:?}")]
    BroadcastError {
        /// Left-hand side shape
        lhs: Vec<usize>,
        /// Right-hand side shape
        rhs: Vec<usize>,
    },

    #[error("Vertex {0} does not belong to this graph")]
    UnknownVertex(VertexId),

    #[error("No vertex labelled '{0}'")]
    UnknownLabel(String),

    #[error("Label '{0}' is already used by another vertex")]
    DuplicateLabel(String),

    /// A calculation needed the value of a vertex that has none
    #[error("Vertex {0} has no value")]
    MissingValue(VertexId),

    /// Differentiation reached a vertex kind without a derivative rule
    #[error("Vertex {id} ({op}) has no differentiable rule")]
    NotDifferentiable {
        /// Offending vertex
        id: VertexId,
        /// Name of its operation
        op: &'static str,
    },

    /// A distribution was asked to work with parameters outside its support
    #[error("Invalid parameter for {distribution}: {reason}")]
    InvalidParameter {
        /// Distribution name
        distribution: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// A required builder input was never supplied
    #[error("{0}")]
    Config(String),

    #[error("Cannot find MAP of network without any latent variables")]
    NoLatentVariables,

    /// Algorithm asked to start from a state with log probability of negative infinity
    #[error("Cannot start {algorithm} on zero probability network")]
    ZeroProbability {
        /// Name of the algorithm that refused to start
        algorithm: &'static str,
    },

    #[error("The initial gradient is very flat. The largest gradient is {max_gradient}")]
    FlatGradient {
        /// Largest absolute gradient component
        max_gradient: f64,
    },

    #[error("Could not find a non-zero probability starting state after {0} attempts")]
    ProbeFailed(usize),

    #[error("Exceeded the maximum of {0} objective evaluations")]
    MaxEvaluationsExceeded(usize),
}
