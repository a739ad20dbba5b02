//! Runtime errors

use thiserror::Error;

/// Error raised by a node lifecycle callback.
pub type NodeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Runtime result type
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("no nodes in pipeline graph")]
    EmptyPipeline,

    #[error("graph is not acyclic")]
    NotADag,

    #[error("can't satisfy all mandatory memory-share adjacencies")]
    GreenEdgesUnsatisfiable,

    #[error("phase partition covered {got} nodes, expected {expected}")]
    PhaseMapSize { got: usize, expected: usize },

    #[error("phase {phase} has no initiator node")]
    MissingInitiator { phase: String },

    #[error("permutation is malformed: {reason}")]
    MalformedPermutation { reason: &'static str },

    #[error("datastructure {name}: aggregated minimum exceeds maximum")]
    MalformedDatastructure { name: String },

    #[error("node {name} failed in {stage}")]
    NodeFailure {
        name: String,
        stage: &'static str,
        #[source]
        source: NodeError,
    },
}
