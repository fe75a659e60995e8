//! Error types for the graph execution engine

use thiserror::Error;

use crate::raster::TileCoord;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while building or executing a graph
#[derive(Debug, Error)]
pub enum Error {
    /// Graph structure error (missing node, cycle, duplicate name,
    /// unresolved source reference, unknown operator type)
    #[error("Graph error: {0}")]
    Graph(String),

    /// Manifest parsing or validation error
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Domain error raised inside an operator
    #[error("Operator error: {0}")]
    Operator(String),

    /// Operator initialization failure; aborts graph context construction
    #[error("Initialization of node '{node}' failed")]
    Init {
        /// Name of the node whose operator failed to initialize
        node: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Tile computation failure, reported once per run from the first
    /// failing tile
    #[error("Computing tile {tile} of band '{band}' in node '{node}' failed")]
    TileComputation {
        /// Name of the node whose operator failed
        node: String,
        /// Band being computed
        band: String,
        /// Failing tile coordinate
        tile: TileCoord,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Execution was cancelled cooperatively
    #[error("Execution cancelled")]
    Cancelled,

    /// Internal execution error (worker pool, permit accounting)
    #[error("Execution error: {0}")]
    Execution(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wraps this error as the initialization failure of `node`.
    pub fn into_init(self, node: impl Into<String>) -> Error {
        Error::Init {
            node: node.into(),
            source: Box::new(self),
        }
    }
}
