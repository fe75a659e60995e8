//! RasterGraph Core - Tiled dataflow graph execution engine
//!
//! This crate runs directed acyclic graphs of image-processing operators,
//! where each operator produces one or more raster outputs computed lazily
//! and tile-by-tile.
//!
//! # Architecture
//!
//! - [`graph`]: the inert, declarative description of operator wiring
//! - [`manifest`]: JSON/YAML graph descriptions
//! - [`raster`]: tile grids, products, bands and lazy images
//! - [`operator`]: the operator contract the engine consumes domain code
//!   through, plus the type registry and built-in operators
//! - [`executor`]: per-execution contexts and the [`GraphProcessor`]
//!   orchestrating demand-driven, bounded-parallel tile computation
//!
//! # Example
//!
//! ```ignore
//! use rastergraph_core::executor::{CancelToken, GraphProcessor};
//! use rastergraph_core::manifest;
//! use rastergraph_core::operator::OperatorRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = manifest::parse_yaml(&std::fs::read_to_string("chain.yaml")?)?
//!         .into_graph()?;
//!     let registry = OperatorRegistry::with_builtins();
//!     let processor = GraphProcessor::new();
//!
//!     let products = processor
//!         .execute_graph(&graph, &registry, &CancelToken::new())
//!         .await?;
//!     println!("{} output product(s)", products.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod executor;
pub mod graph;
pub mod manifest;
pub mod operator;
pub mod raster;

mod error;
pub use error::{Error, Result};

pub use executor::{CancelToken, GraphContext, GraphObserver, GraphProcessor, TileWorkerPool};
pub use graph::{Graph, Node, NodeSource};
pub use operator::{Operator, OperatorRegistry};
pub use raster::{Band, PixelType, Product, Rect, TileCoord};

/// Initialize logging for the engine.
///
/// This should be called once at startup by binaries embedding the engine.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("RasterGraph core initialized");
    Ok(())
}
