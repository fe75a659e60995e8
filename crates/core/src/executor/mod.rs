//! Graph execution engine
//!
//! This module implements the runtime half of the crate:
//! - Builds per-execution contexts from a graph ([`GraphContext`])
//! - Wires every band to a lazy, memoizing image
//! - Drives demand-driven tile computation across the DAG
//!   ([`GraphProcessor`]) with bounded concurrency, first-failure
//!   poisoning, and cooperative cancellation

pub mod context;
pub mod images;
pub mod observer;
pub mod pool;
pub mod processor;
pub mod resources;

pub use context::{BandBinding, ExternalProduct, GraphContext, NodeContext};
pub use images::{OperatorImage, StackCache, StackImage};
pub use observer::GraphObserver;
pub use pool::{TileListener, TileWorkerPool};
pub use processor::{max_tile_grid, CancelToken, GraphProcessor, TileGrid};
pub use resources::{ResourceGuard, ResourcePool};
