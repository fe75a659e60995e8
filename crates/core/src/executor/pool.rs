//! Bounded tile worker pool
//!
//! The pool is the engine's injected computation facility: it computes one
//! tile of a lazy image and reports the outcome to a [`TileListener`]. The
//! orchestrator itself never computes tiles; it only submits requests here,
//! throttled by its own semaphore sized to the pool's parallelism.

use std::sync::Arc;

use crate::error::Error;
use crate::raster::{TileCoord, TileImage};

/// Completion callback for scheduled tiles.
///
/// Invoked from worker tasks, not from the orchestrating thread.
pub trait TileListener: Send + Sync + 'static {
    /// The tile was computed successfully.
    fn tile_computed(&self, coord: TileCoord);

    /// Tile computation failed (or was abandoned by the pool).
    fn tile_failed(&self, coord: TileCoord, error: Error);
}

/// Bounded-concurrency tile computation facility.
///
/// The parallelism level is fixed per pool and communicates how many tile
/// requests may usefully be in flight; submission itself never blocks.
pub struct TileWorkerPool {
    parallelism: usize,
}

impl TileWorkerPool {
    /// Creates a pool with the given parallelism (clamped to at least 1).
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Parallelism level of this pool.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Submits one tile request.
    ///
    /// Pulls the tile from `image` on a worker task — triggering upstream
    /// computation transitively — and reports the outcome to `listener`.
    pub fn schedule(
        &self,
        image: Arc<dyn TileImage>,
        coord: TileCoord,
        listener: Arc<dyn TileListener>,
    ) {
        tokio::spawn(async move {
            match image.tile(coord).await {
                Ok(_) => listener.tile_computed(coord),
                Err(e) => listener.tile_failed(coord, e),
            }
        });
    }
}

impl Default for TileWorkerPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
