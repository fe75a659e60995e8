//! Graph processor
//!
//! The orchestrator: builds the [`GraphContext`], selects the scheduling
//! mode, and drives tile computation across all output nodes through the
//! worker pool — applying backpressure with a counting semaphore sized to
//! the pool's parallelism, funneling failures into a single
//! first-write-wins error slot, and reporting progress to observers.
//!
//! # Scheduling modes
//!
//! If any non-output node declares tile-stack support the run is scheduled
//! stack-wise: the grid coordinate is the outer loop and pulling one band
//! per output triggers the whole computed-together unit. Otherwise every
//! band's tiles are demanded independently, with the node as the outer
//! loop.
//!
//! # Concurrency
//!
//! The orchestrator runs on a single task. Before each submission it
//! acquires one permit; completions release one permit from worker tasks.
//! The first failure releases all permits at once so nothing deadlocks,
//! and no new tiles are submitted afterwards. At the end of the loop the
//! orchestrator reacquires every permit, draining in-flight work before
//! the run is declared finished.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::executor::context::{ExternalProduct, GraphContext, NodeContext};
use crate::executor::observer::GraphObserver;
use crate::executor::pool::{TileListener, TileWorkerPool};
use crate::graph::Graph;
use crate::operator::OperatorRegistry;
use crate::raster::{Product, Rect, TileCoord, TileImage};

/// Cooperative cancellation signal, polled by the orchestrator once per
/// tile-grid coordinate.
///
/// Cancellation is not an error: a cancelled run returns whatever outputs
/// exist, intentionally incomplete. In-flight tiles are not preempted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Single-assignment error cell shared between the orchestrator and the
/// worker-pool callbacks. First write wins; later errors are logged and
/// dropped.
struct ErrorSlot {
    slot: Mutex<Option<Error>>,
}

impl ErrorSlot {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn set(&self, error: Error) {
        let mut guard = self.slot.lock();
        if guard.is_none() {
            *guard = Some(error);
        } else {
            tracing::debug!(error = %error, "suppressing follow-up tile error");
        }
    }

    fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn take(&self) -> Option<Error> {
        self.slot.lock().take()
    }
}

/// Completion listener wiring the worker pool back into the semaphore.
///
/// Success returns one permit. Failure or pool-side cancellation poisons
/// the run: the error lands in the slot and all permits are released at
/// once so any waiter unblocks.
struct PoolCompletionListener {
    semaphore: Arc<Semaphore>,
    parallelism: usize,
    slot: Arc<ErrorSlot>,
}

impl TileListener for PoolCompletionListener {
    fn tile_computed(&self, _coord: TileCoord) {
        self.semaphore.add_permits(1);
    }

    fn tile_failed(&self, coord: TileCoord, error: Error) {
        tracing::warn!(tile = %coord, error = %error, "tile computation failed");
        self.slot.set(error);
        self.semaphore.add_permits(self.parallelism);
    }
}

/// The uniform tile iteration grid: the largest tile counts needed to
/// cover any output node's raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    /// Number of tile columns
    pub tiles_x: u32,
    /// Number of tile rows
    pub tiles_y: u32,
}

/// Computes the maximum tile layout across the given output contexts,
/// using each output's own (or derived default) tile size.
pub fn max_tile_grid(outputs: &[Arc<NodeContext>]) -> TileGrid {
    let mut tiles_x = 0;
    let mut tiles_y = 0;
    for output in outputs {
        let layout = output.target().scene_layout();
        tiles_x = tiles_x.max(layout.tile_count_x());
        tiles_y = tiles_y.max(layout.tile_count_y());
    }
    TileGrid { tiles_x, tiles_y }
}

enum LoopExit {
    Completed,
    Cancelled,
    Poisoned,
}

/// Executes processing graphs.
pub struct GraphProcessor {
    pool: Arc<TileWorkerPool>,
    observers: Vec<Box<dyn GraphObserver>>,
}

impl GraphProcessor {
    /// Creates a processor with a default worker pool (one permit per CPU).
    pub fn new() -> Self {
        Self::with_pool(Arc::new(TileWorkerPool::default()))
    }

    /// Creates a processor over the given worker pool.
    pub fn with_pool(pool: Arc<TileWorkerPool>) -> Self {
        Self {
            pool,
            observers: Vec::new(),
        }
    }

    /// Registers an observer. Observers are notified synchronously, in
    /// registration order.
    pub fn add_observer(&mut self, observer: Box<dyn GraphObserver>) {
        self.observers.push(observer);
    }

    /// The worker pool driving tile computation.
    pub fn pool(&self) -> &Arc<TileWorkerPool> {
        &self.pool
    }

    /// Executes `graph`: builds a fresh [`GraphContext`], runs it, and
    /// disposes it. Returns the output products, which may be incomplete
    /// when the run was cancelled.
    pub async fn execute_graph(
        &self,
        graph: &Graph,
        registry: &OperatorRegistry,
        cancel: &CancelToken,
    ) -> Result<Vec<Arc<Product>>> {
        self.execute_graph_with_products(graph, registry, HashMap::new(), cancel)
            .await
    }

    /// Like [`execute_graph`](Self::execute_graph), with externally
    /// supplied source products available under their reference names.
    pub async fn execute_graph_with_products(
        &self,
        graph: &Graph,
        registry: &OperatorRegistry,
        externals: HashMap<String, ExternalProduct>,
        cancel: &CancelToken,
    ) -> Result<Vec<Arc<Product>>> {
        let mut ctx = GraphContext::with_external_products(graph, registry, externals).await?;
        let result = self.execute_context(&ctx, cancel).await;
        ctx.dispose().await;
        result
    }

    /// Executes an already-built context. The caller keeps ownership and
    /// is responsible for disposing it.
    pub async fn execute_context(
        &self,
        ctx: &GraphContext,
        cancel: &CancelToken,
    ) -> Result<Vec<Arc<Product>>> {
        self.fire_processing_started(ctx);
        tracing::info!(
            graph = ctx.graph().id(),
            nodes = ctx.contexts().len(),
            "graph processing started"
        );

        let result = self.run(ctx, cancel).await;

        self.fire_processing_stopped(ctx);
        match &result {
            Ok(products) => tracing::info!(
                graph = ctx.graph().id(),
                outputs = products.len(),
                "graph processing stopped"
            ),
            Err(error) => tracing::error!(
                graph = ctx.graph().id(),
                error = %error,
                "graph processing failed"
            ),
        }
        result
    }

    async fn run(&self, ctx: &GraphContext, cancel: &CancelToken) -> Result<Vec<Arc<Product>>> {
        let outputs = ctx.output_contexts();
        let grid = max_tile_grid(&outputs);
        let parallelism = self.pool.parallelism();
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let slot = Arc::new(ErrorSlot::new());
        let listener: Arc<dyn TileListener> = Arc::new(PoolCompletionListener {
            semaphore: semaphore.clone(),
            parallelism,
            slot: slot.clone(),
        });

        // Any non-output node computing tile-stacks switches the whole run
        // into stack-wise scheduling.
        let stack_mode = ctx
            .contexts()
            .iter()
            .any(|c| !c.is_output() && c.computes_tile_stack());
        tracing::debug!(
            tiles_x = grid.tiles_x,
            tiles_y = grid.tiles_y,
            parallelism,
            stack_mode,
            "computing raster data"
        );

        let exit = if stack_mode {
            self.run_stack_loop(ctx, &outputs, grid, &semaphore, &slot, &listener, cancel)
                .await?
        } else {
            self.run_independent_loop(ctx, &outputs, grid, &semaphore, &slot, &listener, cancel)
                .await?
        };

        // Drain: wait for everything in flight before finishing the run
        let drained = semaphore
            .acquire_many(parallelism as u32)
            .await
            .map_err(|_| Error::Execution("tile semaphore closed".to_string()))?;
        drop(drained);

        if let Some(error) = slot.take() {
            return Err(error);
        }
        if matches!(exit, LoopExit::Cancelled) {
            tracing::info!(
                graph = ctx.graph().id(),
                "cancelled; returning partial outputs"
            );
        }
        Ok(ctx.output_products())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stack_loop(
        &self,
        ctx: &GraphContext,
        outputs: &[Arc<NodeContext>],
        grid: TileGrid,
        semaphore: &Arc<Semaphore>,
        slot: &Arc<ErrorSlot>,
        listener: &Arc<dyn TileListener>,
        cancel: &CancelToken,
    ) -> Result<LoopExit> {
        for tile_y in 0..grid.tiles_y {
            for tile_x in 0..grid.tiles_x {
                if cancel.is_cancelled() {
                    return Ok(LoopExit::Cancelled);
                }
                let coord = TileCoord::new(tile_x, tile_y);

                for output in outputs {
                    let tile_size = output.target().tile_size();
                    let rect = Rect::new(
                        tile_x * tile_size.width,
                        tile_y * tile_size.height,
                        tile_size.width,
                        tile_size.height,
                    );
                    self.fire_tile_started(ctx, rect);

                    // (1) Pull the tile of the first computed band inside
                    // bounds. For stack nodes this triggers computation of
                    // every band of the unit.
                    for binding in output.computed_bindings() {
                        if !binding.image.layout().contains(coord) {
                            // Coordinate outside this band, probably a
                            // smaller raster sharing the grid
                            continue;
                        }
                        if !self
                            .order_tile(&binding.image, coord, semaphore, slot, listener)
                            .await?
                        {
                            return Ok(LoopExit::Poisoned);
                        }
                        break;
                    }

                    // (2) Pull tiles of the remaining pass-through bands.
                    for binding in output.pass_through_bindings() {
                        if binding.image.layout().contains(coord)
                            && !self
                                .order_tile(&binding.image, coord, semaphore, slot, listener)
                                .await?
                        {
                            return Ok(LoopExit::Poisoned);
                        }
                    }
                    self.fire_tile_stopped(ctx, rect);
                }
                tracing::trace!(tile_x, tile_y, "tile grid coordinate submitted");
            }
        }
        Ok(LoopExit::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_independent_loop(
        &self,
        ctx: &GraphContext,
        outputs: &[Arc<NodeContext>],
        grid: TileGrid,
        semaphore: &Arc<Semaphore>,
        slot: &Arc<ErrorSlot>,
        listener: &Arc<dyn TileListener>,
        cancel: &CancelToken,
    ) -> Result<LoopExit> {
        for output in outputs {
            let tile_size = output.target().tile_size();
            for binding in output.bindings() {
                let layout = binding.image.layout();
                for tile_y in 0..grid.tiles_y {
                    for tile_x in 0..grid.tiles_x {
                        if cancel.is_cancelled() {
                            return Ok(LoopExit::Cancelled);
                        }
                        let coord = TileCoord::new(tile_x, tile_y);
                        if !layout.contains(coord) {
                            continue;
                        }
                        let rect = Rect::new(
                            tile_x * tile_size.width,
                            tile_y * tile_size.height,
                            tile_size.width,
                            tile_size.height,
                        );
                        self.fire_tile_started(ctx, rect);
                        let submitted = self
                            .order_tile(&binding.image, coord, semaphore, slot, listener)
                            .await?;
                        self.fire_tile_stopped(ctx, rect);
                        if !submitted {
                            return Ok(LoopExit::Poisoned);
                        }
                    }
                }
            }
            // Progress is credited once per node here; crediting per tile
            // would overweight this mode against stack scheduling
            tracing::debug!(node = output.name(), "output node tiles requested");
        }
        Ok(LoopExit::Completed)
    }

    /// Submits one tile request, honoring backpressure and poisoning.
    ///
    /// Returns false when the run is already poisoned and no further tiles
    /// may be submitted.
    async fn order_tile(
        &self,
        image: &Arc<dyn TileImage>,
        coord: TileCoord,
        semaphore: &Arc<Semaphore>,
        slot: &Arc<ErrorSlot>,
        listener: &Arc<dyn TileListener>,
    ) -> Result<bool> {
        let permit = semaphore
            .acquire()
            .await
            .map_err(|_| Error::Execution("tile semaphore closed".to_string()))?;
        // The matching release happens in the completion listener
        permit.forget();

        if slot.is_set() {
            semaphore.add_permits(self.pool.parallelism());
            return Ok(false);
        }

        self.pool.schedule(image.clone(), coord, listener.clone());
        Ok(true)
    }

    fn fire_processing_started(&self, ctx: &GraphContext) {
        for observer in &self.observers {
            observer.processing_started(ctx);
        }
    }

    fn fire_processing_stopped(&self, ctx: &GraphContext) {
        for observer in &self.observers {
            observer.processing_stopped(ctx);
        }
    }

    fn fire_tile_started(&self, ctx: &GraphContext, rect: Rect) {
        for observer in &self.observers {
            observer.tile_started(ctx, rect);
        }
    }

    fn fire_tile_stopped(&self, ctx: &GraphContext, rect: Rect) {
        for observer in &self.observers {
            observer.tile_stopped(ctx, rect);
        }
    }
}

impl Default for GraphProcessor {
    fn default() -> Self {
        Self::new()
    }
}
