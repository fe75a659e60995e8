//! Integration tests for the processor's concurrency model: the in-flight
//! bound, failure poisoning, and cooperative cancellation.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rastergraph_core::executor::{CancelToken, GraphContext, GraphObserver, GraphProcessor, TileWorkerPool};
use rastergraph_core::graph::{Graph, Node};
use rastergraph_core::operator::{
    Operator, OperatorContext, OperatorRegistry, SourceTiles, TargetBand, TargetDescriptor,
};
use rastergraph_core::raster::{Band, PixelType, Rect, TileBuffer, TileSize};
use rastergraph_core::{Error, Result};

// =============================================================================
// Test operators
// =============================================================================

/// Tracks how many tiles are computed at the same time.
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Source operator whose tiles take a little while, for probing the
/// in-flight bound.
struct SlowOp {
    probe: Arc<ConcurrencyProbe>,
    width: u32,
    height: u32,
    tile: u32,
}

#[async_trait]
impl Operator for SlowOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        Ok(TargetDescriptor::new(ctx.node_name(), self.width, self.height)
            .with_tile_size(TileSize::new(self.tile, self.tile))
            .with_band(TargetBand::computed(Band::new(
                "data",
                PixelType::F32,
                self.width,
                self.height,
            ))))
    }

    async fn compute_tile(
        &self,
        _band: &str,
        rect: Rect,
        _sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        self.probe.enter();
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.probe.exit();
        Ok(TileBuffer::new(rect))
    }
}

/// Source operator failing at one specific tile coordinate.
struct FailAtOp {
    fail_x: u32,
    fail_y: u32,
    computed: Arc<AtomicUsize>,
}

#[async_trait]
impl Operator for FailAtOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        Ok(TargetDescriptor::new(ctx.node_name(), 40, 40)
            .with_tile_size(TileSize::new(10, 10))
            .with_band(TargetBand::computed(Band::new(
                "data",
                PixelType::F32,
                40,
                40,
            ))))
    }

    async fn compute_tile(
        &self,
        _band: &str,
        rect: Rect,
        _sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        if rect.x / 10 == self.fail_x && rect.y / 10 == self.fail_y {
            return Err(Error::Operator("injected tile failure".to_string()));
        }
        self.computed.fetch_add(1, Ordering::SeqCst);
        Ok(TileBuffer::new(rect))
    }
}

/// Observer that cancels the run at the first tile event.
struct CancelOnFirstTile {
    token: CancelToken,
}

impl GraphObserver for CancelOnFirstTile {
    fn tile_started(&self, _ctx: &GraphContext, _rect: Rect) {
        self.token.cancel();
    }
}

// =============================================================================
// In-flight bound
// =============================================================================

#[tokio::test]
async fn test_in_flight_tiles_never_exceed_parallelism() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let mut registry = OperatorRegistry::with_builtins();
    let probe_clone = probe.clone();
    registry.register("slow", move || {
        Box::new(SlowOp {
            probe: probe_clone.clone(),
            width: 16,
            height: 16,
            tile: 2,
        })
    });

    let mut graph = Graph::new("bounded");
    graph.add_node(Node::new("out", "slow"));

    let parallelism = 3;
    let processor = GraphProcessor::with_pool(Arc::new(TileWorkerPool::new(parallelism)));
    processor
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap();

    // 8x8 grid, all computed, never more than `parallelism` at once
    assert_eq!(probe.total.load(Ordering::SeqCst), 64);
    assert!(probe.peak.load(Ordering::SeqCst) <= parallelism);
    assert!(probe.peak.load(Ordering::SeqCst) >= 1);
}

// =============================================================================
// Scenario C: failure poisoning
// =============================================================================

#[tokio::test]
async fn test_injected_failure_surfaces_and_releases_permits() {
    let computed = Arc::new(AtomicUsize::new(0));
    let mut registry = OperatorRegistry::with_builtins();
    let computed_clone = computed.clone();
    registry.register("fail_at", move || {
        Box::new(FailAtOp {
            fail_x: 1,
            fail_y: 1,
            computed: computed_clone.clone(),
        })
    });

    let mut graph = Graph::new("poisoned");
    graph.add_node(Node::new("out", "fail_at"));

    let processor = GraphProcessor::with_pool(Arc::new(TileWorkerPool::new(2)));
    let err = processor
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap_err();

    // The run fails referencing the failing tile, with the cause attached
    let text = err.to_string();
    assert!(text.contains("(1, 1)"), "unexpected error: {text}");
    assert!(matches!(err, Error::TileComputation { .. }));
    let cause = std::error::Error::source(&err).expect("cause attached");
    assert!(cause.to_string().contains("injected tile failure"));

    // The semaphore is not left exhausted: the same processor can run a
    // healthy graph to completion afterwards
    let mut clean = Graph::new("clean");
    clean.add_node(Node::new("out", "constant").with_params(json!({
        "width": 8, "height": 8, "value": 1.0,
        "tile_size": { "width": 4, "height": 4 }
    })));
    processor
        .execute_graph(&clean, &OperatorRegistry::with_builtins(), &CancelToken::new())
        .await
        .unwrap();
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_pre_cancelled_run_computes_nothing() {
    let computed = Arc::new(AtomicUsize::new(0));
    let mut registry = OperatorRegistry::with_builtins();
    let computed_clone = computed.clone();
    registry.register("fail_at", move || {
        Box::new(FailAtOp {
            // Coordinate outside the grid: this operator never fails here,
            // it only counts computations
            fail_x: 99,
            fail_y: 99,
            computed: computed_clone.clone(),
        })
    });

    let mut graph = Graph::new("cancelled");
    graph.add_node(Node::new("out", "fail_at"));

    let token = CancelToken::new();
    token.cancel();

    let products = GraphProcessor::new()
        .execute_graph(&graph, &registry, &token)
        .await
        .unwrap();

    // Cancellation is an early, intentionally incomplete return - not an
    // error - and no tile was requested
    assert_eq!(products.len(), 1);
    assert_eq!(computed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mid_run_cancellation_stops_the_loop() {
    let computed = Arc::new(AtomicUsize::new(0));
    let mut registry = OperatorRegistry::with_builtins();
    let computed_clone = computed.clone();
    registry.register("fail_at", move || {
        Box::new(FailAtOp {
            fail_x: 99,
            fail_y: 99,
            computed: computed_clone.clone(),
        })
    });

    let mut graph = Graph::new("cancel-mid");
    graph.add_node(Node::new("out", "fail_at"));

    let token = CancelToken::new();
    let mut processor = GraphProcessor::with_pool(Arc::new(TileWorkerPool::new(1)));
    processor.add_observer(Box::new(CancelOnFirstTile {
        token: token.clone(),
    }));

    let products = processor
        .execute_graph(&graph, &registry, &token)
        .await
        .unwrap();
    assert_eq!(products.len(), 1);

    // The 4x4 grid was abandoned after the first coordinate; already
    // submitted tiles were allowed to finish
    assert!(computed.load(Ordering::SeqCst) <= 1);
}
