//! Integration tests for end-to-end graph execution: structural
//! validation, tiling layout, mode selection, pass-through bands, external
//! products and idempotence.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rastergraph_core::executor::{
    CancelToken, ExternalProduct, GraphContext, GraphObserver, GraphProcessor,
};
use rastergraph_core::graph::{Graph, Node};
use rastergraph_core::operator::{
    Operator, OperatorContext, OperatorRegistry, SourceTiles, TargetBand, TargetDescriptor,
};
use rastergraph_core::raster::{
    read_region, Band, PixelType, Product, Rect, TileBuffer, TileCoord, TileSize,
};
use rastergraph_core::{Error, Result};

// =============================================================================
// Test operators
// =============================================================================

/// Shared instrumentation for test operators.
#[derive(Default)]
struct Recording {
    computed_tiles: parking_lot::Mutex<Vec<TileCoord>>,
    compute_calls: AtomicUsize,
}

impl Recording {
    fn record(&self, rect: Rect, tile_size: TileSize) {
        self.compute_calls.fetch_add(1, Ordering::SeqCst);
        self.computed_tiles.lock().push(TileCoord::new(
            rect.x / tile_size.width,
            rect.y / tile_size.height,
        ));
    }

    fn tiles(&self) -> Vec<TileCoord> {
        let mut tiles = self.computed_tiles.lock().clone();
        tiles.sort();
        tiles
    }

    fn calls(&self) -> usize {
        self.compute_calls.load(Ordering::SeqCst)
    }
}

/// Copies its single source band, recording every computed tile.
struct RecordingCopyOp {
    recording: Arc<Recording>,
    source_band: String,
    tile_size: TileSize,
}

impl RecordingCopyOp {
    fn new(recording: Arc<Recording>) -> Self {
        Self {
            recording,
            source_band: String::new(),
            tile_size: TileSize::new(1, 1),
        }
    }
}

#[async_trait]
impl Operator for RecordingCopyOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        let source = ctx.source_product(0)?;
        let band = source
            .bands
            .first()
            .ok_or_else(|| Error::Operator("source has no bands".to_string()))?;
        self.source_band = band.name.clone();
        self.tile_size = source.tile_size();
        Ok(
            TargetDescriptor::new(ctx.node_name(), source.scene_width, source.scene_height)
                .with_tile_size(self.tile_size)
                .with_band(TargetBand::computed(Band::new(
                    "out",
                    PixelType::F32,
                    source.scene_width,
                    source.scene_height,
                ))),
        )
    }

    async fn compute_tile(
        &self,
        _band: &str,
        rect: Rect,
        sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        self.recording.record(rect, self.tile_size);
        sources.read(0, &self.source_band, rect).await
    }
}

/// Two computed bands over a fixed scene; not stack-capable.
struct TwoBandOp {
    width: u32,
    height: u32,
}

#[async_trait]
impl Operator for TwoBandOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        Ok(TargetDescriptor::new(ctx.node_name(), self.width, self.height)
            .with_tile_size(TileSize::new(10, 10))
            .with_band(TargetBand::computed(Band::new(
                "first",
                PixelType::F32,
                self.width,
                self.height,
            )))
            .with_band(TargetBand::computed(Band::new(
                "second",
                PixelType::F32,
                self.width,
                self.height,
            ))))
    }

    async fn compute_tile(
        &self,
        band: &str,
        rect: Rect,
        _sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        let value = if band == "first" { 1.0 } else { 2.0 };
        Ok(TileBuffer::from_samples(rect, vec![value; rect.len()]))
    }
}

/// Observer counting tile_started notifications.
#[derive(Default)]
struct TileCounter {
    started: AtomicUsize,
}

impl GraphObserver for TileCounter {
    fn tile_started(&self, _ctx: &GraphContext, _rect: Rect) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
}

fn registry_with_recorder(recording: Arc<Recording>) -> OperatorRegistry {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register("recording_copy", move || {
        Box::new(RecordingCopyOp::new(recording.clone()))
    });
    registry
}

async fn output_samples(ctx: &GraphContext, node: &str, band: &str) -> Vec<f32> {
    let node_ctx = ctx.node_context(node).expect("node context");
    let image = node_ctx.band_image(band).expect("band image");
    let layout = image.layout();
    let region = read_region(
        image.as_ref(),
        Rect::new(0, 0, layout.raster_width(), layout.raster_height()),
    )
    .await
    .expect("read region");
    region.samples().to_vec()
}

// =============================================================================
// Scenario A: linear two-node graph, 20x15 raster, 10x10 tiles
// =============================================================================

#[tokio::test]
async fn test_linear_graph_enumerates_2x2_grid() {
    let recording = Arc::new(Recording::default());
    let registry = registry_with_recorder(recording.clone());

    let mut graph = Graph::new("scenario-a");
    graph
        .add_node(Node::new("reader", "constant").with_params(json!({
            "width": 20, "height": 15, "value": 5.0,
            "tile_size": { "width": 10, "height": 10 }
        })))
        .add_node(Node::new("proc", "recording_copy").with_source("input", "reader"));

    let processor = GraphProcessor::new();
    let products = processor
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap();

    // Output dimensions match the declared target metadata
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].name, "proc");
    assert_eq!(products[0].scene_width, 20);
    assert_eq!(products[0].scene_height, 15);

    // Exactly a 2x2 tile grid was requested for the output band
    assert_eq!(
        recording.tiles(),
        vec![
            TileCoord::new(0, 0),
            TileCoord::new(0, 1),
            TileCoord::new(1, 0),
            TileCoord::new(1, 1),
        ]
    );
    assert!(recording.calls() >= 4);
}

// =============================================================================
// Scenario B: heterogeneous output sizes share one grid
// =============================================================================

#[tokio::test]
async fn test_smaller_output_skips_outside_coordinates() {
    let small = Arc::new(Recording::default());
    let large = Arc::new(Recording::default());

    let mut registry = OperatorRegistry::with_builtins();
    let small_clone = small.clone();
    registry.register("small_copy", move || {
        Box::new(RecordingCopyOp::new(small_clone.clone()))
    });
    let large_clone = large.clone();
    registry.register("large_copy", move || {
        Box::new(RecordingCopyOp::new(large_clone.clone()))
    });

    let mut graph = Graph::new("scenario-b");
    graph
        .add_node(Node::new("src_small", "constant").with_params(json!({
            "width": 10, "height": 10, "value": 1.0,
            "tile_size": { "width": 10, "height": 10 }
        })))
        .add_node(Node::new("src_large", "constant").with_params(json!({
            "width": 30, "height": 30, "value": 2.0,
            "tile_size": { "width": 10, "height": 10 }
        })))
        .add_node(Node::new("out_small", "small_copy").with_source("input", "src_small"))
        .add_node(Node::new("out_large", "large_copy").with_source("input", "src_large"));

    let processor = GraphProcessor::new();
    let products = processor
        .execute_graph(
            &graph,
            &registry,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(products.len(), 2);

    // The grid comes from the larger raster (3x3); the smaller output only
    // sees the single coordinate inside its own bounds
    assert_eq!(small.tiles(), vec![TileCoord::new(0, 0)]);
    assert_eq!(large.tiles().len(), 9);
}

// =============================================================================
// Mode selection
// =============================================================================

#[tokio::test]
async fn test_independent_mode_requests_each_band() {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register("two_band", || {
        Box::new(TwoBandOp {
            width: 20,
            height: 20,
        })
    });

    // No node declares tile-stack support: independent mode, one
    // tile_started per band per coordinate
    let mut graph = Graph::new("independent");
    graph.add_node(Node::new("out", "two_band"));

    let counter = Arc::new(TileCounter::default());
    let mut processor = GraphProcessor::new();
    processor.add_observer(Box::new(CountingObserver(counter.clone())));
    processor
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap();

    // 2 bands x 4 coordinates
    assert_eq!(counter.started.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_stack_declarer_switches_run_to_stack_mode() {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register("two_band", || {
        Box::new(TwoBandOp {
            width: 20,
            height: 20,
        })
    });

    // The non-output gradient node declares tile-stack support, which
    // switches the whole run to stack mode: one tile_started per output
    // per coordinate, regardless of band count
    let mut graph = Graph::new("stacked");
    graph
        .add_node(Node::new("grad", "stacked_gradient").with_params(json!({
            "width": 20, "height": 20, "bands": 2,
            "tile_size": { "width": 10, "height": 10 }
        })))
        .add_node(
            Node::new("out", "band_maths")
                .with_params(json!({ "band": "b0", "scale": 1.0 }))
                .with_source("input", "grad"),
        );

    let counter = Arc::new(TileCounter::default());
    let mut processor = GraphProcessor::new();
    processor.add_observer(Box::new(CountingObserver(counter.clone())));
    processor
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap();

    // 1 output x 4 coordinates
    assert_eq!(counter.started.load(Ordering::SeqCst), 4);
}

/// Forwards to a shared [`TileCounter`].
struct CountingObserver(Arc<TileCounter>);

impl GraphObserver for CountingObserver {
    fn tile_started(&self, ctx: &GraphContext, rect: Rect) {
        self.0.tile_started(ctx, rect);
    }
}

// =============================================================================
// Structural and initialization failures
// =============================================================================

#[tokio::test]
async fn test_unknown_operator_fails_before_tiles() {
    let recording = Arc::new(Recording::default());
    let registry = registry_with_recorder(recording.clone());

    let mut graph = Graph::new("bad");
    graph.add_node(Node::new("n", "does_not_exist"));

    let err = GraphProcessor::new()
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown operator type"));
    assert_eq!(recording.calls(), 0);
}

#[tokio::test]
async fn test_cycle_fails_before_tiles() {
    let registry = OperatorRegistry::with_builtins();
    let mut graph = Graph::new("cyclic");
    graph
        .add_node(Node::new("a", "merge").with_source("input", "b"))
        .add_node(Node::new("b", "merge").with_source("input", "a"));

    let err = GraphProcessor::new()
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[tokio::test]
async fn test_initialization_error_aborts_run() {
    let recording = Arc::new(Recording::default());
    let registry = registry_with_recorder(recording.clone());

    let mut graph = Graph::new("bad-init");
    graph
        .add_node(Node::new("src", "constant").with_params(json!({
            "width": 10, "height": 10, "value": 1.0
        })))
        // merge with zero sources fails initialize
        .add_node(Node::new("broken", "merge"))
        .add_node(Node::new("copy", "recording_copy").with_source("input", "src"));

    let err = GraphProcessor::new()
        .execute_graph(&graph, &registry, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Init { .. }));
    assert_eq!(recording.calls(), 0);
}

// =============================================================================
// Pass-through bands and external products
// =============================================================================

#[tokio::test]
async fn test_merge_serves_bands_from_upstream_images() {
    let registry = OperatorRegistry::with_builtins();
    let mut graph = Graph::new("merge");
    graph
        .add_node(Node::new("a", "constant").with_params(json!({
            "width": 8, "height": 8, "value": 4.0, "bands": ["x"],
            "tile_size": { "width": 4, "height": 4 }
        })))
        .add_node(Node::new("b", "constant").with_params(json!({
            "width": 8, "height": 8, "value": 6.0, "bands": ["y"],
            "tile_size": { "width": 4, "height": 4 }
        })))
        .add_node(
            Node::new("merged", "merge")
                .with_source("a", "a")
                .with_source("b", "b"),
        );

    let ctx = GraphContext::new(&graph, &registry).await.unwrap();
    let processor = GraphProcessor::new();
    processor
        .execute_context(&ctx, &CancelToken::new())
        .await
        .unwrap();

    let x = output_samples(&ctx, "merged", "x").await;
    let y = output_samples(&ctx, "merged", "y").await;
    assert!(x.iter().all(|&v| v == 4.0));
    assert!(y.iter().all(|&v| v == 6.0));

    let mut ctx = ctx;
    ctx.dispose().await;
}

#[tokio::test]
async fn test_external_product_feeds_graph() {
    let mut product = Product::new("ext", 6, 6);
    product.preferred_tile_size = Some(TileSize::new(3, 3));
    product.bands.push(Band::new("b", PixelType::F32, 6, 6));
    let samples: Vec<f32> = (0..36).map(|i| i as f32).collect();
    let external = ExternalProduct::from_materialized(
        product,
        HashMap::from([("b".to_string(), samples)]),
    )
    .unwrap();

    let registry = OperatorRegistry::with_builtins();
    let mut graph = Graph::new("with-external");
    graph.add_node(
        Node::new("scaled", "band_maths")
            .with_params(json!({ "scale": 2.0, "offset": 1.0 }))
            .with_source("input", "ext"),
    );

    let ctx = GraphContext::with_external_products(
        &graph,
        &registry,
        HashMap::from([("ext".to_string(), external)]),
    )
    .await
    .unwrap();
    GraphProcessor::new()
        .execute_context(&ctx, &CancelToken::new())
        .await
        .unwrap();

    let samples = output_samples(&ctx, "scaled", "b").await;
    assert_eq!(samples[0], 1.0);
    assert_eq!(samples[35], 71.0);

    let mut ctx = ctx;
    ctx.dispose().await;
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_same_graph_twice_yields_identical_rasters() {
    let registry = OperatorRegistry::with_builtins();
    let mut graph = Graph::new("repeat");
    graph
        .add_node(Node::new("grad", "stacked_gradient").with_params(json!({
            "width": 12, "height": 12, "bands": 2,
            "tile_size": { "width": 4, "height": 4 }
        })))
        .add_node(
            Node::new("out", "band_maths")
                .with_params(json!({ "band": "b1", "scale": 0.5 }))
                .with_source("input", "grad"),
        );

    let processor = GraphProcessor::new();
    let mut runs = Vec::new();
    for _ in 0..2 {
        let ctx = GraphContext::new(&graph, &registry).await.unwrap();
        processor
            .execute_context(&ctx, &CancelToken::new())
            .await
            .unwrap();
        runs.push(output_samples(&ctx, "out", "b1").await);
        let mut ctx = ctx;
        ctx.dispose().await;
    }
    assert_eq!(runs[0], runs[1]);
}

// =============================================================================
// Manifest round trip
// =============================================================================

#[tokio::test]
async fn test_yaml_manifest_end_to_end() {
    let yaml = r#"
version: v1
header:
  id: chain
nodes:
  - id: source
    op: constant
    params:
      width: 20
      height: 15
      value: 3.0
      tile_size: { width: 10, height: 10 }
  - id: scaled
    op: band_maths
    params:
      scale: 2.0
    sources:
      - name: input
        from: source
    is_output: true
"#;
    let graph = rastergraph_core::manifest::parse_yaml(yaml)
        .unwrap()
        .into_graph()
        .unwrap();

    let registry = OperatorRegistry::with_builtins();
    let ctx = GraphContext::new(&graph, &registry).await.unwrap();
    GraphProcessor::new()
        .execute_context(&ctx, &CancelToken::new())
        .await
        .unwrap();

    let samples = output_samples(&ctx, "scaled", "data").await;
    assert_eq!(samples.len(), 20 * 15);
    assert!(samples.iter().all(|&v| v == 6.0));

    let mut ctx = ctx;
    ctx.dispose().await;
}
