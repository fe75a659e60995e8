//! Runtime contexts for one graph execution
//!
//! A [`GraphContext`] instantiates a [`Graph`](crate::graph::Graph) for one
//! run: it builds a [`NodeContext`] per node in sources-before-dependents
//! order, wires every band to its lazy image, and owns disposal of all
//! underlying operators. Construction is atomic — on any failure the
//! already-built contexts are disposed and no partial context escapes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::images::{OperatorImage, StackCache, StackImage};
use crate::graph::{Graph, Node};
use crate::operator::{
    BandContent, OperatorContext, OperatorRegistry, SharedOperator, SourceBinding, SourceTiles,
    TargetDescriptor,
};
use crate::raster::{BufferImage, Product, TileImage, TileLayout};

/// An externally supplied product: descriptor plus one lazy image per band.
pub struct ExternalProduct {
    /// Product descriptor
    pub product: Arc<Product>,
    /// Lazy image per band name
    pub images: HashMap<String, Arc<dyn TileImage>>,
}

impl ExternalProduct {
    /// Wraps a product whose bands are fully materialized in memory.
    ///
    /// `rasters` maps band names to row-major sample arrays covering the
    /// band's full extent.
    pub fn from_materialized(product: Product, mut rasters: HashMap<String, Vec<f32>>) -> Result<Self> {
        let tile_size = product.tile_size();
        let mut images: HashMap<String, Arc<dyn TileImage>> = HashMap::new();
        for band in &product.bands {
            let samples = rasters.remove(&band.name).ok_or_else(|| {
                Error::Graph(format!(
                    "external product '{}' has no raster for band '{}'",
                    product.name, band.name
                ))
            })?;
            let layout = TileLayout::new(band.width, band.height, tile_size);
            images.insert(band.name.clone(), Arc::new(BufferImage::new(layout, samples)));
        }
        Ok(Self {
            product: Arc::new(product),
            images,
        })
    }
}

/// How one band of a node context is served.
pub struct BandBinding {
    /// Band name
    pub band: String,
    /// The image tiles are pulled from
    pub image: Arc<dyn TileImage>,
    /// True when this node's operator computes the band; false for
    /// pass-through bands served by an upstream image
    pub computed: bool,
}

/// Per-execution runtime state of one node.
pub struct NodeContext {
    name: String,
    op_type: String,
    operator: SharedOperator,
    target: Arc<Product>,
    is_output: bool,
    computes_tile_stack: bool,
    bindings: Vec<BandBinding>,
}

impl NodeContext {
    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator type identifier.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// The materialized target product descriptor.
    pub fn target(&self) -> &Arc<Product> {
        &self.target
    }

    /// True if this node's product is part of the graph's result.
    pub fn is_output(&self) -> bool {
        self.is_output
    }

    /// True if this node's operator computes its bands as one stack.
    pub fn computes_tile_stack(&self) -> bool {
        self.computes_tile_stack
    }

    /// All band bindings in product band order.
    pub fn bindings(&self) -> &[BandBinding] {
        &self.bindings
    }

    /// Bindings of bands this node's operator computes itself.
    pub fn computed_bindings(&self) -> impl Iterator<Item = &BandBinding> {
        self.bindings.iter().filter(|b| b.computed)
    }

    /// Bindings of pass-through bands served by upstream images.
    pub fn pass_through_bindings(&self) -> impl Iterator<Item = &BandBinding> {
        self.bindings.iter().filter(|b| !b.computed)
    }

    /// Lazy image of `band`, computed or pass-through.
    pub fn band_image(&self, band: &str) -> Option<&Arc<dyn TileImage>> {
        self.bindings
            .iter()
            .find(|b| b.band == band)
            .map(|b| &b.image)
    }

    /// Image of `band` if this node's operator computes it.
    pub fn target_image(&self, band: &str) -> Option<&Arc<dyn TileImage>> {
        self.bindings
            .iter()
            .find(|b| b.band == band && b.computed)
            .map(|b| &b.image)
    }

    async fn dispose(&self) {
        let mut operator = self.operator.write().await;
        if let Err(e) = operator.dispose().await {
            tracing::warn!(node = %self.name, error = %e, "operator dispose failed");
        }
    }
}

/// Runtime state for one execution of a graph.
pub struct GraphContext {
    graph: Graph,
    contexts: Vec<Arc<NodeContext>>,
    by_name: HashMap<String, usize>,
    output_names: Vec<String>,
    disposed: bool,
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("nodes", &self.contexts.len())
            .field("output_names", &self.output_names)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl GraphContext {
    /// Builds the context for `graph`, creating and initializing one node
    /// context per node in sources-before-dependents order.
    pub async fn new(graph: &Graph, registry: &OperatorRegistry) -> Result<Self> {
        Self::with_external_products(graph, registry, HashMap::new()).await
    }

    /// Builds the context with externally supplied source products
    /// available under their reference names.
    pub async fn with_external_products(
        graph: &Graph,
        registry: &OperatorRegistry,
        externals: HashMap<String, ExternalProduct>,
    ) -> Result<Self> {
        let external_names: HashSet<String> = externals.keys().cloned().collect();
        graph.validate(&external_names)?;

        let output_names = graph.output_node_names();
        let output_set: HashSet<&str> = output_names.iter().map(String::as_str).collect();

        let mut contexts: Vec<Arc<NodeContext>> = Vec::with_capacity(graph.node_count());
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for node in graph.init_order()? {
            let built = build_node_context(
                node,
                registry,
                &externals,
                &contexts,
                &by_name,
                output_set.contains(node.name()),
            )
            .await;
            match built {
                Ok(ctx) => {
                    by_name.insert(node.name().to_string(), contexts.len());
                    contexts.push(Arc::new(ctx));
                }
                Err(e) => {
                    // Atomic failure: tear down everything built so far
                    for ctx in contexts.iter().rev() {
                        ctx.dispose().await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            graph = graph.id(),
            nodes = contexts.len(),
            outputs = output_names.len(),
            "graph context built"
        );

        Ok(Self {
            graph: graph.clone(),
            contexts,
            by_name,
            output_names,
            disposed: false,
        })
    }

    /// The executed graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// All node contexts in initialization order.
    pub fn contexts(&self) -> &[Arc<NodeContext>] {
        &self.contexts
    }

    /// Context of the named node.
    pub fn node_context(&self, name: &str) -> Option<&Arc<NodeContext>> {
        self.by_name.get(name).map(|&i| &self.contexts[i])
    }

    /// Contexts of the graph's output nodes, in output order.
    pub fn output_contexts(&self) -> Vec<Arc<NodeContext>> {
        self.output_names
            .iter()
            .filter_map(|name| self.node_context(name).cloned())
            .collect()
    }

    /// Target products of the output nodes.
    pub fn output_products(&self) -> Vec<Arc<Product>> {
        self.output_contexts()
            .iter()
            .map(|ctx| ctx.target().clone())
            .collect()
    }

    /// Disposes every node context exactly once, dependents before
    /// sources. Safe to call repeatedly.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for ctx in self.contexts.iter().rev() {
            ctx.dispose().await;
        }
        tracing::debug!(graph = self.graph.id(), "graph context disposed");
    }
}

/// Builds and initializes the context for one node. All of the node's
/// sources must already be present in `contexts`.
async fn build_node_context(
    node: &Node,
    registry: &OperatorRegistry,
    externals: &HashMap<String, ExternalProduct>,
    contexts: &[Arc<NodeContext>],
    by_name: &HashMap<String, usize>,
    is_output: bool,
) -> Result<NodeContext> {
    // Resolve source bindings (upstream product + per-band images)
    let mut slots = Vec::with_capacity(node.sources().len());
    let mut products = Vec::with_capacity(node.sources().len());
    let mut bindings = Vec::with_capacity(node.sources().len());
    for source in node.sources() {
        let (product, images) = if let Some(&index) = by_name.get(&source.source) {
            let upstream = &contexts[index];
            let images: HashMap<String, Arc<dyn TileImage>> = upstream
                .bindings()
                .iter()
                .map(|b| (b.band.clone(), b.image.clone()))
                .collect();
            (upstream.target().clone(), images)
        } else if let Some(external) = externals.get(&source.source) {
            (external.product.clone(), external.images.clone())
        } else {
            // validate() has already run; this guards the invariant
            return Err(Error::Graph(format!(
                "node '{}' references unknown source '{}'",
                node.name(),
                source.source
            )));
        };
        slots.push(source.name.clone());
        products.push(product.clone());
        bindings.push(SourceBinding { product, images });
    }

    let mut operator = registry.create(node.op_type())?;
    let op_ctx = OperatorContext::new(node.name(), node.params().clone(), slots, products);
    let descriptor = operator
        .initialize(&op_ctx)
        .await
        .map_err(|e| e.into_init(node.name()))?;
    validate_descriptor(node, &descriptor, &bindings)?;

    let computes_tile_stack = operator.computes_tile_stack();
    let target = Arc::new(descriptor.to_product());
    let tile_size = target.tile_size();
    let operator: SharedOperator = Arc::new(tokio::sync::RwLock::new(operator));
    let sources = Arc::new(SourceTiles::new(bindings));

    let has_computed_bands = descriptor
        .bands
        .iter()
        .any(|b| b.content == BandContent::Computed);
    let stack_cache = if computes_tile_stack && has_computed_bands {
        Some(Arc::new(StackCache::new(
            node.name(),
            target.scene_layout(),
            operator.clone(),
            sources.clone(),
        )))
    } else {
        None
    };

    let mut band_bindings = Vec::with_capacity(descriptor.bands.len());
    for target_band in &descriptor.bands {
        let layout = TileLayout::new(target_band.band.width, target_band.band.height, tile_size);
        let binding = match &target_band.content {
            BandContent::Computed => {
                let image: Arc<dyn TileImage> = match &stack_cache {
                    Some(cache) => Arc::new(StackImage::new(
                        target_band.band.name.clone(),
                        layout,
                        cache.clone(),
                    )),
                    None => Arc::new(OperatorImage::new(
                        node.name(),
                        target_band.band.name.clone(),
                        layout,
                        operator.clone(),
                        sources.clone(),
                    )),
                };
                BandBinding {
                    band: target_band.band.name.clone(),
                    image,
                    computed: true,
                }
            }
            BandContent::CopyOf { source, band } => BandBinding {
                band: target_band.band.name.clone(),
                image: sources.image(*source, band)?.clone(),
                computed: false,
            },
        };
        band_bindings.push(binding);
    }

    tracing::debug!(
        node = node.name(),
        op = node.op_type(),
        bands = band_bindings.len(),
        tile_stack = computes_tile_stack,
        output = is_output,
        "node context initialized"
    );

    Ok(NodeContext {
        name: node.name().to_string(),
        op_type: node.op_type().to_string(),
        operator,
        target,
        is_output,
        computes_tile_stack,
        bindings: band_bindings,
    })
}

/// Checks a freshly initialized descriptor against its node's wiring.
fn validate_descriptor(
    node: &Node,
    descriptor: &TargetDescriptor,
    sources: &[SourceBinding],
) -> Result<()> {
    let mut seen = HashSet::new();
    for target_band in &descriptor.bands {
        if !seen.insert(target_band.band.name.as_str()) {
            return Err(Error::Graph(format!(
                "node '{}' declares band '{}' twice",
                node.name(),
                target_band.band.name
            ))
            .into_init(node.name()));
        }
        if let BandContent::CopyOf { source, band } = &target_band.content {
            let binding = sources.get(*source).ok_or_else(|| {
                Error::Graph(format!(
                    "node '{}' copies band '{band}' from nonexistent source {source}",
                    node.name()
                ))
                .into_init(node.name())
            })?;
            if !binding.product.contains_band(band) {
                return Err(Error::Graph(format!(
                    "node '{}' copies unknown band '{band}' from source '{}'",
                    node.name(),
                    binding.product.name
                ))
                .into_init(node.name()));
            }
        }
    }
    Ok(())
}
