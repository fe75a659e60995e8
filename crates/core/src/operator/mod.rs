//! The operator contract
//!
//! Operators are the engine's unit of domain computation. The engine knows
//! nothing about pixels beyond moving them: an [`Operator`] declares its
//! target product during [`initialize`](Operator::initialize) and computes
//! raster data tile-by-tile when asked, pulling upstream tiles through a
//! [`SourceTiles`] handle (which triggers their computation transitively).

pub mod builtin;
pub mod registry;

pub use registry::{OperatorFactory, OperatorRegistry};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::raster::image::read_region;
use crate::raster::{Band, Product, Rect, TileBuffer, TileImage, TileSize, TileStack};

/// How one target band gets its pixel data.
///
/// Resolved once during graph-context construction into the per-band image
/// bindings; the tile loop never re-inspects band identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandContent {
    /// The operator computes this band itself.
    Computed,
    /// Pass-through of an upstream band: tiles are pulled directly from the
    /// referenced source image, bypassing this node's operator.
    CopyOf {
        /// Index into the node's ordered source list
        source: usize,
        /// Band name within that source product
        band: String,
    },
}

/// One band of a target descriptor.
#[derive(Debug, Clone)]
pub struct TargetBand {
    /// Band metadata
    pub band: Band,
    /// Where the band's data comes from
    pub content: BandContent,
}

impl TargetBand {
    /// A band the operator computes itself.
    pub fn computed(band: Band) -> Self {
        Self {
            band,
            content: BandContent::Computed,
        }
    }

    /// A pass-through of `band` from source `source`.
    pub fn copy_of(band: Band, source: usize, source_band: impl Into<String>) -> Self {
        Self {
            band,
            content: BandContent::CopyOf {
                source,
                band: source_band.into(),
            },
        }
    }
}

/// Target product descriptor returned by [`Operator::initialize`].
///
/// Describes dimensions, tiling and bands without computing any pixel data.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    /// Product name
    pub name: String,
    /// Scene width in pixels
    pub scene_width: u32,
    /// Scene height in pixels
    pub scene_height: u32,
    /// Preferred tile size; a default is derived when absent
    pub preferred_tile_size: Option<TileSize>,
    /// Bands in declaration order
    pub bands: Vec<TargetBand>,
}

impl TargetDescriptor {
    /// Creates a descriptor with no bands yet.
    pub fn new(name: impl Into<String>, scene_width: u32, scene_height: u32) -> Self {
        Self {
            name: name.into(),
            scene_width,
            scene_height,
            preferred_tile_size: None,
            bands: Vec::new(),
        }
    }

    /// Sets the preferred tile size.
    pub fn with_tile_size(mut self, tile_size: TileSize) -> Self {
        self.preferred_tile_size = Some(tile_size);
        self
    }

    /// Appends a band.
    pub fn with_band(mut self, band: TargetBand) -> Self {
        self.bands.push(band);
        self
    }

    /// Derives the [`Product`] described by this descriptor.
    pub fn to_product(&self) -> Product {
        Product {
            name: self.name.clone(),
            scene_width: self.scene_width,
            scene_height: self.scene_height,
            preferred_tile_size: self.preferred_tile_size,
            bands: self.bands.iter().map(|b| b.band.clone()).collect(),
        }
    }
}

/// Initialization context handed to [`Operator::initialize`]: the node's
/// identity, configuration, and the already-initialized upstream products.
pub struct OperatorContext {
    node_name: String,
    params: serde_json::Value,
    source_slots: Vec<String>,
    source_products: Vec<Arc<Product>>,
}

impl OperatorContext {
    /// Creates a new context.
    pub fn new(
        node_name: impl Into<String>,
        params: serde_json::Value,
        source_slots: Vec<String>,
        source_products: Vec<Arc<Product>>,
    ) -> Self {
        debug_assert_eq!(source_slots.len(), source_products.len());
        Self {
            node_name: node_name.into(),
            params,
            source_slots,
            source_products,
        }
    }

    /// Name of the node this operator runs under.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Raw configuration value.
    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Deserializes the configuration into a typed parameter struct.
    pub fn parameters<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            Error::Operator(format!(
                "invalid parameters for node '{}': {e}",
                self.node_name
            ))
        })
    }

    /// Number of connected sources.
    pub fn source_count(&self) -> usize {
        self.source_products.len()
    }

    /// Upstream product at `index` (declaration order).
    pub fn source_product(&self, index: usize) -> Result<&Arc<Product>> {
        self.source_products.get(index).ok_or_else(|| {
            Error::Operator(format!(
                "node '{}' has no source at index {index}",
                self.node_name
            ))
        })
    }

    /// Upstream product by input slot name.
    pub fn source_product_by_name(&self, slot: &str) -> Result<&Arc<Product>> {
        self.source_slots
            .iter()
            .position(|s| s == slot)
            .map(|i| &self.source_products[i])
            .ok_or_else(|| {
                Error::Operator(format!(
                    "node '{}' has no source slot '{slot}'",
                    self.node_name
                ))
            })
    }
}

/// One resolved upstream of a node: its product plus the lazy image of
/// every band.
pub struct SourceBinding {
    /// Upstream product descriptor
    pub product: Arc<Product>,
    /// Lazy image per band name
    pub images: HashMap<String, Arc<dyn TileImage>>,
}

/// Read handle for upstream rasters, given to tile computation.
///
/// Reads pull tiles through the upstream lazy images, triggering their
/// computation transitively through the dependency chain.
pub struct SourceTiles {
    bindings: Vec<SourceBinding>,
}

impl SourceTiles {
    /// Creates a handle over the given bindings.
    pub fn new(bindings: Vec<SourceBinding>) -> Self {
        Self { bindings }
    }

    /// Handle with no sources (leaf nodes).
    pub fn empty() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if there are no sources.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Upstream product at `index`.
    pub fn product(&self, index: usize) -> Result<&Arc<Product>> {
        self.bindings
            .get(index)
            .map(|b| &b.product)
            .ok_or_else(|| Error::Operator(format!("no source at index {index}")))
    }

    /// Lazy image of `band` in source `index`.
    pub fn image(&self, index: usize, band: &str) -> Result<&Arc<dyn TileImage>> {
        let binding = self
            .bindings
            .get(index)
            .ok_or_else(|| Error::Operator(format!("no source at index {index}")))?;
        binding.images.get(band).ok_or_else(|| {
            Error::Operator(format!(
                "source {index} ('{}') has no band '{band}'",
                binding.product.name
            ))
        })
    }

    /// Reads an arbitrary pixel region of an upstream band, assembling it
    /// from the covering tiles.
    pub async fn read(&self, index: usize, band: &str, rect: Rect) -> Result<TileBuffer> {
        let image = self.image(index, band)?;
        read_region(image.as_ref(), rect).await
    }
}

/// The operator lifecycle trait.
///
/// All domain computation enters the engine through this contract. The
/// engine initializes operators once (sources before dependents), pulls
/// tiles concurrently through `compute_tile`/`compute_tile_stack`, and
/// disposes each operator exactly once when the run's context is disposed.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Produces the target product descriptor without computing pixel data.
    ///
    /// Called once per run, after all source operators have initialized.
    /// Auxiliary resources (DEMs, model weights, masks) are read here,
    /// exactly once.
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor>;

    /// Computes pixel values for one band over one rectangular region.
    ///
    /// May read upstream tiles through `sources`. Called concurrently for
    /// different tiles; implementations must not rely on tile completion
    /// order.
    async fn compute_tile(
        &self,
        band: &str,
        rect: Rect,
        sources: &SourceTiles,
    ) -> Result<TileBuffer>;

    /// Computes all of this node's computed bands for one region in a
    /// single call.
    ///
    /// Only invoked when [`computes_tile_stack`](Self::computes_tile_stack)
    /// returns true. More efficient when bands share intermediate results.
    async fn compute_tile_stack(&self, rect: Rect, sources: &SourceTiles) -> Result<TileStack> {
        let _ = (rect, sources);
        Err(Error::Operator(
            "tile-stack computation not supported".to_string(),
        ))
    }

    /// Declares support for combined tile-stack computation.
    ///
    /// Any non-output node declaring support switches the whole run into
    /// stack-wise scheduling.
    fn computes_tile_stack(&self) -> bool {
        false
    }

    /// Releases operator-held resources (file handles, model weights).
    ///
    /// Invoked exactly once when the owning graph context is disposed.
    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Operator")
    }
}

/// An operator shared between the engine's tile loop and the lazy images.
///
/// Tile computation takes read access; initialization and disposal take
/// write access.
pub type SharedOperator = Arc<tokio::sync::RwLock<Box<dyn Operator>>>;
