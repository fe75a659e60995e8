//! Built-in operators
//!
//! A small set of general-purpose operators exercising every corner of the
//! operator contract: a source, a per-band transform, a pass-through
//! re-grouping, and a tile-stack producer. Domain processing chains
//! register their own operators next to these.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::operator::{
    Operator, OperatorContext, OperatorRegistry, SourceTiles, TargetBand, TargetDescriptor,
};
use crate::raster::{Band, PixelType, Rect, TileBuffer, TileSize, TileStack};

/// Registers all built-in operators.
pub fn register_builtins(registry: &mut OperatorRegistry) {
    registry.register("constant", || Box::new(ConstantOp::default()));
    registry.register("band_maths", || Box::new(BandMathsOp::default()));
    registry.register("merge", || Box::new(MergeOp));
    registry.register("stacked_gradient", || Box::new(StackedGradientOp::default()));
}

// =============================================================================
// constant
// =============================================================================

#[derive(Debug, Deserialize)]
struct ConstantParams {
    width: u32,
    height: u32,
    value: f32,
    #[serde(default = "default_band_names")]
    bands: Vec<String>,
    #[serde(default)]
    tile_size: Option<TileSize>,
}

fn default_band_names() -> Vec<String> {
    vec!["data".to_string()]
}

/// Source operator producing a constant-valued raster.
#[derive(Default)]
pub struct ConstantOp {
    value: f32,
}

#[async_trait]
impl Operator for ConstantOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        let params: ConstantParams = ctx.parameters()?;
        self.value = params.value;

        let mut descriptor = TargetDescriptor::new(ctx.node_name(), params.width, params.height);
        if let Some(tile_size) = params.tile_size {
            descriptor = descriptor.with_tile_size(tile_size);
        }
        for band in params.bands {
            descriptor = descriptor.with_band(TargetBand::computed(Band::new(
                band,
                PixelType::F32,
                params.width,
                params.height,
            )));
        }
        Ok(descriptor)
    }

    async fn compute_tile(
        &self,
        _band: &str,
        rect: Rect,
        _sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        Ok(TileBuffer::from_samples(
            rect,
            vec![self.value; rect.len()],
        ))
    }
}

// =============================================================================
// band_maths
// =============================================================================

#[derive(Debug, Deserialize, Default)]
struct BandMathsParams {
    /// Source band to read; defaults to the first band of the first source.
    #[serde(default)]
    band: Option<String>,
    #[serde(default = "default_scale")]
    scale: f32,
    #[serde(default)]
    offset: f32,
    /// Target band name; defaults to the source band's name.
    #[serde(default)]
    target_band: Option<String>,
}

fn default_scale() -> f32 {
    1.0
}

/// Per-pixel arithmetic (`value * scale + offset`) over one source band.
#[derive(Default)]
pub struct BandMathsOp {
    source_band: String,
    target_band: String,
    scale: f32,
    offset: f32,
}

#[async_trait]
impl Operator for BandMathsOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        let params: BandMathsParams = ctx.parameters()?;
        let source = ctx.source_product(0)?;

        let source_band = match params.band {
            Some(name) => name,
            None => source
                .bands
                .first()
                .map(|b| b.name.clone())
                .ok_or_else(|| Error::Operator(format!("product '{}' has no bands", source.name)))?,
        };
        let band = source.band(&source_band).ok_or_else(|| {
            Error::Operator(format!(
                "product '{}' has no band '{source_band}'",
                source.name
            ))
        })?;

        self.scale = params.scale;
        self.offset = params.offset;
        self.source_band = source_band;
        self.target_band = params.target_band.unwrap_or_else(|| self.source_band.clone());

        let descriptor = TargetDescriptor::new(ctx.node_name(), band.width, band.height)
            .with_tile_size(source.tile_size())
            .with_band(TargetBand::computed(Band::new(
                self.target_band.clone(),
                PixelType::F32,
                band.width,
                band.height,
            )));
        Ok(descriptor)
    }

    async fn compute_tile(
        &self,
        _band: &str,
        rect: Rect,
        sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        let mut tile = sources.read(0, &self.source_band, rect).await?;
        for sample in tile.samples_mut() {
            *sample = *sample * self.scale + self.offset;
        }
        Ok(tile)
    }
}

// =============================================================================
// merge
// =============================================================================

/// Re-groups the bands of all sources into one product via pass-through.
///
/// Declares every band as a copy of its upstream band; the engine pulls
/// tiles directly from the source images and this operator never computes.
pub struct MergeOp;

#[async_trait]
impl Operator for MergeOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        if ctx.source_count() == 0 {
            return Err(Error::Operator("merge requires at least one source".to_string()));
        }

        let mut scene_width = 0;
        let mut scene_height = 0;
        let mut bands = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for index in 0..ctx.source_count() {
            let product = ctx.source_product(index)?;
            scene_width = scene_width.max(product.scene_width);
            scene_height = scene_height.max(product.scene_height);
            for band in &product.bands {
                if !seen.insert(band.name.clone()) {
                    return Err(Error::Operator(format!(
                        "band '{}' occurs in more than one source",
                        band.name
                    )));
                }
                bands.push(TargetBand::copy_of(band.clone(), index, band.name.clone()));
            }
        }

        let mut descriptor = TargetDescriptor::new(ctx.node_name(), scene_width, scene_height);
        descriptor.preferred_tile_size = ctx.source_product(0)?.preferred_tile_size;
        descriptor.bands = bands;
        Ok(descriptor)
    }

    async fn compute_tile(
        &self,
        band: &str,
        _rect: Rect,
        _sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        Err(Error::Operator(format!(
            "merge has no computed bands (requested '{band}')"
        )))
    }
}

// =============================================================================
// stacked_gradient
// =============================================================================

#[derive(Debug, Deserialize)]
struct StackedGradientParams {
    width: u32,
    height: u32,
    #[serde(default = "default_gradient_bands")]
    bands: u32,
    #[serde(default)]
    tile_size: Option<TileSize>,
}

fn default_gradient_bands() -> u32 {
    2
}

/// Multi-band source computing all of its bands per region in one call.
///
/// Band `i` holds `x + y + i` at each pixel. The bands share the
/// coordinate sweep, so computing them together saves repeating it.
#[derive(Default)]
pub struct StackedGradientOp {
    band_count: u32,
}

impl StackedGradientOp {
    fn band_name(index: u32) -> String {
        format!("b{index}")
    }

    fn fill(rect: Rect, band_index: u32) -> TileBuffer {
        let mut buffer = TileBuffer::new(rect);
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                buffer.set_sample(x, y, (x + y + band_index) as f32);
            }
        }
        buffer
    }
}

#[async_trait]
impl Operator for StackedGradientOp {
    async fn initialize(&mut self, ctx: &OperatorContext) -> Result<TargetDescriptor> {
        let params: StackedGradientParams = ctx.parameters()?;
        self.band_count = params.bands;

        let mut descriptor = TargetDescriptor::new(ctx.node_name(), params.width, params.height);
        if let Some(tile_size) = params.tile_size {
            descriptor = descriptor.with_tile_size(tile_size);
        }
        for index in 0..params.bands {
            descriptor = descriptor.with_band(TargetBand::computed(Band::new(
                Self::band_name(index),
                PixelType::F32,
                params.width,
                params.height,
            )));
        }
        Ok(descriptor)
    }

    async fn compute_tile(
        &self,
        band: &str,
        rect: Rect,
        _sources: &SourceTiles,
    ) -> Result<TileBuffer> {
        let index = (0..self.band_count)
            .find(|i| Self::band_name(*i) == band)
            .ok_or_else(|| Error::Operator(format!("unknown band '{band}'")))?;
        Ok(Self::fill(rect, index))
    }

    async fn compute_tile_stack(&self, rect: Rect, _sources: &SourceTiles) -> Result<TileStack> {
        let mut stack = TileStack::new();
        for index in 0..self.band_count {
            stack.insert(Self::band_name(index), Self::fill(rect, index));
        }
        Ok(stack)
    }

    fn computes_tile_stack(&self) -> bool {
        true
    }
}
