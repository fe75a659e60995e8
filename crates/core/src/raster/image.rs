//! Lazy tile images
//!
//! A [`TileImage`] is a 2-D raster whose tiles are computed (or served) on
//! demand. The engine never iterates pixels eagerly: pulling one tile of an
//! image triggers whatever upstream computation that tile depends on.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::raster::grid::{Rect, TileCoord, TileLayout};
use crate::raster::product::TileBuffer;

/// A lazily evaluated 2-D raster addressed by tile coordinate.
///
/// Implementations must serve concurrent pulls safely; pulling the same
/// tile twice must not recompute it.
#[async_trait]
pub trait TileImage: Send + Sync {
    /// Tile layout of this image.
    fn layout(&self) -> TileLayout;

    /// Returns (computing if necessary) the tile at `coord`.
    async fn tile(&self, coord: TileCoord) -> Result<Arc<TileBuffer>>;
}

/// Reads an arbitrary pixel region from an image, assembling it from the
/// covering tiles.
///
/// The requested rectangle is clipped to the image bounds; pixels outside
/// remain at zero in the returned buffer.
pub async fn read_region(image: &dyn TileImage, rect: Rect) -> Result<TileBuffer> {
    let layout = image.layout();
    let mut out = TileBuffer::new(rect);
    let bounds = Rect::new(0, 0, layout.raster_width(), layout.raster_height());
    let Some(clipped) = rect.intersection(&bounds) else {
        return Ok(out);
    };

    let tile_size = layout.tile_size();
    let first_tx = clipped.x / tile_size.width;
    let last_tx = (clipped.x + clipped.width - 1) / tile_size.width;
    let first_ty = clipped.y / tile_size.height;
    let last_ty = (clipped.y + clipped.height - 1) / tile_size.height;

    for ty in first_ty..=last_ty {
        for tx in first_tx..=last_tx {
            let coord = TileCoord::new(tx, ty);
            let tile = image.tile(coord).await?;
            let Some(overlap) = tile.rect().intersection(&clipped) else {
                continue;
            };
            for y in overlap.y..overlap.y + overlap.height {
                for x in overlap.x..overlap.x + overlap.width {
                    out.set_sample(x, y, tile.sample(x, y));
                }
            }
        }
    }
    Ok(out)
}

/// A fully materialized raster.
///
/// Serves tiles by slicing an in-memory sample array. Used for externally
/// supplied source products and tests.
pub struct BufferImage {
    layout: TileLayout,
    samples: Vec<f32>,
}

impl BufferImage {
    /// Wraps a row-major sample array of `layout.raster_width() *
    /// layout.raster_height()` values.
    pub fn new(layout: TileLayout, samples: Vec<f32>) -> Self {
        assert_eq!(
            samples.len(),
            layout.raster_width() as usize * layout.raster_height() as usize,
            "sample count must match raster dimensions"
        );
        Self { layout, samples }
    }

    /// Materializes a constant-valued raster.
    pub fn filled(layout: TileLayout, value: f32) -> Self {
        let len = layout.raster_width() as usize * layout.raster_height() as usize;
        Self {
            layout,
            samples: vec![value; len],
        }
    }

    fn sample(&self, x: u32, y: u32) -> f32 {
        self.samples[y as usize * self.layout.raster_width() as usize + x as usize]
    }
}

#[async_trait]
impl TileImage for BufferImage {
    fn layout(&self) -> TileLayout {
        self.layout
    }

    async fn tile(&self, coord: TileCoord) -> Result<Arc<TileBuffer>> {
        if !self.layout.contains(coord) {
            return Err(Error::Execution(format!(
                "tile {} outside image grid {}x{}",
                coord,
                self.layout.tile_count_x(),
                self.layout.tile_count_y()
            )));
        }
        let rect = self.layout.tile_rect(coord);
        let mut buffer = TileBuffer::new(rect);
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                buffer.set_sample(x, y, self.sample(x, y));
            }
        }
        Ok(Arc::new(buffer))
    }
}
