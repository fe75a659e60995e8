//! Raster data model: tile grids, products, bands and lazy images.

pub mod grid;
pub mod image;
pub mod product;

pub use grid::{default_tile_size, Rect, TileCoord, TileLayout, TileSize};
pub use image::{read_region, BufferImage, TileImage};
pub use product::{Band, PixelType, Product, TileBuffer, TileStack};
