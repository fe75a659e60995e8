//! Tile grid geometry
//!
//! Rasters are computed tile-by-tile. This module holds the pixel-space and
//! tile-space primitives: rectangles, tile coordinates, tile sizes, and the
//! [`TileLayout`] that maps between the two.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for one axis of a derived tile size.
pub const MAX_DEFAULT_TILE_EDGE: u32 = 512;

/// A pixel-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Left edge (pixels)
    pub x: u32,
    /// Top edge (pixels)
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Rect {
    /// Creates a new rectangle.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of pixels covered.
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns true if the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns true if the pixel position lies inside this rectangle.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    /// Intersection with another rectangle; `None` if disjoint.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x0 < x1 && y0 < y1 {
            Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}x{}]",
            self.x, self.y, self.width, self.height
        )
    }
}

/// Integer tile indices identifying one rectangular region of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    /// Horizontal tile index
    pub tile_x: u32,
    /// Vertical tile index
    pub tile_y: u32,
}

impl TileCoord {
    /// Creates a new tile coordinate.
    pub fn new(tile_x: u32, tile_y: u32) -> Self {
        Self { tile_x, tile_y }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.tile_x, self.tile_y)
    }
}

/// Size of one tile in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileSize {
    /// Tile width in pixels
    pub width: u32,
    /// Tile height in pixels
    pub height: u32,
}

impl TileSize {
    /// Creates a new tile size. Both edges must be non-zero.
    pub fn new(width: u32, height: u32) -> Self {
        debug_assert!(width > 0 && height > 0, "tile edges must be non-zero");
        Self { width, height }
    }
}

/// Derives a tile size for a raster that declares none.
///
/// Balances tile count against per-tile memory: each axis is split into
/// `ceil(dim / 512)` evenly sized tiles, so small rasters become a single
/// tile and large rasters get tiles close to (but never above) 512 pixels
/// per edge.
pub fn default_tile_size(width: u32, height: u32) -> TileSize {
    TileSize::new(default_tile_edge(width), default_tile_edge(height))
}

fn default_tile_edge(dim: u32) -> u32 {
    if dim <= MAX_DEFAULT_TILE_EDGE {
        return dim.max(1);
    }
    let count = dim.div_ceil(MAX_DEFAULT_TILE_EDGE);
    dim.div_ceil(count)
}

/// Maps a raster of fixed dimensions onto a grid of equally sized tiles.
///
/// The rightmost and bottom tiles may be clipped to the raster bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    raster_width: u32,
    raster_height: u32,
    tile_size: TileSize,
    tile_count_x: u32,
    tile_count_y: u32,
}

impl TileLayout {
    /// Creates the layout covering `raster_width` x `raster_height` with
    /// tiles of `tile_size`. Zero tile edges are clamped to one pixel.
    pub fn new(raster_width: u32, raster_height: u32, tile_size: TileSize) -> Self {
        let tile_size = TileSize::new(tile_size.width.max(1), tile_size.height.max(1));
        Self {
            raster_width,
            raster_height,
            tile_size,
            tile_count_x: raster_width.div_ceil(tile_size.width),
            tile_count_y: raster_height.div_ceil(tile_size.height),
        }
    }

    /// Raster width in pixels.
    pub fn raster_width(&self) -> u32 {
        self.raster_width
    }

    /// Raster height in pixels.
    pub fn raster_height(&self) -> u32 {
        self.raster_height
    }

    /// Tile size of this layout.
    pub fn tile_size(&self) -> TileSize {
        self.tile_size
    }

    /// Number of tile columns.
    pub fn tile_count_x(&self) -> u32 {
        self.tile_count_x
    }

    /// Number of tile rows.
    pub fn tile_count_y(&self) -> u32 {
        self.tile_count_y
    }

    /// Total number of tiles.
    pub fn tile_count(&self) -> usize {
        self.tile_count_x as usize * self.tile_count_y as usize
    }

    /// Returns true if the coordinate lies inside this layout's grid.
    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.tile_x < self.tile_count_x && coord.tile_y < self.tile_count_y
    }

    /// Pixel rectangle of the tile at `coord`, clipped to the raster bounds.
    ///
    /// Callers must check [`contains`](Self::contains) first; coordinates
    /// outside the grid yield an empty rectangle.
    pub fn tile_rect(&self, coord: TileCoord) -> Rect {
        let x = coord.tile_x.saturating_mul(self.tile_size.width);
        let y = coord.tile_y.saturating_mul(self.tile_size.height);
        let width = self.tile_size.width.min(self.raster_width.saturating_sub(x));
        let height = self
            .tile_size
            .height
            .min(self.raster_height.saturating_sub(y));
        Rect::new(x, y, width, height)
    }

    /// Iterates all coordinates in row-major order (`tile_y` outer).
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.tile_count_y).flat_map(move |tile_y| {
            (0..self.tile_count_x).map(move |tile_x| TileCoord::new(tile_x, tile_y))
        })
    }
}
