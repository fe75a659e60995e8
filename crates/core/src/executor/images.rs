//! Operator-backed lazy images
//!
//! These images connect the tile grid to operator computation. Each memoizes
//! its tiles in a concurrent map keyed by tile coordinate: concurrent pulls
//! of one tile compute it exactly once, later pulls are free, and no
//! node-level locking is needed because every tile is independently
//! addressable.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::operator::{SharedOperator, SourceTiles};
use crate::raster::{TileBuffer, TileCoord, TileImage, TileLayout};

type TileCell = Arc<OnceCell<Arc<TileBuffer>>>;
type StackCell = Arc<OnceCell<Arc<HashMap<String, Arc<TileBuffer>>>>>;

/// One computed band of a node, evaluated tile-by-tile through the node's
/// operator.
pub struct OperatorImage {
    node_name: String,
    band: String,
    layout: TileLayout,
    operator: SharedOperator,
    sources: Arc<SourceTiles>,
    tiles: DashMap<TileCoord, TileCell>,
}

impl OperatorImage {
    /// Creates the image for `band` of node `node_name`.
    pub fn new(
        node_name: impl Into<String>,
        band: impl Into<String>,
        layout: TileLayout,
        operator: SharedOperator,
        sources: Arc<SourceTiles>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            band: band.into(),
            layout,
            operator,
            sources,
            tiles: DashMap::new(),
        }
    }

    fn cell(&self, coord: TileCoord) -> TileCell {
        self.tiles.entry(coord).or_default().clone()
    }
}

#[async_trait]
impl TileImage for OperatorImage {
    fn layout(&self) -> TileLayout {
        self.layout
    }

    async fn tile(&self, coord: TileCoord) -> Result<Arc<TileBuffer>> {
        if !self.layout.contains(coord) {
            return Err(Error::Execution(format!(
                "tile {} outside grid of band '{}' in node '{}'",
                coord, self.band, self.node_name
            )));
        }
        let cell = self.cell(coord);
        let tile = cell
            .get_or_try_init(|| async {
                let rect = self.layout.tile_rect(coord);
                tracing::trace!(
                    node = %self.node_name,
                    band = %self.band,
                    tile = %coord,
                    "computing tile"
                );
                let operator = self.operator.read().await;
                let buffer = operator
                    .compute_tile(&self.band, rect, &self.sources)
                    .await
                    .map_err(|e| Error::TileComputation {
                        node: self.node_name.clone(),
                        band: self.band.clone(),
                        tile: coord,
                        source: Box::new(e),
                    })?;
                Ok::<_, Error>(Arc::new(buffer))
            })
            .await?;
        Ok(tile.clone())
    }
}

/// Node-level cache for tile-stack computation.
///
/// All stack bands of one node share a cache; pulling any band's tile runs
/// the operator's combined computation once and all other bands of that
/// coordinate are served from the result.
pub struct StackCache {
    node_name: String,
    layout: TileLayout,
    operator: SharedOperator,
    sources: Arc<SourceTiles>,
    tiles: DashMap<TileCoord, StackCell>,
}

impl StackCache {
    /// Creates the cache over the node's scene layout.
    pub fn new(
        node_name: impl Into<String>,
        layout: TileLayout,
        operator: SharedOperator,
        sources: Arc<SourceTiles>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            layout,
            operator,
            sources,
            tiles: DashMap::new(),
        }
    }

    async fn stack(&self, coord: TileCoord) -> Result<Arc<HashMap<String, Arc<TileBuffer>>>> {
        let cell = self.tiles.entry(coord).or_default().clone();
        let stack = cell
            .get_or_try_init(|| async {
                let rect = self.layout.tile_rect(coord);
                tracing::trace!(
                    node = %self.node_name,
                    tile = %coord,
                    "computing tile stack"
                );
                let operator = self.operator.read().await;
                let stack = operator.compute_tile_stack(rect, &self.sources).await?;
                let bands: HashMap<String, Arc<TileBuffer>> = stack
                    .into_bands()
                    .map(|(band, buffer)| (band, Arc::new(buffer)))
                    .collect();
                Ok::<_, Error>(Arc::new(bands))
            })
            .await?;
        Ok(stack.clone())
    }
}

/// One band of a node that computes tile-stacks; thin view over the shared
/// [`StackCache`].
pub struct StackImage {
    band: String,
    layout: TileLayout,
    cache: Arc<StackCache>,
}

impl StackImage {
    /// Creates the view for `band`.
    pub fn new(band: impl Into<String>, layout: TileLayout, cache: Arc<StackCache>) -> Self {
        Self {
            band: band.into(),
            layout,
            cache,
        }
    }
}

#[async_trait]
impl TileImage for StackImage {
    fn layout(&self) -> TileLayout {
        self.layout
    }

    async fn tile(&self, coord: TileCoord) -> Result<Arc<TileBuffer>> {
        if !self.layout.contains(coord) {
            return Err(Error::Execution(format!(
                "tile {} outside grid of band '{}' in node '{}'",
                coord, self.band, self.cache.node_name
            )));
        }
        let stack = self
            .cache
            .stack(coord)
            .await
            .map_err(|e| match e {
                // Keep already-attributed failures as-is
                tile @ Error::TileComputation { .. } => tile,
                other => Error::TileComputation {
                    node: self.cache.node_name.clone(),
                    band: self.band.clone(),
                    tile: coord,
                    source: Box::new(other),
                },
            })?;
        stack.get(&self.band).cloned().ok_or_else(|| {
            Error::Operator(format!(
                "tile-stack of node '{}' is missing band '{}'",
                self.cache.node_name, self.band
            ))
        })
    }
}
