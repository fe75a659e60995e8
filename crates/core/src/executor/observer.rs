//! Observer protocol for graph processing
//!
//! Observers are notified synchronously, in registration order, on the
//! orchestrating task — never from worker tasks — and must not block.

use crate::executor::context::GraphContext;
use crate::raster::Rect;

/// Receives coarse processing events from a
/// [`GraphProcessor`](crate::executor::GraphProcessor).
pub trait GraphObserver: Send + Sync {
    /// Processing of a graph has started.
    fn processing_started(&self, ctx: &GraphContext) {
        let _ = ctx;
    }

    /// Processing of a graph has stopped (successfully, cancelled, or
    /// failed).
    fn processing_stopped(&self, ctx: &GraphContext) {
        let _ = ctx;
    }

    /// Tile requests for the given region of an output node are about to
    /// be submitted.
    fn tile_started(&self, ctx: &GraphContext, rect: Rect) {
        let _ = (ctx, rect);
    }

    /// Tile requests for the given region have been submitted.
    fn tile_stopped(&self, ctx: &GraphContext, rect: Rect) {
        let _ = (ctx, rect);
    }
}
