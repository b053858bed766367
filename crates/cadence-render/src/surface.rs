// SPDX-License-Identifier: CEPL-1.0
use crate::RenderSize;

/// Window side of the frame loop.
///
/// Backends additionally need raw window and display handles to create the
/// presentation surface; those come from `raw-window-handle` on the concrete
/// window type and never pass through this trait.
pub trait SurfaceProvider {
    fn should_close(&self) -> bool;

    /// Pumps pending OS events without blocking for long.
    fn poll_events(&mut self);

    /// Drawable size in physical pixels. Zero in either axis while minimized.
    fn framebuffer_size(&self) -> RenderSize;
}
