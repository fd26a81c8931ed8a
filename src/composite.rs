//! Collaborator traits the embedder provides.

use std::sync::Arc;

use crate::backend::kms::framebuffer::ScanoutBuffer;
use crate::layer::Layer;

/// Software composition fallback. Invoked whenever the frame cannot go to
/// hardware planes directly.
pub trait FrameCompositor {
    /// Flattens `layers` into a single opaque image of `output_size`,
    /// returning a buffer suitable for the primary plane.
    fn composite(
        &mut self,
        layers: &[Layer],
        output_size: (u32, u32),
    ) -> anyhow::Result<Arc<ScanoutBuffer>>;
}

/// Receives display change notifications from the backend.
pub trait SessionDisplayInfo {
    /// The active connector or its mode changed.
    fn display_changed(&mut self, description: &str, physical_size_mm: (u32, u32));

    /// The last display went away; the session has nothing to present to.
    fn display_lost(&mut self);
}
