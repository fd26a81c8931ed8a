//! helios: a direct-scanout KMS display engine for single-display game
//! sessions.
//!
//! The engine owns one DRM device and one active output, maps the session's
//! frame layers onto hardware planes whenever the driver lets it, and falls
//! back to a caller-provided software compositor otherwise. Presentation is
//! driven by the embedder calling [`Backend::present_frame`] once per
//! refresh; a dedicated thread retires page flips.

pub mod backend;
pub mod composite;
pub mod layer;
pub mod logging;
pub mod mode_memory;

pub use backend::kms::{FrameRequest, KmsBackend};
pub use backend::{Backend, HeadlessBackend};
pub use composite::{FrameCompositor, SessionDisplayInfo};
pub use layer::{Colorspace, DstRect, Layer, SrcRect};
