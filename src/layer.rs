//! The frame model handed to the backend every refresh.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::backend::kms::framebuffer::ScanoutBuffer;

/// Color encoding of a layer's pixel values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Colorspace {
    Srgb,
    /// HDR10: BT.2020 primaries with the PQ transfer function.
    Hdr10Pq,
    /// scRGB: 709 primaries, linear, possibly out-of-gamut values.
    ScRgbLinear,
}

/// Source crop in buffer pixels. Fractional offsets are meaningful; the
/// hardware takes 16.16 fixed point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SrcRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl SrcRect {
    pub fn full(size: (u32, u32)) -> Self {
        Self {
            x: 0.,
            y: 0.,
            w: f64::from(size.0),
            h: f64::from(size.1),
        }
    }

    pub fn to_fixed16(self) -> (u32, u32, u32, u32) {
        (
            to_fixed(self.x),
            to_fixed(self.y),
            to_fixed(self.w),
            to_fixed(self.h),
        )
    }
}

fn to_fixed(n: f64) -> u32 {
    f64::round(n * (1 << 16) as f64) as u32
}

/// Destination rectangle in CRTC coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DstRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// One element of the frame, already importable for scanout.
#[derive(Clone, Debug)]
pub struct Layer {
    pub buffer: Arc<ScanoutBuffer>,
    pub src: SrcRect,
    pub dst: DstRect,
    /// Opacity in [0, 1].
    pub alpha: f32,
    pub colorspace: Colorspace,
    /// Whether plane color management should transform this layer.
    pub color_managed: bool,
    /// Acquire fence from the producer, if it handed us one.
    pub fence: Option<Arc<OwnedFd>>,
}

impl Layer {
    /// An opaque layer covering the whole mode, as produced by the software
    /// compositor.
    pub fn fullscreen(buffer: Arc<ScanoutBuffer>, colorspace: Colorspace) -> Self {
        let size = buffer.size();
        Self {
            src: SrcRect::full(size),
            dst: DstRect {
                x: 0,
                y: 0,
                w: size.0 as i32,
                h: size.1 as i32,
            },
            alpha: 1.,
            colorspace,
            color_managed: false,
            fence: None,
            buffer,
        }
    }
}
