//! Virtual output with no display hardware behind it.
//!
//! Every frame is composited to a virtual buffer and retained as the "last
//! presented" frame, which is enough for automated sessions and tests.

use std::sync::Arc;

use tracing::trace;

use super::kms::framebuffer::ScanoutBuffer;
use super::kms::FrameRequest;
use crate::composite::FrameCompositor;

pub struct HeadlessBackend {
    size: (u32, u32),
    refresh_mhz: i32,
    frames_presented: u64,
    last_frame: Option<Arc<ScanoutBuffer>>,
}

impl HeadlessBackend {
    pub fn new(size: (u32, u32), refresh_mhz: i32) -> Self {
        Self {
            size,
            refresh_mhz,
            frames_presented: 0,
            last_frame: None,
        }
    }

    pub fn present_frame(
        &mut self,
        frame: &FrameRequest,
        compositor: &mut dyn FrameCompositor,
    ) -> anyhow::Result<()> {
        let composited = compositor.composite(&frame.layers, self.size)?;
        self.last_frame = Some(composited);
        self.frames_presented += 1;
        trace!(frame = self.frames_presented, "presented virtual frame");
        Ok(())
    }

    pub fn description(&self) -> String {
        format!(
            "Virtual {}x{}@{}mHz",
            self.size.0, self.size.1, self.refresh_mhz
        )
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn last_frame(&self) -> Option<&Arc<ScanoutBuffer>> {
        self.last_frame.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use drm::buffer::DrmFourcc;

    use super::*;
    use crate::layer::Layer;

    struct CountingCompositor {
        calls: u32,
    }

    impl FrameCompositor for CountingCompositor {
        fn composite(
            &mut self,
            _layers: &[Layer],
            output_size: (u32, u32),
        ) -> anyhow::Result<Arc<ScanoutBuffer>> {
            self.calls += 1;
            Ok(ScanoutBuffer::virtual_new(
                self.calls,
                output_size,
                DrmFourcc::Xrgb8888,
            ))
        }
    }

    #[test]
    fn every_frame_is_composited() {
        let mut backend = HeadlessBackend::new((1280, 720), 60_000);
        let mut compositor = CountingCompositor { calls: 0 };

        for _ in 0..3 {
            backend
                .present_frame(&FrameRequest::default(), &mut compositor)
                .unwrap();
        }

        assert_eq!(backend.frames_presented(), 3);
        assert_eq!(compositor.calls, 3);
        assert_eq!(backend.last_frame().unwrap().size(), (1280, 720));
    }
}
