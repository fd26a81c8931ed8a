//! Scanout buffers and their lifetime through the flip pipeline.
//!
//! A buffer referenced by the frame being built is *in-request*; once the
//! non-blocking commit is submitted it is *queued*; when the flip completion
//! arrives it becomes *visible*, and the previously visible set drops its
//! references. A buffer is never destroyed while it sits in any of the three
//! sets, and the swap happens under one mutex so the flip thread and the
//! presentation thread always agree.

use std::fmt;
use std::mem;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use drm::buffer::DrmFourcc;
use drm::control::{framebuffer, Device as ControlDevice};
use gbm::{BufferObject, BufferObjectFlags};
use tracing::warn;

use super::device::Device;

/// Color depth and bits per pixel for the formats we allocate ourselves.
fn depth_and_bpp(format: DrmFourcc) -> (u32, u32) {
    match format {
        DrmFourcc::Xrgb8888 | DrmFourcc::Xbgr8888 => (24, 32),
        DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 => (32, 32),
        DrmFourcc::Xrgb2101010 | DrmFourcc::Xbgr2101010 => (30, 32),
        DrmFourcc::Argb2101010 | DrmFourcc::Abgr2101010 => (32, 32),
        // NV12 and friends arrive pre-imported from producers, never
        // allocated here.
        _ => (24, 32),
    }
}

enum Backing {
    /// GBM-allocated and registered with the kernel; owns the fb id.
    Gbm {
        _bo: BufferObject<()>,
        device: Arc<Device>,
    },
    /// No kernel object behind it (headless backend and tests).
    Virtual,
}

/// A scanout-capable buffer bound to a kernel framebuffer id.
///
/// Shared by reference counting; the kernel framebuffer is destroyed when the
/// last reference (in-request, queued, visible, or the producer's own) goes
/// away.
pub struct ScanoutBuffer {
    fb: framebuffer::Handle,
    size: (u32, u32),
    format: DrmFourcc,
    backing: Backing,
}

impl fmt::Debug for ScanoutBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanoutBuffer")
            .field("fb", &self.fb)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ScanoutBuffer {
    /// Allocates a GBM buffer and registers it as a kernel framebuffer.
    pub fn allocate(
        device: &Arc<Device>,
        gbm: &gbm::Device<Arc<Device>>,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> anyhow::Result<Arc<Self>> {
        let mut bo = gbm
            .create_buffer_object::<()>(
                size.0,
                size.1,
                format,
                BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
            )
            .context("error creating GBM buffer object")?;

        // Fresh GBM memory is not guaranteed to be zeroed; clear it so the
        // first scanout shows black rather than whatever the VRAM held.
        bo.map_mut(0, 0, size.0, size.1, |map| map.buffer_mut().fill(0))
            .context("error clearing buffer contents")?;

        let (depth, bpp) = depth_and_bpp(format);
        let fb = device
            .add_framebuffer(&bo, depth, bpp)
            .context("error adding framebuffer")?;

        Ok(Arc::new(Self {
            fb,
            size,
            format,
            backing: Backing::Gbm {
                _bo: bo,
                device: device.clone(),
            },
        }))
    }

    /// A buffer with no kernel object behind it, for the headless backend
    /// and tests.
    pub fn virtual_new(id: u32, size: (u32, u32), format: DrmFourcc) -> Arc<Self> {
        let id = NonZeroU32::new(id).expect("framebuffer id must be non-zero");
        Arc::new(Self {
            fb: framebuffer::Handle::from(id),
            size,
            format,
            backing: Backing::Virtual,
        })
    }

    pub fn framebuffer(&self) -> framebuffer::Handle {
        self.fb
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn format(&self) -> DrmFourcc {
        self.format
    }
}

impl Drop for ScanoutBuffer {
    fn drop(&mut self) {
        if let Backing::Gbm { device, .. } = &self.backing {
            if let Err(err) = device.destroy_framebuffer(self.fb) {
                warn!("error destroying framebuffer {:?}: {err:?}", self.fb);
            }
        }
    }
}

/// The queued and visible reference sets, shared with the flip thread.
#[derive(Debug, Default)]
pub struct FrameSets {
    pub queued: Vec<Arc<ScanoutBuffer>>,
    pub visible: Vec<Arc<ScanoutBuffer>>,
}

/// Tracks which buffers the frame being built references, and moves them
/// through queued and visible.
#[derive(Debug)]
pub struct FrameTracker {
    in_request: Vec<Arc<ScanoutBuffer>>,
    shared: Arc<Mutex<FrameSets>>,
}

impl FrameTracker {
    pub fn new(shared: Arc<Mutex<FrameSets>>) -> Self {
        Self {
            in_request: Vec::new(),
            shared,
        }
    }

    /// Records a buffer referenced by the frame being built.
    pub fn track(&mut self, buffer: &Arc<ScanoutBuffer>) {
        if !self.in_request.iter().any(|b| Arc::ptr_eq(b, buffer)) {
            self.in_request.push(buffer.clone());
        }
    }

    pub fn in_request(&self) -> &[Arc<ScanoutBuffer>] {
        &self.in_request
    }

    /// Moves the in-request set into queued, immediately before submitting a
    /// non-blocking commit. The previous flip must have completed already.
    pub fn submit(&mut self) {
        let mut sets = self.shared.lock().unwrap();
        debug_assert!(sets.queued.is_empty(), "queued set must be drained first");
        sets.queued = mem::take(&mut self.in_request);
    }

    /// Undoes [`FrameTracker::submit`] after the kernel rejected the commit,
    /// so no reference is dropped early.
    pub fn abort_submit(&mut self) {
        let mut sets = self.shared.lock().unwrap();
        self.in_request = mem::take(&mut sets.queued);
    }

    /// For blocking commits, which have no completion event: the new frame
    /// is on screen once the ioctl returns.
    pub fn promote_blocking(&mut self) {
        let previous = {
            let mut sets = self.shared.lock().unwrap();
            mem::replace(&mut sets.visible, mem::take(&mut self.in_request))
        };
        drop(previous);
    }

    /// Drops the frame being built without submitting it.
    pub fn discard_request(&mut self) {
        self.in_request.clear();
    }

    /// Drops every reference. Only valid once scanout has stopped.
    pub fn clear(&mut self) {
        self.in_request.clear();
        let mut sets = self.shared.lock().unwrap();
        sets.queued.clear();
        sets.visible.clear();
    }
}
