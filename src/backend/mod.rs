//! Backend selection.
//!
//! The backend is a closed set, chosen once at startup and never swapped at
//! runtime.

use crate::composite::FrameCompositor;

pub mod headless;
pub mod kms;

pub use headless::HeadlessBackend;
pub use kms::{FrameRequest, KmsBackend};

pub enum Backend {
    Kms(KmsBackend),
    Headless(HeadlessBackend),
}

impl Backend {
    pub fn present_frame(
        &mut self,
        frame: &FrameRequest,
        compositor: &mut dyn FrameCompositor,
    ) -> anyhow::Result<()> {
        match self {
            Backend::Kms(backend) => backend.present_frame(frame, compositor),
            Backend::Headless(backend) => backend.present_frame(frame, compositor),
        }
    }

    pub fn supports_hdr(&self) -> bool {
        match self {
            Backend::Kms(backend) => backend.supports_hdr(),
            Backend::Headless(_) => false,
        }
    }

    pub fn supports_vrr(&self) -> bool {
        match self {
            Backend::Kms(backend) => backend.supports_vrr(),
            Backend::Headless(_) => false,
        }
    }

    pub fn description(&self) -> Option<String> {
        match self {
            Backend::Kms(backend) => backend.description(),
            Backend::Headless(backend) => Some(backend.description()),
        }
    }

    pub fn hotplug(&self) {
        match self {
            Backend::Kms(backend) => backend.hotplug(),
            Backend::Headless(_) => (),
        }
    }

    pub fn pause(&self) {
        match self {
            Backend::Kms(backend) => backend.pause(),
            Backend::Headless(_) => (),
        }
    }

    pub fn resume(&mut self) {
        match self {
            Backend::Kms(backend) => backend.resume(),
            Backend::Headless(_) => (),
        }
    }

    pub fn teardown(self) -> anyhow::Result<()> {
        match self {
            Backend::Kms(backend) => backend.teardown(),
            Backend::Headless(_) => Ok(()),
        }
    }

    pub fn kms(&mut self) -> Option<&mut KmsBackend> {
        match self {
            Backend::Kms(backend) => Some(backend),
            Backend::Headless(_) => None,
        }
    }

    pub fn headless(&mut self) -> Option<&mut HeadlessBackend> {
        match self {
            Backend::Headless(backend) => Some(backend),
            Backend::Kms(_) => None,
        }
    }
}
