//! Open DRM device node.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use anyhow::Context;
use drm::control::atomic::AtomicModeReq;
use drm::control::{self, AtomicCommitFlags, Device as ControlDevice, ResourceHandles};
use drm::{ClientCapability, Device as DrmDevice};
use tracing::{debug, warn};

/// A DRM device node opened read-write, with universal planes and atomic
/// mode-setting enabled.
#[derive(Debug)]
pub struct Device {
    file: File,
    path: PathBuf,
}

impl AsFd for Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl DrmDevice for Device {}
impl ControlDevice for Device {}

impl Device {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("error opening DRM device {path:?}"))?;

        let device = Self {
            file,
            path: path.to_owned(),
        };

        for cap in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            device
                .set_client_capability(cap, true)
                .with_context(|| format!("error enabling client capability {cap:?}"))?;
        }

        debug!("opened DRM device {path:?}");
        Ok(device)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resources(&self) -> anyhow::Result<ResourceHandles> {
        self.resource_handles().context("error getting DRM resources")
    }

    pub fn commit(&self, flags: AtomicCommitFlags, req: AtomicModeReq) -> io::Result<()> {
        self.atomic_commit(flags, req)
    }

    /// Uploads a mode as a property blob, returning the blob id for
    /// `MODE_ID`.
    pub fn create_mode_blob(&self, mode: &control::Mode) -> anyhow::Result<u64> {
        let value = self
            .create_property_blob(mode)
            .context("error creating mode property blob")?;
        Ok(value.into())
    }

    /// Uploads raw bytes as a property blob (LUTs, CTM, HDR metadata).
    pub fn create_data_blob(&self, data: &mut [u8]) -> anyhow::Result<u64> {
        let blob = drm_ffi::mode::create_property_blob(self.as_fd(), data)
            .context("error creating property blob")?;
        Ok(u64::from(blob.blob_id))
    }

    /// Best-effort blob destruction; failures only leak a kernel-side blob.
    pub fn destroy_blob(&self, blob: u64) {
        if blob == 0 {
            return;
        }
        if let Err(err) = self.destroy_property_blob(blob) {
            warn!("error destroying property blob {blob}: {err:?}");
        }
    }
}
