//! Atomic commit transactions.
//!
//! A transaction collects staged property writes for one display refresh and
//! is committed exactly once. Whether it may change routing is latched at
//! construction: steady-state frames go down non-blocking with a completion
//! event, mode-sets block and carry `ALLOW_MODESET`.

use std::fmt;
use std::io;

use drm::control::atomic::AtomicModeReq;
use drm::control::{property, AtomicCommitFlags};
use tracing::trace;

use super::device::Device;
use super::property::ObjectId;

/// Why the kernel rejected an atomic commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitErrorKind {
    /// Transient: the hardware flip queue is full.
    Busy,
    /// We are not the DRM master right now (VT switched away).
    NotVisible,
    /// The staged state is not supported by the driver.
    Invalid,
    /// `EPERM`. Some drivers return this when an input fence is staged.
    PermissionDenied,
    Other,
}

pub fn classify(err: &io::Error) -> CommitErrorKind {
    match err.raw_os_error() {
        Some(libc::EBUSY) => CommitErrorKind::Busy,
        Some(libc::EACCES) => CommitErrorKind::NotVisible,
        Some(libc::EPERM) => CommitErrorKind::PermissionDenied,
        Some(libc::EINVAL) | Some(libc::ERANGE) | Some(libc::ENOSPC) => CommitErrorKind::Invalid,
        _ => CommitErrorKind::Other,
    }
}

#[derive(Debug)]
pub struct CommitError {
    pub kind: CommitErrorKind,
    pub source: io::Error,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atomic commit failed ({:?}): {}", self.kind, self.source)
    }
}

impl std::error::Error for CommitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<io::Error> for CommitError {
    fn from(source: io::Error) -> Self {
        Self {
            kind: classify(&source),
            source,
        }
    }
}

/// One staged property write, kept next to the kernel request for logging and
/// inspection.
#[derive(Clone, Copy, Debug)]
pub struct PropertyWrite {
    pub object: ObjectId,
    pub prop: property::Handle,
    pub name: &'static str,
    pub value: u64,
}

/// The staged writes for one display refresh.
///
/// Consumed by [`Transaction::commit`]; a committed transaction cannot be
/// amended or resubmitted.
pub struct Transaction {
    req: AtomicModeReq,
    writes: Vec<PropertyWrite>,
    modeset: bool,
}

impl Transaction {
    pub fn new(modeset: bool) -> Self {
        Self {
            req: AtomicModeReq::new(),
            writes: Vec::new(),
            modeset,
        }
    }

    pub fn is_modeset(&self) -> bool {
        self.modeset
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    /// Writes staged against `object` for the property called `name`.
    pub fn writes_for(&self, object: ObjectId, name: &str) -> Vec<u64> {
        self.writes
            .iter()
            .filter(|w| w.object == object && w.name == name)
            .map(|w| w.value)
            .collect()
    }

    pub(crate) fn stage(
        &mut self,
        object: ObjectId,
        prop: property::Handle,
        name: &'static str,
        value: u64,
    ) {
        let raw = property::Value::Unknown(value);
        match object {
            ObjectId::Connector(handle) => self.req.add_property(handle, prop, raw),
            ObjectId::Crtc(handle) => self.req.add_property(handle, prop, raw),
            ObjectId::Plane(handle) => self.req.add_property(handle, prop, raw),
        }
        self.writes.push(PropertyWrite {
            object,
            prop,
            name,
            value,
        });
    }

    fn commit_flags(&self, async_flip: bool) -> AtomicCommitFlags {
        if self.modeset {
            AtomicCommitFlags::ALLOW_MODESET
        } else {
            let mut flags = AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT;
            if async_flip {
                flags |= AtomicCommitFlags::PAGE_FLIP_ASYNC;
            }
            flags
        }
    }

    /// Submits the transaction to the kernel, consuming it.
    pub fn commit(self, device: &Device, async_flip: bool) -> Result<(), CommitError> {
        let flags = self.commit_flags(async_flip);
        trace!(
            writes = self.writes.len(),
            modeset = self.modeset,
            "committing atomic request"
        );
        device.commit(flags, self.req).map_err(CommitError::from)
    }

    /// Asks the kernel whether it would accept the staged state, without
    /// applying any of it.
    pub fn test_commit(&self, device: &Device) -> Result<(), CommitError> {
        let mut flags = AtomicCommitFlags::TEST_ONLY;
        if self.modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        device
            .commit(flags, self.req.clone())
            .map_err(CommitError::from)
    }
}
