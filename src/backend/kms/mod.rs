//! The KMS backend: owns the device, the object registry, the plane
//! allocator, and both ends of the flip pipeline.
//!
//! Two threads are involved. The presentation thread (the caller of
//! [`KmsBackend::present_frame`]) builds and submits atomic commits; a
//! dedicated flip thread blocks on the DRM event fd and retires them. At most
//! one flip is in flight at a time.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Context;
use drm::buffer::DrmFourcc;
use drm::control::Mode;
use helios_config::Config;
use tracing::{debug, error, trace, warn};

pub mod allocator;
pub mod color;
pub mod connector;
pub mod crtc;
pub mod device;
pub mod edid;
pub mod flip;
pub mod framebuffer;
pub mod plane;
pub mod property;
pub mod registry;
pub mod transaction;

use allocator::{PlaneAllocator, PlaneAssignment, ProbeError, ScanoutProbe};
use color::{ColorState, OutputEotf};
use connector::{mode_refresh_mhz, pick_mode, Rotation};
use device::Device;
use flip::{spawn_flip_thread, FlipState};
use framebuffer::{FrameSets, FrameTracker, ScanoutBuffer};
use plane::RotationBits;
use registry::{ActiveRoute, Registry, Selection};
use transaction::{CommitError, CommitErrorKind, Transaction};

use crate::composite::{FrameCompositor, SessionDisplayInfo};
use crate::layer::{Colorspace, Layer};
use crate::mode_memory::{ModeMemory, SavedMode};

/// Everything the embedder hands us for one display refresh.
#[derive(Debug, Default)]
pub struct FrameRequest {
    pub layers: Vec<Layer>,
    /// HDR content must be tone-mapped for the sink; planes cannot do that.
    pub hdr_tone_mapping: bool,
    /// Shader filters (sharpening, scaling filters) are active.
    pub filters_required: bool,
    /// A fade/transition is running.
    pub fade_active: bool,
    /// Tearing allowed for this frame.
    pub async_flip: bool,
}

impl FrameRequest {
    /// Whether the frame itself rules out direct scanout.
    fn forces_composite(&self) -> bool {
        self.hdr_tone_mapping || self.filters_required || self.fade_active
    }

    fn output_colorspace(&self) -> Colorspace {
        if self
            .layers
            .iter()
            .any(|l| l.colorspace == Colorspace::Hdr10Pq)
            && !self.hdr_tone_mapping
        {
            Colorspace::Hdr10Pq
        } else {
            Colorspace::Srgb
        }
    }
}

fn rotation_bits(rotation: Rotation) -> RotationBits {
    match rotation {
        Rotation::Normal => RotationBits::ROTATE_0,
        Rotation::Rotate90 => RotationBits::ROTATE_90,
        Rotation::Rotate180 => RotationBits::ROTATE_180,
        Rotation::Rotate270 => RotationBits::ROTATE_270,
    }
}

/// Asks the kernel whether an assignment scans out, with a TEST_ONLY commit
/// built against cloned objects so no pending state is disturbed.
struct AtomicProbe<'a> {
    device: &'a Device,
    registry: &'a Registry,
    route: ActiveRoute,
    rotation: RotationBits,
    modeset: bool,
    mode_blob: u64,
}

impl ScanoutProbe for AtomicProbe<'_> {
    fn probe(
        &mut self,
        assignment: &PlaneAssignment,
        layers: &[Layer],
        with_fences: bool,
    ) -> Result<(), ProbeError> {
        let _span = tracy_client::span!("AtomicProbe::probe");
        let mut txn = Transaction::new(self.modeset);

        if self.modeset {
            if let Some(connector) = self.registry.connector(self.route.connector) {
                let mut connector = connector.clone_props();
                let crtc_raw: std::num::NonZeroU32 = self.route.crtc.into();
                connector
                    .crtc_id
                    .set_pending(&mut txn, u64::from(crtc_raw.get()), true);
            }
            // ACTIVE and MODE_ID ride along so the probe tests the mode we
            // are about to set, not the dying one.
            if let Some(crtc) = self.registry.crtc(self.route.crtc) {
                let mut props = crtc.clone_props();
                props.active.set_pending(&mut txn, 1, true);
                props.mode_id.set_pending(&mut txn, self.mode_blob, true);
            }
        }

        for &(handle, layer_index) in &assignment.entries {
            let Some(plane) = self.registry.plane(handle) else {
                return Err(ProbeError::Rejected);
            };
            let mut plane = plane.clone();
            let layer = &layers[layer_index];
            let fence = if with_fences {
                layer.fence.as_ref().map(|f| f.as_raw_fd())
            } else {
                None
            };
            plane.stage_layer(&mut txn, self.route.crtc, layer, self.rotation, fence);
        }

        for handle in self.registry.planes_for_crtc(self.route.crtc) {
            if assignment.entries.iter().any(|(used, _)| *used == handle) {
                continue;
            }
            if let Some(plane) = self.registry.plane(handle) {
                plane.clone().stage_disable(&mut txn, false);
            }
        }

        match txn.test_commit(self.device) {
            Ok(()) => Ok(()),
            Err(err) => match err.kind {
                CommitErrorKind::PermissionDenied if with_fences => Err(ProbeError::FenceDenied),
                CommitErrorKind::Invalid | CommitErrorKind::PermissionDenied => {
                    Err(ProbeError::Rejected)
                }
                _ => Err(ProbeError::Other(err.source)),
            },
        }
    }
}

/// Stages the disable of every object on the device. Used for teardown; the
/// routing zeroes are forced so a disable is always explicit on the wire,
/// never suppressed by pending-state bookkeeping.
fn stage_teardown(registry: &mut Registry, txn: &mut Transaction) {
    for plane in registry.planes_mut() {
        plane.stage_disable(txn, true);
    }
    for crtc in registry.crtcs_mut() {
        crtc.stage_disable(txn, true);
    }
    for connector in registry.connectors_mut() {
        connector.stage_disable(txn, true);
    }
}

pub struct KmsBackend {
    device: Arc<Device>,
    gbm: gbm::Device<Arc<Device>>,
    registry: Registry,
    allocator: PlaneAllocator,
    tracker: FrameTracker,
    flip: Arc<FlipState>,
    flip_thread: Option<JoinHandle<()>>,
    color: ColorState,
    config: Config,
    mode_memory: ModeMemory,
    session: Box<dyn SessionDisplayInfo>,
    /// Last mode the kernel accepted. `None` only before the first
    /// successful mode-set.
    current_mode: Option<Mode>,
    /// Mode chosen for the active connector, applied by the next mode-set.
    negotiated_mode: Option<Mode>,
    mode_blob: u64,
    /// The next commit must carry ALLOW_MODESET.
    pending_modeset: bool,
}

impl KmsBackend {
    pub fn new(
        path: &Path,
        config: Config,
        session: Box<dyn SessionDisplayInfo>,
    ) -> anyhow::Result<Self> {
        let device = Arc::new(Device::open(path)?);
        let gbm = gbm::Device::new(device.clone()).context("error creating GBM device")?;

        let mut registry = Registry::enumerate(&device)?;
        let selection = registry.select_best_connector(&config);
        anyhow::ensure!(
            selection == Selection::Changed,
            "no usable connector on {path:?}"
        );

        let sets = Arc::new(Mutex::new(FrameSets::default()));
        let flip = FlipState::new(sets.clone());
        let tracker = FrameTracker::new(sets);

        let cache_enabled = !config.debug.disable_allocation_cache;
        let mode_memory = ModeMemory::load(config.mode_memory.clone());

        let mut backend = Self {
            gbm,
            registry,
            allocator: PlaneAllocator::new(cache_enabled),
            tracker,
            flip: flip.clone(),
            flip_thread: None,
            color: ColorState::new(),
            config,
            mode_memory,
            session,
            current_mode: None,
            negotiated_mode: None,
            mode_blob: 0,
            pending_modeset: true,
            device: device.clone(),
        };

        backend.negotiate_mode()?;
        backend.apply_initial_mode()?;

        backend.flip_thread =
            Some(spawn_flip_thread(device, flip).context("error spawning flip thread")?);

        Ok(backend)
    }

    /// Picks the mode for the freshly selected connector and notifies the
    /// session. Does not commit anything.
    fn negotiate_mode(&mut self) -> anyhow::Result<()> {
        let route = self
            .registry
            .active()
            .context("no active connector to negotiate a mode for")?;
        let connector = self
            .registry
            .connector(route.connector)
            .context("active connector vanished")?;

        let saved = self.mode_memory.recall(&connector.description());
        let mode = pick_mode(
            connector,
            self.config.preferred_mode.as_ref(),
            saved.as_ref(),
        )
        .with_context(|| format!("connector {} reports no usable mode", connector.name()))?;

        debug!(
            "negotiated {}x{}@{}mHz on {}",
            mode.size().0,
            mode.size().1,
            mode_refresh_mhz(&mode),
            connector.name()
        );

        let description = connector.description();
        let physical = connector.display_info().physical_size_mm;
        if !connector.is_internal() {
            self.mode_memory.remember(
                &description,
                SavedMode {
                    width: mode.size().0,
                    height: mode.size().1,
                    refresh_mhz: mode_refresh_mhz(&mode),
                },
            );
        }
        self.session.display_changed(&description, physical);

        let new_blob = self.device.create_mode_blob(&mode)?;
        let old_blob = std::mem::replace(&mut self.mode_blob, new_blob);
        self.device.destroy_blob(old_blob);
        self.current_mode = None;
        self.pending_modeset = true;
        // Mode died, so every cached rejection did too.
        self.allocator.cache.clear();
        // `current_mode` is set once the kernel accepts the mode-set.
        self.negotiated_mode = Some(mode);
        Ok(())
    }

    /// First light: a blocking mode-set scanning out a blank frame. Failure
    /// here fails construction; the device is left untouched.
    fn apply_initial_mode(&mut self) -> anyhow::Result<()> {
        let mode = self
            .negotiated_mode
            .context("no negotiated mode for the initial mode-set")?;
        let size = (u32::from(mode.size().0), u32::from(mode.size().1));
        let blank = ScanoutBuffer::allocate(&self.device, &self.gbm, size, DrmFourcc::Xrgb8888)
            .context("error allocating the initial framebuffer")?;
        let layers = vec![Layer::fullscreen(blank, Colorspace::Srgb)];

        let route = self.registry.active().context("no active route")?;
        let assignment = PlaneAssignment {
            entries: vec![(route.primary_plane, 0)],
        };
        self.try_present(&layers, &assignment, OutputEotf::Sdr, false)
            .map_err(anyhow::Error::from)
            .context("initial mode-set rejected")?;
        Ok(())
    }

    pub fn supports_hdr(&self) -> bool {
        self.active_connector()
            .is_some_and(|c| c.display_info().hdr_capable)
            && !self.config.color_management.disabled
    }

    pub fn supports_vrr(&self) -> bool {
        self.config.allow_vrr && self.active_connector().is_some_and(|c| c.vrr_capable())
    }

    pub fn description(&self) -> Option<String> {
        self.active_connector().map(|c| c.description())
    }

    pub fn current_mode_size(&self) -> Option<(u32, u32)> {
        self.current_mode
            .or(self.negotiated_mode)
            .map(|m| (u32::from(m.size().0), u32::from(m.size().1)))
    }

    fn active_connector(&self) -> Option<&connector::Connector> {
        let route = self.registry.active()?;
        self.registry.connector(route.connector)
    }

    /// Marks the device changed; resources are re-read at the top of the
    /// next frame, never mid-pipeline. Safe to call from any thread.
    pub fn hotplug(&self) {
        self.flip
            .needs_repoll
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Stops presenting (VT switch away). Frames become cheap no-ops.
    pub fn pause(&self) {
        self.flip
            .paused
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Resumes presenting. The hardware may have been reprogrammed behind
    /// our back, so everything is re-read and the mode re-set.
    pub fn resume(&mut self) {
        self.flip
            .paused
            .store(false, std::sync::atomic::Ordering::Release);
        self.pending_modeset = true;
        self.hotplug();
    }

    /// Re-reads device resources and reselects the output. Called between
    /// frames when something flagged a change.
    fn repoll(&mut self) -> anyhow::Result<()> {
        let _span = tracy_client::span!("KmsBackend::repoll");
        self.registry.refresh(&self.device)?;
        match self.registry.select_best_connector(&self.config) {
            Selection::Unchanged => Ok(()),
            Selection::Changed => self.negotiate_mode(),
            Selection::Cleared => {
                warn!("no usable connector remains");
                self.current_mode = None;
                self.negotiated_mode = None;
                self.session.display_lost();
                Ok(())
            }
        }
    }

    /// Presents one frame: direct scanout when the allocator manages it,
    /// software composite otherwise, with a single-layer composite retry if
    /// the kernel rejects a commit that its own TEST_ONLY accepted.
    pub fn present_frame(
        &mut self,
        frame: &FrameRequest,
        compositor: &mut dyn FrameCompositor,
    ) -> anyhow::Result<()> {
        let _span = tracy_client::span!("KmsBackend::present_frame");

        if self.flip.paused.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }
        let flip = self.flip.clone();
        flip.take_repoll(|| self.repoll())?;
        let Some(route) = self.registry.active() else {
            // Nothing to present to; not an error.
            return Ok(());
        };
        let Some(size) = self.current_mode_size() else {
            return Ok(());
        };

        let modeset = self.pending_modeset;
        let eotf = OutputEotf::for_colorspace(frame.output_colorspace());
        let rotation = rotation_bits(
            self.active_connector()
                .map(|c| c.rotation())
                .unwrap_or_default(),
        );

        let assignment = if self.config.debug.force_composite || frame.forces_composite() {
            None
        } else {
            let mut probe = AtomicProbe {
                device: &self.device,
                registry: &self.registry,
                route,
                rotation,
                modeset,
                mode_blob: self.mode_blob,
            };
            self.allocator.allocate(
                &self.registry,
                &frame.layers,
                modeset,
                self.supports_hdr(),
                &mut probe,
            )
        };

        let (layers, assignment) = match assignment {
            Some(assignment) => (frame.layers.clone(), assignment),
            None => {
                let composited = compositor
                    .composite(&frame.layers, size)
                    .context("error compositing frame")?;
                let layers = vec![Layer::fullscreen(composited, frame.output_colorspace())];
                let assignment = PlaneAssignment {
                    entries: vec![(route.primary_plane, 0)],
                };
                (layers, assignment)
            }
        };

        match self.try_present(&layers, &assignment, eotf, frame.async_flip) {
            Ok(()) => Ok(()),
            Err(err) if err.kind == CommitErrorKind::NotVisible => {
                // Lost DRM master (VT switch raced us); drop the frame.
                trace!("commit while not master, dropping frame");
                Ok(())
            }
            Err(err) => {
                warn!("commit failed, retrying composited: {err}");
                // Retry once, fully composited, before giving up on the
                // frame.
                let composited = compositor
                    .composite(&frame.layers, size)
                    .context("error compositing frame for retry")?;
                let layers = vec![Layer::fullscreen(composited, frame.output_colorspace())];
                let assignment = PlaneAssignment {
                    entries: vec![(route.primary_plane, 0)],
                };
                match self.try_present(&layers, &assignment, eotf, false) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        error!("composited retry also failed: {err}");
                        if modeset && self.current_mode.is_none() {
                            // No known-good mode to fall back to. Presenting
                            // undefined content is worse than dying.
                            error!("mode-set failed with no previous good mode");
                            std::process::abort();
                        }
                        self.hotplug();
                        Err(anyhow::Error::from(err).context("error presenting frame"))
                    }
                }
            }
        }
    }

    /// Builds and commits the transaction for an already-decided layer
    /// layout.
    fn try_present(
        &mut self,
        layers: &[Layer],
        assignment: &PlaneAssignment,
        eotf: OutputEotf,
        async_flip: bool,
    ) -> Result<(), CommitError> {
        let _span = tracy_client::span!("KmsBackend::try_present");
        let modeset = self.pending_modeset;
        let route = match self.registry.active() {
            Some(route) => route,
            None => return Ok(()),
        };
        let rotation = rotation_bits(
            self.active_connector()
                .map(|c| c.rotation())
                .unwrap_or_default(),
        );
        let vrr = self.supports_vrr();
        let fences_enabled = !self.allocator.fences_disabled();
        let cm_config = self.config.color_management;
        let mode_blob = self.mode_blob;

        let mut txn = Transaction::new(modeset);

        if modeset {
            if let Some(connector) = self.registry.connector_mut(route.connector) {
                let crtc_raw: std::num::NonZeroU32 = route.crtc.into();
                connector
                    .props
                    .crtc_id
                    .set_pending(&mut txn, u64::from(crtc_raw.get()), true);
            }
            if let Some(crtc) = self.registry.crtc_mut(route.crtc) {
                crtc.props.active.set_pending(&mut txn, 1, true);
                crtc.props.mode_id.set_pending(&mut txn, mode_blob, true);
            }
        }

        if let Some(crtc) = self.registry.crtc_mut(route.crtc) {
            if let Some(prop) = &mut crtc.props.vrr_enabled {
                prop.set_pending(&mut txn, u64::from(vrr), false);
            }
        }

        for &(handle, layer_index) in &assignment.entries {
            let layer = &layers[layer_index];
            if let Some(plane) = self.registry.plane_mut(handle) {
                let fence = if fences_enabled {
                    layer.fence.as_ref().map(|f| f.as_raw_fd())
                } else {
                    None
                };
                plane.stage_layer(&mut txn, route.crtc, layer, rotation, fence);
            }
            self.tracker.track(&layer.buffer);
        }

        for handle in self.registry.planes_for_crtc(route.crtc) {
            if assignment.entries.iter().any(|(used, _)| *used == handle) {
                continue;
            }
            if let Some(plane) = self.registry.plane_mut(handle) {
                plane.stage_disable(&mut txn, false);
            }
        }

        let color_result = {
            let registry = &mut self.registry;
            // Split borrows: connector and CRTC are distinct objects.
            if let Some(mut connector) = registry.take_connector(route.connector) {
                let result = match registry.crtc_mut(route.crtc) {
                    Some(crtc) => self.color.stage(
                        &self.device,
                        &mut txn,
                        &mut connector,
                        crtc,
                        eotf,
                        &cm_config,
                    ),
                    None => Ok(()),
                };
                registry.put_connector(route.connector, connector);
                result
            } else {
                Ok(())
            }
        };
        if let Err(err) = color_result {
            warn!("error staging color management: {err:?}");
        }

        if modeset {
            // A late flip from the previous non-blocking commit would swap
            // its stale queued set over whatever this commit puts on screen.
            // Wait it out; the completion drains queued into visible before
            // the gate opens.
            self.flip.gate.acquire();
            match txn.commit(&self.device, false) {
                Ok(()) => {
                    self.registry.on_commit();
                    self.tracker.promote_blocking();
                    self.color.release_stale(&self.device);
                    self.current_mode = self.negotiated_mode;
                    self.pending_modeset = false;
                    self.flip.gate.release();
                    Ok(())
                }
                Err(err) => {
                    self.flip.gate.release();
                    self.registry.rollback();
                    self.tracker.discard_request();
                    self.pending_modeset = true;
                    Err(err)
                }
            }
        } else {
            self.flip.gate.acquire();
            self.tracker.submit();
            match txn.commit(&self.device, async_flip) {
                Ok(()) => {
                    self.flip
                        .submitted
                        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                    self.registry.on_commit();
                    self.color.release_stale(&self.device);
                    Ok(())
                }
                Err(err) => {
                    self.tracker.abort_submit();
                    self.flip.gate.release();
                    self.registry.rollback();
                    Err(err)
                }
            }
        }
    }

    /// Stops the flip thread and hands the device back with every plane,
    /// CRTC and connector explicitly zeroed.
    pub fn teardown(mut self) -> anyhow::Result<()> {
        debug!("tearing down KMS backend");

        self.flip.request_stop();
        if let Some(thread) = self.flip_thread.take() {
            let _ = thread.join();
        }

        let mut txn = Transaction::new(true);
        stage_teardown(&mut self.registry, &mut txn);
        {
            // Color blobs are zeroed per-route.
            let routes: Vec<_> = self.registry.active().into_iter().collect();
            for route in routes {
                if let Some(mut connector) = self.registry.take_connector(route.connector) {
                    if let Some(crtc) = self.registry.crtc_mut(route.crtc) {
                        self.color.stage_reset(&mut txn, &mut connector, crtc);
                    }
                    self.registry.put_connector(route.connector, connector);
                }
            }
        }

        let result = txn
            .commit(&self.device, false)
            .context("error committing teardown state");
        if result.is_ok() {
            self.registry.on_commit();
        } else {
            self.registry.rollback();
        }

        self.tracker.clear();
        self.color.destroy_all(&self.device);
        self.device.destroy_blob(std::mem::take(&mut self.mode_blob));
        self.registry.clear_active();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::connector::test_support::{fake_mode, FakeConnector};
    use super::property::test_support::*;
    use super::property::ObjectId;
    use super::registry::test_support::fake_registry;
    use super::*;

    #[test]
    fn teardown_zeroes_every_plane_even_on_active_crtcs() {
        // CRTC reports ACTIVE=1 and the planes are already detached in our
        // bookkeeping; teardown must still put explicit zeroes on the wire
        // for every plane, not rely on the CRTC disable to cascade.
        let mut registry = fake_registry(vec![(
            30,
            FakeConnector {
                name: "DP-1",
                connected: true,
                non_desktop: false,
                modes: vec![fake_mode(1920, 1080, 60_000, 0, 0)],
                possible_crtcs: vec![],
            },
        )]);

        let mut txn = Transaction::new(true);
        stage_teardown(&mut registry, &mut txn);

        for plane in [plane_handle(40), plane_handle(41)] {
            let object = ObjectId::Plane(plane);
            assert_eq!(txn.writes_for(object, "FB_ID"), vec![0]);
            assert_eq!(txn.writes_for(object, "CRTC_ID"), vec![0]);
        }

        let crtc = ObjectId::Crtc(crtc_handle(8));
        assert_eq!(txn.writes_for(crtc, "ACTIVE"), vec![0]);
        assert_eq!(txn.writes_for(crtc, "MODE_ID"), vec![0]);

        let connector = ObjectId::Connector(connector_handle(30));
        assert_eq!(txn.writes_for(connector, "CRTC_ID"), vec![0]);
    }

    #[test]
    fn teardown_staging_is_idempotent_per_transaction() {
        let mut registry = fake_registry(vec![]);

        let mut first = Transaction::new(true);
        stage_teardown(&mut registry, &mut first);
        let first_writes = first.writes().len();

        // Forced routing writes appear again in a second transaction even
        // though pendings are already zero.
        let mut second = Transaction::new(true);
        stage_teardown(&mut registry, &mut second);
        let object = ObjectId::Plane(plane_handle(41));
        assert_eq!(second.writes_for(object, "FB_ID"), vec![0]);
        assert!(first_writes >= second.writes().len());
    }

    #[test]
    fn rotation_mapping_is_one_hot() {
        for (rotation, bits) in [
            (Rotation::Normal, RotationBits::ROTATE_0),
            (Rotation::Rotate90, RotationBits::ROTATE_90),
            (Rotation::Rotate180, RotationBits::ROTATE_180),
            (Rotation::Rotate270, RotationBits::ROTATE_270),
        ] {
            assert_eq!(rotation_bits(rotation), bits);
        }
    }

    #[test]
    fn frame_request_output_colorspace() {
        use crate::layer::{Colorspace, Layer};
        use framebuffer::ScanoutBuffer;

        let buffer = ScanoutBuffer::virtual_new(1, (64, 64), DrmFourcc::Xrgb8888);
        let mut frame = FrameRequest {
            layers: vec![Layer::fullscreen(buffer, Colorspace::Hdr10Pq)],
            ..Default::default()
        };
        assert_eq!(frame.output_colorspace(), Colorspace::Hdr10Pq);

        // Tone mapping flattens the output back to SDR.
        frame.hdr_tone_mapping = true;
        assert_eq!(frame.output_colorspace(), Colorspace::Srgb);
    }
}
