//! Hardware plane allocation.
//!
//! Maps the frame's layer list onto scanout planes, or fails as a whole so
//! the caller composites in software. Partial assignments are never returned:
//! splitting a frame between hardware and software looks torn for exactly the
//! content (video, overlays) that direct scanout is for.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io;

use drm::buffer::DrmFourcc;
use drm::control::plane;
use tracing::{debug, trace, warn};

use super::registry::Registry;
use crate::layer::Layer;

/// Quantized summary of one layer, the unit of the rejected-layout cache
/// key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayerFingerprint {
    dst: (i32, i32, i32, i32),
    /// Source rect in 1/16-pixel units, so subpixel pan does not churn the
    /// cache.
    src: (u32, u32, u32, u32),
    format: u32,
    colorspace: crate::layer::Colorspace,
    /// Opacity quantized to 8 bits.
    alpha: u8,
    color_managed: bool,
}

impl LayerFingerprint {
    pub fn of(layer: &Layer) -> Self {
        let quantize = |v: f64| (v * 16.).round() as u32;
        let format = layer.buffer.format();
        Self {
            dst: (layer.dst.x, layer.dst.y, layer.dst.w, layer.dst.h),
            src: (
                quantize(layer.src.x),
                quantize(layer.src.y),
                quantize(layer.src.w),
                quantize(layer.src.h),
            ),
            format: format as u32,
            colorspace: layer.colorspace,
            alpha: (f64::from(layer.alpha.clamp(0., 1.)) * 255.).round() as u8,
            // Only NV12 scanout has shown color-management-dependent
            // rejections (driver-specific); letting the bit vary for other
            // formats would poison unrelated cache entries.
            color_managed: layer.color_managed && format == DrmFourcc::Nv12,
        }
    }
}

/// Collapses a layer list into one cache key.
pub fn fingerprint_layers(layers: &[Layer]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    layers.len().hash(&mut hasher);
    for layer in layers {
        LayerFingerprint::of(layer).hash(&mut hasher);
    }
    hasher.finish()
}

/// Remembers layer layouts the driver rejected for the current mode.
#[derive(Debug)]
pub struct RejectedLayouts {
    rejected: HashSet<u64>,
    enabled: bool,
}

impl RejectedLayouts {
    pub fn new(enabled: bool) -> Self {
        Self {
            rejected: HashSet::new(),
            enabled,
        }
    }

    pub fn remember(&mut self, fingerprint: u64) {
        if self.enabled {
            self.rejected.insert(fingerprint);
        }
    }

    pub fn contains(&self, fingerprint: u64) -> bool {
        self.enabled && self.rejected.contains(&fingerprint)
    }

    /// Rejections are only meaningful for one mode; a mode-set invalidates
    /// everything.
    pub fn clear(&mut self) {
        self.rejected.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rejected.len()
    }
}

/// A concrete plane-to-layer mapping, in staging order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaneAssignment {
    /// `(plane, layer index)` pairs.
    pub entries: Vec<(plane::Handle, usize)>,
}

#[derive(Debug)]
pub enum ProbeError {
    /// The driver cannot scan this layout out.
    Rejected,
    /// `EPERM` with an input fence staged; see the allocator's fence latch.
    FenceDenied,
    Other(io::Error),
}

/// Answers whether a concrete assignment would scan out. The production
/// implementation asks the kernel with a TEST_ONLY commit.
pub trait ScanoutProbe {
    fn probe(
        &mut self,
        assignment: &PlaneAssignment,
        layers: &[Layer],
        with_fences: bool,
    ) -> Result<(), ProbeError>;
}

#[derive(Debug)]
pub struct PlaneAllocator {
    pub cache: RejectedLayouts,
    fences_disabled: bool,
}

impl PlaneAllocator {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            cache: RejectedLayouts::new(cache_enabled),
            fences_disabled: false,
        }
    }

    /// Whether input fences have been latched off for this session.
    pub fn fences_disabled(&self) -> bool {
        self.fences_disabled
    }

    /// Tries to put every layer on a hardware plane. `None` means composite
    /// in software. During a mode-set the cache is cleared and not written:
    /// rejections probed against a dying mode would poison the new one.
    pub fn allocate(
        &mut self,
        registry: &Registry,
        layers: &[Layer],
        modeset: bool,
        color_managed_output: bool,
        probe: &mut dyn ScanoutProbe,
    ) -> Option<PlaneAssignment> {
        let _span = tracy_client::span!("PlaneAllocator::allocate");

        if modeset {
            self.cache.clear();
        }
        let route = registry.active()?;
        if layers.is_empty() {
            return None;
        }

        // A frame mixing colorspaces needs per-plane color management to
        // come out right; without it the whole frame goes to the
        // compositor.
        let mixed = layers
            .iter()
            .any(|l| l.colorspace != layers[0].colorspace);
        if mixed && !color_managed_output {
            trace!("mixed-colorspace frame without color management, compositing");
            return None;
        }

        let fingerprint = fingerprint_layers(layers);
        if !modeset && self.cache.contains(fingerprint) {
            trace!("layout previously rejected, compositing");
            return None;
        }

        let planes = registry.planes_for_crtc(route.crtc);
        if layers.len() > planes.len() {
            debug!(
                "{} layers but only {} planes, compositing",
                layers.len(),
                planes.len()
            );
            if !modeset {
                self.cache.remember(fingerprint);
            }
            return None;
        }

        let mut entries = Vec::with_capacity(layers.len());
        for (index, _) in layers.iter().enumerate() {
            let format = layers[index].buffer.format();
            let plane = planes.iter().find(|&&handle| {
                !entries.iter().any(|(used, _)| *used == handle)
                    && registry
                        .plane(handle)
                        .is_some_and(|p| p.supports_format(format))
            });
            match plane {
                Some(&plane) => entries.push((plane, index)),
                None => {
                    debug!("no plane supports {format:?} for layer {index}, compositing");
                    if !modeset {
                        self.cache.remember(fingerprint);
                    }
                    return None;
                }
            }
        }
        let assignment = PlaneAssignment { entries };

        let want_fences = !self.fences_disabled && layers.iter().any(|l| l.fence.is_some());
        let result = probe.probe(&assignment, layers, want_fences);
        let result = match result {
            Err(ProbeError::FenceDenied) if want_fences => {
                // Some drivers reject IN_FENCE_FD outright. Retry once
                // without fences; if that passes, keep them off for the
                // rest of the session.
                match probe.probe(&assignment, layers, false) {
                    Ok(()) => {
                        warn!("driver rejected IN_FENCE_FD, disabling input fences");
                        self.fences_disabled = true;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            other => other,
        };

        match result {
            Ok(()) => Some(assignment),
            Err(err) => {
                trace!("scanout probe rejected layout: {err:?}");
                if !modeset {
                    self.cache.remember(fingerprint);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use drm::buffer::DrmFourcc;

    use super::super::connector::test_support::{fake_mode, FakeConnector};
    use super::super::registry::test_support::fake_registry;
    use super::super::registry::Registry;
    use super::*;
    use crate::backend::kms::framebuffer::ScanoutBuffer;
    use crate::layer::{Colorspace, DstRect, Layer, SrcRect};

    struct FakeProbe {
        responses: Vec<Result<(), ProbeError>>,
        calls: Vec<bool>,
    }

    impl FakeProbe {
        fn accepting() -> Self {
            Self {
                responses: Vec::new(),
                calls: Vec::new(),
            }
        }

        fn with_responses(responses: Vec<Result<(), ProbeError>>) -> Self {
            Self {
                responses,
                calls: Vec::new(),
            }
        }
    }

    impl ScanoutProbe for FakeProbe {
        fn probe(
            &mut self,
            _assignment: &PlaneAssignment,
            _layers: &[Layer],
            with_fences: bool,
        ) -> Result<(), ProbeError> {
            self.calls.push(with_fences);
            if self.responses.is_empty() {
                Ok(())
            } else {
                self.responses.remove(0)
            }
        }
    }

    fn registry() -> Registry {
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
        registry.select_best_connector(&helios_config::Config::default());
        registry
    }

    fn layer(id: u32, colorspace: Colorspace) -> Layer {
        let buffer = ScanoutBuffer::virtual_new(id, (1920, 1080), DrmFourcc::Xrgb8888);
        Layer {
            src: SrcRect::full((1920, 1080)),
            dst: DstRect {
                x: 0,
                y: 0,
                w: 1920,
                h: 1080,
            },
            alpha: 1.,
            colorspace,
            color_managed: false,
            fence: None,
            buffer,
        }
    }

    #[test]
    fn single_layer_goes_to_primary_plane() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let layers = vec![layer(1, Colorspace::Srgb)];

        let assignment = allocator
            .allocate(&registry, &layers, false, false, &mut FakeProbe::accepting())
            .unwrap();
        assert_eq!(assignment.entries.len(), 1);
        assert_eq!(assignment.entries[0].1, 0);
    }

    #[test]
    fn mixed_colorspace_without_color_management_fails_whole_frame() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let layers = vec![layer(1, Colorspace::Hdr10Pq), layer(2, Colorspace::Srgb)];

        let mut probe = FakeProbe::accepting();
        let result = allocator.allocate(&registry, &layers, false, false, &mut probe);

        assert!(result.is_none());
        // Failed before ever asking the driver.
        assert!(probe.calls.is_empty());
    }

    #[test]
    fn mixed_colorspace_with_color_management_is_probed() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let layers = vec![layer(1, Colorspace::Hdr10Pq), layer(2, Colorspace::Srgb)];

        let mut probe = FakeProbe::accepting();
        let result = allocator.allocate(&registry, &layers, false, true, &mut probe);

        assert!(result.is_some());
        assert_eq!(probe.calls.len(), 1);
    }

    #[test]
    fn rejection_is_cached_and_skips_reprobe() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let layers = vec![layer(1, Colorspace::Srgb)];

        let mut probe = FakeProbe::with_responses(vec![Err(ProbeError::Rejected)]);
        assert!(allocator
            .allocate(&registry, &layers, false, false, &mut probe)
            .is_none());
        assert_eq!(allocator.cache.len(), 1);

        // Same layout again: no probe call at all.
        let mut probe = FakeProbe::accepting();
        assert!(allocator
            .allocate(&registry, &layers, false, false, &mut probe)
            .is_none());
        assert!(probe.calls.is_empty());
    }

    #[test]
    fn modeset_rejections_never_enter_the_cache() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let layers = vec![layer(1, Colorspace::Srgb)];

        let mut probe = FakeProbe::with_responses(vec![Err(ProbeError::Rejected)]);
        assert!(allocator
            .allocate(&registry, &layers, true, false, &mut probe)
            .is_none());
        assert_eq!(allocator.cache.len(), 0);

        // The same layout probes fine against the new mode.
        let mut probe = FakeProbe::accepting();
        assert!(allocator
            .allocate(&registry, &layers, false, false, &mut probe)
            .is_some());
    }

    #[test]
    fn modeset_clears_previously_cached_rejections() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let layers = vec![layer(1, Colorspace::Srgb)];

        let mut probe = FakeProbe::with_responses(vec![Err(ProbeError::Rejected)]);
        allocator.allocate(&registry, &layers, false, false, &mut probe);
        assert_eq!(allocator.cache.len(), 1);

        let mut probe = FakeProbe::accepting();
        assert!(allocator
            .allocate(&registry, &layers, true, false, &mut probe)
            .is_some());
        assert_eq!(allocator.cache.len(), 0);
    }

    #[test]
    fn fence_eperm_latches_off_for_the_session() {
        let registry = registry();
        let mut allocator = PlaneAllocator::new(true);
        let mut layers = vec![layer(1, Colorspace::Srgb)];
        // Any fd stands in for a real fence here; the probe never reads it.
        let fence = std::fs::File::open("/dev/null").unwrap();
        layers[0].fence = Some(std::sync::Arc::new(fence.into()));

        // First probe with fences gets EPERM; retry without succeeds.
        let mut probe =
            FakeProbe::with_responses(vec![Err(ProbeError::FenceDenied), Ok(())]);
        assert!(allocator
            .allocate(&registry, &layers, false, false, &mut probe)
            .is_some());
        assert_eq!(probe.calls, vec![true, false]);
        assert!(allocator.fences_disabled());

        // Later frames never ask for fences again.
        let mut probe = FakeProbe::accepting();
        allocator.allocate(&registry, &layers, false, false, &mut probe);
        assert_eq!(probe.calls, vec![false]);
    }

    #[test]
    fn subpixel_jitter_shares_a_fingerprint() {
        let a = layer(1, Colorspace::Srgb);
        let mut b = a.clone();
        b.src.x += 0.01;

        assert_eq!(
            LayerFingerprint::of(&a),
            LayerFingerprint::of(&b),
        );
    }

    proptest::proptest! {
        /// The fingerprint is a pure function of the quantized fields:
        /// source offsets in the same 1/16-pixel cell and alpha in the same
        /// 8-bit step always collide, and any destination change never
        /// does.
        #[test]
        fn fingerprint_respects_quantization(
            x in 0.0f64..4096.0,
            jitter in 0.0f64..0.2,
            alpha in 0.0f32..=1.0,
            alpha_jitter in 0.0f32..0.01,
            dx in 1i32..100,
        ) {
            let mut a = layer(1, Colorspace::Srgb);
            a.src.x = x;
            a.alpha = alpha;

            let mut b = a.clone();
            b.src.x = x + jitter;
            b.alpha = (alpha + alpha_jitter).min(1.);

            let same_cell = (x * 16.).round() == ((x + jitter) * 16.).round();
            let same_alpha = (f64::from(a.alpha) * 255.).round()
                == (f64::from(b.alpha) * 255.).round();
            if same_cell && same_alpha {
                proptest::prop_assert_eq!(
                    LayerFingerprint::of(&a),
                    LayerFingerprint::of(&b)
                );
            }

            let mut moved = a.clone();
            moved.dst.x += dx;
            proptest::prop_assert_ne!(LayerFingerprint::of(&a), LayerFingerprint::of(&moved));
        }
    }

    #[test]
    fn color_managed_bit_ignored_for_rgb_formats() {
        let a = layer(1, Colorspace::Srgb);
        let mut b = a.clone();
        b.color_managed = true;

        // Same Xrgb8888 buffer: the quirk bit only participates for NV12.
        assert_eq!(LayerFingerprint::of(&a), LayerFingerprint::of(&b));
    }
}
