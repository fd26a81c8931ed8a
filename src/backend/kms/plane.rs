//! Hardware plane objects.

use anyhow::Context;
use bitflags::bitflags;
use drm::buffer::DrmFourcc;
use drm::control::{crtc, plane, Device as ControlDevice, PlaneType, ResourceHandles};

use super::device::Device;
use super::property::{ObjectId, Property, PropertyMap};
use super::transaction::Transaction;
use crate::layer::Layer;

bitflags! {
    /// Raw values of the kernel "rotation" bitmask property.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RotationBits: u64 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

// Kernel color encoding / range enum values.
pub const COLOR_ENCODING_BT709: u64 = 1;
pub const COLOR_RANGE_LIMITED: u64 = 0;

/// The fixed property set we drive on a plane. Geometry and framebuffer
/// routing are mandatory on any atomic driver; the rest is negotiated.
#[derive(Debug, Clone)]
pub struct PlaneProps {
    pub fb_id: Property,
    pub crtc_id: Property,
    pub src_x: Property,
    pub src_y: Property,
    pub src_w: Property,
    pub src_h: Property,
    pub crtc_x: Property,
    pub crtc_y: Property,
    pub crtc_w: Property,
    pub crtc_h: Property,
    pub rotation: Option<Property>,
    pub alpha: Option<Property>,
    pub in_fence_fd: Option<Property>,
    pub color_encoding: Option<Property>,
    pub color_range: Option<Property>,
}

impl PlaneProps {
    fn new(object: ObjectId, map: &PropertyMap) -> anyhow::Result<Self> {
        let required = |name: &'static str| {
            Property::new(name, object, map)
                .with_context(|| format!("plane is missing the {name} property"))
        };

        Ok(Self {
            fb_id: required("FB_ID")?,
            crtc_id: required("CRTC_ID")?,
            src_x: required("SRC_X")?,
            src_y: required("SRC_Y")?,
            src_w: required("SRC_W")?,
            src_h: required("SRC_H")?,
            crtc_x: required("CRTC_X")?,
            crtc_y: required("CRTC_Y")?,
            crtc_w: required("CRTC_W")?,
            crtc_h: required("CRTC_H")?,
            rotation: Property::new("rotation", object, map),
            alpha: Property::new("alpha", object, map),
            in_fence_fd: Property::new("IN_FENCE_FD", object, map),
            color_encoding: Property::new("COLOR_ENCODING", object, map),
            color_range: Property::new("COLOR_RANGE", object, map),
        })
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&mut Property)) {
        f(&mut self.fb_id);
        f(&mut self.crtc_id);
        f(&mut self.src_x);
        f(&mut self.src_y);
        f(&mut self.src_w);
        f(&mut self.src_h);
        f(&mut self.crtc_x);
        f(&mut self.crtc_y);
        f(&mut self.crtc_w);
        f(&mut self.crtc_h);
        for prop in [
            &mut self.rotation,
            &mut self.alpha,
            &mut self.in_fence_fd,
            &mut self.color_encoding,
            &mut self.color_range,
        ]
        .into_iter()
        .flatten()
        {
            f(prop);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plane {
    handle: plane::Handle,
    ty: PlaneType,
    formats: Vec<u32>,
    possible_crtcs: Vec<crtc::Handle>,
    pub props: PlaneProps,
}

impl Plane {
    pub fn query(
        device: &Device,
        resources: &ResourceHandles,
        handle: plane::Handle,
    ) -> anyhow::Result<Self> {
        let info = device
            .get_plane(handle)
            .context("error getting plane info")?;
        let possible_crtcs = resources.filter_crtcs(info.possible_crtcs());

        let object = ObjectId::Plane(handle);
        let map = PropertyMap::query(device, object)?;
        let props = PlaneProps::new(object, &map)?;

        let ty = match map.get("type").map(|(_, value)| value) {
            Some(value) if value == PlaneType::Primary as u64 => PlaneType::Primary,
            Some(value) if value == PlaneType::Cursor as u64 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };

        Ok(Self {
            handle,
            ty,
            formats: info.formats().to_vec(),
            possible_crtcs,
            props,
        })
    }

    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    pub fn plane_type(&self) -> PlaneType {
        self.ty
    }

    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&(format as u32))
    }

    pub fn can_drive(&self, crtc: crtc::Handle) -> bool {
        self.possible_crtcs.contains(&crtc)
    }

    pub fn refresh_props(&mut self, device: &Device) -> anyhow::Result<()> {
        let map = PropertyMap::query(device, ObjectId::Plane(self.handle))?;
        self.props.for_each(|prop| prop.refresh(&map));
        Ok(())
    }

    /// Stages the full state for one layer.
    pub fn stage_layer(
        &mut self,
        txn: &mut Transaction,
        crtc: crtc::Handle,
        layer: &Layer,
        rotation: RotationBits,
        fence_fd: Option<i32>,
    ) {
        let crtc_raw: std::num::NonZeroU32 = crtc.into();
        let fb_raw: std::num::NonZeroU32 = layer.buffer.framebuffer().into();

        self.props
            .crtc_id
            .set_pending(txn, u64::from(crtc_raw.get()), false);
        self.props
            .fb_id
            .set_pending(txn, u64::from(fb_raw.get()), false);

        let (src_x, src_y, src_w, src_h) = layer.src.to_fixed16();
        self.props.src_x.set_pending(txn, u64::from(src_x), false);
        self.props.src_y.set_pending(txn, u64::from(src_y), false);
        self.props.src_w.set_pending(txn, u64::from(src_w), false);
        self.props.src_h.set_pending(txn, u64::from(src_h), false);

        self.props
            .crtc_x
            .set_pending(txn, layer.dst.x as i64 as u64, false);
        self.props
            .crtc_y
            .set_pending(txn, layer.dst.y as i64 as u64, false);
        self.props
            .crtc_w
            .set_pending(txn, layer.dst.w as i64 as u64, false);
        self.props
            .crtc_h
            .set_pending(txn, layer.dst.h as i64 as u64, false);

        if let Some(prop) = &mut self.props.rotation {
            prop.set_pending(txn, rotation.bits(), false);
        }

        if let Some(prop) = &mut self.props.alpha {
            let alpha = (f64::from(layer.alpha.clamp(0., 1.)) * 65535.).round() as u64;
            prop.set_pending(txn, alpha, false);
        }

        if let Some(prop) = &mut self.props.in_fence_fd {
            match fence_fd {
                // Fence fds are consumed per commit; the kernel does not
                // retain them, so dedup against pending is meaningless here.
                Some(fd) => prop.set_pending(txn, fd as i64 as u64, true),
                None => prop.set_pending(txn, -1i64 as u64, false),
            }
        }

        if layer.buffer.format() == DrmFourcc::Nv12 {
            if let Some(prop) = &mut self.props.color_encoding {
                prop.set_pending(txn, COLOR_ENCODING_BT709, false);
            }
            if let Some(prop) = &mut self.props.color_range {
                prop.set_pending(txn, COLOR_RANGE_LIMITED, false);
            }
        }
    }

    /// Detaches the plane: zeroes FB_ID and CRTC_ID along with geometry.
    /// With `force`, the writes are staged even if the plane already looks
    /// detached, so a disable is always explicit on the wire.
    pub fn stage_disable(&mut self, txn: &mut Transaction, force: bool) {
        self.props.crtc_id.set_pending(txn, 0, force);
        self.props.fb_id.set_pending(txn, 0, force);
        self.props.src_x.set_pending(txn, 0, false);
        self.props.src_y.set_pending(txn, 0, false);
        self.props.src_w.set_pending(txn, 0, false);
        self.props.src_h.set_pending(txn, 0, false);
        self.props.crtc_x.set_pending(txn, 0, false);
        self.props.crtc_y.set_pending(txn, 0, false);
        self.props.crtc_w.set_pending(txn, 0, false);
        self.props.crtc_h.set_pending(txn, 0, false);
        if let Some(prop) = &mut self.props.rotation {
            prop.set_pending(txn, RotationBits::ROTATE_0.bits(), false);
        }
        if let Some(prop) = &mut self.props.alpha {
            prop.set_pending(txn, 65535, false);
        }
        if let Some(prop) = &mut self.props.in_fence_fd {
            prop.set_pending(txn, -1i64 as u64, false);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use drm::control::PlaneType;

    use super::super::property::test_support::*;
    use super::super::property::{ObjectId, PropertyMap};
    use super::{Plane, PlaneProps};
    use drm::control::crtc;

    /// Fabricates a plane with the mandatory property set plus `extra`
    /// optional properties, without touching a device.
    pub fn fake_plane(
        id: u32,
        ty: PlaneType,
        possible_crtcs: Vec<crtc::Handle>,
        formats: Vec<u32>,
        extra: &[(&'static str, u64)],
    ) -> Plane {
        let handle = plane_handle(id);
        let object = ObjectId::Plane(handle);

        let mut entries = vec![
            ("FB_ID", prop_handle(100), 0),
            ("CRTC_ID", prop_handle(101), 0),
            ("SRC_X", prop_handle(102), 0),
            ("SRC_Y", prop_handle(103), 0),
            ("SRC_W", prop_handle(104), 0),
            ("SRC_H", prop_handle(105), 0),
            ("CRTC_X", prop_handle(106), 0),
            ("CRTC_Y", prop_handle(107), 0),
            ("CRTC_W", prop_handle(108), 0),
            ("CRTC_H", prop_handle(109), 0),
        ];
        for (i, (name, value)) in extra.iter().enumerate() {
            entries.push((*name, prop_handle(110 + i as u32), *value));
        }
        let map = PropertyMap::from_entries(entries);

        Plane {
            handle,
            ty,
            formats,
            possible_crtcs,
            props: PlaneProps::new(object, &map).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use drm::buffer::DrmFourcc;
    use drm::control::PlaneType;

    use super::super::property::test_support::*;
    use super::super::property::ObjectId;
    use super::super::transaction::Transaction;
    use super::test_support::fake_plane;
    use super::*;
    use crate::backend::kms::framebuffer::ScanoutBuffer;
    use crate::layer::{Colorspace, Layer};

    #[test]
    fn stage_layer_writes_geometry_and_routing() {
        let crtc = crtc_handle(8);
        let mut plane = fake_plane(
            40,
            PlaneType::Primary,
            vec![crtc],
            vec![DrmFourcc::Xrgb8888 as u32],
            &[("alpha", 65535)],
        );
        let object = ObjectId::Plane(plane.handle());

        let buffer = ScanoutBuffer::virtual_new(77, (1920, 1080), DrmFourcc::Xrgb8888);
        let layer = Layer::fullscreen(buffer, Colorspace::Srgb);

        let mut txn = Transaction::new(false);
        plane.stage_layer(&mut txn, crtc, &layer, RotationBits::ROTATE_0, None);

        assert_eq!(txn.writes_for(object, "CRTC_ID"), vec![8]);
        assert_eq!(txn.writes_for(object, "FB_ID"), vec![77]);
        assert_eq!(txn.writes_for(object, "SRC_W"), vec![1920 << 16]);
        assert_eq!(txn.writes_for(object, "CRTC_H"), vec![1080]);
        // Alpha already at max, write suppressed.
        assert!(txn.writes_for(object, "alpha").is_empty());
    }

    #[test]
    fn stage_disable_forces_routing_writes() {
        let mut plane = fake_plane(40, PlaneType::Overlay, vec![], vec![], &[]);
        let object = ObjectId::Plane(plane.handle());

        // Plane already detached: FB_ID and CRTC_ID pendings are zero.
        let mut txn = Transaction::new(true);
        plane.stage_disable(&mut txn, true);

        assert_eq!(txn.writes_for(object, "FB_ID"), vec![0]);
        assert_eq!(txn.writes_for(object, "CRTC_ID"), vec![0]);
    }
}
