//! CRTC objects.

use anyhow::Context;
use drm::control::crtc;

use super::device::Device;
use super::property::{ObjectId, Property, PropertyMap};
use super::transaction::Transaction;

/// The property set we drive on a CRTC. ACTIVE and MODE_ID are mandatory on
/// atomic drivers; color-management and VRR state is negotiated.
#[derive(Debug, Clone)]
pub struct CrtcProps {
    pub active: Property,
    pub mode_id: Property,
    pub vrr_enabled: Option<Property>,
    pub gamma_lut: Option<Property>,
    pub gamma_lut_size: Option<Property>,
    pub degamma_lut: Option<Property>,
    pub degamma_lut_size: Option<Property>,
    pub ctm: Option<Property>,
}

impl CrtcProps {
    fn new(object: ObjectId, map: &PropertyMap) -> anyhow::Result<Self> {
        let required = |name: &'static str| {
            Property::new(name, object, map)
                .with_context(|| format!("CRTC is missing the {name} property"))
        };

        Ok(Self {
            active: required("ACTIVE")?,
            mode_id: required("MODE_ID")?,
            vrr_enabled: Property::new("VRR_ENABLED", object, map),
            gamma_lut: Property::new("GAMMA_LUT", object, map),
            gamma_lut_size: Property::new("GAMMA_LUT_SIZE", object, map),
            degamma_lut: Property::new("DEGAMMA_LUT", object, map),
            degamma_lut_size: Property::new("DEGAMMA_LUT_SIZE", object, map),
            ctm: Property::new("CTM", object, map),
        })
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&mut Property)) {
        f(&mut self.active);
        f(&mut self.mode_id);
        for prop in [
            &mut self.vrr_enabled,
            &mut self.gamma_lut,
            &mut self.gamma_lut_size,
            &mut self.degamma_lut,
            &mut self.degamma_lut_size,
            &mut self.ctm,
        ]
        .into_iter()
        .flatten()
        {
            f(prop);
        }
    }
}

#[derive(Debug)]
pub struct Crtc {
    handle: crtc::Handle,
    pub props: CrtcProps,
}

impl Crtc {
    pub fn query(device: &Device, handle: crtc::Handle) -> anyhow::Result<Self> {
        let object = ObjectId::Crtc(handle);
        let map = PropertyMap::query(device, object)?;
        let props = CrtcProps::new(object, &map)?;
        Ok(Self { handle, props })
    }

    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    pub fn refresh_props(&mut self, device: &Device) -> anyhow::Result<()> {
        let map = PropertyMap::query(device, ObjectId::Crtc(self.handle))?;
        self.props.for_each(|prop| prop.refresh(&map));
        Ok(())
    }

    /// A throwaway copy of the property set, for staging probe requests
    /// without touching real pending state.
    pub fn clone_props(&self) -> CrtcProps {
        self.props.clone()
    }

    /// Stops scanout: ACTIVE=0 and MODE_ID=0, plus a reset of any
    /// color-management and VRR state we may have staged.
    pub fn stage_disable(&mut self, txn: &mut Transaction, force: bool) {
        self.props.active.set_pending(txn, 0, force);
        self.props.mode_id.set_pending(txn, 0, force);
        if let Some(prop) = &mut self.props.vrr_enabled {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut self.props.gamma_lut {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut self.props.degamma_lut {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut self.props.ctm {
            prop.set_pending(txn, 0, false);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::property::test_support::*;
    use super::super::property::{ObjectId, PropertyMap};
    use super::{Crtc, CrtcProps};

    pub fn fake_crtc(id: u32, active: u64, extra: &[(&'static str, u64)]) -> Crtc {
        let handle = crtc_handle(id);
        let object = ObjectId::Crtc(handle);

        let mut entries = vec![
            ("ACTIVE", prop_handle(200), active),
            ("MODE_ID", prop_handle(201), 0),
        ];
        for (i, (name, value)) in extra.iter().enumerate() {
            entries.push((*name, prop_handle(202 + i as u32), *value));
        }
        let map = PropertyMap::from_entries(entries);

        Crtc {
            handle,
            props: CrtcProps::new(object, &map).unwrap(),
        }
    }
}
