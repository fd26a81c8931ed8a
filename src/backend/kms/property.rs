//! KMS property model.
//!
//! Every mutable piece of display hardware state is a property on a kernel
//! object. Drivers expose different property sets, so absence is a legal,
//! checked state: consumers hold `Option<Property>` and branch on presence as
//! capability negotiation, never as error handling.

use std::collections::HashMap;
use std::num::NonZeroU32;

use anyhow::Context;
use drm::control::{connector, crtc, plane, property, Device as ControlDevice};

use super::device::Device;
use super::transaction::Transaction;

/// A KMS object that properties can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Connector(connector::Handle),
    Crtc(crtc::Handle),
    Plane(plane::Handle),
}

impl ObjectId {
    pub fn raw(self) -> u32 {
        let raw: NonZeroU32 = match self {
            ObjectId::Connector(handle) => handle.into(),
            ObjectId::Crtc(handle) => handle.into(),
            ObjectId::Plane(handle) => handle.into(),
        };
        raw.get()
    }
}

/// Name-keyed snapshot of an object's properties and their raw values.
#[derive(Debug, Default, Clone)]
pub struct PropertyMap {
    props: HashMap<String, (property::Handle, u64)>,
}

impl PropertyMap {
    pub fn query(device: &Device, object: ObjectId) -> anyhow::Result<Self> {
        let set = match object {
            ObjectId::Connector(handle) => device.get_properties(handle),
            ObjectId::Crtc(handle) => device.get_properties(handle),
            ObjectId::Plane(handle) => device.get_properties(handle),
        }
        .with_context(|| format!("error getting properties of object {}", object.raw()))?;

        let mut props = HashMap::new();
        for (handle, value) in set {
            let Ok(info) = device.get_property(handle) else {
                continue;
            };
            let Ok(name) = info.name().to_str() else {
                continue;
            };
            props.insert(name.to_owned(), (handle, value));
        }

        Ok(Self { props })
    }

    pub fn get(&self, name: &str) -> Option<(property::Handle, u64)> {
        self.props.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    /// Builds a map from known entries, for code paths that never touch the
    /// kernel (headless backend and tests).
    pub fn from_entries(
        entries: impl IntoIterator<Item = (&'static str, property::Handle, u64)>,
    ) -> Self {
        let props = entries
            .into_iter()
            .map(|(name, handle, value)| (name.to_owned(), (handle, value)))
            .collect();
        Self { props }
    }
}

/// One atomic-commit-addressable value on a KMS object.
///
/// `current` reflects what the kernel last accepted; `pending` is what the
/// next commit will carry. The two are reconciled only through
/// [`Property::on_commit`] and [`Property::rollback`], so a rejected commit
/// can never leak half-applied state.
#[derive(Debug, Clone)]
pub struct Property {
    object: ObjectId,
    prop: property::Handle,
    name: &'static str,
    initial: u64,
    current: u64,
    pending: u64,
}

impl Property {
    /// Returns `None` when the object does not expose `name`.
    pub fn new(name: &'static str, object: ObjectId, props: &PropertyMap) -> Option<Self> {
        let (prop, value) = props.get(name)?;
        Some(Self {
            object,
            prop,
            name,
            initial: value,
            current: value,
            pending: value,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn handle(&self) -> property::Handle {
        self.prop
    }

    pub fn initial(&self) -> u64 {
        self.initial
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Stages a write into `txn` unless `value` is already pending and
    /// `force` is unset, suppressing redundant kernel writes.
    pub fn set_pending(&mut self, txn: &mut Transaction, value: u64, force: bool) {
        if !force && value == self.pending {
            return;
        }
        self.pending = value;
        txn.stage(self.object, self.prop, self.name, value);
    }

    /// Promotes pending to current after the kernel accepted a commit.
    pub fn on_commit(&mut self) {
        self.current = self.pending;
    }

    /// Discards pending back to current after the kernel rejected a commit.
    pub fn rollback(&mut self) {
        self.pending = self.current;
    }

    /// Adopts a freshly queried value. Only called at safe points, with no
    /// commit in flight.
    pub fn refresh(&mut self, props: &PropertyMap) {
        if let Some((_, value)) = props.get(self.name) {
            self.current = value;
            self.pending = value;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::num::NonZeroU32;

    use drm::control::{connector, crtc, plane, property};

    use super::ObjectId;

    pub fn prop_handle(id: u32) -> property::Handle {
        property::Handle::from(NonZeroU32::new(id).unwrap())
    }

    pub fn connector_id(id: u32) -> ObjectId {
        ObjectId::Connector(connector_handle(id))
    }

    pub fn connector_handle(id: u32) -> connector::Handle {
        connector::Handle::from(NonZeroU32::new(id).unwrap())
    }

    pub fn crtc_handle(id: u32) -> crtc::Handle {
        crtc::Handle::from(NonZeroU32::new(id).unwrap())
    }

    pub fn plane_handle(id: u32) -> plane::Handle {
        plane::Handle::from(NonZeroU32::new(id).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn fixture() -> (Property, Transaction) {
        let map = PropertyMap::from_entries([("ACTIVE", prop_handle(20), 1)]);
        let prop = Property::new("ACTIVE", connector_id(5), &map).unwrap();
        (prop, Transaction::new(false))
    }

    #[test]
    fn absent_property_is_none() {
        let map = PropertyMap::from_entries([("ACTIVE", prop_handle(20), 1)]);
        assert!(Property::new("HDR_OUTPUT_METADATA", connector_id(5), &map).is_none());
    }

    #[test]
    fn instantiate_captures_all_three_values() {
        let (prop, _) = fixture();
        assert_eq!(prop.initial(), 1);
        assert_eq!(prop.current(), 1);
        assert_eq!(prop.pending(), 1);
    }

    #[test]
    fn current_changes_only_on_commit() {
        let (mut prop, mut txn) = fixture();

        prop.set_pending(&mut txn, 0, false);
        assert_eq!(prop.current(), 1);
        assert_eq!(prop.pending(), 0);

        prop.on_commit();
        assert_eq!(prop.current(), 0);
    }

    #[test]
    fn rollback_restores_pending_to_current() {
        let (mut prop, mut txn) = fixture();

        prop.set_pending(&mut txn, 0, false);
        prop.rollback();

        assert_eq!(prop.pending(), prop.current());
        assert_eq!(prop.pending(), 1);
    }

    #[test]
    fn redundant_set_pending_stages_one_write() {
        let (mut prop, mut txn) = fixture();

        prop.set_pending(&mut txn, 0, false);
        prop.set_pending(&mut txn, 0, false);

        assert_eq!(txn.writes().len(), 1);
    }

    #[test]
    fn force_stages_even_when_redundant() {
        let (mut prop, mut txn) = fixture();

        prop.set_pending(&mut txn, 1, false);
        assert_eq!(txn.writes().len(), 0);

        prop.set_pending(&mut txn, 1, true);
        assert_eq!(txn.writes().len(), 1);
    }
}
