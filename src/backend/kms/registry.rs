//! Resource registry: every KMS object on the device, plus the active
//! connector/CRTC/plane routing.

use std::collections::HashMap;

use anyhow::Context;
use drm::control::{connector, crtc, plane, Device as ControlDevice, PlaneType};
use helios_config::Config;
use tracing::{debug, trace};

use super::connector::Connector;
use super::crtc::Crtc;
use super::device::Device;
use super::plane::Plane;

/// The single active display route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveRoute {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub primary_plane: plane::Handle,
}

/// Outcome of a best-connector pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The previously active route is still the best one.
    Unchanged,
    /// A new route was chosen; a mode-set is needed.
    Changed,
    /// Nothing usable is connected.
    Cleared,
}

#[derive(Debug, Default)]
pub struct Registry {
    connectors: HashMap<connector::Handle, Connector>,
    crtcs: HashMap<crtc::Handle, Crtc>,
    planes: HashMap<plane::Handle, Plane>,
    // Enumeration order is a tie-breaker for selection and keeps staging
    // deterministic.
    connector_order: Vec<connector::Handle>,
    crtc_order: Vec<crtc::Handle>,
    plane_order: Vec<plane::Handle>,
    active: Option<ActiveRoute>,
}

impl Registry {
    pub fn enumerate(device: &Device) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        registry.refresh(device)?;
        Ok(registry)
    }

    /// Re-reads the device's resources. New connectors are added, vanished
    /// ones dropped, and every surviving connector is recreated wholesale so
    /// modes and EDID-derived state are always current. CRTCs and planes
    /// refresh their property values in place.
    ///
    /// Only called at safe points, with no commit in flight.
    pub fn refresh(&mut self, device: &Device) -> anyhow::Result<()> {
        let _span = tracy_client::span!("Registry::refresh");
        let resources = device.resources()?;

        let current = resources.connectors();
        self.connector_order.retain(|handle| {
            let keep = current.contains(handle);
            if !keep {
                debug!("connector {handle:?} vanished");
                self.connectors.remove(handle);
                if self.active.map(|a| a.connector) == Some(*handle) {
                    self.active = None;
                }
            }
            keep
        });
        for &handle in current {
            let connector = Connector::query(device, &resources, handle)?;
            trace!(
                "connector {} connected={}",
                connector.name(),
                connector.usable()
            );
            if self.connectors.insert(handle, connector).is_none() {
                self.connector_order.push(handle);
            }
            // The active connector may have been replugged with a different
            // display; a later selection pass decides whether the route
            // still stands.
            if self.active.map(|a| a.connector) == Some(handle)
                && !self.connectors[&handle].usable()
            {
                self.active = None;
            }
        }

        for &handle in resources.crtcs() {
            match self.crtcs.get_mut(&handle) {
                Some(crtc) => crtc.refresh_props(device)?,
                None => {
                    self.crtcs.insert(handle, Crtc::query(device, handle)?);
                    self.crtc_order.push(handle);
                }
            }
        }

        let plane_handles = device
            .plane_handles()
            .context("error getting plane handles")?;
        for &handle in plane_handles.iter() {
            match self.planes.get_mut(&handle) {
                Some(plane) => plane.refresh_props(device)?,
                None => {
                    self.planes
                        .insert(handle, Plane::query(device, &resources, handle)?);
                    self.plane_order.push(handle);
                }
            }
        }

        Ok(())
    }

    /// Picks the best usable connector and routes a CRTC and primary plane
    /// to it. Rank: configured priority first (exact name beats wildcard,
    /// unlisted last), enumeration order as the tie-breaker.
    pub fn select_best_connector(&mut self, config: &Config) -> Selection {
        let mut best: Option<(usize, usize, connector::Handle)> = None;
        for (index, handle) in self.connector_order.iter().enumerate() {
            let connector = &self.connectors[handle];
            if !connector.usable() {
                continue;
            }
            let priority = config
                .connector_priority(connector.name())
                .unwrap_or(usize::MAX);
            let key = (priority, index, *handle);
            if best.map_or(true, |b| (b.0, b.1) > (priority, index)) {
                best = Some(key);
            }
        }

        let Some((_, _, connector)) = best else {
            let had_active = self.active.take().is_some();
            return if had_active {
                Selection::Cleared
            } else {
                Selection::Unchanged
            };
        };

        if self.active.map(|a| a.connector) == Some(connector) {
            return Selection::Unchanged;
        }

        let Some(route) = self.route_for(connector) else {
            debug!("no CRTC/primary plane route for connector {connector:?}");
            let had_active = self.active.take().is_some();
            return if had_active {
                Selection::Cleared
            } else {
                Selection::Unchanged
            };
        };

        debug!(
            "selected connector {} (crtc {:?}, primary plane {:?})",
            self.connectors[&connector].name(),
            route.crtc,
            route.primary_plane
        );
        self.active = Some(route);
        Selection::Changed
    }

    fn route_for(&self, connector: connector::Handle) -> Option<ActiveRoute> {
        let info = &self.connectors[&connector];
        for crtc in info.possible_crtcs() {
            if !self.crtcs.contains_key(crtc) {
                continue;
            }
            let primary = self.plane_order.iter().find(|&handle| {
                let plane = &self.planes[handle];
                plane.plane_type() == PlaneType::Primary && plane.can_drive(*crtc)
            });
            if let Some(&primary_plane) = primary {
                return Some(ActiveRoute {
                    connector,
                    crtc: *crtc,
                    primary_plane,
                });
            }
        }
        None
    }

    pub fn active(&self) -> Option<ActiveRoute> {
        self.active
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    pub fn connector(&self, handle: connector::Handle) -> Option<&Connector> {
        self.connectors.get(&handle)
    }

    pub fn connector_mut(&mut self, handle: connector::Handle) -> Option<&mut Connector> {
        self.connectors.get_mut(&handle)
    }

    /// Temporarily removes a connector so it can be mutated alongside other
    /// registry objects. Must be paired with [`Registry::put_connector`].
    pub fn take_connector(&mut self, handle: connector::Handle) -> Option<Connector> {
        self.connectors.remove(&handle)
    }

    pub fn put_connector(&mut self, handle: connector::Handle, connector: Connector) {
        self.connectors.insert(handle, connector);
    }

    pub fn crtc(&self, handle: crtc::Handle) -> Option<&Crtc> {
        self.crtcs.get(&handle)
    }

    pub fn crtc_mut(&mut self, handle: crtc::Handle) -> Option<&mut Crtc> {
        self.crtcs.get_mut(&handle)
    }

    pub fn plane_mut(&mut self, handle: plane::Handle) -> Option<&mut Plane> {
        self.planes.get_mut(&handle)
    }

    pub fn plane(&self, handle: plane::Handle) -> Option<&Plane> {
        self.planes.get(&handle)
    }

    /// Planes assignable to `crtc`, primary first, then overlays in
    /// enumeration order. Cursor planes are not part of the layer pipeline.
    pub fn planes_for_crtc(&self, crtc: crtc::Handle) -> Vec<plane::Handle> {
        let mut planes: Vec<_> = self
            .plane_order
            .iter()
            .copied()
            .filter(|handle| {
                let plane = &self.planes[handle];
                plane.can_drive(crtc) && plane.plane_type() != PlaneType::Cursor
            })
            .collect();
        planes.sort_by_key(|handle| self.planes[handle].plane_type() != PlaneType::Primary);
        planes
    }

    pub fn connectors_mut(&mut self) -> impl Iterator<Item = &mut Connector> {
        self.connectors.values_mut()
    }

    pub fn crtcs_mut(&mut self) -> impl Iterator<Item = &mut Crtc> {
        self.crtcs.values_mut()
    }

    pub fn planes_mut(&mut self) -> impl Iterator<Item = &mut Plane> {
        self.planes.values_mut()
    }

    /// Promotes every pending property value after an accepted commit.
    pub fn on_commit(&mut self) {
        for connector in self.connectors.values_mut() {
            connector.props.for_each(|prop| prop.on_commit());
        }
        for crtc in self.crtcs.values_mut() {
            crtc.props.for_each(|prop| prop.on_commit());
        }
        for plane in self.planes.values_mut() {
            plane.props.for_each(|prop| prop.on_commit());
        }
    }

    /// Discards every pending property value after a rejected commit.
    pub fn rollback(&mut self) {
        for connector in self.connectors.values_mut() {
            connector.props.for_each(|prop| prop.rollback());
        }
        for crtc in self.crtcs.values_mut() {
            crtc.props.for_each(|prop| prop.rollback());
        }
        for plane in self.planes.values_mut() {
            plane.props.for_each(|prop| prop.rollback());
        }
    }
}


#[cfg(test)]
mod tests {
    use helios_config::Config;

    use super::super::connector::test_support::{fake_mode, FakeConnector};
    use super::super::property::test_support::*;
    use super::test_support::fake_registry;
    use super::*;

    fn connector_spec(name: &'static str, connected: bool) -> FakeConnector {
        FakeConnector {
            name,
            connected,
            non_desktop: false,
            modes: vec![fake_mode(1920, 1080, 60_000, 0, 0)],
            possible_crtcs: vec![],
        }
    }

    #[test]
    fn selects_first_connected_by_enumeration_order() {
        let mut registry = fake_registry(vec![
            (30, connector_spec("DP-1", false)),
            (31, connector_spec("HDMI-A-1", true)),
            (32, connector_spec("DP-2", true)),
        ]);

        assert_eq!(
            registry.select_best_connector(&Config::default()),
            Selection::Changed
        );
        let active = registry.active().unwrap();
        assert_eq!(active.connector, connector_handle(31));
        assert_eq!(active.crtc, crtc_handle(8));
        // Primary plane wins over the earlier-enumerated overlay.
        assert_eq!(active.primary_plane, plane_handle(41));
    }

    #[test]
    fn configured_priority_overrides_enumeration_order() {
        let mut registry = fake_registry(vec![
            (30, connector_spec("HDMI-A-1", true)),
            (31, connector_spec("DP-2", true)),
        ]);
        let config = Config::parse("test.kdl", "connector \"DP-2\"").unwrap();

        registry.select_best_connector(&config);
        assert_eq!(
            registry.active().unwrap().connector,
            connector_handle(31)
        );
    }

    #[test]
    fn reselection_of_same_connector_is_unchanged() {
        let mut registry = fake_registry(vec![(30, connector_spec("DP-1", true))]);

        assert_eq!(
            registry.select_best_connector(&Config::default()),
            Selection::Changed
        );
        assert_eq!(
            registry.select_best_connector(&Config::default()),
            Selection::Unchanged
        );
    }

    #[test]
    fn nothing_connected_clears_active() {
        let mut registry = fake_registry(vec![(30, connector_spec("DP-1", true))]);
        registry.select_best_connector(&Config::default());
        assert!(registry.active().is_some());

        // Same registry, connector now reported disconnected.
        let mut registry = fake_registry(vec![(30, connector_spec("DP-1", false))]);
        registry.active = Some(ActiveRoute {
            connector: connector_handle(30),
            crtc: crtc_handle(8),
            primary_plane: plane_handle(41),
        });
        assert_eq!(
            registry.select_best_connector(&Config::default()),
            Selection::Cleared
        );
        assert!(registry.active().is_none());
    }

    #[test]
    fn non_desktop_connectors_ignored() {
        let mut spec = connector_spec("DP-1", true);
        spec.non_desktop = true;
        let mut registry = fake_registry(vec![(30, spec)]);

        assert_eq!(
            registry.select_best_connector(&Config::default()),
            Selection::Unchanged
        );
        assert!(registry.active().is_none());
    }

    #[test]
    fn planes_for_crtc_orders_primary_first() {
        let registry = fake_registry(vec![(30, connector_spec("DP-1", true))]);
        let planes = registry.planes_for_crtc(crtc_handle(8));
        assert_eq!(planes, vec![plane_handle(41), plane_handle(40)]);
    }
}
