//! Connector objects: modes, identity, and routing properties.

use anyhow::Context;
use drm::control::{
    connector, crtc, Device as ControlDevice, Mode, ModeFlags, ModeTypeFlags, ResourceHandles,
};
use helios_config::PreferredMode;
use tracing::warn;

use super::device::Device;
use super::edid::{self, DisplayInfo};
use super::property::{ObjectId, Property, PropertyMap};
use super::transaction::Transaction;
use crate::mode_memory::SavedMode;

/// Fixed rotation applied to the whole output, from the panel-orientation
/// property.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
}

#[derive(Debug, Clone)]
pub struct ConnectorProps {
    pub crtc_id: Property,
    pub hdr_output_metadata: Option<Property>,
    pub colorspace: Option<Property>,
}

impl ConnectorProps {
    fn new(object: ObjectId, map: &PropertyMap) -> anyhow::Result<Self> {
        Ok(Self {
            crtc_id: Property::new("CRTC_ID", object, map)
                .context("connector is missing the CRTC_ID property")?,
            hdr_output_metadata: Property::new("HDR_OUTPUT_METADATA", object, map),
            colorspace: Property::new("Colorspace", object, map),
        })
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&mut Property)) {
        f(&mut self.crtc_id);
        for prop in [&mut self.hdr_output_metadata, &mut self.colorspace]
            .into_iter()
            .flatten()
        {
            f(prop);
        }
    }
}

#[derive(Debug)]
pub struct Connector {
    handle: connector::Handle,
    name: String,
    connected: bool,
    non_desktop: bool,
    vrr_capable: bool,
    /// Sorted best-first; see [`sort_modes`].
    modes: Vec<Mode>,
    possible_crtcs: Vec<crtc::Handle>,
    info: DisplayInfo,
    rotation: Rotation,
    pub props: ConnectorProps,
}

impl Connector {
    /// Queries everything about a connector, force-probing so modes and EDID
    /// are current. Hotplug recreates connectors through this path rather
    /// than patching them up.
    pub fn query(
        device: &Device,
        resources: &ResourceHandles,
        handle: connector::Handle,
    ) -> anyhow::Result<Self> {
        let info = device
            .get_connector(handle, true)
            .context("error getting connector info")?;
        let name = format_connector_name(&info);

        let object = ObjectId::Connector(handle);
        let map = PropertyMap::query(device, object)?;
        let props = ConnectorProps::new(object, &map)?;

        let connected = info.state() == connector::State::Connected;
        let mut modes = info.modes().to_vec();
        sort_modes(&mut modes);

        let mut possible_crtcs = Vec::new();
        for &encoder in info.encoders() {
            if let Ok(encoder) = device.get_encoder(encoder) {
                for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
                    if !possible_crtcs.contains(&crtc) {
                        possible_crtcs.push(crtc);
                    }
                }
            }
        }

        let display_info = if connected {
            edid::derive_display_info(device, &name, &map, info.size().unwrap_or((0, 0)))
        } else {
            DisplayInfo::default()
        };

        Ok(Self {
            handle,
            connected,
            non_desktop: edid::is_non_desktop(&map),
            vrr_capable: edid::is_vrr_capable(&map),
            modes,
            possible_crtcs,
            info: display_info,
            rotation: panel_orientation(&name, &map),
            props,
            name,
        })
    }

    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connected, and something a desktop session should drive.
    pub fn usable(&self) -> bool {
        self.connected && !self.non_desktop
    }

    pub fn vrr_capable(&self) -> bool {
        self.vrr_capable
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    pub fn display_info(&self) -> &DisplayInfo {
        &self.info
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Internal panels renegotiate from EDID every boot; only external
    /// displays participate in mode memory.
    pub fn is_internal(&self) -> bool {
        is_laptop_panel(&self.name)
    }

    pub fn description(&self) -> String {
        self.info.description(&self.name)
    }

    pub fn refresh_props(&mut self, device: &Device) -> anyhow::Result<()> {
        let map = PropertyMap::query(device, ObjectId::Connector(self.handle))?;
        self.props.for_each(|prop| prop.refresh(&map));
        Ok(())
    }

    /// A throwaway copy of the property set, for staging probe requests
    /// without touching real pending state.
    pub fn clone_props(&self) -> ConnectorProps {
        self.props.clone()
    }

    /// Detaches the connector from its CRTC.
    pub fn stage_disable(&mut self, txn: &mut Transaction, force: bool) {
        self.props.crtc_id.set_pending(txn, 0, force);
        if let Some(prop) = &mut self.props.hdr_output_metadata {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut self.props.colorspace {
            prop.set_pending(txn, 0, false);
        }
    }
}

pub fn format_connector_name(connector: &connector::Info) -> String {
    format!(
        "{}-{}",
        connector.interface().as_str(),
        connector.interface_id()
    )
}

pub fn is_laptop_panel(connector_name: &str) -> bool {
    matches!(&connector_name[..4.min(connector_name.len())], "eDP-" | "LVDS" | "DSI-")
}

fn panel_orientation(connector_name: &str, map: &PropertyMap) -> Rotation {
    let Some((_, value)) = map.get("panel orientation") else {
        return Rotation::Normal;
    };
    match value {
        // "Normal"
        0 => Rotation::Normal,
        // "Upside Down"
        1 => Rotation::Rotate180,
        // "Left Side Up"
        2 => Rotation::Rotate90,
        // "Right Side Up"
        3 => Rotation::Rotate270,
        _ => {
            warn!("{connector_name}: panel orientation has invalid value {value}");
            Rotation::Normal
        }
    }
}

/// Refresh rate in millihertz, from the mode timings.
pub fn mode_refresh_mhz(mode: &Mode) -> i32 {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return 0;
    }

    let mut numerator = clock * 1_000_000;
    let mut denominator = htotal * vtotal;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        numerator *= 2;
    }
    if mode.flags().contains(ModeFlags::DBLSCAN) {
        denominator *= 2;
    }
    if mode.vscan() > 1 {
        denominator *= mode.vscan() as u64;
    }

    ((numerator + denominator / 2) / denominator) as i32
}

/// Orders modes best-first: modes at or above 60 Hz beat slower ones, the
/// driver-preferred mode beats the rest, then larger area, then higher
/// refresh.
pub fn sort_modes(modes: &mut [Mode]) {
    modes.sort_by_key(|m| {
        let refresh = mode_refresh_mhz(m);
        let area = u32::from(m.size().0) * u32::from(m.size().1);
        (
            refresh < 60_000,
            !m.mode_type().contains(ModeTypeFlags::PREFERRED),
            std::cmp::Reverse(area),
            std::cmp::Reverse(refresh),
        )
    });
}

/// Picks the mode to set on a connector, in priority order: the operator's
/// preferred mode, then the remembered mode for this display, then the top
/// of the sorted list. Interlaced modes never match.
pub fn pick_mode(
    connector: &Connector,
    preferred: Option<&PreferredMode>,
    saved: Option<&SavedMode>,
) -> Option<Mode> {
    if let Some(target) = preferred {
        let refresh = target.refresh.map(|r| (r * 1000.).round() as i32);
        let mut best: Option<&Mode> = None;

        for m in connector.modes() {
            if m.size() != (target.width, target.height) {
                continue;
            }
            // Interlaced modes don't appear to work.
            if m.flags().contains(ModeFlags::INTERLACE) {
                continue;
            }

            if let Some(refresh) = refresh {
                if mode_refresh_mhz(m) == refresh {
                    best = Some(m);
                }
            } else if let Some(curr) = best {
                if mode_refresh_mhz(curr) < mode_refresh_mhz(m) {
                    best = Some(m);
                }
            } else {
                best = Some(m);
            }
        }

        if let Some(mode) = best {
            return Some(*mode);
        }
        warn!(
            "{}: no mode matches preferred {}x{}, falling back",
            connector.name(),
            target.width,
            target.height
        );
    }

    if let Some(saved) = saved {
        if !connector.is_internal() {
            let found = connector.modes().iter().find(|m| {
                m.size() == (saved.width, saved.height)
                    && !m.flags().contains(ModeFlags::INTERLACE)
                    && mode_refresh_mhz(m) == saved.refresh_mhz
            });
            if let Some(mode) = found {
                return Some(*mode);
            }
        }
    }

    connector
        .modes()
        .iter()
        .find(|m| !m.flags().contains(ModeFlags::INTERLACE))
        .copied()
}


#[cfg(test)]
mod tests {
    use drm::control::ModeTypeFlags;

    use super::super::property::test_support::*;
    use super::test_support::*;
    use super::*;

    const DRM_MODE_FLAG_INTERLACE: u32 = 1 << 4;

    fn external_1080p() -> Connector {
        fake_connector(
            30,
            FakeConnector {
                name: "DP-1",
                connected: true,
                non_desktop: false,
                modes: vec![
                    fake_mode(1280, 720, 60_000, 0, 0),
                    fake_mode(1920, 1080, 60_000, ModeTypeFlags::PREFERRED.bits(), 0),
                    fake_mode(1920, 1080, 144_000, 0, 0),
                    fake_mode(3840, 2160, 30_000, 0, 0),
                ],
                possible_crtcs: vec![crtc_handle(8)],
            },
        )
    }

    #[test]
    fn refresh_from_timings() {
        let mode = fake_mode(1920, 1080, 60_000, 0, 0);
        let refresh = mode_refresh_mhz(&mode);
        // Integer clock granularity keeps this within a few mHz of exact.
        assert!((59_990..=60_010).contains(&refresh), "got {refresh}");
    }

    #[test]
    fn sorting_prefers_fast_then_preferred_then_area() {
        let connector = external_1080p();
        let sizes: Vec<_> = connector
            .modes()
            .iter()
            .map(|m| (m.size(), m.mode_type().contains(ModeTypeFlags::PREFERRED)))
            .collect();

        // Sub-60 Hz 4K mode sorts last despite the largest area; the
        // driver-preferred 1080p60 beats the faster plain 1080p144.
        assert_eq!(
            sizes,
            vec![
                ((1920, 1080), true),
                ((1920, 1080), false),
                ((1280, 720), false),
                ((3840, 2160), false),
            ],
        );
    }

    #[test]
    fn preferred_mode_with_refresh_wins() {
        let connector = external_1080p();
        let preferred = PreferredMode {
            width: 1920,
            height: 1080,
            refresh: Some(144.0),
        };

        let mode = pick_mode(&connector, Some(&preferred), None).unwrap();
        assert_eq!(mode.size(), (1920, 1080));
        let refresh = mode_refresh_mhz(&mode);
        assert!((143_900..=144_100).contains(&refresh), "got {refresh}");
    }

    #[test]
    fn unmatched_preferred_falls_back_to_sorted_best() {
        let connector = external_1080p();
        let preferred = PreferredMode {
            width: 2560,
            height: 1440,
            refresh: None,
        };

        let mode = pick_mode(&connector, Some(&preferred), None).unwrap();
        assert_eq!(mode.size(), (1920, 1080));
        assert!(mode.mode_type().contains(ModeTypeFlags::PREFERRED));
    }

    #[test]
    fn saved_mode_recalled_for_external_display() {
        let connector = external_1080p();
        let saved_refresh = {
            let mode = fake_mode(1920, 1080, 144_000, 0, 0);
            mode_refresh_mhz(&mode)
        };
        let saved = crate::mode_memory::SavedMode {
            width: 1920,
            height: 1080,
            refresh_mhz: saved_refresh,
        };

        let mode = pick_mode(&connector, None, Some(&saved)).unwrap();
        assert_eq!(mode_refresh_mhz(&mode), saved_refresh);
    }

    #[test]
    fn interlaced_modes_never_picked() {
        let connector = fake_connector(
            31,
            FakeConnector {
                name: "HDMI-A-1",
                connected: true,
                non_desktop: false,
                modes: vec![
                    fake_mode(1920, 1080, 60_000, 0, DRM_MODE_FLAG_INTERLACE),
                    fake_mode(1280, 720, 60_000, 0, 0),
                ],
                possible_crtcs: vec![],
            },
        );

        let mode = pick_mode(&connector, None, None).unwrap();
        assert_eq!(mode.size(), (1280, 720));
    }

    #[test]
    fn laptop_panel_detection() {
        assert!(is_laptop_panel("eDP-1"));
        assert!(is_laptop_panel("DSI-1"));
        assert!(is_laptop_panel("LVDS-1"));
        assert!(!is_laptop_panel("DP-1"));
        assert!(!is_laptop_panel("HDMI-A-2"));
    }
}
