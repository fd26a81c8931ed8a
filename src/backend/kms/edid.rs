//! Display identity and capabilities, derived from the EDID blob and the
//! connector's property set.

use anyhow::Context;
use drm::control::Device as ControlDevice;
use tracing::warn;

use super::device::Device;
use super::property::PropertyMap;

/// Identity parsed out of the EDID blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayIdentity {
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

/// Native colorimetry of the sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Colorimetry {
    #[default]
    Srgb,
    Bt2020,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub identity: DisplayIdentity,
    /// Whether HDR10 output can be negotiated with this sink. Derived from
    /// the driver-exposed property set, not assumed.
    pub hdr_capable: bool,
    pub colorimetry: Colorimetry,
    pub physical_size_mm: (u32, u32),
}

impl DisplayInfo {
    /// Human-readable description, used for session notifications and as the
    /// mode-memory key.
    pub fn description(&self, connector_name: &str) -> String {
        match (&self.identity.make, &self.identity.model) {
            (Some(make), Some(model)) => format!("{make} {model} ({connector_name})"),
            (None, Some(model)) => format!("{model} ({connector_name})"),
            _ => format!("Unknown ({connector_name})"),
        }
    }
}

fn parse_identity(device: &Device, props: &PropertyMap) -> anyhow::Result<DisplayIdentity> {
    let (_, value) = props.get("EDID").context("no EDID property")?;
    anyhow::ensure!(value != 0, "EDID blob is empty");

    let data = device
        .get_property_blob(value)
        .context("error getting EDID blob value")?;
    let info =
        libdisplay_info::info::Info::parse_edid(&data).context("error parsing EDID")?;

    Ok(DisplayIdentity {
        make: info.make(),
        model: info.model(),
        serial: info.serial(),
    })
}

/// Derives everything we publish about a connected sink. EDID parse failures
/// degrade to an anonymous identity; capability bits come from property
/// presence alone.
pub fn derive_display_info(
    device: &Device,
    connector_name: &str,
    props: &PropertyMap,
    physical_size_mm: (u32, u32),
) -> DisplayInfo {
    let identity = parse_identity(device, props)
        .map_err(|err| warn!("error getting EDID info for {connector_name}: {err:?}"))
        .unwrap_or_default();

    let hdr_capable = props.contains("HDR_OUTPUT_METADATA") && props.contains("Colorspace");
    let colorimetry = if hdr_capable {
        Colorimetry::Bt2020
    } else {
        Colorimetry::Srgb
    };

    DisplayInfo {
        identity,
        hdr_capable,
        colorimetry,
        physical_size_mm,
    }
}

/// Whether the connector is marked non-desktop (VR headsets and the like).
pub fn is_non_desktop(props: &PropertyMap) -> bool {
    props.get("non-desktop").is_some_and(|(_, value)| value != 0)
}

/// Whether the sink advertises adaptive sync.
pub fn is_vrr_capable(props: &PropertyMap) -> bool {
    props
        .get("vrr_capable")
        .is_some_and(|(_, value)| value != 0)
}
