//! Color-management staging: HDR infoframe metadata on the connector,
//! degamma/CTM/gamma on the CRTC.
//!
//! Blob-backed properties need kernel-side blobs that outlive the commit
//! referencing them, so replaced blobs are parked and only destroyed after
//! the next successful commit.

use anyhow::Context;
use bytemuck::cast_slice_mut;
use tracing::trace;

use super::connector::Connector;
use super::crtc::Crtc;
use super::device::Device;
use super::transaction::Transaction;
use crate::layer::Colorspace;

// CTA-861-G EOTF codes for the HDR infoframe.
const HDMI_EOTF_TRADITIONAL_GAMMA_SDR: u8 = 0;
const HDMI_EOTF_ST2084: u8 = 2;

// Kernel "Colorspace" connector property enum values.
pub const DRM_MODE_COLORIMETRY_DEFAULT: u64 = 0;
pub const DRM_MODE_COLORIMETRY_BT2020_RGB: u64 = 9;

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct drm_color_lut {
    red: u16,
    green: u16,
    blue: u16,
    reserved: u16,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct drm_color_ctm {
    /// S31.32 fixed point, row-major 3x3.
    matrix: [u64; 9],
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct hdr_metadata_infoframe {
    eotf: u8,
    metadata_type: u8,
    display_primaries: [[u16; 2]; 3],
    white_point: [u16; 2],
    max_display_mastering_luminance: u16,
    min_display_mastering_luminance: u16,
    max_cll: u16,
    max_fall: u16,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct hdr_output_metadata {
    metadata_type: u32,
    hdmi_metadata_type1: hdr_metadata_infoframe,
    /// The kernel struct has 2 bytes of tail padding; spelled out so the
    /// type is padding-free and the 32-byte blob size is explicit.
    _pad: [u8; 2],
}

/// The output transfer function for the frame being staged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputEotf {
    Sdr,
    Hdr10Pq,
}

impl OutputEotf {
    pub fn for_colorspace(colorspace: Colorspace) -> Self {
        match colorspace {
            Colorspace::Hdr10Pq => OutputEotf::Hdr10Pq,
            Colorspace::Srgb | Colorspace::ScRgbLinear => OutputEotf::Sdr,
        }
    }
}

/// Owns the kernel blobs behind the color properties.
#[derive(Debug, Default)]
pub struct ColorState {
    hdr_blob: u64,
    degamma_blob: u64,
    gamma_blob: u64,
    ctm_blob: u64,
    /// Replaced blobs, destroyed after the commit that stopped referencing
    /// them succeeds.
    stale: Vec<u64>,
    staged_eotf: Option<OutputEotf>,
}

impl ColorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages connector and CRTC color state for `eotf`. Feature toggles
    /// come from the operator config; a disabled feature is left alone
    /// entirely.
    pub fn stage(
        &mut self,
        device: &Device,
        txn: &mut Transaction,
        connector: &mut Connector,
        crtc: &mut Crtc,
        eotf: OutputEotf,
        config: &helios_config::ColorManagement,
    ) -> anyhow::Result<()> {
        if config.disabled {
            return Ok(());
        }
        let _span = tracy_client::span!("ColorState::stage");

        if self.staged_eotf != Some(eotf) {
            trace!("staging color state for {eotf:?}");
        }

        if let Some(prop) = &mut connector.props.hdr_output_metadata {
            let blob = match eotf {
                OutputEotf::Hdr10Pq => {
                    if self.staged_eotf != Some(eotf) || self.hdr_blob == 0 {
                        let blob = self.create_hdr_blob(device, eotf)?;
                        let old = std::mem::replace(&mut self.hdr_blob, blob);
                        self.park(old);
                    }
                    self.hdr_blob
                }
                OutputEotf::Sdr => 0,
            };
            prop.set_pending(txn, blob, false);
        }

        if let Some(prop) = &mut connector.props.colorspace {
            let value = match eotf {
                OutputEotf::Hdr10Pq => DRM_MODE_COLORIMETRY_BT2020_RGB,
                OutputEotf::Sdr => DRM_MODE_COLORIMETRY_DEFAULT,
            };
            prop.set_pending(txn, value, false);
        }

        let rebuild = self.staged_eotf != Some(eotf);

        if !config.no_degamma {
            if let (Some(prop), Some(size_prop)) =
                (&mut crtc.props.degamma_lut, &crtc.props.degamma_lut_size)
            {
                if rebuild || self.degamma_blob == 0 {
                    let size = size_prop.current() as usize;
                    let blob = self.create_eotf_lut_blob(device, size, eotf)?;
                    let old = std::mem::replace(&mut self.degamma_blob, blob);
                    self.park(old);
                }
                prop.set_pending(txn, self.degamma_blob, false);
            }
        }

        if !config.no_ctm {
            if let Some(prop) = &mut crtc.props.ctm {
                if self.ctm_blob == 0 {
                    self.ctm_blob = create_identity_ctm_blob(device)?;
                }
                prop.set_pending(txn, self.ctm_blob, false);
            }
        }

        if !config.no_regamma {
            if let (Some(prop), Some(size_prop)) =
                (&mut crtc.props.gamma_lut, &crtc.props.gamma_lut_size)
            {
                if rebuild || self.gamma_blob == 0 {
                    let size = size_prop.current() as usize;
                    let blob = self.create_inverse_eotf_lut_blob(device, size, eotf)?;
                    let old = std::mem::replace(&mut self.gamma_blob, blob);
                    self.park(old);
                }
                prop.set_pending(txn, self.gamma_blob, false);
            }
        }

        self.staged_eotf = Some(eotf);
        Ok(())
    }

    /// Zeroes everything we may have staged, for teardown.
    pub fn stage_reset(&mut self, txn: &mut Transaction, connector: &mut Connector, crtc: &mut Crtc) {
        if let Some(prop) = &mut connector.props.hdr_output_metadata {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut connector.props.colorspace {
            prop.set_pending(txn, DRM_MODE_COLORIMETRY_DEFAULT, false);
        }
        if let Some(prop) = &mut crtc.props.degamma_lut {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut crtc.props.ctm {
            prop.set_pending(txn, 0, false);
        }
        if let Some(prop) = &mut crtc.props.gamma_lut {
            prop.set_pending(txn, 0, false);
        }
        self.staged_eotf = None;
    }

    /// Destroys blobs no commit references anymore. Call after a successful
    /// commit.
    pub fn release_stale(&mut self, device: &Device) {
        for blob in self.stale.drain(..) {
            device.destroy_blob(blob);
        }
    }

    /// Destroys every owned blob. Only valid after scanout has stopped.
    pub fn destroy_all(&mut self, device: &Device) {
        self.release_stale(device);
        for blob in [
            std::mem::take(&mut self.hdr_blob),
            std::mem::take(&mut self.degamma_blob),
            std::mem::take(&mut self.gamma_blob),
            std::mem::take(&mut self.ctm_blob),
        ] {
            device.destroy_blob(blob);
        }
        self.staged_eotf = None;
    }

    fn park(&mut self, blob: u64) {
        if blob != 0 {
            self.stale.push(blob);
        }
    }

    fn create_hdr_blob(&mut self, device: &Device, eotf: OutputEotf) -> anyhow::Result<u64> {
        let eotf_code = match eotf {
            OutputEotf::Hdr10Pq => HDMI_EOTF_ST2084,
            OutputEotf::Sdr => HDMI_EOTF_TRADITIONAL_GAMMA_SDR,
        };
        let mut metadata = [hdr_output_metadata {
            metadata_type: 0,
            hdmi_metadata_type1: hdr_metadata_infoframe {
                eotf: eotf_code,
                metadata_type: 0,
                // Static metadata left zero: "unknown", letting the sink
                // apply its own defaults, which tracks what games hand us.
                ..Default::default()
            },
            _pad: [0; 2],
        }];
        device
            .create_data_blob(cast_slice_mut(&mut metadata))
            .context("error creating HDR_OUTPUT_METADATA blob")
    }

    fn create_eotf_lut_blob(
        &mut self,
        device: &Device,
        size: usize,
        eotf: OutputEotf,
    ) -> anyhow::Result<u64> {
        let mut data = build_lut(size, |x| match eotf {
            OutputEotf::Hdr10Pq => pq_to_linear(x),
            OutputEotf::Sdr => srgb_to_linear(x),
        });
        device
            .create_data_blob(cast_slice_mut(&mut data))
            .context("error creating DEGAMMA_LUT blob")
    }

    fn create_inverse_eotf_lut_blob(
        &mut self,
        device: &Device,
        size: usize,
        eotf: OutputEotf,
    ) -> anyhow::Result<u64> {
        let mut data = build_lut(size, |x| match eotf {
            OutputEotf::Hdr10Pq => linear_to_pq(x),
            OutputEotf::Sdr => linear_to_srgb(x),
        });
        device
            .create_data_blob(cast_slice_mut(&mut data))
            .context("error creating GAMMA_LUT blob")
    }
}

fn create_identity_ctm_blob(device: &Device) -> anyhow::Result<u64> {
    let one = 1u64 << 32;
    let mut ctm = [drm_color_ctm {
        matrix: [one, 0, 0, 0, one, 0, 0, 0, one],
    }];
    device
        .create_data_blob(cast_slice_mut(&mut ctm))
        .context("error creating CTM blob")
}

fn build_lut(size: usize, f: impl Fn(f64) -> f64) -> Vec<drm_color_lut> {
    let size = size.max(2);
    (0..size)
        .map(|i| {
            let x = i as f64 / (size - 1) as f64;
            let y = (f(x).clamp(0., 1.) * 65535.).round() as u16;
            drm_color_lut {
                red: y,
                green: y,
                blue: y,
                reserved: 0,
            }
        })
        .collect()
}

// SMPTE ST 2084 perceptual quantizer.
const PQ_M1: f64 = 2610. / 16384.;
const PQ_M2: f64 = 2523. / 4096. * 128.;
const PQ_C1: f64 = 3424. / 4096.;
const PQ_C2: f64 = 2413. / 4096. * 32.;
const PQ_C3: f64 = 2392. / 4096. * 32.;

fn pq_to_linear(e: f64) -> f64 {
    let e_pow = e.powf(1. / PQ_M2);
    let num = (e_pow - PQ_C1).max(0.);
    let den = PQ_C2 - PQ_C3 * e_pow;
    (num / den).powf(1. / PQ_M1)
}

fn linear_to_pq(y: f64) -> f64 {
    let y_pow = y.powf(PQ_M1);
    let num = PQ_C1 + PQ_C2 * y_pow;
    let den = 1. + PQ_C3 * y_pow;
    (num / den).powf(PQ_M2)
}

fn srgb_to_linear(x: f64) -> f64 {
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(x: f64) -> f64 {
    if x <= 0.0031308 {
        x * 12.92
    } else {
        1.055 * x.powf(1. / 2.4) - 0.055
    }
}
