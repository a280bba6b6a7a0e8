//! Probe baking configuration.
//!
//! The constants are the compiled-in defaults; [`IblSettings`] carries them at
//! runtime so a bake can be run at reduced resolution (tests, previews).

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// Face resolution of the scene capture cubemap.
pub const IBL_CAPTURE_RESOLUTION: u32 = 256;
/// Face resolution of a light probe's irradiance cubemap.
pub const LIGHT_PROBE_RESOLUTION: u32 = 32;
/// Face resolution of mip 0 of a reflection probe's prefiltered cubemap.
pub const REFLECTION_PROBE_RESOLUTION: u32 = 128;
/// Width and height of the shared BRDF lookup table.
pub const BRDF_LUT_RESOLUTION: u32 = 512;
/// Number of roughness levels stored in a reflection probe.
pub const REFLECTION_PROBE_MIP_COUNT: u32 = 5;
/// Width and height of the directional shadow map.
pub const SHADOWMAP_RESOLUTION: u32 = 1024;
/// Face resolution used when a skybox description is uploaded.
pub const SKYBOX_RESOLUTION: u32 = 128;

pub const CAPTURE_NEAR_PLANE: f32 = 0.1;
pub const CAPTURE_FAR_PLANE: f32 = 300.0;

/// Roughness encoded by mip `mip` of a reflection probe with `mip_count` mips.
///
/// Mips interpolate linearly from 0 (mip 0) to 1 (last mip). A single-mip probe
/// only stores the mirror reflection, so its roughness is 0.
pub fn mip_roughness(mip: u32, mip_count: u32) -> f32 {
    if mip_count <= 1 {
        return 0.0;
    }
    mip.min(mip_count - 1) as f32 / (mip_count - 1) as f32
}

/// Runtime probe baking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IblSettings {
    pub capture_resolution: u32,
    pub light_probe_resolution: u32,
    pub reflection_probe_resolution: u32,
    pub brdf_lut_resolution: u32,
    pub reflection_probe_mip_count: u32,
    pub shadowmap_resolution: u32,
    pub skybox_resolution: u32,
    pub capture_near: f32,
    pub capture_far: f32,
    /// Angular step (radians) of the hemisphere walk in the irradiance kernel.
    pub irradiance_sample_delta: f32,
    /// Samples per texel in the importance-sampling kernel.
    pub prefilter_sample_count: u32,
    /// Samples per texel when integrating the BRDF lookup table.
    pub brdf_sample_count: u32,
    /// Half-size of the orthographic shadow frustum in world units.
    pub shadow_extent: f32,
    pub shadow_bias: f32,
}

impl Default for IblSettings {
    fn default() -> Self {
        Self {
            capture_resolution: IBL_CAPTURE_RESOLUTION,
            light_probe_resolution: LIGHT_PROBE_RESOLUTION,
            reflection_probe_resolution: REFLECTION_PROBE_RESOLUTION,
            brdf_lut_resolution: BRDF_LUT_RESOLUTION,
            reflection_probe_mip_count: REFLECTION_PROBE_MIP_COUNT,
            shadowmap_resolution: SHADOWMAP_RESOLUTION,
            skybox_resolution: SKYBOX_RESOLUTION,
            capture_near: CAPTURE_NEAR_PLANE,
            capture_far: CAPTURE_FAR_PLANE,
            irradiance_sample_delta: 0.025,
            prefilter_sample_count: 1024,
            brdf_sample_count: 1024,
            shadow_extent: 40.0,
            shadow_bias: 0.005,
        }
    }
}

impl IblSettings {
    /// Small, fast settings suitable for previews and tests.
    pub fn preview() -> Self {
        Self {
            capture_resolution: 16,
            light_probe_resolution: 4,
            reflection_probe_resolution: 8,
            brdf_lut_resolution: 8,
            reflection_probe_mip_count: 3,
            shadowmap_resolution: 32,
            skybox_resolution: 8,
            irradiance_sample_delta: 0.2,
            prefilter_sample_count: 32,
            brdf_sample_count: 64,
            ..Self::default()
        }
    }

    pub fn mip_roughness(&self, mip: u32) -> f32 {
        mip_roughness(mip, self.reflection_probe_mip_count)
    }

    /// Reject settings that would produce empty targets or degenerate kernels.
    pub fn validate(&self) -> Result<(), RenderError> {
        let resolutions = [
            ("capture_resolution", self.capture_resolution),
            ("light_probe_resolution", self.light_probe_resolution),
            ("reflection_probe_resolution", self.reflection_probe_resolution),
            ("brdf_lut_resolution", self.brdf_lut_resolution),
            ("shadowmap_resolution", self.shadowmap_resolution),
            ("skybox_resolution", self.skybox_resolution),
        ];
        for (name, value) in resolutions {
            if value == 0 {
                return Err(RenderError::InvalidSettings(format!("{name} must be > 0")));
            }
        }

        let max_mips = u32::BITS - self.reflection_probe_resolution.leading_zeros();
        if self.reflection_probe_mip_count == 0 || self.reflection_probe_mip_count > max_mips {
            return Err(RenderError::InvalidSettings(format!(
                "reflection_probe_mip_count must be in 1..={max_mips} for a {} texel probe",
                self.reflection_probe_resolution
            )));
        }
        if !(self.capture_near > 0.0 && self.capture_far > self.capture_near) {
            return Err(RenderError::InvalidSettings(
                "capture planes must satisfy 0 < near < far".into(),
            ));
        }
        if !(self.irradiance_sample_delta > 0.0
            && self.irradiance_sample_delta <= std::f32::consts::FRAC_PI_2)
        {
            return Err(RenderError::InvalidSettings(
                "irradiance_sample_delta must be in (0, pi/2]".into(),
            ));
        }
        if self.prefilter_sample_count == 0 || self.brdf_sample_count == 0 {
            return Err(RenderError::InvalidSettings(
                "sample counts must be > 0".into(),
            ));
        }
        if self.shadow_extent <= 0.0 {
            return Err(RenderError::InvalidSettings(
                "shadow_extent must be > 0".into(),
            ));
        }
        Ok(())
    }
}
