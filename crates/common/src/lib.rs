//! Shared types, constants and errors for the radiance workspace.

mod error;
mod settings;
mod types;

pub use error::RenderError;
pub use settings::{
    mip_roughness, IblSettings, BRDF_LUT_RESOLUTION, CAPTURE_FAR_PLANE, CAPTURE_NEAR_PLANE,
    IBL_CAPTURE_RESOLUTION, LIGHT_PROBE_RESOLUTION, REFLECTION_PROBE_MIP_COUNT,
    REFLECTION_PROBE_RESOLUTION, SHADOWMAP_RESOLUTION, SKYBOX_RESOLUTION,
};
pub use types::{mip_extent, CubeFace, EntityId, TextureFormat, Transform};

pub fn crate_info() -> &'static str {
    "radiance-common v0.1.0"
}
