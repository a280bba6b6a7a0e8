//! Rendering core: render passes, probe baking and the device seam they run
//! on.
//!
//! # Invariants
//! - Every GPU command goes through a [`GraphicsDevice`]; passes never talk
//!   to a backend directly.
//! - A pass leaves the render state exactly as it found it, on success and
//!   on error.
//! - GPU resources are owned by RAII handles and released through the
//!   context's release queue, never while a draw may still use them.
//!
//! [`SoftwareDevice`] is a complete CPU backend used by tests and headless
//! tooling; GPU backends live in their own crates.

pub mod camera;
pub mod context;
pub mod device;
pub mod pass;
pub mod probe;
pub mod resource;
pub mod scene;
pub mod software;
pub mod state;
pub mod uniforms;

pub use camera::{Camera, CubemapCamera, FlyCamera};
pub use context::{RenderContext, StateScope};
pub use device::{
    AttachmentTarget, ClearValues, CubemapDesc, CubemapId, FramebufferDesc, FramebufferId,
    Geometry, GraphicsDevice, ResourceHandle, SampledResource, ShaderKind, TextureDesc, TextureId,
};
pub use pass::{
    ConvolutionPass, DeferredGeometryPass, GBuffer, GBufferView, GeometryPassOutput,
    ImportanceSamplingPass, LightingPass, LightingPassOutput, PassContext, PassInput, PassOutput,
    RenderPass, ShadowmapOutput, ShadowmapPass,
};
pub use probe::{BakeReport, LightProbe, Probe, ProbeManager, ProbePass, ReflectionProbe};
pub use resource::{Cubemap, Framebuffer, FramebufferBuilder, Texture};
pub use scene::{DirectionalLight, GpuScene, ModelRenderer, RenderMode, Scene};
pub use software::{DeviceEvent, SoftwareDevice};
pub use state::{CompareFunction, RenderState, StencilFunc, StencilOperation, StencilOps, Viewport};
pub use uniforms::{UniformBlock, UniformValue};

pub fn crate_info() -> &'static str {
    "radiance-render v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("render"));
    }

    #[test]
    fn software_device_is_a_graphics_device() {
        fn backend<D: GraphicsDevice>(device: &D) -> &'static str {
            device.backend_name()
        }
        assert_eq!(backend(&SoftwareDevice::new()), "software");
    }
}
