//! Render passes.
//!
//! Each pass owns its targets and its model queue, captures the render state
//! on entry and restores it on exit. [`RenderPass`] gives them one calling
//! convention so a sequence can be driven generically.

mod convolution;
mod geometry;
mod importance;
mod lighting;
mod shadow;

pub use convolution::ConvolutionPass;
pub use geometry::{
    DeferredGeometryPass, GBuffer, GBufferView, GeometryPassOutput, MODEL_STENCIL_VALUE,
    TERRAIN_STENCIL_VALUE,
};
pub use importance::ImportanceSamplingPass;
pub use lighting::{LightingPass, LightingPassOutput};
pub use shadow::{light_space_matrix, ShadowmapOutput, ShadowmapPass};

use radiance_common::RenderError;

use crate::camera::Camera;
use crate::context::RenderContext;
use crate::device::{CubemapId, GraphicsDevice};
use crate::resource::{Cubemap, Framebuffer};
use crate::scene::Scene;

/// What every pass needs to run.
pub struct PassContext<'a, D: GraphicsDevice> {
    pub gfx: &'a mut RenderContext<D>,
    pub scene: &'a dyn Scene,
    pub camera: &'a dyn Camera,
    /// Only static models are drawn (probe captures).
    pub render_only_static: bool,
}

/// Output of an earlier pass fed into the next one.
#[derive(Debug, Clone, Copy)]
pub enum PassInput<'a> {
    None,
    Shadowmap(&'a ShadowmapOutput),
    Environment(CubemapId),
}

#[derive(Debug)]
pub enum PassOutput {
    Shadowmap(ShadowmapOutput),
    Geometry(GeometryPassOutput),
    Lighting(LightingPassOutput),
    Convolution(Cubemap),
    ImportanceSampling(Cubemap),
}

impl PassOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            PassOutput::Shadowmap(_) => "shadowmap",
            PassOutput::Geometry(_) => "geometry",
            PassOutput::Lighting(_) => "lighting",
            PassOutput::Convolution(_) => "convolution",
            PassOutput::ImportanceSampling(_) => "importance_sampling",
        }
    }

    fn unexpected(&self, expected: &'static str) -> RenderError {
        RenderError::UnexpectedOutput {
            expected,
            actual: self.kind(),
        }
    }

    pub fn into_shadowmap(self) -> Result<ShadowmapOutput, RenderError> {
        match self {
            PassOutput::Shadowmap(out) => Ok(out),
            other => Err(other.unexpected("shadowmap")),
        }
    }

    pub fn into_geometry(self) -> Result<GeometryPassOutput, RenderError> {
        match self {
            PassOutput::Geometry(out) => Ok(out),
            other => Err(other.unexpected("geometry")),
        }
    }

    pub fn into_lighting(self) -> Result<LightingPassOutput, RenderError> {
        match self {
            PassOutput::Lighting(out) => Ok(out),
            other => Err(other.unexpected("lighting")),
        }
    }

    /// The cubemap produced by a convolution or importance-sampling pass.
    pub fn into_cubemap(self) -> Result<Cubemap, RenderError> {
        match self {
            PassOutput::Convolution(cube) | PassOutput::ImportanceSampling(cube) => Ok(cube),
            other => Err(other.unexpected("cubemap")),
        }
    }
}

pub enum RenderPass {
    Shadow(ShadowmapPass),
    Geometry(DeferredGeometryPass),
    Lighting(LightingPass),
    Convolution(ConvolutionPass),
    ImportanceSampling(ImportanceSamplingPass),
}

impl RenderPass {
    pub fn name(&self) -> &'static str {
        match self {
            RenderPass::Shadow(_) => "shadow",
            RenderPass::Geometry(_) => "geometry",
            RenderPass::Lighting(_) => "lighting",
            RenderPass::Convolution(_) => "convolution",
            RenderPass::ImportanceSampling(_) => "importance_sampling",
        }
    }

    /// Framebuffer the pass renders into.
    pub fn framebuffer(&self) -> &Framebuffer {
        match self {
            RenderPass::Shadow(pass) => pass.framebuffer(),
            RenderPass::Geometry(pass) => pass.gbuffer().framebuffer(),
            RenderPass::Lighting(pass) => pass.framebuffer(),
            RenderPass::Convolution(pass) => pass.framebuffer(),
            RenderPass::ImportanceSampling(pass) => pass.framebuffer(),
        }
    }

    pub fn execute<D: GraphicsDevice>(
        &mut self,
        cx: &mut PassContext<'_, D>,
        input: PassInput<'_>,
    ) -> Result<PassOutput, RenderError> {
        match (self, input) {
            (RenderPass::Shadow(pass), _) => pass.generate_shadowmaps(cx).map(PassOutput::Shadowmap),
            (RenderPass::Geometry(pass), _) => {
                pass.execute_geometry_pass(cx).map(PassOutput::Geometry)
            }
            (RenderPass::Lighting(pass), PassInput::Shadowmap(shadowmap)) => pass
                .execute_lighting_pass(cx, shadowmap)
                .map(PassOutput::Lighting),
            (RenderPass::Lighting(_), _) => Err(RenderError::MissingInput {
                pass: "lighting",
                expected: "shadowmap",
            }),
            (RenderPass::Convolution(pass), PassInput::Environment(env)) => {
                pass.convolve(cx.gfx, env).map(PassOutput::Convolution)
            }
            (RenderPass::ImportanceSampling(pass), PassInput::Environment(env)) => pass
                .prefilter(cx.gfx, env)
                .map(PassOutput::ImportanceSampling),
            (pass, _) => Err(RenderError::MissingInput {
                pass: pass.name(),
                expected: "environment cubemap",
            }),
        }
    }
}
