//! The device seam: every GPU command issued by the core goes through
//! [`GraphicsDevice`].

use glam::Vec4;
use radiance_common::{CubeFace, RenderError, TextureFormat};

use crate::state::RenderState;
use crate::uniforms::UniformValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CubemapId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

/// Any device resource, for destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Texture(TextureId),
    Cubemap(CubemapId),
    Framebuffer(FramebufferId),
}

/// Shader programs known to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderKind {
    ShadowDepth,
    ForwardLighting,
    Skybox,
    ModelGeometry,
    TerrainGeometry,
    IrradianceConvolution,
    ImportanceSampling,
    BrdfIntegration,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 8] = [
        ShaderKind::ShadowDepth,
        ShaderKind::ForwardLighting,
        ShaderKind::Skybox,
        ShaderKind::ModelGeometry,
        ShaderKind::TerrainGeometry,
        ShaderKind::IrradianceConvolution,
        ShaderKind::ImportanceSampling,
        ShaderKind::BrdfIntegration,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShaderKind::ShadowDepth => "shadow_depth",
            ShaderKind::ForwardLighting => "forward_lighting",
            ShaderKind::Skybox => "skybox",
            ShaderKind::ModelGeometry => "model_geometry",
            ShaderKind::TerrainGeometry => "terrain_geometry",
            ShaderKind::IrradianceConvolution => "irradiance_convolution",
            ShaderKind::ImportanceSampling => "importance_sampling",
            ShaderKind::BrdfIntegration => "brdf_integration",
        }
    }

    /// Number of color outputs the fragment stage writes.
    pub fn color_outputs(self) -> usize {
        match self {
            ShaderKind::ShadowDepth => 0,
            ShaderKind::ModelGeometry | ShaderKind::TerrainGeometry => 3,
            _ => 1,
        }
    }
}

/// Built-in meshes. Object placement comes from the `model` uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Geometry {
    /// Full-screen quad. Fragment `uv` has `v = 0` on the top row.
    NdcPlane,
    /// Unit cube around the eye, seen from inside and emitted at the far
    /// plane. Used for skyboxes and cubemap filtering.
    NdcCube,
    /// Unit sphere.
    Sphere,
    /// Unit quad in the XZ plane facing +Y.
    TerrainPatch,
}

/// What a color slot renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttachmentTarget {
    #[default]
    None,
    Texture(TextureId),
    CubeFace {
        cubemap: CubemapId,
        face: CubeFace,
        mip: u32,
    },
}

/// A resource bound to a sampler unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampledResource {
    Texture(TextureId),
    Cubemap(CubemapId),
}

#[derive(Debug, Clone)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

#[derive(Debug, Clone)]
pub struct CubemapDesc<'a> {
    pub label: &'a str,
    pub size: u32,
    pub mip_count: u32,
    pub format: TextureFormat,
}

/// A framebuffer is a set of color slots (with fixed formats) and an
/// optional depth attachment. Slots start detached.
#[derive(Debug, Clone)]
pub struct FramebufferDesc<'a> {
    pub label: &'a str,
    pub color_formats: Vec<TextureFormat>,
}

/// Which attachments a clear touches, and with what.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearValues {
    pub color: Option<Vec4>,
    pub depth: Option<f32>,
    pub stencil: Option<u8>,
}

impl ClearValues {
    pub fn depth(depth: f32) -> Self {
        Self {
            depth: Some(depth),
            ..Self::default()
        }
    }

    pub fn color_depth(color: Vec4, depth: f32) -> Self {
        Self {
            color: Some(color),
            depth: Some(depth),
            stencil: None,
        }
    }

    pub fn all(color: Vec4, depth: f32, stencil: u8) -> Self {
        Self {
            color: Some(color),
            depth: Some(depth),
            stencil: Some(stencil),
        }
    }
}

/// Backend interface. Commands execute in call order; a draw sees the state
/// applied by the most recent [`GraphicsDevice::apply_state`] and the
/// uniforms and sampler bindings set before it.
pub trait GraphicsDevice {
    fn backend_name(&self) -> &'static str;

    /// Prepare a shader program. Drawing with a program that was never loaded
    /// is an error.
    fn load_shader(&mut self, kind: ShaderKind) -> Result<(), RenderError>;

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, RenderError>;
    fn create_cubemap(&mut self, desc: &CubemapDesc<'_>) -> Result<CubemapId, RenderError>;
    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc<'_>,
    ) -> Result<FramebufferId, RenderError>;

    /// Release a resource. Unknown handles are ignored.
    fn destroy(&mut self, handle: ResourceHandle);
    fn is_alive(&self, handle: ResourceHandle) -> bool;

    /// Upload one face of one mip, row-major with row 0 at the top.
    fn write_cubemap_face(
        &mut self,
        cubemap: CubemapId,
        face: CubeFace,
        mip: u32,
        texels: &[Vec4],
    ) -> Result<(), RenderError>;
    fn read_cubemap_face(
        &mut self,
        cubemap: CubemapId,
        face: CubeFace,
        mip: u32,
    ) -> Result<Vec<Vec4>, RenderError>;
    /// Read a 2D texture. Depth formats return depth in `x`.
    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<Vec4>, RenderError>;

    /// Point a color slot at a new target. The framebuffer object is kept.
    fn set_color_attachment(
        &mut self,
        framebuffer: FramebufferId,
        slot: usize,
        target: AttachmentTarget,
    ) -> Result<(), RenderError>;
    fn set_depth_attachment(
        &mut self,
        framebuffer: FramebufferId,
        texture: Option<TextureId>,
    ) -> Result<(), RenderError>;

    fn apply_state(&mut self, state: &RenderState) -> Result<(), RenderError>;
    fn set_uniform(&mut self, name: &str, value: UniformValue) -> Result<(), RenderError>;
    fn bind_sampled(&mut self, unit: u32, resource: Option<SampledResource>);

    /// Clear the attachments of the bound framebuffer. Detached color slots
    /// are skipped.
    fn clear(&mut self, values: ClearValues) -> Result<(), RenderError>;
    fn draw(&mut self, geometry: Geometry) -> Result<(), RenderError>;
}
