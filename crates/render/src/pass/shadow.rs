use std::rc::Rc;

use glam::{Mat4, Vec3};
use radiance_common::RenderError;

use crate::context::RenderContext;
use crate::device::{ClearValues, GraphicsDevice, ShaderKind, TextureId};
use crate::pass::PassContext;
use crate::resource::Framebuffer;
use crate::scene::{ModelRenderer, RenderMode};
use crate::state::CompareFunction;
use crate::uniforms::names;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowmapOutput {
    /// Depth texture as seen from the light.
    pub shadowmap: TextureId,
    pub light_space_view_projection: Mat4,
}

/// Orthographic light transform covering a box of half-size `extent` around
/// `center`.
pub fn light_space_matrix(direction: Vec3, center: Vec3, extent: f32) -> Mat4 {
    let dir = direction.try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if dir.cross(Vec3::Y).length_squared() < 1e-6 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = center - dir * (extent * 2.0);
    let view = Mat4::look_at_rh(eye, center, up);
    let projection = Mat4::orthographic_rh(-extent, extent, -extent, extent, 0.01, extent * 4.0);
    projection * view
}

/// Depth-only render of the scene from the sun.
pub struct ShadowmapPass {
    framebuffer: Rc<Framebuffer>,
    renderer: ModelRenderer,
    extent: f32,
}

impl ShadowmapPass {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        resolution: u32,
        extent: f32,
    ) -> Result<Self, RenderError> {
        let framebuffer = Framebuffer::builder(resolution, resolution)
            .label("shadowmap")
            .add_depth_texture()
            .build(ctx)?;
        Self::with_framebuffer(ctx, Rc::new(framebuffer), extent)
    }

    pub fn with_framebuffer<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        framebuffer: Rc<Framebuffer>,
        extent: f32,
    ) -> Result<Self, RenderError> {
        ctx.load_shader(ShaderKind::ShadowDepth)?;
        Ok(Self {
            framebuffer,
            renderer: ModelRenderer::new(),
            extent,
        })
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn generate_shadowmaps<D: GraphicsDevice>(
        &mut self,
        cx: &mut PassContext<'_, D>,
    ) -> Result<ShadowmapOutput, RenderError> {
        let _span = tracing::debug_span!("shadowmap_pass").entered();
        let shadowmap = self
            .framebuffer
            .depth_texture()
            .ok_or_else(|| RenderError::UnknownResource("shadowmap depth texture".into()))?;
        let sun = cx.scene.sun();
        let light_space = light_space_matrix(sun.direction, cx.camera.position(), self.extent);

        let mut gfx = cx.gfx.scoped();
        gfx.bind_framebuffer(&self.framebuffer)?;
        gfx.set_viewport(self.framebuffer.width(), self.framebuffer.height())?;
        gfx.set_depth_test(true)?;
        gfx.set_depth_func(CompareFunction::Less)?;
        gfx.set_stencil_test(false)?;
        gfx.clear(ClearValues::depth(1.0))?;

        gfx.switch_shader(ShaderKind::ShadowDepth)?;
        gfx.set_uniform(names::LIGHT_SPACE_VIEW_PROJECTION, light_space)?;

        if cx.render_only_static {
            cx.scene.add_opaque_static_models_to_renderer(&mut self.renderer);
        } else {
            cx.scene.add_opaque_models_to_renderer(&mut self.renderer);
        }
        ModelRenderer::setup_opaque_render_state(&mut gfx)?;
        let models = self
            .renderer
            .flush_opaque(&mut gfx, RenderMode::NoMaterialRequired)?;
        if let Some(terrain) = cx.scene.terrain() {
            terrain.draw(&mut gfx, RenderMode::NoMaterialRequired)?;
        }
        tracing::trace!(models, "shadow casters drawn");

        Ok(ShadowmapOutput {
            shadowmap,
            light_space_view_projection: light_space,
        })
    }
}
