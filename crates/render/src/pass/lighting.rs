use std::rc::Rc;

use glam::Vec4;
use radiance_common::RenderError;

use crate::camera::Camera;
use crate::context::RenderContext;
use crate::device::{ClearValues, FramebufferId, Geometry, GraphicsDevice, ShaderKind};
use crate::pass::{PassContext, ShadowmapOutput};
use crate::resource::Framebuffer;
use crate::scene::{ModelRenderer, RenderMode, Scene};
use crate::state::CompareFunction;
use crate::uniforms::names;

const SKYBOX_UNIT: u32 = 0;
const SHADOWMAP_UNIT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightingPassOutput {
    pub framebuffer: FramebufferId,
}

/// Forward-lit render of the scene followed by the skybox.
///
/// The caller decides where color goes by binding slot 0 of the pass
/// framebuffer before executing.
pub struct LightingPass {
    framebuffer: Rc<Framebuffer>,
    renderer: ModelRenderer,
    shadow_bias: f32,
}

impl LightingPass {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        framebuffer: Rc<Framebuffer>,
        shadow_bias: f32,
    ) -> Result<Self, RenderError> {
        ctx.load_shader(ShaderKind::ForwardLighting)?;
        ctx.load_shader(ShaderKind::Skybox)?;
        Ok(Self {
            framebuffer,
            renderer: ModelRenderer::new(),
            shadow_bias,
        })
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn execute_lighting_pass<D: GraphicsDevice>(
        &mut self,
        cx: &mut PassContext<'_, D>,
        shadowmap: &ShadowmapOutput,
    ) -> Result<LightingPassOutput, RenderError> {
        let _span = tracing::debug_span!("lighting_pass").entered();

        let mut gfx = cx.gfx.scoped();
        let drawn = self.draw_lit_scene(
            &mut gfx,
            cx.scene,
            cx.camera,
            cx.render_only_static,
            shadowmap,
        );
        // Sampler bindings live outside the render state, so the scope
        // cannot put them back.
        gfx.unbind_unit(SKYBOX_UNIT);
        gfx.unbind_unit(SHADOWMAP_UNIT);
        drawn?;

        Ok(LightingPassOutput {
            framebuffer: self.framebuffer.id(),
        })
    }

    fn draw_lit_scene<D: GraphicsDevice>(
        &mut self,
        gfx: &mut RenderContext<D>,
        scene: &dyn Scene,
        camera: &dyn Camera,
        render_only_static: bool,
        shadowmap: &ShadowmapOutput,
    ) -> Result<(), RenderError> {
        let sun = scene.sun();
        let projection = camera.projection_matrix();
        let view = camera.view_matrix();

        gfx.bind_framebuffer(&self.framebuffer)?;
        gfx.set_viewport(self.framebuffer.width(), self.framebuffer.height())?;
        gfx.set_blend(false)?;
        gfx.set_stencil_test(false)?;
        gfx.set_depth_test(true)?;
        gfx.set_depth_func(CompareFunction::Less)?;
        gfx.clear(ClearValues::color_depth(Vec4::new(0.0, 0.0, 0.0, 1.0), 1.0))?;

        gfx.switch_shader(ShaderKind::ForwardLighting)?;
        gfx.set_uniform(names::PROJECTION, projection)?;
        gfx.set_uniform(names::VIEW, view)?;
        gfx.set_uniform(names::VIEW_POS, camera.position())?;
        gfx.set_uniform(names::LIGHT_DIRECTION, sun.direction)?;
        gfx.set_uniform(names::LIGHT_COLOR, sun.color)?;
        gfx.set_uniform(names::AMBIENT_COLOR, sun.ambient)?;
        gfx.set_uniform(
            names::LIGHT_SPACE_VIEW_PROJECTION,
            shadowmap.light_space_view_projection,
        )?;
        gfx.set_uniform(names::SHADOW_BIAS, self.shadow_bias)?;
        gfx.bind_texture(SHADOWMAP_UNIT, shadowmap.shadowmap);
        gfx.set_uniform(names::SHADOWMAP, SHADOWMAP_UNIT)?;

        if render_only_static {
            scene.add_opaque_static_models_to_renderer(&mut self.renderer);
        } else {
            scene.add_opaque_models_to_renderer(&mut self.renderer);
        }
        ModelRenderer::setup_opaque_render_state(gfx)?;
        self.renderer.flush_opaque(gfx, RenderMode::MaterialRequired)?;
        if let Some(terrain) = scene.terrain() {
            terrain.draw(gfx, RenderMode::MaterialRequired)?;
        }

        // Skybox last, at the far plane, so only uncovered pixels pass.
        gfx.switch_shader(ShaderKind::Skybox)?;
        gfx.set_depth_func(CompareFunction::LessEqual)?;
        gfx.set_face_cull(false)?;
        gfx.set_uniform(names::PROJECTION, projection)?;
        gfx.set_uniform(names::VIEW, view)?;
        gfx.bind_cubemap(SKYBOX_UNIT, scene.skybox());
        gfx.set_uniform(names::SKYBOX, SKYBOX_UNIT)?;
        gfx.draw(Geometry::NdcCube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FlyCamera;
    use crate::device::AttachmentTarget;
    use crate::pass::ShadowmapPass;
    use crate::scene::GpuScene;
    use crate::software::SoftwareDevice;
    use glam::Vec3;
    use radiance_common::{CubeFace, TextureFormat, Transform};
    use radiance_scene::{Scene3D, SceneModel};

    const SIZE: u32 = 8;

    fn context() -> RenderContext<SoftwareDevice> {
        RenderContext::new(SoftwareDevice::new()).unwrap()
    }

    fn render(
        ctx: &mut RenderContext<SoftwareDevice>,
        pass: &mut LightingPass,
        scene: &GpuScene,
    ) -> Result<LightingPassOutput, RenderError> {
        let camera = FlyCamera {
            aspect: 1.0,
            ..FlyCamera::looking_at(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO)
        };
        let mut shadow = ShadowmapPass::new(ctx, SIZE, 10.0)?;
        let mut cx = PassContext {
            gfx: ctx,
            scene,
            camera: &camera,
            render_only_static: false,
        };
        let shadowmap = shadow.generate_shadowmaps(&mut cx)?;
        pass.execute_lighting_pass(&mut cx, &shadowmap)
    }

    #[test]
    fn sampler_units_are_released_after_the_pass() {
        let mut ctx = context();
        let mut scene = Scene3D::new();
        scene.spawn_model(SceneModel::new(
            Transform::from_position(Vec3::ZERO),
            Vec4::new(1.0, 1.0, 1.0, 1.0),
        ));
        let scene = GpuScene::upload(&mut ctx, scene, SIZE).unwrap();
        let framebuffer = Framebuffer::builder(SIZE, SIZE)
            .add_color_texture(TextureFormat::Rgba16Float)
            .add_depth()
            .build(&mut ctx)
            .unwrap();
        let mut pass = LightingPass::new(&mut ctx, Rc::new(framebuffer), 0.005).unwrap();
        let before = *ctx.state();

        render(&mut ctx, &mut pass, &scene).unwrap();
        assert!(ctx.device().stats().draw_calls >= 2);
        assert_eq!(ctx.device().bound_unit(SKYBOX_UNIT), None);
        assert_eq!(ctx.device().bound_unit(SHADOWMAP_UNIT), None);
        assert_eq!(*ctx.state(), before);
    }

    #[test]
    fn sampler_units_are_released_when_a_draw_fails() {
        let mut ctx = context();
        let scene = GpuScene::upload(&mut ctx, Scene3D::new(), SIZE).unwrap();
        let framebuffer = Framebuffer::builder(SIZE, SIZE)
            .add_color_slot(TextureFormat::Rgba16Float)
            .add_depth()
            .build(&mut ctx)
            .unwrap();
        // Rendering the skybox into itself fails on the last draw.
        framebuffer
            .set_color_attachment(
                &mut ctx,
                0,
                AttachmentTarget::CubeFace {
                    cubemap: scene.skybox(),
                    face: CubeFace::PositiveX,
                    mip: 0,
                },
            )
            .unwrap();
        let mut pass = LightingPass::new(&mut ctx, Rc::new(framebuffer), 0.005).unwrap();
        let before = *ctx.state();

        let err = render(&mut ctx, &mut pass, &scene).unwrap_err();
        assert!(matches!(err, RenderError::FeedbackLoop(_)), "{err:?}");
        assert_eq!(ctx.device().bound_unit(SKYBOX_UNIT), None);
        assert_eq!(ctx.device().bound_unit(SHADOWMAP_UNIT), None);
        assert_eq!(*ctx.state(), before);
    }
}
