//! Deferred geometry pass.
//!
//! # Invariants
//! - Models are tagged with [`MODEL_STENCIL_VALUE`] and terrain with
//!   [`TERRAIN_STENCIL_VALUE`] in the GBuffer stencil.
//! - The stencil write mask is zero between categories and on exit.
//! - A pass built with [`DeferredGeometryPass::new`] owns its GBuffer; one
//!   built with [`DeferredGeometryPass::with_gbuffer`] never releases it.

use std::rc::Rc;

use glam::Vec4;
use radiance_common::{RenderError, TextureFormat};

use crate::context::RenderContext;
use crate::device::{ClearValues, FramebufferId, GraphicsDevice, ShaderKind, TextureId};
use crate::pass::PassContext;
use crate::resource::Framebuffer;
use crate::scene::{ModelRenderer, RenderMode};
use crate::state::{CompareFunction, StencilOperation};
use crate::uniforms::names;

pub const MODEL_STENCIL_VALUE: u8 = 0x01;
pub const TERRAIN_STENCIL_VALUE: u8 = 0x02;

const POSITION_SLOT: usize = 0;
const NORMAL_SLOT: usize = 1;
const ALBEDO_SLOT: usize = 2;

/// World position, normal and albedo targets plus depth-stencil.
#[derive(Debug)]
pub struct GBuffer {
    framebuffer: Framebuffer,
}

impl GBuffer {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        width: u32,
        height: u32,
    ) -> Result<Self, RenderError> {
        let framebuffer = Framebuffer::builder(width, height)
            .label("gbuffer")
            .add_color_texture(TextureFormat::Rgba16Float)
            .add_color_texture(TextureFormat::Rgba16Float)
            .add_color_texture(TextureFormat::Rgba8Unorm)
            .add_depth_stencil()
            .build(ctx)?;
        Ok(Self { framebuffer })
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn width(&self) -> u32 {
        self.framebuffer.width()
    }

    pub fn height(&self) -> u32 {
        self.framebuffer.height()
    }

    /// Handles to every target, for the lighting stage.
    pub fn view(&self) -> Result<GBufferView, RenderError> {
        let slot = |slot: usize, what: &str| {
            self.framebuffer
                .color_texture(slot)
                .ok_or_else(|| RenderError::UnknownResource(format!("gbuffer {what} target")))
        };
        Ok(GBufferView {
            framebuffer: self.framebuffer.id(),
            position: slot(POSITION_SLOT, "position")?,
            normal: slot(NORMAL_SLOT, "normal")?,
            albedo: slot(ALBEDO_SLOT, "albedo")?,
            depth_stencil: self
                .framebuffer
                .depth_texture()
                .ok_or_else(|| RenderError::UnknownResource("gbuffer depth-stencil".into()))?,
            width: self.width(),
            height: self.height(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBufferView {
    pub framebuffer: FramebufferId,
    pub position: TextureId,
    pub normal: TextureId,
    pub albedo: TextureId,
    pub depth_stencil: TextureId,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPassOutput {
    pub gbuffer: GBufferView,
}

enum GBufferSlot {
    Owned(GBuffer),
    Shared(Rc<GBuffer>),
}

impl GBufferSlot {
    fn get(&self) -> &GBuffer {
        match self {
            GBufferSlot::Owned(gbuffer) => gbuffer,
            GBufferSlot::Shared(gbuffer) => gbuffer,
        }
    }
}

pub struct DeferredGeometryPass {
    gbuffer: GBufferSlot,
    renderer: ModelRenderer,
}

impl DeferredGeometryPass {
    /// Pass with its own GBuffer, released with the pass.
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        width: u32,
        height: u32,
    ) -> Result<Self, RenderError> {
        let gbuffer = GBuffer::new(ctx, width, height)?;
        Self::build(ctx, GBufferSlot::Owned(gbuffer))
    }

    /// Pass writing into a GBuffer owned elsewhere.
    pub fn with_gbuffer<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        gbuffer: Rc<GBuffer>,
    ) -> Result<Self, RenderError> {
        Self::build(ctx, GBufferSlot::Shared(gbuffer))
    }

    fn build<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        gbuffer: GBufferSlot,
    ) -> Result<Self, RenderError> {
        ctx.load_shader(ShaderKind::ModelGeometry)?;
        ctx.load_shader(ShaderKind::TerrainGeometry)?;
        Ok(Self {
            gbuffer,
            renderer: ModelRenderer::new(),
        })
    }

    pub fn owns_gbuffer(&self) -> bool {
        matches!(self.gbuffer, GBufferSlot::Owned(_))
    }

    pub fn gbuffer(&self) -> &GBuffer {
        self.gbuffer.get()
    }

    pub fn execute_geometry_pass<D: GraphicsDevice>(
        &mut self,
        cx: &mut PassContext<'_, D>,
    ) -> Result<GeometryPassOutput, RenderError> {
        let _span = tracing::debug_span!("geometry_pass").entered();
        let gbuffer = self.gbuffer.get();
        let view = gbuffer.view()?;
        let projection = cx.camera.projection_matrix();
        let camera_view = cx.camera.view_matrix();

        let mut gfx = cx.gfx.scoped();
        gfx.set_viewport(gbuffer.width(), gbuffer.height())?;
        gfx.bind_framebuffer(gbuffer.framebuffer())?;
        // Stencil clears honour the write mask.
        gfx.set_stencil_write_mask(0xFF)?;
        gfx.clear(ClearValues::all(Vec4::ZERO, 1.0, 0))?;

        gfx.set_blend(false)?;
        gfx.set_multisample(false)?;
        gfx.set_stencil_op(
            StencilOperation::Keep,
            StencilOperation::Keep,
            StencilOperation::Replace,
        )?;
        gfx.set_stencil_write_mask(0x00)?;
        gfx.set_stencil_test(true)?;

        gfx.switch_shader(ShaderKind::ModelGeometry)?;
        gfx.set_uniform(names::VIEW_POS, cx.camera.position())?;
        gfx.set_uniform(names::VIEW, camera_view)?;
        gfx.set_uniform(names::PROJECTION, projection)?;

        if cx.render_only_static {
            cx.scene.add_opaque_static_models_to_renderer(&mut self.renderer);
        } else {
            cx.scene.add_opaque_models_to_renderer(&mut self.renderer);
        }
        gfx.set_stencil_write_mask(0xFF)?;
        gfx.set_stencil_func(CompareFunction::Always, MODEL_STENCIL_VALUE, 0xFF)?;
        ModelRenderer::setup_opaque_render_state(&mut gfx)?;
        let models = self
            .renderer
            .flush_opaque(&mut gfx, RenderMode::MaterialRequired)?;
        gfx.set_stencil_write_mask(0x00)?;

        if let Some(terrain) = cx.scene.terrain() {
            gfx.switch_shader(ShaderKind::TerrainGeometry)?;
            gfx.set_uniform(names::VIEW, camera_view)?;
            gfx.set_uniform(names::PROJECTION, projection)?;
            gfx.set_stencil_write_mask(0xFF)?;
            gfx.set_stencil_func(CompareFunction::Always, TERRAIN_STENCIL_VALUE, 0xFF)?;
            terrain.draw(&mut gfx, RenderMode::MaterialRequired)?;
            gfx.set_stencil_write_mask(0x00)?;
        }
        gfx.set_stencil_test(false)?;
        tracing::debug!(models, "gbuffer filled");

        Ok(GeometryPassOutput { gbuffer: view })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FlyCamera;
    use crate::device::ResourceHandle;
    use crate::scene::GpuScene;
    use crate::software::{DeviceEvent, SoftwareDevice};
    use crate::state::RenderState;
    use glam::Vec3;
    use radiance_common::Transform;
    use radiance_scene::{Scene3D, SceneModel, Terrain};

    fn context() -> RenderContext<SoftwareDevice> {
        RenderContext::new(SoftwareDevice::new()).unwrap()
    }

    fn sphere_and_ground() -> Scene3D {
        let mut scene = Scene3D::new();
        scene.spawn_model(SceneModel::new(
            Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
            Vec4::new(1.0, 0.0, 0.0, 1.0),
        ));
        scene.set_terrain(Some(Terrain {
            transform: Transform {
                scale: Vec3::new(40.0, 1.0, 40.0),
                ..Transform::default()
            },
            albedo: Vec4::new(0.0, 1.0, 0.0, 1.0),
        }));
        scene
    }

    fn gbuffer_handles(gbuffer: &GBuffer) -> Vec<ResourceHandle> {
        let view = gbuffer.view().unwrap();
        vec![
            ResourceHandle::Framebuffer(view.framebuffer),
            ResourceHandle::Texture(view.position),
            ResourceHandle::Texture(view.normal),
            ResourceHandle::Texture(view.albedo),
            ResourceHandle::Texture(view.depth_stencil),
        ]
    }

    #[test]
    fn stencil_values_are_distinct() {
        assert_ne!(MODEL_STENCIL_VALUE, TERRAIN_STENCIL_VALUE);
        assert_ne!(MODEL_STENCIL_VALUE, 0);
        assert_ne!(TERRAIN_STENCIL_VALUE, 0);
    }

    #[test]
    fn owned_gbuffer_is_released_with_the_pass() {
        let mut ctx = context();
        let pass = DeferredGeometryPass::new(&mut ctx, 8, 8).unwrap();
        assert!(pass.owns_gbuffer());
        let handles = gbuffer_handles(pass.gbuffer());
        drop(pass);
        ctx.collect_garbage();
        for handle in handles {
            assert!(!ctx.device().is_alive(handle), "{handle:?} leaked");
        }
    }

    #[test]
    fn shared_gbuffer_outlives_the_pass() {
        let mut ctx = context();
        let gbuffer = Rc::new(GBuffer::new(&mut ctx, 8, 8).unwrap());
        let pass = DeferredGeometryPass::with_gbuffer(&mut ctx, Rc::clone(&gbuffer)).unwrap();
        assert!(!pass.owns_gbuffer());
        drop(pass);
        assert_eq!(ctx.collect_garbage(), 0);
        for handle in gbuffer_handles(&gbuffer) {
            assert!(ctx.device().is_alive(handle));
        }
    }

    #[test]
    fn categories_are_tagged_and_state_restored() {
        let mut ctx = context();
        let scene = GpuScene::upload(&mut ctx, sphere_and_ground(), 4).unwrap();
        let camera = FlyCamera {
            aspect: 1.0,
            ..FlyCamera::looking_at(Vec3::new(0.0, 3.0, 8.0), Vec3::new(0.0, 0.5, 0.0))
        };
        let mut pass = DeferredGeometryPass::new(&mut ctx, 32, 32).unwrap();
        let before = *ctx.state();

        let out = {
            let mut cx = PassContext {
                gfx: &mut ctx,
                scene: &scene,
                camera: &camera,
                render_only_static: false,
            };
            pass.execute_geometry_pass(&mut cx).unwrap()
        };
        assert_eq!(*ctx.state(), before);

        let stencil = ctx
            .device()
            .read_stencil(out.gbuffer.depth_stencil)
            .unwrap();
        let albedo = ctx
            .device_mut()
            .read_texture(out.gbuffer.albedo)
            .unwrap();
        let centre = 16 * 32 + 16;
        assert_eq!(stencil[centre], MODEL_STENCIL_VALUE);
        assert!(albedo[centre].x > 0.9);
        let bottom = 31 * 32 + 16;
        assert_eq!(stencil[bottom], TERRAIN_STENCIL_VALUE);
        assert!(albedo[bottom].y > 0.9);
        let sky = 16;
        assert_eq!(stencil[sky], 0);

        // Same values on a second frame.
        let mut cx = PassContext {
            gfx: &mut ctx,
            scene: &scene,
            camera: &camera,
            render_only_static: false,
        };
        let again = pass.execute_geometry_pass(&mut cx).unwrap();
        let stencil_again = ctx
            .device()
            .read_stencil(again.gbuffer.depth_stencil)
            .unwrap();
        assert_eq!(stencil, stencil_again);
    }

    fn camera() -> FlyCamera {
        FlyCamera {
            aspect: 1.0,
            ..FlyCamera::looking_at(Vec3::new(0.0, 3.0, 8.0), Vec3::new(0.0, 0.5, 0.0))
        }
    }

    fn run(
        ctx: &mut RenderContext<SoftwareDevice>,
        pass: &mut DeferredGeometryPass,
        scene: &GpuScene,
    ) -> GeometryPassOutput {
        let camera = camera();
        let mut cx = PassContext {
            gfx: ctx,
            scene,
            camera: &camera,
            render_only_static: false,
        };
        pass.execute_geometry_pass(&mut cx).unwrap()
    }

    #[test]
    fn stencil_is_reset_even_with_a_zero_caller_mask() {
        let mut ctx = context();
        let mut pass = DeferredGeometryPass::new(&mut ctx, 32, 32).unwrap();
        let centre = 16 * 32 + 16;

        let full = GpuScene::upload(&mut ctx, sphere_and_ground(), 4).unwrap();
        let out = run(&mut ctx, &mut pass, &full);
        let stencil = ctx.device().read_stencil(out.gbuffer.depth_stencil).unwrap();
        assert_eq!(stencil[centre], MODEL_STENCIL_VALUE);

        ctx.set_stencil_write_mask(0x00).unwrap();
        let empty = GpuScene::upload(&mut ctx, Scene3D::new(), 4).unwrap();
        let out = run(&mut ctx, &mut pass, &empty);
        let stencil = ctx.device().read_stencil(out.gbuffer.depth_stencil).unwrap();
        assert!(stencil.iter().all(|&s| s == 0));
        assert_eq!(ctx.state().stencil_write_mask, 0x00);
    }

    #[test]
    fn write_mask_is_closed_between_categories() {
        let mut ctx = RenderContext::new(SoftwareDevice::recording()).unwrap();
        let scene = GpuScene::upload(&mut ctx, sphere_and_ground(), 4).unwrap();
        let mut pass = DeferredGeometryPass::new(&mut ctx, 16, 16).unwrap();
        run(&mut ctx, &mut pass, &scene);

        let history = ctx.device().history();
        let draws: Vec<&RenderState> = history
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Draw { state, .. } => Some(state),
                DeviceEvent::State(_) => None,
            })
            .collect();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].shader, Some(ShaderKind::ModelGeometry));
        assert_eq!(draws[0].stencil_func.reference, MODEL_STENCIL_VALUE);
        assert_eq!(draws[1].shader, Some(ShaderKind::TerrainGeometry));
        assert_eq!(draws[1].stencil_func.reference, TERRAIN_STENCIL_VALUE);
        for state in &draws {
            assert_eq!(state.stencil_write_mask, 0xFF);
            assert!(state.stencil_test);
            assert_eq!(state.stencil_ops.pass, StencilOperation::Replace);
        }

        // Every state applied between the two draws keeps the mask closed
        // until the terrain tag is set.
        let first = history
            .iter()
            .position(|e| matches!(e, DeviceEvent::Draw { .. }))
            .unwrap();
        let second = history
            .iter()
            .rposition(|e| matches!(e, DeviceEvent::Draw { .. }))
            .unwrap();
        let between: Vec<&RenderState> = history[first + 1..second]
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::State(s) => Some(s),
                DeviceEvent::Draw { .. } => None,
            })
            .collect();
        let closed = between
            .iter()
            .position(|s| s.stencil_write_mask == 0x00)
            .unwrap();
        let terrain = between
            .iter()
            .position(|s| s.shader == Some(ShaderKind::TerrainGeometry))
            .unwrap();
        assert!(closed < terrain);
        assert_eq!(between[terrain].stencil_write_mask, 0x00);

        // The last applied state is the caller's, restored by the scope.
        let last = history.iter().rev().find_map(|e| match e {
            DeviceEvent::State(s) => Some(s),
            DeviceEvent::Draw { .. } => None,
        });
        assert_eq!(last, Some(ctx.state()));
    }
}
