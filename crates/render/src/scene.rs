//! The scene as the passes see it.

use glam::{Mat4, Vec3, Vec4};
use radiance_common::{CubeFace, RenderError, TextureFormat};
use radiance_scene::Scene3D;

use crate::context::RenderContext;
use crate::device::{CubemapDesc, CubemapId, Geometry, GraphicsDevice};
use crate::resource::Cubemap;
use crate::uniforms::names;

/// Directional light plus the constant ambient term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels.
    pub direction: Vec3,
    pub color: Vec3,
    pub ambient: Vec3,
}

/// One queued opaque model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelDraw {
    pub transform: Mat4,
    pub albedo: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainDraw {
    pub transform: Mat4,
    pub albedo: Vec4,
}

/// Whether a flush binds per-model material uniforms. Depth-only passes
/// skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    MaterialRequired,
    NoMaterialRequired,
}

impl TerrainDraw {
    pub fn draw<D: GraphicsDevice>(
        &self,
        ctx: &mut RenderContext<D>,
        mode: RenderMode,
    ) -> Result<(), RenderError> {
        ctx.set_uniform(names::MODEL, self.transform)?;
        if mode == RenderMode::MaterialRequired {
            ctx.set_uniform(names::ALBEDO, self.albedo)?;
        }
        ctx.draw(Geometry::TerrainPatch)
    }
}

/// Queue of opaque models filled by the scene and drained by a pass.
#[derive(Debug, Default)]
pub struct ModelRenderer {
    opaque: Vec<ModelDraw>,
}

impl ModelRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_opaque(&mut self, draw: ModelDraw) {
        self.opaque.push(draw);
    }

    pub fn opaque_len(&self) -> usize {
        self.opaque.len()
    }

    pub fn setup_opaque_render_state<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
    ) -> Result<(), RenderError> {
        ctx.set_depth_test(true)?;
        ctx.set_face_cull(true)?;
        ctx.set_blend(false)
    }

    /// Draw and clear the queue. Returns the number of models drawn.
    pub fn flush_opaque<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        mode: RenderMode,
    ) -> Result<usize, RenderError> {
        let count = self.opaque.len();
        for draw in self.opaque.drain(..) {
            ctx.set_uniform(names::MODEL, draw.transform)?;
            if mode == RenderMode::MaterialRequired {
                ctx.set_uniform(names::ALBEDO, draw.albedo)?;
            }
            ctx.draw(Geometry::Sphere)?;
        }
        Ok(count)
    }
}

/// Scene contents consumed by the passes.
pub trait Scene {
    fn add_opaque_models_to_renderer(&self, renderer: &mut ModelRenderer);
    fn add_opaque_static_models_to_renderer(&self, renderer: &mut ModelRenderer);
    fn terrain(&self) -> Option<TerrainDraw>;
    fn skybox(&self) -> CubemapId;
    fn sun(&self) -> DirectionalLight;
}

/// A [`Scene3D`] with its skybox uploaded to the device.
pub struct GpuScene {
    scene: Scene3D,
    skybox: Cubemap,
}

impl GpuScene {
    pub fn upload<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        scene: Scene3D,
        skybox_resolution: u32,
    ) -> Result<Self, RenderError> {
        let skybox = Cubemap::new(
            ctx,
            &CubemapDesc {
                label: "skybox",
                size: skybox_resolution,
                mip_count: 1,
                format: TextureFormat::Rgba16Float,
            },
        )?;
        let mut gpu = Self { scene, skybox };
        gpu.refresh_skybox(ctx)?;
        Ok(gpu)
    }

    /// Re-render the skybox description into the cubemap.
    pub fn refresh_skybox<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
    ) -> Result<(), RenderError> {
        let size = self.skybox.size();
        let sky = self.scene.skybox();
        for face in CubeFace::ALL {
            let mut texels = Vec::with_capacity((size * size) as usize);
            for y in 0..size {
                for x in 0..size {
                    let u = (x as f32 + 0.5) / size as f32;
                    let v = (y as f32 + 0.5) / size as f32;
                    texels.push(sky.radiance(face.direction(u, v)).extend(1.0));
                }
            }
            ctx.device_mut()
                .write_cubemap_face(self.skybox.id(), face, 0, &texels)?;
        }
        tracing::debug!(size, "skybox uploaded");
        Ok(())
    }

    pub fn scene(&self) -> &Scene3D {
        &self.scene
    }

    /// Mutable access to the scene. Call [`GpuScene::refresh_skybox`] after
    /// changing the skybox.
    pub fn scene_mut(&mut self) -> &mut Scene3D {
        &mut self.scene
    }

    pub fn skybox_cubemap(&self) -> &Cubemap {
        &self.skybox
    }

    fn queue(&self, renderer: &mut ModelRenderer, static_only: bool) {
        for model in self.scene.opaque_models(static_only) {
            renderer.submit_opaque(ModelDraw {
                transform: model.transform.matrix(),
                albedo: model.albedo,
            });
        }
    }
}

impl Scene for GpuScene {
    fn add_opaque_models_to_renderer(&self, renderer: &mut ModelRenderer) {
        self.queue(renderer, false);
    }

    fn add_opaque_static_models_to_renderer(&self, renderer: &mut ModelRenderer) {
        self.queue(renderer, true);
    }

    fn terrain(&self) -> Option<TerrainDraw> {
        self.scene.terrain().map(|t| TerrainDraw {
            transform: t.transform.matrix(),
            albedo: t.albedo,
        })
    }

    fn skybox(&self) -> CubemapId {
        self.skybox.id()
    }

    fn sun(&self) -> DirectionalLight {
        let sun = self.scene.sun();
        DirectionalLight {
            direction: sun.direction,
            color: sun.color,
            ambient: sun.ambient,
        }
    }
}
