use radiance_common::{mip_extent, CubeFace, IblSettings, RenderError, TextureFormat};

use crate::camera::{Camera, CubemapCamera};
use crate::context::RenderContext;
use crate::device::{AttachmentTarget, CubemapDesc, CubemapId, Geometry, GraphicsDevice, ShaderKind};
use crate::resource::{Cubemap, Framebuffer};
use crate::uniforms::names;

const ENVIRONMENT_UNIT: u32 = 0;

/// GGX importance sampling of an environment cubemap, one roughness level
/// per mip.
pub struct ImportanceSamplingPass {
    framebuffer: Framebuffer,
    camera: CubemapCamera,
    settings: IblSettings,
}

impl ImportanceSamplingPass {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        settings: &IblSettings,
    ) -> Result<Self, RenderError> {
        let resolution = settings.reflection_probe_resolution;
        let framebuffer = Framebuffer::builder(resolution, resolution)
            .label("reflection_probe_sampling")
            .add_color_slot(TextureFormat::Rgba16Float)
            .add_depth()
            .build(ctx)?;
        ctx.load_shader(ShaderKind::ImportanceSampling)?;
        Ok(Self {
            framebuffer,
            camera: CubemapCamera::new(
                glam::Vec3::ZERO,
                settings.capture_near,
                settings.capture_far,
            ),
            settings: settings.clone(),
        })
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    /// Prefilter `environment` into a new mip-chained cubemap.
    pub fn prefilter<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        environment: CubemapId,
    ) -> Result<Cubemap, RenderError> {
        let resolution = self.settings.reflection_probe_resolution;
        let mip_count = self.settings.reflection_probe_mip_count;
        let _span =
            tracing::debug_span!("importance_sampling_pass", resolution, mip_count).entered();
        let prefiltered = Cubemap::new(
            ctx,
            &CubemapDesc {
                label: "prefilter",
                size: resolution,
                mip_count,
                format: TextureFormat::Rgba16Float,
            },
        )?;

        let mut gfx = ctx.scoped();
        gfx.bind_cubemap(ENVIRONMENT_UNIT, environment);
        let drawn = self.draw_mips(&mut gfx, prefiltered.id());
        gfx.unbind_unit(ENVIRONMENT_UNIT);
        drawn?;
        Ok(prefiltered)
    }

    fn draw_mips<D: GraphicsDevice>(
        &mut self,
        gfx: &mut RenderContext<D>,
        prefiltered: CubemapId,
    ) -> Result<(), RenderError> {
        let resolution = self.settings.reflection_probe_resolution;
        gfx.switch_shader(ShaderKind::ImportanceSampling)?;
        gfx.set_face_cull(false)?;
        gfx.set_depth_test(false)?;
        gfx.set_uniform(names::PROJECTION, self.camera.projection_matrix())?;
        gfx.set_uniform(names::SAMPLE_COUNT, self.settings.prefilter_sample_count)?;
        gfx.set_uniform(names::SCENE_CAPTURE_CUBEMAP, ENVIRONMENT_UNIT)?;
        gfx.bind_framebuffer(&self.framebuffer)?;

        for mip in 0..self.settings.reflection_probe_mip_count {
            let size = mip_extent(resolution, mip);
            let roughness = self.settings.mip_roughness(mip);
            self.framebuffer.resize_depth_attachment(gfx, size, size)?;
            gfx.set_viewport(size, size)?;
            gfx.set_uniform(names::ROUGHNESS, roughness)?;

            for face in CubeFace::ALL {
                self.camera.switch_to_face(face);
                gfx.set_uniform(names::VIEW, self.camera.view_matrix())?;
                let target = AttachmentTarget::CubeFace {
                    cubemap: prefiltered,
                    face,
                    mip,
                };
                self.framebuffer
                    .with_color_attachment(gfx, target, |g| g.draw(Geometry::NdcCube))?;
            }
            tracing::debug!(mip, size, roughness, "prefiltered mip");
        }
        self.framebuffer
            .resize_depth_attachment(gfx, resolution, resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareDevice;
    use glam::Vec4;

    #[test]
    fn framebuffer_is_restored_after_prefiltering() {
        let mut ctx = RenderContext::new(SoftwareDevice::new()).unwrap();
        let settings = IblSettings::preview();
        let size = settings.reflection_probe_resolution;
        let environment = Cubemap::new(
            &mut ctx,
            &CubemapDesc {
                label: "environment",
                size: 4,
                mip_count: 1,
                format: TextureFormat::Rgba16Float,
            },
        )
        .unwrap();
        for face in CubeFace::ALL {
            ctx.device_mut()
                .write_cubemap_face(environment.id(), face, 0, &[Vec4::ONE; 16])
                .unwrap();
        }
        let mut pass = ImportanceSamplingPass::new(&mut ctx, &settings).unwrap();

        let prefiltered = pass.prefilter(&mut ctx, environment.id()).unwrap();
        assert_eq!(prefiltered.mip_count(), settings.reflection_probe_mip_count);

        let framebuffer = pass.framebuffer();
        assert_eq!(
            ctx.device().color_attachment(framebuffer.id(), 0).unwrap(),
            AttachmentTarget::None
        );
        assert_eq!(framebuffer.depth_extent(), Some((size, size)));
        assert_eq!(ctx.device().bound_unit(ENVIRONMENT_UNIT), None);
    }

    #[test]
    fn environment_unit_is_released_when_a_draw_fails() {
        let mut ctx = RenderContext::new(SoftwareDevice::new()).unwrap();
        let settings = IblSettings::preview();
        let mut pass = ImportanceSamplingPass::new(&mut ctx, &settings).unwrap();
        let environment = Cubemap::new(
            &mut ctx,
            &CubemapDesc {
                label: "environment",
                size: 4,
                mip_count: 1,
                format: TextureFormat::Rgba16Float,
            },
        )
        .unwrap();
        let dead = environment.id();
        drop(environment);
        ctx.collect_garbage();

        assert!(pass.prefilter(&mut ctx, dead).is_err());
        assert_eq!(ctx.device().bound_unit(ENVIRONMENT_UNIT), None);
        assert_eq!(
            ctx.device().color_attachment(pass.framebuffer().id(), 0).unwrap(),
            AttachmentTarget::None
        );
    }
}
