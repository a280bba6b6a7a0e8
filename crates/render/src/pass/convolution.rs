use radiance_common::{CubeFace, IblSettings, RenderError, TextureFormat};

use crate::camera::{Camera, CubemapCamera};
use crate::context::RenderContext;
use crate::device::{AttachmentTarget, CubemapDesc, CubemapId, Geometry, GraphicsDevice, ShaderKind};
use crate::resource::{Cubemap, Framebuffer};
use crate::uniforms::names;

const ENVIRONMENT_UNIT: u32 = 0;

/// Diffuse irradiance convolution of an environment cubemap.
pub struct ConvolutionPass {
    framebuffer: Framebuffer,
    camera: CubemapCamera,
    resolution: u32,
    sample_delta: f32,
}

impl ConvolutionPass {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        settings: &IblSettings,
    ) -> Result<Self, RenderError> {
        let resolution = settings.light_probe_resolution;
        let framebuffer = Framebuffer::builder(resolution, resolution)
            .label("light_probe_convolution")
            .add_color_slot(TextureFormat::Rgba16Float)
            .add_depth()
            .build(ctx)?;
        ctx.load_shader(ShaderKind::IrradianceConvolution)?;
        Ok(Self {
            framebuffer,
            camera: CubemapCamera::new(
                glam::Vec3::ZERO,
                settings.capture_near,
                settings.capture_far,
            ),
            resolution,
            sample_delta: settings.irradiance_sample_delta,
        })
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    /// Convolve `environment` into a new irradiance cubemap.
    pub fn convolve<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        environment: CubemapId,
    ) -> Result<Cubemap, RenderError> {
        let _span = tracing::debug_span!("convolution_pass", resolution = self.resolution).entered();
        let irradiance = Cubemap::new(
            ctx,
            &CubemapDesc {
                label: "irradiance",
                size: self.resolution,
                mip_count: 1,
                format: TextureFormat::Rgba16Float,
            },
        )?;

        let mut gfx = ctx.scoped();
        gfx.bind_cubemap(ENVIRONMENT_UNIT, environment);
        let drawn = self.draw_faces(&mut gfx, irradiance.id());
        gfx.unbind_unit(ENVIRONMENT_UNIT);
        drawn?;
        Ok(irradiance)
    }

    fn draw_faces<D: GraphicsDevice>(
        &mut self,
        gfx: &mut RenderContext<D>,
        irradiance: CubemapId,
    ) -> Result<(), RenderError> {
        gfx.switch_shader(ShaderKind::IrradianceConvolution)?;
        gfx.set_face_cull(false)?;
        gfx.set_depth_test(false)?;
        gfx.set_uniform(names::PROJECTION, self.camera.projection_matrix())?;
        gfx.set_uniform(names::SAMPLE_DELTA, self.sample_delta)?;
        gfx.set_uniform(names::SCENE_CAPTURE_CUBEMAP, ENVIRONMENT_UNIT)?;
        gfx.bind_framebuffer(&self.framebuffer)?;
        gfx.set_viewport(self.resolution, self.resolution)?;

        for face in CubeFace::ALL {
            self.camera.switch_to_face(face);
            gfx.set_uniform(names::VIEW, self.camera.view_matrix())?;
            let target = AttachmentTarget::CubeFace {
                cubemap: irradiance,
                face,
                mip: 0,
            };
            self.framebuffer
                .with_color_attachment(gfx, target, |g| g.draw(Geometry::NdcCube))?;
            tracing::trace!(?face, "irradiance face convolved");
        }
        Ok(())
    }
}
