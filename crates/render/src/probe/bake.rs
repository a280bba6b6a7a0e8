//! IBL baking.
//!
//! # Invariants
//! - Every cubemap produced has all six faces of every mip rendered.
//! - The render state on return equals the state on entry, on success and
//!   on failure.
//! - Color slots of the capture and filter framebuffers are detached after
//!   every face.

use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use glam::Vec3;
use radiance_common::{CubeFace, IblSettings, RenderError, TextureFormat};
use radiance_scene::SceneEvent;

use crate::camera::CubemapCamera;
use crate::context::RenderContext;
use crate::device::{
    AttachmentTarget, CubemapDesc, CubemapId, Geometry, GraphicsDevice, ShaderKind, TextureDesc,
};
use crate::pass::{
    ConvolutionPass, ImportanceSamplingPass, LightingPass, PassContext, PassInput, RenderPass,
    ShadowmapPass,
};
use crate::probe::{LightProbe, ProbeManager, ReflectionProbe};
use crate::resource::{Cubemap, Framebuffer, Texture};
use crate::scene::{GpuScene, Scene};
use crate::uniforms::names;

/// Summary of one bake call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BakeReport {
    pub light_probes: usize,
    pub reflection_probes: usize,
    pub brdf_lut: bool,
    /// Cubemap faces rendered, counting every mip.
    pub faces_rendered: u32,
    pub elapsed: Duration,
}

impl fmt::Display for BakeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} light probe(s), {} reflection probe(s), {} face(s)",
            self.light_probes, self.reflection_probes, self.faces_rendered
        )?;
        if self.brdf_lut {
            write!(f, ", BRDF LUT")?;
        }
        write!(f, " in {:.1?}", self.elapsed)
    }
}

/// Bakes light probes, reflection probes and the BRDF lookup table.
///
/// Scene captures render static geometry only: six shadow + lighting
/// sub-passes from the probe position into one capture cubemap. That
/// capture is then convolved (light probe) or importance sampled per mip
/// (reflection probe).
pub struct ProbePass {
    settings: IblSettings,
    camera: CubemapCamera,
    capture: Cubemap,
    capture_framebuffer: Rc<Framebuffer>,
    shadow: RenderPass,
    lighting: RenderPass,
    convolution: RenderPass,
    importance: RenderPass,
}

impl ProbePass {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        settings: IblSettings,
    ) -> Result<Self, RenderError> {
        settings.validate()?;
        let resolution = settings.capture_resolution;
        let capture = Cubemap::new(
            ctx,
            &CubemapDesc {
                label: "scene_capture",
                size: resolution,
                mip_count: 1,
                format: TextureFormat::Rgba16Float,
            },
        )?;
        let capture_framebuffer = Rc::new(
            Framebuffer::builder(resolution, resolution)
                .label("scene_capture")
                .add_color_slot(TextureFormat::Rgba16Float)
                .add_depth()
                .build(ctx)?,
        );
        let shadow = RenderPass::Shadow(ShadowmapPass::new(
            ctx,
            settings.shadowmap_resolution,
            settings.shadow_extent,
        )?);
        let lighting = RenderPass::Lighting(LightingPass::new(
            ctx,
            Rc::clone(&capture_framebuffer),
            settings.shadow_bias,
        )?);
        let convolution = RenderPass::Convolution(ConvolutionPass::new(ctx, &settings)?);
        let importance = RenderPass::ImportanceSampling(ImportanceSamplingPass::new(ctx, &settings)?);
        ctx.load_shader(ShaderKind::BrdfIntegration)?;

        Ok(Self {
            camera: CubemapCamera::new(Vec3::ZERO, settings.capture_near, settings.capture_far),
            settings,
            capture,
            capture_framebuffer,
            shadow,
            lighting,
            convolution,
            importance,
        })
    }

    pub fn settings(&self) -> &IblSettings {
        &self.settings
    }

    pub fn capture_framebuffer(&self) -> &Framebuffer {
        &self.capture_framebuffer
    }

    /// Startup bake: the BRDF LUT plus light and reflection fallback probes
    /// filtered straight from the skybox.
    pub fn pregenerate_ibl<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        probes: &mut ProbeManager,
    ) -> Result<BakeReport, RenderError> {
        let _span = tracing::info_span!("pregenerate_ibl").entered();
        let start = Instant::now();
        ctx.collect_garbage();
        let mut gfx = ctx.scoped();

        let lut = self.generate_brdf_lut(&mut gfx)?;
        probes.set_brdf_lut(lut);

        let skybox = scene.skybox();
        let irradiance = self.convolve(&mut gfx, scene, skybox)?;
        probes.set_light_probe_fallback(LightProbe::new(Vec3::ZERO, irradiance));
        let prefiltered = self.prefilter(&mut gfx, scene, skybox)?;
        probes.set_reflection_probe_fallback(ReflectionProbe::new(Vec3::ZERO, prefiltered));

        let report = BakeReport {
            light_probes: 1,
            reflection_probes: 1,
            brdf_lut: true,
            faces_rendered: self.filter_faces(),
            elapsed: start.elapsed(),
        };
        tracing::info!(%report, "IBL pregenerated");
        Ok(report)
    }

    /// Bake a light and a reflection probe at each position. Each position
    /// is captured once and both probes are derived from that capture.
    pub fn pregenerate_probes<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        probes: &mut ProbeManager,
        positions: &[Vec3],
    ) -> Result<BakeReport, RenderError> {
        let _span = tracing::info_span!("pregenerate_probes", count = positions.len()).entered();
        let start = Instant::now();
        ctx.collect_garbage();
        let mut gfx = ctx.scoped();
        let mut report = BakeReport::default();

        for &position in positions {
            self.capture_scene(&mut gfx, scene, position)?;
            let capture = self.capture.id();
            let irradiance = self.convolve(&mut gfx, scene, capture)?;
            let prefiltered = self.prefilter(&mut gfx, scene, capture)?;
            probes.add_probe(LightProbe::new(position, irradiance));
            probes.add_probe(ReflectionProbe::new(position, prefiltered));

            report.light_probes += 1;
            report.reflection_probes += 1;
            report.faces_rendered += CubeFace::COUNT as u32 + self.filter_faces();
            tracing::debug!(?position, "probe baked");
        }

        report.elapsed = start.elapsed();
        tracing::info!(%report, "scene probes baked");
        Ok(report)
    }

    /// Rebake scene probes when something a capture would see changed since
    /// the scene's event log was last drained. A skybox change also refreshes
    /// the skybox upload and the fallbacks. The log is drained only once the
    /// bake succeeds, so a failed rebake is retried on the next call.
    pub fn rebake_if_stale<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &mut GpuScene,
        probes: &mut ProbeManager,
    ) -> Result<Option<BakeReport>, RenderError> {
        if !scene.scene().needs_probe_rebake() {
            scene.scene_mut().drain_events();
            return Ok(None);
        }
        let sky_changed = scene
            .scene()
            .events()
            .iter()
            .any(|event| matches!(event, SceneEvent::SkyboxChanged));

        let mut report = BakeReport::default();
        if sky_changed {
            scene.refresh_skybox(ctx)?;
            report = self.pregenerate_ibl(ctx, &*scene, probes)?;
        }
        probes.clear_scene_probes();
        let positions = scene.scene().probe_placements().to_vec();
        let baked = self.pregenerate_probes(ctx, &*scene, probes, &positions)?;
        report.light_probes += baked.light_probes;
        report.reflection_probes += baked.reflection_probes;
        report.faces_rendered += baked.faces_rendered;
        report.elapsed += baked.elapsed;

        let events = scene.scene_mut().drain_events().len();
        tracing::info!(events, %report, "stale probes rebaked");
        Ok(Some(report))
    }

    pub fn generate_light_probe<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        position: Vec3,
    ) -> Result<LightProbe, RenderError> {
        let _span = tracing::debug_span!("light_probe", ?position).entered();
        let mut gfx = ctx.scoped();
        self.capture_scene(&mut gfx, scene, position)?;
        let capture = self.capture.id();
        let irradiance = self.convolve(&mut gfx, scene, capture)?;
        Ok(LightProbe::new(position, irradiance))
    }

    pub fn generate_reflection_probe<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        position: Vec3,
    ) -> Result<ReflectionProbe, RenderError> {
        let _span = tracing::debug_span!("reflection_probe", ?position).entered();
        let mut gfx = ctx.scoped();
        self.capture_scene(&mut gfx, scene, position)?;
        let capture = self.capture.id();
        let prefiltered = self.prefilter(&mut gfx, scene, capture)?;
        Ok(ReflectionProbe::new(position, prefiltered))
    }

    /// Integrate the split-sum BRDF into a (scale, bias) table indexed by
    /// (N.V, roughness).
    pub fn generate_brdf_lut<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
    ) -> Result<Texture, RenderError> {
        let resolution = self.settings.brdf_lut_resolution;
        let _span = tracing::debug_span!("brdf_lut", resolution).entered();
        let lut = Texture::new(
            ctx,
            &TextureDesc {
                label: "brdf_lut",
                width: resolution,
                height: resolution,
                format: TextureFormat::Rg16Float,
            },
        )?;
        let framebuffer = Framebuffer::builder(resolution, resolution)
            .label("brdf_integration")
            .add_color_slot(TextureFormat::Rg16Float)
            .add_depth()
            .build(ctx)?;

        let mut gfx = ctx.scoped();
        gfx.bind_framebuffer(&framebuffer)?;
        gfx.set_viewport(resolution, resolution)?;
        gfx.switch_shader(ShaderKind::BrdfIntegration)?;
        gfx.set_depth_test(false)?;
        gfx.set_uniform(names::SAMPLE_COUNT, self.settings.brdf_sample_count)?;
        framebuffer.with_color_attachment(&mut gfx, AttachmentTarget::Texture(lut.id()), |g| {
            g.draw(Geometry::NdcPlane)
        })?;
        Ok(lut)
    }

    /// Faces rendered by one convolution plus one prefilter.
    fn filter_faces(&self) -> u32 {
        CubeFace::COUNT as u32 * (1 + self.settings.reflection_probe_mip_count)
    }

    fn capture_scene<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        position: Vec3,
    ) -> Result<(), RenderError> {
        let _span = tracing::debug_span!("scene_capture", ?position).entered();
        self.camera.set_position(position);
        let capture = self.capture.id();

        for face in CubeFace::ALL {
            self.camera.switch_to_face(face);
            let shadowmap = {
                let mut cx = PassContext {
                    gfx: &mut *ctx,
                    scene,
                    camera: &self.camera,
                    render_only_static: true,
                };
                self.shadow
                    .execute(&mut cx, PassInput::None)?
                    .into_shadowmap()?
            };

            let target = AttachmentTarget::CubeFace {
                cubemap: capture,
                face,
                mip: 0,
            };
            let camera = &self.camera;
            let lighting = &mut self.lighting;
            self.capture_framebuffer
                .with_color_attachment(ctx, target, |gfx| {
                    let mut cx = PassContext {
                        gfx,
                        scene,
                        camera,
                        render_only_static: true,
                    };
                    lighting
                        .execute(&mut cx, PassInput::Shadowmap(&shadowmap))?
                        .into_lighting()
                })?;
            tracing::trace!(?face, "face captured");
        }
        Ok(())
    }

    fn convolve<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        environment: CubemapId,
    ) -> Result<Cubemap, RenderError> {
        let mut cx = PassContext {
            gfx: ctx,
            scene,
            camera: &self.camera,
            render_only_static: true,
        };
        self.convolution
            .execute(&mut cx, PassInput::Environment(environment))?
            .into_cubemap()
    }

    fn prefilter<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        scene: &dyn Scene,
        environment: CubemapId,
    ) -> Result<Cubemap, RenderError> {
        let mut cx = PassContext {
            gfx: ctx,
            scene,
            camera: &self.camera,
            render_only_static: true,
        };
        self.importance
            .execute(&mut cx, PassInput::Environment(environment))?
            .into_cubemap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ResourceHandle;
    use crate::scene::{DirectionalLight, ModelRenderer, TerrainDraw};
    use crate::software::SoftwareDevice;
    use glam::Vec4;
    use radiance_common::Transform;
    use radiance_scene::{Scene3D, SceneModel, Skybox, Terrain};

    const SKY: Vec3 = Vec3::new(0.3, 0.5, 0.7);

    fn context() -> RenderContext<SoftwareDevice> {
        RenderContext::new(SoftwareDevice::new()).unwrap()
    }

    fn solid_sky_scene(ctx: &mut RenderContext<SoftwareDevice>) -> GpuScene {
        let scene = Scene3D::with_skybox(Skybox::Solid { color: SKY });
        GpuScene::upload(ctx, scene, 8).unwrap()
    }

    fn furnished_scene(ctx: &mut RenderContext<SoftwareDevice>) -> GpuScene {
        let mut scene = Scene3D::with_skybox(Skybox::Solid { color: SKY });
        scene.spawn_model(SceneModel::new(
            Transform::from_position(Vec3::new(3.0, 1.0, 0.0)),
            Vec4::new(0.9, 0.1, 0.1, 1.0),
        ));
        scene.set_terrain(Some(Terrain {
            transform: Transform {
                scale: Vec3::new(50.0, 1.0, 50.0),
                ..Transform::default()
            },
            albedo: Vec4::new(0.2, 0.6, 0.2, 1.0),
        }));
        GpuScene::upload(ctx, scene, 8).unwrap()
    }

    fn assert_faces_complete(ctx: &RenderContext<SoftwareDevice>, cube: &Cubemap) {
        for mip in 0..cube.mip_count() {
            let written = ctx.device().faces_written(cube.id(), mip).unwrap();
            assert_eq!(written, [true; 6], "mip {mip}");
        }
    }

    #[test]
    fn solid_skybox_convolves_to_its_color() {
        let mut ctx = context();
        let scene = solid_sky_scene(&mut ctx);
        let mut probes = ProbeManager::new();
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();

        pass.pregenerate_ibl(&mut ctx, &scene, &mut probes).unwrap();

        let fallback = probes.light_probe_fallback().unwrap();
        assert_eq!(fallback.position(), Vec3::ZERO);
        let irradiance = fallback.irradiance_map().id();
        for face in CubeFace::ALL {
            let texels = ctx
                .device_mut()
                .read_cubemap_face(irradiance, face, 0)
                .unwrap();
            assert_eq!(texels.len(), 16);
            for texel in texels {
                assert!(texel.truncate().abs_diff_eq(SKY, 1e-4), "{face:?}: {texel}");
            }
        }

        let reflection = probes.reflection_probe_fallback().unwrap().prefilter_map();
        for mip in 0..reflection.mip_count() {
            for face in CubeFace::ALL {
                let texels = ctx
                    .device_mut()
                    .read_cubemap_face(reflection.id(), face, mip)
                    .unwrap();
                let size = reflection.mip_size(mip) as usize;
                assert_eq!(texels.len(), size * size);
                assert!(texels.iter().all(|t| t.truncate().abs_diff_eq(SKY, 1e-4)));
            }
        }
    }

    #[test]
    fn every_face_of_every_mip_is_rendered() {
        let mut ctx = context();
        let scene = furnished_scene(&mut ctx);
        let mut probes = ProbeManager::new();
        let settings = IblSettings::preview();
        let mips = settings.reflection_probe_mip_count;
        let mut pass = ProbePass::new(&mut ctx, settings).unwrap();

        let ibl = pass.pregenerate_ibl(&mut ctx, &scene, &mut probes).unwrap();
        assert_eq!(ibl.faces_rendered, 6 * (1 + mips));

        let report = pass
            .pregenerate_probes(&mut ctx, &scene, &mut probes, &[Vec3::new(0.0, 2.0, 0.0)])
            .unwrap();
        assert_eq!(report.light_probes, 1);
        assert_eq!(report.reflection_probes, 1);
        assert_eq!(report.faces_rendered, 6 + 6 * (1 + mips));

        assert_faces_complete(&ctx, &pass.capture);
        assert_faces_complete(&ctx, probes.light_probes()[0].irradiance_map());
        let reflection = probes.reflection_probes()[0].prefilter_map();
        assert_eq!(reflection.mip_count(), mips);
        assert_faces_complete(&ctx, reflection);
        assert_faces_complete(&ctx, probes.reflection_probe_fallback().unwrap().prefilter_map());
    }

    #[test]
    fn bake_leaves_render_state_untouched() {
        let mut ctx = context();
        let scene = furnished_scene(&mut ctx);
        let mut probes = ProbeManager::new();
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();

        ctx.set_face_cull(false).unwrap();
        ctx.set_stencil_test(true).unwrap();
        ctx.set_stencil_write_mask(0x0F).unwrap();
        ctx.set_depth_test(false).unwrap();
        let before = *ctx.state();

        pass.pregenerate_ibl(&mut ctx, &scene, &mut probes).unwrap();
        assert_eq!(*ctx.state(), before);
        pass.pregenerate_probes(&mut ctx, &scene, &mut probes, &[Vec3::Y])
            .unwrap();
        assert_eq!(*ctx.state(), before);
        assert_eq!(ctx.device().applied_state(), &before);

        assert_eq!(
            ctx.device()
                .color_attachment(pass.capture_framebuffer().id(), 0)
                .unwrap(),
            AttachmentTarget::None
        );
    }

    #[test]
    fn filter_framebuffers_end_detached() {
        let mut ctx = context();
        let scene = furnished_scene(&mut ctx);
        let mut probes = ProbeManager::new();
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();

        pass.pregenerate_ibl(&mut ctx, &scene, &mut probes).unwrap();
        pass.pregenerate_probes(&mut ctx, &scene, &mut probes, &[Vec3::Y])
            .unwrap();

        for filter in [&pass.convolution, &pass.importance] {
            let framebuffer = filter.framebuffer();
            assert_eq!(
                ctx.device().color_attachment(framebuffer.id(), 0).unwrap(),
                AttachmentTarget::None,
                "{}",
                filter.name()
            );
        }
        for unit in 0..2 {
            assert_eq!(ctx.device().bound_unit(unit), None, "unit {unit}");
        }
    }

    #[test]
    fn stale_probes_are_rebaked_once() {
        let mut ctx = context();
        let mut scene = furnished_scene(&mut ctx);
        let mut probes = ProbeManager::new();
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();
        pass.pregenerate_ibl(&mut ctx, &scene, &mut probes).unwrap();

        scene.scene_mut().place_probe(Vec3::Y);
        let report = pass
            .rebake_if_stale(&mut ctx, &mut scene, &mut probes)
            .unwrap()
            .unwrap();
        assert_eq!(report.light_probes, 1);
        assert_eq!(report.reflection_probes, 1);
        assert!(!report.brdf_lut);
        assert!(scene.scene().events().is_empty());
        assert!(pass
            .rebake_if_stale(&mut ctx, &mut scene, &mut probes)
            .unwrap()
            .is_none());

        // Dynamic models never show up in captures.
        scene.scene_mut().spawn_model(
            SceneModel::new(Transform::from_position(Vec3::X), Vec4::ONE).dynamic(),
        );
        assert!(pass
            .rebake_if_stale(&mut ctx, &mut scene, &mut probes)
            .unwrap()
            .is_none());
        assert!(scene.scene().events().is_empty());

        scene.scene_mut().set_skybox(Skybox::Solid { color: Vec3::ONE });
        let report = pass
            .rebake_if_stale(&mut ctx, &mut scene, &mut probes)
            .unwrap()
            .unwrap();
        assert!(report.brdf_lut);
        assert_eq!(report.light_probes, 2);
        assert_eq!(probes.light_probes().len(), 1);
        assert_eq!(probes.reflection_probes().len(), 1);
        let fallback = probes.light_probe_fallback().unwrap().irradiance_map().id();
        let texels = ctx
            .device_mut()
            .read_cubemap_face(fallback, CubeFace::PositiveY, 0)
            .unwrap();
        assert!(texels.iter().all(|t| t.truncate().abs_diff_eq(Vec3::ONE, 1e-4)));
    }

    #[test]
    fn capture_sees_static_geometry() {
        let mut ctx = context();
        let scene = furnished_scene(&mut ctx);
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();
        pass.generate_light_probe(&mut ctx, &scene, Vec3::new(0.0, 1.0, 0.0))
            .unwrap();

        // Looking down from the probe the capture sees lit terrain, not sky.
        let down = ctx
            .device_mut()
            .read_cubemap_face(pass.capture.id(), CubeFace::NegativeY, 0)
            .unwrap();
        let centre = down[8 * 16 + 8];
        assert!(centre.y > centre.x && centre.y > centre.z, "{centre}");
        // Looking along +X the sphere is in the middle of the face.
        let side = ctx
            .device_mut()
            .read_cubemap_face(pass.capture.id(), CubeFace::PositiveX, 0)
            .unwrap();
        let centre = side[8 * 16 + 8];
        assert!(centre.x > centre.y && centre.x > centre.z, "{centre}");
    }

    #[test]
    fn reflection_probe_mips_shrink() {
        let mut ctx = context();
        let scene = solid_sky_scene(&mut ctx);
        let settings = IblSettings::preview();
        let mut pass = ProbePass::new(&mut ctx, settings.clone()).unwrap();
        let probe = pass
            .generate_reflection_probe(&mut ctx, &scene, Vec3::new(1.0, 2.0, 3.0))
            .unwrap();
        let map = probe.prefilter_map();
        assert_eq!(map.size(), settings.reflection_probe_resolution);
        for mip in 0..map.mip_count() {
            let texels = ctx
                .device_mut()
                .read_cubemap_face(map.id(), CubeFace::PositiveZ, mip)
                .unwrap();
            let size = (settings.reflection_probe_resolution >> mip).max(1) as usize;
            assert_eq!(texels.len(), size * size);
        }
    }

    #[test]
    fn single_mip_reflection_probe_is_a_mirror() {
        let mut ctx = context();
        let scene = solid_sky_scene(&mut ctx);
        let settings = IblSettings {
            reflection_probe_mip_count: 1,
            ..IblSettings::preview()
        };
        let mut pass = ProbePass::new(&mut ctx, settings).unwrap();
        let probe = pass
            .generate_reflection_probe(&mut ctx, &scene, Vec3::ZERO)
            .unwrap();
        assert_eq!(probe.prefilter_map().mip_count(), 1);
        let texels = ctx
            .device_mut()
            .read_cubemap_face(probe.prefilter_map().id(), CubeFace::NegativeX, 0)
            .unwrap();
        assert!(texels.iter().all(|t| t.is_finite()));
    }

    #[test]
    fn brdf_lut_is_bounded_and_mirror_like_at_low_roughness() {
        let mut ctx = context();
        let settings = IblSettings::preview();
        let n = settings.brdf_lut_resolution as usize;
        let mut pass = ProbePass::new(&mut ctx, settings).unwrap();
        let lut = pass.generate_brdf_lut(&mut ctx).unwrap();
        assert_eq!(lut.format(), TextureFormat::Rg16Float);

        let texels = ctx.device_mut().read_texture(lut.id()).unwrap();
        assert_eq!(texels.len(), n * n);
        for t in &texels {
            assert!(t.is_finite() && t.x >= 0.0 && t.y >= 0.0, "{t}");
        }
        // Row 0 is the smoothest, the last column the most head-on.
        let smooth_head_on = texels[n - 1];
        assert!(smooth_head_on.x > 0.9, "{smooth_head_on}");
        assert!(smooth_head_on.y < 0.05, "{smooth_head_on}");
    }

    struct MissingSkybox;

    impl Scene for MissingSkybox {
        fn add_opaque_models_to_renderer(&self, _: &mut ModelRenderer) {}
        fn add_opaque_static_models_to_renderer(&self, _: &mut ModelRenderer) {}
        fn terrain(&self) -> Option<TerrainDraw> {
            None
        }
        fn skybox(&self) -> CubemapId {
            CubemapId(u32::MAX)
        }
        fn sun(&self) -> DirectionalLight {
            DirectionalLight {
                direction: Vec3::NEG_Y,
                color: Vec3::ONE,
                ambient: Vec3::ZERO,
            }
        }
    }

    #[test]
    fn failed_bake_restores_state() {
        let mut ctx = context();
        let mut probes = ProbeManager::new();
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();
        ctx.set_face_cull(false).unwrap();
        let before = *ctx.state();

        let err = pass
            .pregenerate_ibl(&mut ctx, &MissingSkybox, &mut probes)
            .unwrap_err();
        assert!(matches!(err, RenderError::UnknownResource(_)), "{err}");
        assert_eq!(*ctx.state(), before);
        assert!(probes.light_probe_fallback().is_none());
        // The LUT finished before the failure and is kept.
        assert!(probes.brdf_lut().is_some());

        // Partially built cubemaps are released.
        ctx.collect_garbage();
        let live = ctx.device().live_cubemaps();
        assert_eq!(live, 1, "only the capture cubemap should remain");
    }

    #[test]
    fn rebake_releases_old_probes() {
        let mut ctx = context();
        let scene = solid_sky_scene(&mut ctx);
        let mut probes = ProbeManager::new();
        let mut pass = ProbePass::new(&mut ctx, IblSettings::preview()).unwrap();
        pass.pregenerate_probes(&mut ctx, &scene, &mut probes, &[Vec3::ZERO])
            .unwrap();
        let old = ResourceHandle::Cubemap(probes.light_probes()[0].irradiance_map().id());

        probes.clear_scene_probes();
        pass.pregenerate_probes(&mut ctx, &scene, &mut probes, &[Vec3::X])
            .unwrap();
        assert!(!ctx.device().is_alive(old));
        assert_eq!(probes.light_probes().len(), 1);
    }
}
