//! CPU reference backend.
//!
//! Draws are ray cast against the built-in meshes and shaded on the CPU with
//! the same fragment logic the GPU shaders implement. Texels are stored as
//! `f32`, so results are deterministic and exact enough to test against.
//!
//! # Invariants
//!
//! - A draw never leaves a target image detached: targets are taken out of
//!   their resources for the duration of the draw and always put back.
//! - Sampling a resource that is also a target of the same draw is a
//!   [`RenderError::FeedbackLoop`].

pub mod kernels;
mod raster;

use std::collections::{BTreeMap, BTreeSet};

use glam::{Vec2, Vec3, Vec4};
use radiance_common::{mip_extent, CubeFace, RenderError, TextureFormat};

use crate::device::{
    AttachmentTarget, ClearValues, CubemapDesc, CubemapId, FramebufferDesc, FramebufferId,
    Geometry, GraphicsDevice, ResourceHandle, SampledResource, ShaderKind, TextureDesc, TextureId,
};
use crate::state::RenderState;
use crate::uniforms::{UniformBlock, UniformValue};

use raster::{Fragment, Rasterizer};

/// A row-major image with row 0 at the top.
#[derive(Debug, Clone, Default)]
struct Image {
    width: u32,
    height: u32,
    texels: Vec<Vec4>,
}

impl Image {
    fn filled(width: u32, height: u32, value: Vec4) -> Self {
        Self {
            width,
            height,
            texels: vec![value; (width * height) as usize],
        }
    }

    fn fetch(&self, x: i64, y: i64) -> Vec4 {
        let x = x.clamp(0, self.width as i64 - 1) as u32;
        let y = y.clamp(0, self.height as i64 - 1) as u32;
        self.texels[(y * self.width + x) as usize]
    }

    /// Bilinear, clamp-to-edge lookup at normalized `(u, v)`.
    fn sample(&self, u: f32, v: f32) -> Vec4 {
        if self.texels.is_empty() {
            return Vec4::ZERO;
        }
        let x = u * self.width as f32 - 0.5;
        let y = v * self.height as f32 - 0.5;
        let (x0, y0) = (x.floor(), y.floor());
        let (tx, ty) = (x - x0, y - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);
        let top = self.fetch(x0, y0).lerp(self.fetch(x0 + 1, y0), tx);
        let bottom = self.fetch(x0, y0 + 1).lerp(self.fetch(x0 + 1, y0 + 1), tx);
        top.lerp(bottom, ty)
    }

    /// Nearest lookup at normalized `(u, v)`.
    fn load(&self, u: f32, v: f32) -> Vec4 {
        if self.texels.is_empty() {
            return Vec4::ZERO;
        }
        self.fetch(
            (u * self.width as f32) as i64,
            (v * self.height as f32) as i64,
        )
    }
}

/// Apply the storage rules of `format` to a shaded value.
fn store(format: TextureFormat, value: Vec4) -> Vec4 {
    match format {
        TextureFormat::Rgba8Unorm => value.clamp(Vec4::ZERO, Vec4::ONE),
        TextureFormat::Rg16Float => Vec4::new(value.x, value.y, 0.0, 1.0),
        _ => value,
    }
}

#[derive(Debug)]
struct SoftTexture {
    label: String,
    format: TextureFormat,
    image: Image,
    /// Empty unless the format carries stencil.
    stencil: Vec<u8>,
}

#[derive(Debug)]
struct SoftCubemap {
    label: String,
    format: TextureFormat,
    size: u32,
    mip_count: u32,
    /// Indexed by `mip * 6 + face`.
    faces: Vec<Image>,
    written: Vec<bool>,
}

impl SoftCubemap {
    fn slot(&self, face: CubeFace, mip: u32) -> Result<usize, RenderError> {
        if mip >= self.mip_count {
            return Err(RenderError::UnknownResource(format!(
                "mip {mip} of cubemap `{}` ({} mips)",
                self.label, self.mip_count
            )));
        }
        Ok(mip as usize * 6 + face.index())
    }

    fn sample(&self, dir: Vec3) -> Vec4 {
        let (face, u, v) = CubeFace::from_direction(dir);
        self.faces[face.index()].sample(u, v)
    }
}

#[derive(Debug)]
struct SoftFramebuffer {
    label: String,
    color_formats: Vec<TextureFormat>,
    colors: Vec<AttachmentTarget>,
    depth: Option<TextureId>,
}

/// Counters for the work the device has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub draw_calls: u64,
    pub clears: u64,
    pub fragments: u64,
}

/// The depth-stencil image taken out for a draw.
struct DepthTarget {
    id: TextureId,
    image: Image,
    stencil: Vec<u8>,
}

/// What the active shader samples, resolved before rasterizing.
enum Inputs<'a> {
    None,
    Cubemap(&'a SoftCubemap),
    Shadowmap(&'a SoftTexture),
}

/// A command seen by a recording device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    State(RenderState),
    Draw {
        geometry: Geometry,
        state: RenderState,
    },
}

#[derive(Debug, Default)]
pub struct SoftwareDevice {
    next_id: u32,
    textures: BTreeMap<TextureId, SoftTexture>,
    cubemaps: BTreeMap<CubemapId, SoftCubemap>,
    framebuffers: BTreeMap<FramebufferId, SoftFramebuffer>,
    shaders: BTreeSet<ShaderKind>,
    state: RenderState,
    uniforms: UniformBlock,
    units: BTreeMap<u32, SampledResource>,
    stats: DeviceStats,
    history: Option<Vec<DeviceEvent>>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that keeps every applied state and successful draw.
    pub fn recording() -> Self {
        Self {
            history: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Commands recorded so far; empty unless built with [`Self::recording`].
    pub fn history(&self) -> &[DeviceEvent] {
        self.history.as_deref().unwrap_or_default()
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// State applied by the last [`GraphicsDevice::apply_state`].
    pub fn applied_state(&self) -> &RenderState {
        &self.state
    }

    pub fn uniforms(&self) -> &UniformBlock {
        &self.uniforms
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_cubemaps(&self) -> usize {
        self.cubemaps.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn color_attachment(
        &self,
        framebuffer: FramebufferId,
        slot: usize,
    ) -> Result<AttachmentTarget, RenderError> {
        let fb = self.framebuffer(framebuffer)?;
        fb.colors.get(slot).copied().ok_or_else(|| {
            RenderError::UnknownResource(format!("color slot {slot} of `{}`", fb.label))
        })
    }

    pub fn depth_attachment(
        &self,
        framebuffer: FramebufferId,
    ) -> Result<Option<TextureId>, RenderError> {
        Ok(self.framebuffer(framebuffer)?.depth)
    }

    pub fn bound_unit(&self, unit: u32) -> Option<SampledResource> {
        self.units.get(&unit).copied()
    }

    /// Stencil values of a depth-stencil texture, row-major.
    pub fn read_stencil(&self, texture: TextureId) -> Result<Vec<u8>, RenderError> {
        let tex = self.texture(texture)?;
        if !tex.format.has_stencil() {
            return Err(RenderError::Backend(format!(
                "texture `{}` has no stencil aspect",
                tex.label
            )));
        }
        Ok(tex.stencil.clone())
    }

    /// Which faces of `mip` have been cleared, drawn to or uploaded.
    pub fn faces_written(&self, cubemap: CubemapId, mip: u32) -> Result<[bool; 6], RenderError> {
        let cube = self.cubemap(cubemap)?;
        let base = cube.slot(CubeFace::PositiveX, mip)?;
        let mut written = [false; 6];
        written.copy_from_slice(&cube.written[base..base + 6]);
        Ok(written)
    }

    fn texture(&self, id: TextureId) -> Result<&SoftTexture, RenderError> {
        self.textures
            .get(&id)
            .ok_or_else(|| RenderError::UnknownResource(format!("texture {}", id.0)))
    }

    fn cubemap(&self, id: CubemapId) -> Result<&SoftCubemap, RenderError> {
        self.cubemaps
            .get(&id)
            .ok_or_else(|| RenderError::UnknownResource(format!("cubemap {}", id.0)))
    }

    fn framebuffer(&self, id: FramebufferId) -> Result<&SoftFramebuffer, RenderError> {
        self.framebuffers
            .get(&id)
            .ok_or_else(|| RenderError::UnknownResource(format!("framebuffer {}", id.0)))
    }

    fn target_format(&self, target: AttachmentTarget) -> Result<Option<TextureFormat>, RenderError> {
        Ok(match target {
            AttachmentTarget::None => None,
            AttachmentTarget::Texture(id) => Some(self.texture(id)?.format),
            AttachmentTarget::CubeFace { cubemap, face, mip } => {
                let cube = self.cubemap(cubemap)?;
                cube.slot(face, mip)?;
                Some(cube.format)
            }
        })
    }

    fn target_extent(&self, target: AttachmentTarget) -> Result<Option<(u32, u32)>, RenderError> {
        Ok(match target {
            AttachmentTarget::None => None,
            AttachmentTarget::Texture(id) => {
                let tex = self.texture(id)?;
                Some((tex.image.width, tex.image.height))
            }
            AttachmentTarget::CubeFace { cubemap, mip, .. } => {
                let size = mip_extent(self.cubemap(cubemap)?.size, mip);
                Some((size, size))
            }
        })
    }

    /// Resource bound to `unit`, failing if nothing (or a dead resource) is
    /// bound there.
    fn sampled(&self, unit: u32) -> Result<SampledResource, RenderError> {
        let resource = self.units.get(&unit).copied().ok_or_else(|| {
            RenderError::UnknownResource(format!("nothing bound to sampler unit {unit}"))
        })?;
        match resource {
            SampledResource::Texture(id) => {
                self.texture(id)?;
            }
            SampledResource::Cubemap(id) => {
                self.cubemap(id)?;
            }
        }
        Ok(resource)
    }

    fn sampled_cubemap(&self, unit: u32) -> Result<CubemapId, RenderError> {
        match self.sampled(unit)? {
            SampledResource::Cubemap(id) => Ok(id),
            SampledResource::Texture(id) => Err(RenderError::UnknownResource(format!(
                "sampler unit {unit} holds texture {} where a cubemap is expected",
                id.0
            ))),
        }
    }

    fn sampled_texture(&self, unit: u32) -> Result<TextureId, RenderError> {
        match self.sampled(unit)? {
            SampledResource::Texture(id) => Ok(id),
            SampledResource::Cubemap(id) => Err(RenderError::UnknownResource(format!(
                "sampler unit {unit} holds cubemap {} where a texture is expected",
                id.0
            ))),
        }
    }

    /// Sampled resource of `shader`, if any.
    fn shader_input(&self, shader: ShaderKind) -> Result<Option<SampledResource>, RenderError> {
        let u = &self.uniforms;
        Ok(match shader {
            ShaderKind::Skybox => Some(SampledResource::Cubemap(
                self.sampled_cubemap(u.skybox_unit)?,
            )),
            ShaderKind::IrradianceConvolution | ShaderKind::ImportanceSampling => Some(
                SampledResource::Cubemap(self.sampled_cubemap(u.scene_capture_unit)?),
            ),
            ShaderKind::ForwardLighting => Some(SampledResource::Texture(
                self.sampled_texture(u.shadowmap_unit)?,
            )),
            _ => None,
        })
    }

    fn take_image(&mut self, target: AttachmentTarget) -> Image {
        match target {
            AttachmentTarget::None => Image::default(),
            AttachmentTarget::Texture(id) => self
                .textures
                .get_mut(&id)
                .map(|t| std::mem::take(&mut t.image))
                .unwrap_or_default(),
            AttachmentTarget::CubeFace { cubemap, face, mip } => self
                .cubemaps
                .get_mut(&cubemap)
                .map(|c| std::mem::take(&mut c.faces[mip as usize * 6 + face.index()]))
                .unwrap_or_default(),
        }
    }

    fn put_image(&mut self, target: AttachmentTarget, image: Image, written: bool) {
        match target {
            AttachmentTarget::None => {}
            AttachmentTarget::Texture(id) => {
                if let Some(t) = self.textures.get_mut(&id) {
                    t.image = image;
                }
            }
            AttachmentTarget::CubeFace { cubemap, face, mip } => {
                if let Some(c) = self.cubemaps.get_mut(&cubemap) {
                    let slot = mip as usize * 6 + face.index();
                    c.faces[slot] = image;
                    c.written[slot] |= written;
                }
            }
        }
    }

    /// Check the bound framebuffer can be drawn into and return its extent.
    fn validate_targets(
        &self,
        framebuffer: FramebufferId,
        input: Option<SampledResource>,
    ) -> Result<(u32, u32), RenderError> {
        let fb = self.framebuffer(framebuffer)?;
        let mut extent = None;
        for (slot, &target) in fb.colors.iter().enumerate() {
            let Some(size) = self.target_extent(target)? else {
                return Err(RenderError::UnboundAttachment {
                    framebuffer: framebuffer.0,
                    slot,
                });
            };
            match extent {
                Some(first) if first != size => {
                    return Err(RenderError::AttachmentMismatch {
                        attachment: size,
                        depth: first,
                    });
                }
                _ => extent = Some(size),
            }
            match (target, input) {
                (
                    AttachmentTarget::CubeFace { cubemap, .. },
                    Some(SampledResource::Cubemap(sampled)),
                ) if cubemap == sampled => return Err(RenderError::FeedbackLoop(cubemap.0)),
                (AttachmentTarget::Texture(id), Some(SampledResource::Texture(sampled)))
                    if id == sampled =>
                {
                    return Err(RenderError::FeedbackLoop(id.0));
                }
                _ => {}
            }
        }
        if let Some(depth) = fb.depth {
            let tex = self.texture(depth)?;
            let depth_size = (tex.image.width, tex.image.height);
            if let Some(color) = extent {
                if color != depth_size {
                    return Err(RenderError::AttachmentMismatch {
                        attachment: color,
                        depth: depth_size,
                    });
                }
            }
            if input == Some(SampledResource::Texture(depth)) {
                return Err(RenderError::FeedbackLoop(depth.0));
            }
            extent = Some(depth_size);
        }
        extent.ok_or_else(|| {
            RenderError::Backend(format!("framebuffer `{}` has no attachments", fb.label))
        })
    }

    /// Depth and stencil tests for one fragment. Returns whether the
    /// fragment survives.
    fn depth_stencil(&self, depth: f32, index: usize, target: Option<&mut DepthTarget>) -> bool {
        let state = &self.state;
        let Some(target) = target else {
            return true;
        };
        let stored_depth = target.image.texels[index].x;
        let depth_pass = !state.depth_test || state.depth_func.test(depth, stored_depth);

        if state.stencil_test && !target.stencil.is_empty() {
            let stored = target.stencil[index];
            let stencil_pass = state.stencil_func.passes(stored);
            let op = if !stencil_pass {
                state.stencil_ops.fail
            } else if !depth_pass {
                state.stencil_ops.depth_fail
            } else {
                state.stencil_ops.pass
            };
            let value = op.apply(stored, state.stencil_func.reference);
            let mask = state.stencil_write_mask;
            target.stencil[index] = (stored & !mask) | (value & mask);
            if !stencil_pass {
                return false;
            }
        }
        if !depth_pass {
            return false;
        }
        if state.depth_test {
            target.image.texels[index].x = depth;
        }
        true
    }

    /// Fragment shader outputs, one per color slot.
    fn shade(&self, shader: ShaderKind, fragment: &Fragment, inputs: &Inputs<'_>) -> [Vec4; 3] {
        let u = &self.uniforms;
        let mut out = [Vec4::ZERO; 3];
        match (shader, inputs) {
            (ShaderKind::ModelGeometry | ShaderKind::TerrainGeometry, _) => {
                out[0] = fragment.world_pos.extend(1.0);
                out[1] = fragment.normal.extend(1.0);
                out[2] = u.albedo;
            }
            (ShaderKind::ForwardLighting, Inputs::Shadowmap(shadowmap)) => {
                let shadow = shadow_factor(shadowmap, u, fragment.world_pos);
                let color = kernels::forward_lighting(
                    u.albedo.truncate(),
                    fragment.normal,
                    u.light_direction,
                    u.light_color,
                    u.ambient_color,
                    shadow,
                );
                out[0] = color.extend(u.albedo.w);
            }
            (ShaderKind::Skybox, Inputs::Cubemap(cube)) => {
                out[0] = cube.sample(fragment.direction);
            }
            (ShaderKind::IrradianceConvolution, Inputs::Cubemap(cube)) => {
                out[0] = kernels::irradiance(fragment.direction, u.sample_delta, |d| cube.sample(d))
                    .extend(1.0);
            }
            (ShaderKind::ImportanceSampling, Inputs::Cubemap(cube)) => {
                out[0] = kernels::prefilter(fragment.direction, u.roughness, u.sample_count, |d| {
                    cube.sample(d)
                })
                .extend(1.0);
            }
            (ShaderKind::BrdfIntegration, _) => {
                let ab = kernels::integrate_brdf(fragment.uv.x, fragment.uv.y, u.sample_count);
                out[0] = Vec4::new(ab.x, ab.y, 0.0, 1.0);
            }
            _ => {}
        }
        out
    }
}

/// 1 where `world` is occluded from the light, 0 elsewhere. Points outside
/// the shadowmap are lit.
fn shadow_factor(shadowmap: &SoftTexture, uniforms: &UniformBlock, world: Vec3) -> f32 {
    let ndc = uniforms
        .light_space_view_projection
        .project_point3(world);
    if ndc.z > 1.0 {
        return 0.0;
    }
    let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if !(0.0..=1.0).contains(&uv.x) || !(0.0..=1.0).contains(&uv.y) {
        return 0.0;
    }
    let closest = shadowmap.image.load(uv.x, uv.y).x;
    if ndc.z - uniforms.shadow_bias > closest {
        1.0
    } else {
        0.0
    }
}

fn blend(src: Vec4, dst: Vec4) -> Vec4 {
    let a = src.w;
    (src.truncate() * a + dst.truncate() * (1.0 - a)).extend(a + dst.w * (1.0 - a))
}

impl GraphicsDevice for SoftwareDevice {
    fn backend_name(&self) -> &'static str {
        "software"
    }

    fn load_shader(&mut self, kind: ShaderKind) -> Result<(), RenderError> {
        if self.shaders.insert(kind) {
            tracing::trace!(shader = kind.name(), "shader loaded");
        }
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, RenderError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::ResourceCreation {
                what: "texture",
                reason: format!("`{}` has zero extent", desc.label),
            });
        }
        let clear = if desc.format.is_depth() {
            Vec4::X
        } else {
            Vec4::ZERO
        };
        let stencil = if desc.format.has_stencil() {
            vec![0; (desc.width * desc.height) as usize]
        } else {
            Vec::new()
        };
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            SoftTexture {
                label: desc.label.to_string(),
                format: desc.format,
                image: Image::filled(desc.width, desc.height, clear),
                stencil,
            },
        );
        Ok(id)
    }

    fn create_cubemap(&mut self, desc: &CubemapDesc<'_>) -> Result<CubemapId, RenderError> {
        let max_mips = u32::BITS - desc.size.leading_zeros();
        if desc.size == 0 || desc.mip_count == 0 || desc.mip_count > max_mips {
            return Err(RenderError::ResourceCreation {
                what: "cubemap",
                reason: format!(
                    "`{}` has size {} with {} mips",
                    desc.label, desc.size, desc.mip_count
                ),
            });
        }
        if desc.format.is_depth() {
            return Err(RenderError::ResourceCreation {
                what: "cubemap",
                reason: format!("`{}` cannot use depth format {:?}", desc.label, desc.format),
            });
        }
        let faces = (0..desc.mip_count)
            .flat_map(|mip| {
                let size = mip_extent(desc.size, mip);
                std::iter::repeat_with(move || Image::filled(size, size, Vec4::ZERO)).take(6)
            })
            .collect::<Vec<_>>();
        let id = CubemapId(self.next_id());
        self.cubemaps.insert(
            id,
            SoftCubemap {
                label: desc.label.to_string(),
                format: desc.format,
                size: desc.size,
                mip_count: desc.mip_count,
                written: vec![false; faces.len()],
                faces,
            },
        );
        Ok(id)
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDesc<'_>,
    ) -> Result<FramebufferId, RenderError> {
        if let Some(format) = desc.color_formats.iter().find(|f| f.is_depth()) {
            return Err(RenderError::ResourceCreation {
                what: "framebuffer",
                reason: format!("`{}` has depth format {format:?} in a color slot", desc.label),
            });
        }
        let id = FramebufferId(self.next_id());
        self.framebuffers.insert(
            id,
            SoftFramebuffer {
                label: desc.label.to_string(),
                color_formats: desc.color_formats.clone(),
                colors: vec![AttachmentTarget::None; desc.color_formats.len()],
                depth: None,
            },
        );
        Ok(id)
    }

    fn destroy(&mut self, handle: ResourceHandle) {
        let removed = match handle {
            ResourceHandle::Texture(id) => self.textures.remove(&id).is_some(),
            ResourceHandle::Cubemap(id) => self.cubemaps.remove(&id).is_some(),
            ResourceHandle::Framebuffer(id) => self.framebuffers.remove(&id).is_some(),
        };
        if removed {
            tracing::trace!(?handle, "resource destroyed");
        }
    }

    fn is_alive(&self, handle: ResourceHandle) -> bool {
        match handle {
            ResourceHandle::Texture(id) => self.textures.contains_key(&id),
            ResourceHandle::Cubemap(id) => self.cubemaps.contains_key(&id),
            ResourceHandle::Framebuffer(id) => self.framebuffers.contains_key(&id),
        }
    }

    fn write_cubemap_face(
        &mut self,
        cubemap: CubemapId,
        face: CubeFace,
        mip: u32,
        texels: &[Vec4],
    ) -> Result<(), RenderError> {
        let cube = self
            .cubemaps
            .get_mut(&cubemap)
            .ok_or_else(|| RenderError::UnknownResource(format!("cubemap {}", cubemap.0)))?;
        let slot = cube.slot(face, mip)?;
        let image = &mut cube.faces[slot];
        if texels.len() != image.texels.len() {
            return Err(RenderError::Backend(format!(
                "face upload of {} texels into a {}x{} face",
                texels.len(),
                image.width,
                image.height
            )));
        }
        let format = cube.format;
        for (dst, &src) in image.texels.iter_mut().zip(texels) {
            *dst = store(format, src);
        }
        cube.written[slot] = true;
        Ok(())
    }

    fn read_cubemap_face(
        &mut self,
        cubemap: CubemapId,
        face: CubeFace,
        mip: u32,
    ) -> Result<Vec<Vec4>, RenderError> {
        let cube = self.cubemap(cubemap)?;
        let slot = cube.slot(face, mip)?;
        Ok(cube.faces[slot].texels.clone())
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<Vec4>, RenderError> {
        Ok(self.texture(texture)?.image.texels.clone())
    }

    fn set_color_attachment(
        &mut self,
        framebuffer: FramebufferId,
        slot: usize,
        target: AttachmentTarget,
    ) -> Result<(), RenderError> {
        let expected = {
            let fb = self.framebuffer(framebuffer)?;
            *fb.color_formats.get(slot).ok_or_else(|| {
                RenderError::UnknownResource(format!("color slot {slot} of `{}`", fb.label))
            })?
        };
        if let Some(actual) = self.target_format(target)? {
            if actual != expected {
                return Err(RenderError::AttachmentFormat {
                    slot,
                    expected,
                    actual,
                });
            }
        }
        if let Some(fb) = self.framebuffers.get_mut(&framebuffer) {
            fb.colors[slot] = target;
        }
        Ok(())
    }

    fn set_depth_attachment(
        &mut self,
        framebuffer: FramebufferId,
        texture: Option<TextureId>,
    ) -> Result<(), RenderError> {
        self.framebuffer(framebuffer)?;
        if let Some(id) = texture {
            let tex = self.texture(id)?;
            if !tex.format.is_depth() {
                return Err(RenderError::Backend(format!(
                    "texture `{}` ({:?}) is not a depth format",
                    tex.label, tex.format
                )));
            }
        }
        if let Some(fb) = self.framebuffers.get_mut(&framebuffer) {
            fb.depth = texture;
        }
        Ok(())
    }

    fn apply_state(&mut self, state: &RenderState) -> Result<(), RenderError> {
        if let Some(fb) = state.framebuffer {
            self.framebuffer(fb)?;
        }
        self.state = *state;
        if let Some(history) = &mut self.history {
            history.push(DeviceEvent::State(*state));
        }
        Ok(())
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) -> Result<(), RenderError> {
        self.uniforms.set(name, value)
    }

    fn bind_sampled(&mut self, unit: u32, resource: Option<SampledResource>) {
        match resource {
            Some(resource) => self.units.insert(unit, resource),
            None => self.units.remove(&unit),
        };
    }

    fn clear(&mut self, values: ClearValues) -> Result<(), RenderError> {
        let fb_id = self.state.framebuffer.ok_or(RenderError::NoFramebufferBound)?;
        let (colors, depth) = {
            let fb = self.framebuffer(fb_id)?;
            (fb.colors.clone(), fb.depth)
        };
        if let Some(color) = values.color {
            for target in colors {
                let format = self.target_format(target)?;
                let mut image = self.take_image(target);
                if let Some(format) = format {
                    image.texels.fill(store(format, color));
                }
                self.put_image(target, image, true);
            }
        }
        let mask = self.state.stencil_write_mask;
        if let Some(tex) = depth.and_then(|id| self.textures.get_mut(&id)) {
            if let Some(d) = values.depth {
                for texel in &mut tex.image.texels {
                    texel.x = d;
                }
            }
            if let Some(s) = values.stencil {
                for stored in &mut tex.stencil {
                    *stored = (*stored & !mask) | (s & mask);
                }
            }
        }
        self.stats.clears += 1;
        Ok(())
    }

    fn draw(&mut self, geometry: Geometry) -> Result<(), RenderError> {
        let shader = self.state.shader.ok_or(RenderError::NoShaderBound)?;
        let fb_id = self.state.framebuffer.ok_or(RenderError::NoFramebufferBound)?;
        if !self.shaders.contains(&shader) {
            return Err(RenderError::Backend(format!(
                "shader `{}` was not loaded",
                shader.name()
            )));
        }
        let input = self.shader_input(shader)?;
        let (width, height) = self.validate_targets(fb_id, input)?;

        let (colors, depth_id) = {
            let fb = self.framebuffer(fb_id)?;
            (fb.colors.clone(), fb.depth)
        };
        let formats = colors
            .iter()
            .map(|&t| self.target_format(t))
            .collect::<Result<Vec<_>, _>>()?;
        let mut images: Vec<Image> = colors.iter().map(|&t| self.take_image(t)).collect();
        let mut depth = depth_id.and_then(|id| {
            self.textures.get_mut(&id).map(|t| DepthTarget {
                id,
                image: std::mem::take(&mut t.image),
                stencil: std::mem::take(&mut t.stencil),
            })
        });

        let fragments = self.rasterize(
            shader,
            geometry,
            input,
            (width, height),
            &formats,
            &mut images,
            depth.as_mut(),
        );

        let written = fragments > 0;
        for (&target, image) in colors.iter().zip(images) {
            self.put_image(target, image, written);
        }
        if let Some(target) = depth {
            if let Some(t) = self.textures.get_mut(&target.id) {
                t.image = target.image;
                t.stencil = target.stencil;
            }
        }
        self.stats.draw_calls += 1;
        self.stats.fragments += fragments;
        if let Some(history) = &mut self.history {
            history.push(DeviceEvent::Draw {
                geometry,
                state: self.state,
            });
        }
        tracing::trace!(shader = shader.name(), ?geometry, fragments, "draw");
        Ok(())
    }
}

impl SoftwareDevice {
    /// Rasterize into the taken-out target images. Returns the number of
    /// fragments that passed every test.
    #[allow(clippy::too_many_arguments)]
    fn rasterize(
        &self,
        shader: ShaderKind,
        geometry: Geometry,
        input: Option<SampledResource>,
        (width, height): (u32, u32),
        formats: &[Option<TextureFormat>],
        images: &mut [Image],
        mut depth: Option<&mut DepthTarget>,
    ) -> u64 {
        let inputs = match input {
            Some(SampledResource::Cubemap(id)) => {
                self.cubemaps.get(&id).map_or(Inputs::None, Inputs::Cubemap)
            }
            Some(SampledResource::Texture(id)) => {
                self.textures.get(&id).map_or(Inputs::None, Inputs::Shadowmap)
            }
            None => Inputs::None,
        };
        let state = &self.state;
        let raster = Rasterizer::new(geometry, shader, &self.uniforms, state.face_cull);
        let vp = if state.viewport.width == 0 || state.viewport.height == 0 {
            crate::state::Viewport::new(width, height)
        } else {
            state.viewport
        };
        let x_end = (vp.x + vp.width).min(width);
        let y_end = (vp.y + vp.height).min(height);
        let outputs = shader.color_outputs();

        let mut fragments = 0;
        for py in vp.y..y_end {
            for px in vp.x..x_end {
                let ndc = Vec2::new(
                    ((px as f32 + 0.5 - vp.x as f32) / vp.width as f32) * 2.0 - 1.0,
                    1.0 - ((py as f32 + 0.5 - vp.y as f32) / vp.height as f32) * 2.0,
                );
                let uv = Vec2::new((ndc.x + 1.0) * 0.5, (1.0 - ndc.y) * 0.5);
                let Some(fragment) = raster.fragment(ndc, uv) else {
                    continue;
                };
                let index = (py * width + px) as usize;
                if !self.depth_stencil(fragment.depth, index, depth.as_deref_mut()) {
                    continue;
                }
                fragments += 1;
                if outputs == 0 {
                    continue;
                }
                let shaded = self.shade(shader, &fragment, &inputs);
                for (slot, image) in images.iter_mut().enumerate().take(outputs) {
                    let Some(format) = formats[slot] else {
                        continue;
                    };
                    let dst = &mut image.texels[index];
                    let src = if state.blend {
                        blend(shaded[slot], *dst)
                    } else {
                        shaded[slot]
                    };
                    *dst = store(format, src);
                }
            }
        }
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CompareFunction, StencilOperation, Viewport};
    use crate::uniforms::names;

    struct Fixture {
        device: SoftwareDevice,
        fb: FramebufferId,
        color: TextureId,
        depth: TextureId,
    }

    fn fixture(size: u32) -> Fixture {
        let mut device = SoftwareDevice::new();
        let fb = device
            .create_framebuffer(&FramebufferDesc {
                label: "test",
                color_formats: vec![TextureFormat::Rgba16Float],
            })
            .unwrap();
        let color = device
            .create_texture(&TextureDesc {
                label: "color",
                width: size,
                height: size,
                format: TextureFormat::Rgba16Float,
            })
            .unwrap();
        let depth = device
            .create_texture(&TextureDesc {
                label: "depth",
                width: size,
                height: size,
                format: TextureFormat::Depth24PlusStencil8,
            })
            .unwrap();
        device
            .set_color_attachment(fb, 0, AttachmentTarget::Texture(color))
            .unwrap();
        device.set_depth_attachment(fb, Some(depth)).unwrap();
        for kind in ShaderKind::ALL {
            device.load_shader(kind).unwrap();
        }
        Fixture {
            device,
            fb,
            color,
            depth,
        }
    }

    fn state(shader: ShaderKind, fb: FramebufferId, size: u32) -> RenderState {
        RenderState {
            shader: Some(shader),
            framebuffer: Some(fb),
            viewport: Viewport::new(size, size),
            ..RenderState::default()
        }
    }

    fn solid_cubemap(device: &mut SoftwareDevice, color: Vec4) -> CubemapId {
        let cube = device
            .create_cubemap(&CubemapDesc {
                label: "solid",
                size: 2,
                mip_count: 1,
                format: TextureFormat::Rgba16Float,
            })
            .unwrap();
        for face in CubeFace::ALL {
            device
                .write_cubemap_face(cube, face, 0, &[color; 4])
                .unwrap();
        }
        cube
    }

    #[test]
    fn draw_requires_shader_then_framebuffer() {
        let mut device = SoftwareDevice::new();
        assert!(matches!(
            device.draw(Geometry::NdcPlane),
            Err(RenderError::NoShaderBound)
        ));
        device
            .apply_state(&RenderState {
                shader: Some(ShaderKind::BrdfIntegration),
                ..RenderState::default()
            })
            .unwrap();
        assert!(matches!(
            device.draw(Geometry::NdcPlane),
            Err(RenderError::NoFramebufferBound)
        ));
    }

    #[test]
    fn unloaded_shader_is_rejected() {
        let mut device = SoftwareDevice::new();
        let fb = device
            .create_framebuffer(&FramebufferDesc {
                label: "fb",
                color_formats: vec![],
            })
            .unwrap();
        device
            .apply_state(&state(ShaderKind::BrdfIntegration, fb, 4))
            .unwrap();
        assert!(matches!(
            device.draw(Geometry::NdcPlane),
            Err(RenderError::Backend(_))
        ));
    }

    #[test]
    fn detached_slot_fails_the_draw() {
        let mut f = fixture(4);
        f.device
            .set_color_attachment(f.fb, 0, AttachmentTarget::None)
            .unwrap();
        f.device
            .apply_state(&state(ShaderKind::BrdfIntegration, f.fb, 4))
            .unwrap();
        assert!(matches!(
            f.device.draw(Geometry::NdcPlane),
            Err(RenderError::UnboundAttachment { slot: 0, .. })
        ));
    }

    #[test]
    fn attachment_format_is_checked() {
        let mut f = fixture(4);
        let lut = f
            .device
            .create_texture(&TextureDesc {
                label: "rg",
                width: 4,
                height: 4,
                format: TextureFormat::Rg16Float,
            })
            .unwrap();
        assert!(matches!(
            f.device
                .set_color_attachment(f.fb, 0, AttachmentTarget::Texture(lut)),
            Err(RenderError::AttachmentFormat { slot: 0, .. })
        ));
    }

    #[test]
    fn extent_mismatch_is_reported() {
        let mut f = fixture(4);
        let small = f
            .device
            .create_texture(&TextureDesc {
                label: "small",
                width: 2,
                height: 2,
                format: TextureFormat::Rgba16Float,
            })
            .unwrap();
        f.device
            .set_color_attachment(f.fb, 0, AttachmentTarget::Texture(small))
            .unwrap();
        f.device
            .apply_state(&state(ShaderKind::BrdfIntegration, f.fb, 2))
            .unwrap();
        assert!(matches!(
            f.device.draw(Geometry::NdcPlane),
            Err(RenderError::AttachmentMismatch {
                attachment: (2, 2),
                depth: (4, 4)
            })
        ));
    }

    #[test]
    fn sampling_a_target_is_a_feedback_loop() {
        let mut device = SoftwareDevice::new();
        device.load_shader(ShaderKind::Skybox).unwrap();
        let cube = solid_cubemap(&mut device, Vec4::ONE);
        let fb = device
            .create_framebuffer(&FramebufferDesc {
                label: "fb",
                color_formats: vec![TextureFormat::Rgba16Float],
            })
            .unwrap();
        device
            .set_color_attachment(
                fb,
                0,
                AttachmentTarget::CubeFace {
                    cubemap: cube,
                    face: CubeFace::PositiveZ,
                    mip: 0,
                },
            )
            .unwrap();
        device.bind_sampled(0, Some(SampledResource::Cubemap(cube)));
        let mut s = state(ShaderKind::Skybox, fb, 2);
        s.face_cull = false;
        device.apply_state(&s).unwrap();
        assert!(matches!(
            device.draw(Geometry::NdcCube),
            Err(RenderError::FeedbackLoop(id)) if id == cube.0
        ));
        // The face is still there after the failed draw.
        assert_eq!(
            device
                .read_cubemap_face(cube, CubeFace::PositiveZ, 0)
                .unwrap(),
            vec![Vec4::ONE; 4]
        );
    }

    #[test]
    fn sampling_a_dead_cubemap_fails() {
        let mut f = fixture(4);
        f.device
            .bind_sampled(0, Some(SampledResource::Cubemap(CubemapId(999))));
        let mut s = state(ShaderKind::Skybox, f.fb, 4);
        s.face_cull = false;
        f.device.apply_state(&s).unwrap();
        assert!(matches!(
            f.device.draw(Geometry::NdcCube),
            Err(RenderError::UnknownResource(_))
        ));
    }

    #[test]
    fn skybox_fills_the_target() {
        let mut f = fixture(4);
        let sky = Vec4::new(0.2, 0.4, 0.8, 1.0);
        let cube = solid_cubemap(&mut f.device, sky);
        f.device.bind_sampled(0, Some(SampledResource::Cubemap(cube)));
        let mut s = state(ShaderKind::Skybox, f.fb, 4);
        s.face_cull = false;
        s.depth_func = CompareFunction::LessEqual;
        f.device.apply_state(&s).unwrap();
        f.device
            .set_uniform(
                names::PROJECTION,
                glam::Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0).into(),
            )
            .unwrap();
        f.device.draw(Geometry::NdcCube).unwrap();
        let texels = f.device.read_texture(f.color).unwrap();
        assert!(texels.iter().all(|t| t.abs_diff_eq(sky, 1e-6)));
        assert_eq!(f.device.stats().fragments, 16);
    }

    #[test]
    fn stencil_write_mask_applies_to_draws_and_clears() {
        let mut f = fixture(2);
        let mut s = state(ShaderKind::BrdfIntegration, f.fb, 2);
        s.depth_test = false;
        s.stencil_test = true;
        s.stencil_write_mask = 0x00;
        s.stencil_func.reference = 0x05;
        s.stencil_ops.pass = StencilOperation::Replace;
        f.device.apply_state(&s).unwrap();
        f.device.set_uniform(names::SAMPLE_COUNT, 4u32.into()).unwrap();
        f.device.draw(Geometry::NdcPlane).unwrap();
        assert_eq!(f.device.read_stencil(f.depth).unwrap(), vec![0; 4]);

        s.stencil_write_mask = 0x0F;
        f.device.apply_state(&s).unwrap();
        f.device.draw(Geometry::NdcPlane).unwrap();
        assert_eq!(f.device.read_stencil(f.depth).unwrap(), vec![0x05; 4]);

        f.device.clear(ClearValues::all(Vec4::ZERO, 1.0, 0xFF)).unwrap();
        assert_eq!(f.device.read_stencil(f.depth).unwrap(), vec![0x0F; 4]);
    }

    #[test]
    fn stencil_func_rejects_fragments() {
        let mut f = fixture(2);
        let mut s = state(ShaderKind::BrdfIntegration, f.fb, 2);
        s.stencil_test = true;
        s.stencil_func.compare = CompareFunction::Equal;
        s.stencil_func.reference = 1;
        f.device.apply_state(&s).unwrap();
        f.device.set_uniform(names::SAMPLE_COUNT, 4u32.into()).unwrap();
        f.device.draw(Geometry::NdcPlane).unwrap();
        assert_eq!(f.device.stats().fragments, 0);
        assert!(f
            .device
            .read_texture(f.color)
            .unwrap()
            .iter()
            .all(|t| *t == Vec4::ZERO));
    }

    #[test]
    fn depth_test_keeps_the_nearest_sphere() {
        let mut f = fixture(8);
        f.device
            .apply_state(&state(ShaderKind::ModelGeometry, f.fb, 8))
            .unwrap();
        f.device
            .set_uniform(
                names::PROJECTION,
                glam::Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0).into(),
            )
            .unwrap();
        f.device
            .set_uniform(
                names::VIEW,
                glam::Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y).into(),
            )
            .unwrap();
        // Far sphere first, near sphere second, then the far one again.
        let far = glam::Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0));
        let near = glam::Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0));
        for (model, albedo) in [(far, Vec4::X), (near, Vec4::Y), (far, Vec4::X)] {
            f.device.set_uniform(names::MODEL, model.into()).unwrap();
            f.device.set_uniform(names::ALBEDO, albedo.into()).unwrap();
            f.device.draw(Geometry::Sphere).unwrap();
        }
        // Slot 0 of the geometry program is the world position; the near
        // sphere spans z in [1, 3] and the far one z in [-3, -1].
        let center = f.device.read_texture(f.color).unwrap()[4 * 8 + 4];
        assert!(center.z > 1.0 && center.z <= 3.0, "{center}");
        let depth = f.device.read_texture(f.depth).unwrap()[4 * 8 + 4];
        assert!(depth.x > 0.0 && depth.x < 1.0);
    }

    #[test]
    fn clear_marks_cube_faces_written() {
        let mut device = SoftwareDevice::new();
        let cube = device
            .create_cubemap(&CubemapDesc {
                label: "cube",
                size: 4,
                mip_count: 3,
                format: TextureFormat::Rgba16Float,
            })
            .unwrap();
        let fb = device
            .create_framebuffer(&FramebufferDesc {
                label: "fb",
                color_formats: vec![TextureFormat::Rgba16Float],
            })
            .unwrap();
        device
            .set_color_attachment(
                fb,
                0,
                AttachmentTarget::CubeFace {
                    cubemap: cube,
                    face: CubeFace::NegativeX,
                    mip: 2,
                },
            )
            .unwrap();
        device
            .apply_state(&RenderState {
                framebuffer: Some(fb),
                ..RenderState::default()
            })
            .unwrap();
        device.clear(ClearValues::color_depth(Vec4::ONE, 1.0)).unwrap();
        let written = device.faces_written(cube, 2).unwrap();
        assert_eq!(written, [false, true, false, false, false, false]);
        assert_eq!(device.faces_written(cube, 0).unwrap(), [false; 6]);
        assert_eq!(
            device.read_cubemap_face(cube, CubeFace::NegativeX, 2).unwrap(),
            vec![Vec4::ONE]
        );
        assert!(device.faces_written(cube, 3).is_err());
    }

    #[test]
    fn cubemap_mip_count_is_bounded() {
        let mut device = SoftwareDevice::new();
        let desc = |mip_count| CubemapDesc {
            label: "cube",
            size: 8,
            mip_count,
            format: TextureFormat::Rgba16Float,
        };
        assert!(device.create_cubemap(&desc(4)).is_ok());
        assert!(device.create_cubemap(&desc(5)).is_err());
        assert!(device.create_cubemap(&desc(0)).is_err());
    }
}
