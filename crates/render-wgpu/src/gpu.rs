use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec4};
use half::f16;
use radiance_common::{mip_extent, CubeFace, RenderError, TextureFormat};
use radiance_render::{
    AttachmentTarget, ClearValues, CompareFunction, CubemapDesc, CubemapId, FramebufferDesc,
    FramebufferId, Geometry, GraphicsDevice, RenderState, ResourceHandle, SampledResource,
    ShaderKind, StencilOperation, StencilOps, TextureDesc, TextureId, UniformBlock, UniformValue,
};
use wgpu::util::DeviceExt;

use crate::meshes::{self, Vertex};
use crate::shaders;

/// GPU copy of [`UniformBlock`], laid out to match the WGSL `Uniforms`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Uniforms {
    projection: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
    light_space: [[f32; 4]; 4],
    normal_matrix: [[f32; 4]; 4],
    view_pos: [f32; 4],
    albedo: [f32; 4],
    light_direction: [f32; 4],
    light_color: [f32; 4],
    ambient_color: [f32; 4],
    params: [f32; 4],
}

impl Uniforms {
    fn from_block(block: &UniformBlock) -> Self {
        let normal = Mat3::from_mat4(block.model).inverse().transpose();
        Self {
            projection: block.projection.to_cols_array_2d(),
            view: block.view.to_cols_array_2d(),
            model: block.model.to_cols_array_2d(),
            light_space: block.light_space_view_projection.to_cols_array_2d(),
            normal_matrix: Mat4::from_mat3(normal).to_cols_array_2d(),
            view_pos: block.view_pos.extend(1.0).to_array(),
            albedo: block.albedo.to_array(),
            light_direction: block.light_direction.extend(0.0).to_array(),
            light_color: block.light_color.extend(1.0).to_array(),
            ambient_color: block.ambient_color.extend(1.0).to_array(),
            params: [
                block.roughness,
                block.shadow_bias,
                block.sample_delta,
                block.sample_count as f32,
            ],
        }
    }
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

fn compare(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
    match op {
        StencilOperation::Keep => wgpu::StencilOperation::Keep,
        StencilOperation::Zero => wgpu::StencilOperation::Zero,
        StencilOperation::Replace => wgpu::StencilOperation::Replace,
        StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOperation::Invert => wgpu::StencilOperation::Invert,
    }
}

/// Bytes per texel as laid out in copies.
fn texel_size(format: TextureFormat) -> u32 {
    match format {
        TextureFormat::Rgba16Float => 8,
        _ => 4,
    }
}

fn encode(format: TextureFormat, texels: &[Vec4]) -> Result<Vec<u8>, RenderError> {
    let half = |values: &mut Vec<u16>, v: f32| values.push(f16::from_f32(v).to_bits());
    Ok(match format {
        TextureFormat::Rgba8Unorm => texels
            .iter()
            .flat_map(|t| t.to_array())
            .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
        TextureFormat::Rgba16Float => {
            let mut values = Vec::with_capacity(texels.len() * 4);
            for t in texels {
                for c in t.to_array() {
                    half(&mut values, c);
                }
            }
            bytemuck::cast_slice(&values).to_vec()
        }
        TextureFormat::Rg16Float => {
            let mut values = Vec::with_capacity(texels.len() * 2);
            for t in texels {
                half(&mut values, t.x);
                half(&mut values, t.y);
            }
            bytemuck::cast_slice(&values).to_vec()
        }
        TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8 => {
            return Err(RenderError::Backend(format!(
                "texel upload is not supported for {format:?}"
            )));
        }
    })
}

fn decode(format: TextureFormat, bytes: &[u8]) -> Vec<Vec4> {
    let half = |b: &[u8]| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32();
    match format {
        TextureFormat::Rgba8Unorm => bytes
            .chunks_exact(4)
            .map(|b| Vec4::new(b[0] as f32, b[1] as f32, b[2] as f32, b[3] as f32) / 255.0)
            .collect(),
        TextureFormat::Rgba16Float => bytes
            .chunks_exact(8)
            .map(|b| Vec4::new(half(&b[0..2]), half(&b[2..4]), half(&b[4..6]), half(&b[6..8])))
            .collect(),
        TextureFormat::Rg16Float => bytes
            .chunks_exact(4)
            .map(|b| Vec4::new(half(&b[0..2]), half(&b[2..4]), 0.0, 1.0))
            .collect(),
        TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8 => bytes
            .chunks_exact(4)
            .map(|b| Vec4::new(f32::from_le_bytes([b[0], b[1], b[2], b[3]]), 0.0, 0.0, 0.0))
            .collect(),
    }
}

/// Winding that counts as front facing once `clip` is applied. Mirroring
/// transforms (positive determinant with this projection convention) flip it.
fn front_face(clip: Mat4) -> wgpu::FrontFace {
    if clip.determinant() > 0.0 {
        wgpu::FrontFace::Cw
    } else {
        wgpu::FrontFace::Ccw
    }
}

/// Everything a render pipeline is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: ShaderKind,
    color_formats: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
    depth_test: bool,
    depth_func: CompareFunction,
    cull: bool,
    clockwise: bool,
    blend: bool,
    stencil: Option<(CompareFunction, u8, u8, StencilOps)>,
}

struct GpuTexture {
    label: String,
    texture: wgpu::Texture,
    format: TextureFormat,
    width: u32,
    height: u32,
}

struct GpuCubemap {
    label: String,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
    size: u32,
    mip_count: u32,
    /// Indexed by `mip * 6 + face`.
    written: Vec<bool>,
}

impl GpuCubemap {
    fn slot(&self, face: CubeFace, mip: u32) -> Result<usize, RenderError> {
        if mip >= self.mip_count {
            return Err(RenderError::UnknownResource(format!(
                "mip {mip} of cubemap `{}` ({} mips)",
                self.label, self.mip_count
            )));
        }
        Ok(mip as usize * 6 + face.index())
    }
}

struct GpuFramebuffer {
    label: String,
    color_formats: Vec<TextureFormat>,
    colors: Vec<AttachmentTarget>,
    depth: Option<TextureId>,
}

/// [`GraphicsDevice`] on wgpu.
///
/// Commands are encoded and submitted one at a time, so uniform writes and
/// attachment switches between draws behave like immediate-mode calls.
/// Pipelines are compiled on first use and cached per shader, state and
/// attachment formats.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    next_id: u32,
    textures: BTreeMap<TextureId, GpuTexture>,
    cubemaps: BTreeMap<CubemapId, GpuCubemap>,
    framebuffers: BTreeMap<FramebufferId, GpuFramebuffer>,
    shaders: BTreeMap<ShaderKind, wgpu::ShaderModule>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    meshes: HashMap<Geometry, (wgpu::Buffer, u32)>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    fallback_cube: wgpu::TextureView,
    fallback_depth: wgpu::TextureView,
    state: RenderState,
    uniforms: UniformBlock,
    units: BTreeMap<u32, SampledResource>,
}

impl WgpuDevice {
    /// Device on the best available adapter, without a surface.
    pub fn new_headless() -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::Backend("no compatible GPU adapter".into()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("radiance_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| RenderError::Backend(format!("request device: {e}")))?;
        let info = adapter.get_info();
        tracing::info!(
            adapter = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            driver = %info.driver,
            driver_info = %info.driver_info,
            "wgpu device created"
        );
        Ok(Self::from_device(device, queue, info.name))
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, adapter_name: String) -> Self {
        device.on_uncaptured_error(Box::new(|err| {
            tracing::error!(%err, "uncaptured wgpu error");
        }));

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("uniform_buffer"),
            contents: bytemuck::bytes_of(&Uniforms::from_block(&UniformBlock::default())),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let fragment = wgpu::ShaderStages::FRAGMENT;
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("radiance_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: fragment,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::Cube,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: fragment,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: fragment,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("radiance_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("environment_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let fallback = |label, format, layers| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
        };
        let fallback_cube = fallback("fallback_cube", wgpu::TextureFormat::Rgba16Float, 6)
            .create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::Cube),
                ..Default::default()
            });
        let fallback_depth = fallback("fallback_depth", wgpu::TextureFormat::Depth32Float, 1)
            .create_view(&wgpu::TextureViewDescriptor::default());

        let meshes = [
            Geometry::NdcPlane,
            Geometry::NdcCube,
            Geometry::Sphere,
            Geometry::TerrainPatch,
        ]
        .into_iter()
        .map(|geometry| {
            let vertices = meshes::mesh(geometry);
            let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mesh_vertex_buffer"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
            (geometry, (buffer, vertices.len() as u32))
        })
        .collect();

        Self {
            device,
            queue,
            adapter_name,
            next_id: 0,
            textures: BTreeMap::new(),
            cubemaps: BTreeMap::new(),
            framebuffers: BTreeMap::new(),
            shaders: BTreeMap::new(),
            pipelines: HashMap::new(),
            meshes,
            bind_group_layout,
            pipeline_layout,
            uniform_buffer,
            sampler,
            fallback_cube,
            fallback_depth,
            state: RenderState::default(),
            uniforms: UniformBlock::default(),
            units: BTreeMap::new(),
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Number of pipelines compiled so far.
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Run `f` inside a validation error scope.
    fn validated<T>(&self, what: &str, f: impl FnOnce(&Self) -> T) -> Result<T, RenderError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(self);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(RenderError::Backend(format!("{what}: {err}"))),
            None => Ok(out),
        }
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture, RenderError> {
        self.textures
            .get(&id)
            .ok_or_else(|| RenderError::UnknownResource(format!("texture {}", id.0)))
    }

    fn cubemap(&self, id: CubemapId) -> Result<&GpuCubemap, RenderError> {
        self.cubemaps
            .get(&id)
            .ok_or_else(|| RenderError::UnknownResource(format!("cubemap {}", id.0)))
    }

    fn framebuffer(&self, id: FramebufferId) -> Result<&GpuFramebuffer, RenderError> {
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
                Some((tex.width, tex.height))
            }
            AttachmentTarget::CubeFace { cubemap, mip, .. } => {
                let size = mip_extent(self.cubemap(cubemap)?.size, mip);
                Some((size, size))
            }
        })
    }

    /// Render view of one attachment target.
    fn target_view(&self, target: AttachmentTarget) -> Result<Option<wgpu::TextureView>, RenderError> {
        Ok(match target {
            AttachmentTarget::None => None,
            AttachmentTarget::Texture(id) => Some(
                self.texture(id)?
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default()),
            ),
            AttachmentTarget::CubeFace { cubemap, face, mip } => {
                let cube = self.cubemap(cubemap)?;
                cube.slot(face, mip)?;
                Some(cube.texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("cube_face_target"),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    base_array_layer: face.index() as u32,
                    array_layer_count: Some(1),
                    ..Default::default()
                }))
            }
        })
    }

    fn sampled(&self, unit: u32) -> Result<SampledResource, RenderError> {
        let resource = self.units.get(&unit).copied().ok_or_else(|| {
            RenderError::UnknownResource(format!("nothing bound to sampler unit {unit}"))
        })?;
        match resource {
            SampledResource::Texture(id) => {
                let tex = self.texture(id)?;
                if !tex.format.is_depth() {
                    return Err(RenderError::Backend(format!(
                        "texture `{}` ({:?}) cannot be sampled as a shadowmap",
                        tex.label, tex.format
                    )));
                }
            }
            SampledResource::Cubemap(id) => {
                self.cubemap(id)?;
            }
        }
        Ok(resource)
    }

    fn shader_input(&self, shader: ShaderKind) -> Result<Option<SampledResource>, RenderError> {
        let u = &self.uniforms;
        let unit = match shader {
            ShaderKind::Skybox => u.skybox_unit,
            ShaderKind::IrradianceConvolution | ShaderKind::ImportanceSampling => {
                u.scene_capture_unit
            }
            ShaderKind::ForwardLighting => u.shadowmap_unit,
            _ => return Ok(None),
        };
        let resource = self.sampled(unit)?;
        let expects_cube = shader != ShaderKind::ForwardLighting;
        if expects_cube != matches!(resource, SampledResource::Cubemap(_)) {
            return Err(RenderError::UnknownResource(format!(
                "sampler unit {unit} holds {resource:?}, which `{}` cannot sample",
                shader.name()
            )));
        }
        Ok(Some(resource))
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
            if let Some(first) = extent {
                if first != size {
                    return Err(RenderError::AttachmentMismatch {
                        attachment: size,
                        depth: first,
                    });
                }
            }
            extent = Some(size);
            if let (AttachmentTarget::CubeFace { cubemap, .. }, Some(SampledResource::Cubemap(s))) =
                (target, input)
            {
                if cubemap == s {
                    return Err(RenderError::FeedbackLoop(cubemap.0));
                }
            }
            if let (AttachmentTarget::Texture(id), Some(SampledResource::Texture(s))) =
                (target, input)
            {
                if id == s {
                    return Err(RenderError::FeedbackLoop(id.0));
                }
            }
        }
        if let Some(depth) = fb.depth {
            let tex = self.texture(depth)?;
            let depth_size = (tex.width, tex.height);
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

    fn clip_for(&self, shader: ShaderKind, geometry: Geometry) -> Mat4 {
        let u = &self.uniforms;
        match geometry {
            Geometry::NdcPlane => Mat4::IDENTITY,
            Geometry::NdcCube => u.projection * Mat4::from_mat3(Mat3::from_mat4(u.view)),
            Geometry::Sphere | Geometry::TerrainPatch => u.clip_from_world(shader) * u.model,
        }
    }

    fn pipeline_key(
        &self,
        shader: ShaderKind,
        geometry: Geometry,
        color_formats: &[TextureFormat],
        depth_format: Option<TextureFormat>,
    ) -> PipelineKey {
        let s = &self.state;
        let clockwise = match geometry {
            Geometry::NdcPlane => false,
            _ => front_face(self.clip_for(shader, geometry)) == wgpu::FrontFace::Cw,
        };
        let stencil = (s.stencil_test && depth_format.is_some_and(TextureFormat::has_stencil))
            .then_some((
                s.stencil_func.compare,
                s.stencil_func.read_mask,
                s.stencil_write_mask,
                s.stencil_ops,
            ));
        PipelineKey {
            shader,
            color_formats: color_formats.to_vec(),
            depth_format,
            depth_test: s.depth_test,
            depth_func: s.depth_func,
            cull: s.face_cull,
            clockwise,
            blend: s.blend,
            stencil,
        }
    }

    fn ensure_pipeline(&mut self, key: &PipelineKey) -> Result<(), RenderError> {
        if self.pipelines.contains_key(key) {
            return Ok(());
        }
        let pipeline = self.validated("create pipeline", |this| this.create_pipeline(key))??;
        tracing::debug!(shader = key.shader.name(), total = self.pipelines.len() + 1, "pipeline compiled");
        self.pipelines.insert(key.clone(), pipeline);
        Ok(())
    }

    fn create_pipeline(&self, key: &PipelineKey) -> Result<wgpu::RenderPipeline, RenderError> {
        let module = self.shaders.get(&key.shader).ok_or_else(|| {
            RenderError::Backend(format!("shader `{}` was not loaded", key.shader.name()))
        })?;
        let outputs = key.shader.color_outputs();
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .enumerate()
            .map(|(slot, &format)| {
                Some(wgpu::ColorTargetState {
                    format: wgpu_format(format),
                    blend: Some(if key.blend {
                        wgpu::BlendState::ALPHA_BLENDING
                    } else {
                        wgpu::BlendState::REPLACE
                    }),
                    write_mask: if slot < outputs {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })
            })
            .collect();
        let depth_stencil = key.depth_format.map(|format| {
            let stencil = match key.stencil {
                Some((func, read_mask, write_mask, ops)) => {
                    let face = wgpu::StencilFaceState {
                        compare: compare(func),
                        fail_op: stencil_operation(ops.fail),
                        depth_fail_op: stencil_operation(ops.depth_fail),
                        pass_op: stencil_operation(ops.pass),
                    };
                    wgpu::StencilState {
                        front: face,
                        back: face,
                        read_mask: read_mask as u32,
                        write_mask: write_mask as u32,
                    }
                }
                None => wgpu::StencilState::default(),
            };
            wgpu::DepthStencilState {
                format: wgpu_format(format),
                depth_write_enabled: key.depth_test,
                depth_compare: if key.depth_test {
                    compare(key.depth_func)
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil,
                bias: Default::default(),
            }
        });

        Ok(self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(key.shader.name()),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<Vertex>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![
                            0 => Float32x3,
                            1 => Float32x3,
                        ],
                    }],
                },
                fragment: shaders::has_fragment(key.shader).then(|| wgpu::FragmentState {
                    module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: if key.clockwise {
                        wgpu::FrontFace::Cw
                    } else {
                        wgpu::FrontFace::Ccw
                    },
                    cull_mode: key.cull.then_some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil,
                multisample: Default::default(),
                multiview: None,
                cache: None,
            }))
    }

    fn bind_group(&self, input: Option<SampledResource>) -> Result<wgpu::BindGroup, RenderError> {
        let shadow_view;
        let (cube, shadow) = match input {
            Some(SampledResource::Cubemap(id)) => (&self.cubemap(id)?.view, &self.fallback_depth),
            Some(SampledResource::Texture(id)) => {
                shadow_view = self.texture(id)?.texture.create_view(&wgpu::TextureViewDescriptor {
                    aspect: wgpu::TextureAspect::DepthOnly,
                    ..Default::default()
                });
                (&self.fallback_cube, &shadow_view)
            }
            None => (&self.fallback_cube, &self.fallback_depth),
        };
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("radiance_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(cube),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(shadow),
                },
            ],
        }))
    }

    fn mark_written(&mut self, targets: &[AttachmentTarget]) {
        for target in targets {
            if let AttachmentTarget::CubeFace { cubemap, face, mip } = *target {
                if let Some(cube) = self.cubemaps.get_mut(&cubemap) {
                    cube.written[mip as usize * 6 + face.index()] = true;
                }
            }
        }
    }

    /// Copy one layer of one mip back to the CPU. Rows are padded to the copy
    /// alignment on the GPU and depadded here.
    #[allow(clippy::too_many_arguments)]
    fn read_back(
        &self,
        texture: &wgpu::Texture,
        format: TextureFormat,
        aspect: wgpu::TextureAspect,
        mip: u32,
        layer: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<Vec4>, RenderError> {
        let tight = texel_size(format) * width;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = tight.div_ceil(align) * align;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: mip,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.validated("readback copy", |this| {
            this.queue.submit(std::iter::once(encoder.finish()))
        })?;

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| RenderError::Backend("readback callback dropped".into()))?
            .map_err(|e| RenderError::Backend(format!("map readback buffer: {e}")))?;

        let data = slice.get_mapped_range();
        let mut bytes = Vec::with_capacity((tight * height) as usize);
        for row in 0..height as usize {
            let start = row * padded as usize;
            bytes.extend_from_slice(&data[start..start + tight as usize]);
        }
        drop(data);
        staging.unmap();
        Ok(decode(format, &bytes))
    }

    fn viewport(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let vp = self.state.viewport;
        if vp.width == 0 || vp.height == 0 || vp.x >= width || vp.y >= height {
            return (0.0, 0.0, width as f32, height as f32);
        }
        (
            vp.x as f32,
            vp.y as f32,
            vp.width.min(width - vp.x) as f32,
            vp.height.min(height - vp.y) as f32,
        )
    }
}

impl GraphicsDevice for WgpuDevice {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn load_shader(&mut self, kind: ShaderKind) -> Result<(), RenderError> {
        if self.shaders.contains_key(&kind) {
            return Ok(());
        }
        let source = shaders::source(kind);
        let module = self.validated("compile shader", |this| {
            this.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(kind.name()),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
        })?;
        tracing::debug!(shader = kind.name(), "shader compiled");
        self.shaders.insert(kind, module);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureId, RenderError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::ResourceCreation {
                what: "texture",
                reason: format!("`{}` has zero extent", desc.label),
            });
        }
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC;
        if !desc.format.is_depth() {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        let texture = self
            .validated("create texture", |this| {
                this.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(desc.label),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format(desc.format),
                    usage,
                    view_formats: &[],
                })
            })
            .map_err(|e| RenderError::ResourceCreation {
                what: "texture",
                reason: e.to_string(),
            })?;
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            GpuTexture {
                label: desc.label.to_string(),
                texture,
                format: desc.format,
                width: desc.width,
                height: desc.height,
            },
        );
        Ok(id)
    }

    fn create_cubemap(&mut self, desc: &CubemapDesc<'_>) -> Result<CubemapId, RenderError> {
        let max_mips = u32::BITS - desc.size.leading_zeros();
        if desc.size == 0 || desc.mip_count == 0 || desc.mip_count > max_mips || desc.format.is_depth()
        {
            return Err(RenderError::ResourceCreation {
                what: "cubemap",
                reason: format!(
                    "`{}` has size {} with {} mips of {:?}",
                    desc.label, desc.size, desc.mip_count, desc.format
                ),
            });
        }
        let texture = self
            .validated("create cubemap", |this| {
                this.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(desc.label),
                    size: wgpu::Extent3d {
                        width: desc.size,
                        height: desc.size,
                        depth_or_array_layers: 6,
                    },
                    mip_level_count: desc.mip_count,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format(desc.format),
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .map_err(|e| RenderError::ResourceCreation {
                what: "cubemap",
                reason: e.to_string(),
            })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(desc.label),
            dimension: Some(wgpu::TextureViewDimension::Cube),
            ..Default::default()
        });
        let id = CubemapId(self.next_id());
        self.cubemaps.insert(
            id,
            GpuCubemap {
                label: desc.label.to_string(),
                texture,
                view,
                format: desc.format,
                size: desc.size,
                mip_count: desc.mip_count,
                written: vec![false; desc.mip_count as usize * 6],
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
            GpuFramebuffer {
                label: desc.label.to_string(),
                color_formats: desc.color_formats.clone(),
                colors: vec![AttachmentTarget::None; desc.color_formats.len()],
                depth: None,
            },
        );
        Ok(id)
    }

    fn destroy(&mut self, handle: ResourceHandle) {
        match handle {
            ResourceHandle::Texture(id) => {
                if let Some(tex) = self.textures.remove(&id) {
                    tex.texture.destroy();
                }
            }
            ResourceHandle::Cubemap(id) => {
                if let Some(cube) = self.cubemaps.remove(&id) {
                    cube.texture.destroy();
                }
            }
            ResourceHandle::Framebuffer(id) => {
                self.framebuffers.remove(&id);
            }
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
        let cube = self.cubemap(cubemap)?;
        let slot = cube.slot(face, mip)?;
        let size = mip_extent(cube.size, mip);
        if texels.len() != (size * size) as usize {
            return Err(RenderError::Backend(format!(
                "face upload of {} texels into a {size}x{size} face",
                texels.len()
            )));
        }
        let bytes = encode(cube.format, texels)?;
        let bytes_per_row = size * texel_size(cube.format);
        self.validated("cubemap face upload", |this| {
            this.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &cube.texture,
                    mip_level: mip,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: face.index() as u32,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                &bytes,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(size),
                },
                wgpu::Extent3d {
                    width: size,
                    height: size,
                    depth_or_array_layers: 1,
                },
            );
            // Flush the staged upload so it is ordered before later passes.
            this.queue.submit(std::iter::empty());
        })?;
        if let Some(cube) = self.cubemaps.get_mut(&cubemap) {
            cube.written[slot] = true;
        }
        Ok(())
    }

    fn read_cubemap_face(
        &mut self,
        cubemap: CubemapId,
        face: CubeFace,
        mip: u32,
    ) -> Result<Vec<Vec4>, RenderError> {
        let cube = self.cubemap(cubemap)?;
        cube.slot(face, mip)?;
        let size = mip_extent(cube.size, mip);
        self.read_back(
            &cube.texture,
            cube.format,
            wgpu::TextureAspect::All,
            mip,
            face.index() as u32,
            size,
            size,
        )
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<Vec4>, RenderError> {
        let tex = self.texture(texture)?;
        let aspect = match tex.format {
            TextureFormat::Depth32Float => wgpu::TextureAspect::DepthOnly,
            TextureFormat::Depth24PlusStencil8 => {
                return Err(RenderError::Backend(format!(
                    "depth of `{}` ({:?}) cannot be copied back",
                    tex.label, tex.format
                )));
            }
            _ => wgpu::TextureAspect::All,
        };
        self.read_back(&tex.texture, tex.format, aspect, 0, 0, tex.width, tex.height)
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
        let color_views = colors
            .iter()
            .map(|&t| self.target_view(t))
            .collect::<Result<Vec<_>, _>>()?;
        let depth_tex = depth.map(|id| self.texture(id)).transpose()?;
        let depth_view = depth_tex.map(|t| {
            t.texture
                .create_view(&wgpu::TextureViewDescriptor::default())
        });

        let color_load = match values.color {
            Some(c) => wgpu::LoadOp::Clear(wgpu::Color {
                r: c.x as f64,
                g: c.y as f64,
                b: c.z as f64,
                a: c.w as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .iter()
            .map(|view| {
                view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_stencil_attachment = depth_tex.zip(depth_view.as_ref()).map(|(tex, view)| {
            wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: values.depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: tex.format.has_stencil().then(|| wgpu::Operations {
                    load: values
                        .stencil
                        .map_or(wgpu::LoadOp::Load, |s| wgpu::LoadOp::Clear(s as u32)),
                    store: wgpu::StoreOp::Store,
                }),
            }
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("clear_encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear"),
                color_attachments: &attachments,
                depth_stencil_attachment,
                ..Default::default()
            });
        }
        self.validated("clear", |this| {
            this.queue.submit(std::iter::once(encoder.finish()))
        })?;
        if values.color.is_some() {
            self.mark_written(&colors);
        }
        Ok(())
    }

    fn draw(&mut self, geometry: Geometry) -> Result<(), RenderError> {
        let shader = self.state.shader.ok_or(RenderError::NoShaderBound)?;
        let fb_id = self.state.framebuffer.ok_or(RenderError::NoFramebufferBound)?;
        if !self.shaders.contains_key(&shader) {
            return Err(RenderError::Backend(format!(
                "shader `{}` was not loaded",
                shader.name()
            )));
        }
        let input = self.shader_input(shader)?;
        let (width, height) = self.validate_targets(fb_id, input)?;

        let (colors, color_formats, depth) = {
            let fb = self.framebuffer(fb_id)?;
            (fb.colors.clone(), fb.color_formats.clone(), fb.depth)
        };
        let depth_format = depth.map(|id| self.texture(id).map(|t| t.format)).transpose()?;
        let key = self.pipeline_key(shader, geometry, &color_formats, depth_format);
        self.ensure_pipeline(&key)?;

        let color_views = colors
            .iter()
            .map(|&t| self.target_view(t))
            .collect::<Result<Vec<_>, _>>()?;
        let depth_view = depth
            .map(|id| self.texture(id))
            .transpose()?
            .map(|t| t.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        let bind_group = self.bind_group(input)?;
        self.queue.write_buffer(
            &self.uniform_buffer,
            0,
            bytemuck::bytes_of(&Uniforms::from_block(&self.uniforms)),
        );

        let pipeline = self.pipelines.get(&key).ok_or_else(|| {
            RenderError::Backend(format!("pipeline for `{}` missing", shader.name()))
        })?;
        let (vertices, vertex_count) = self.meshes.get(&geometry).ok_or_else(|| {
            RenderError::Backend(format!("no mesh for {geometry:?}"))
        })?;
        let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .iter()
            .map(|view| {
                view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let has_stencil = depth_format.is_some_and(TextureFormat::has_stencil);
        let depth_stencil_attachment =
            depth_view
                .as_ref()
                .map(|view| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: has_stencil.then_some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("draw_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(shader.name()),
                color_attachments: &attachments,
                depth_stencil_attachment,
                ..Default::default()
            });
            let (x, y, w, h) = self.viewport(width, height);
            pass.set_viewport(x, y, w, h, 0.0, 1.0);
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_stencil_reference(self.state.stencil_func.reference as u32);
            pass.set_vertex_buffer(0, vertices.slice(..));
            pass.draw(0..*vertex_count, 0..1);
        }
        self.validated("draw", |this| {
            this.queue.submit(std::iter::once(encoder.finish()))
        })?;
        self.mark_written(&colors);
        tracing::trace!(shader = shader.name(), ?geometry, "draw submitted");
        Ok(())
    }
}
