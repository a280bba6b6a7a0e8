//! Named shader uniforms.
//!
//! Every program reads from one [`UniformBlock`]. Setting a name the block
//! does not know, or a value of the wrong type, is an error.

use glam::{Mat4, Vec3, Vec4};
use radiance_common::RenderError;

use crate::device::ShaderKind;

pub mod names {
    pub const PROJECTION: &str = "projection";
    pub const VIEW: &str = "view";
    pub const MODEL: &str = "model";
    pub const VIEW_POS: &str = "viewPos";
    pub const ALBEDO: &str = "albedo";
    pub const ROUGHNESS: &str = "roughness";
    pub const SCENE_CAPTURE_CUBEMAP: &str = "sceneCaptureCubemap";
    pub const SKYBOX: &str = "skybox";
    pub const SHADOWMAP: &str = "shadowmap";
    pub const LIGHT_SPACE_VIEW_PROJECTION: &str = "lightSpaceViewProjection";
    pub const LIGHT_DIRECTION: &str = "lightDirection";
    pub const LIGHT_COLOR: &str = "lightColor";
    pub const AMBIENT_COLOR: &str = "ambientColor";
    pub const SHADOW_BIAS: &str = "shadowBias";
    pub const SAMPLE_DELTA: &str = "sampleDelta";
    pub const SAMPLE_COUNT: &str = "sampleCount";
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Int(i32),
    UInt(u32),
    Float(f32),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        UniformValue::Int(v)
    }
}

impl From<u32> for UniformValue {
    fn from(v: u32) -> Self {
        UniformValue::UInt(v)
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::Float(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        UniformValue::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        UniformValue::Vec4(v)
    }
}

impl From<Mat4> for UniformValue {
    fn from(v: Mat4) -> Self {
        UniformValue::Mat4(v)
    }
}

/// Current value of every uniform. Sampler uniforms hold texture units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformBlock {
    pub projection: Mat4,
    pub view: Mat4,
    pub model: Mat4,
    pub light_space_view_projection: Mat4,
    pub view_pos: Vec3,
    pub albedo: Vec4,
    pub roughness: f32,
    pub scene_capture_unit: u32,
    pub skybox_unit: u32,
    pub shadowmap_unit: u32,
    pub light_direction: Vec3,
    pub light_color: Vec3,
    pub ambient_color: Vec3,
    pub shadow_bias: f32,
    pub sample_delta: f32,
    pub sample_count: u32,
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
            light_space_view_projection: Mat4::IDENTITY,
            view_pos: Vec3::ZERO,
            albedo: Vec4::ONE,
            roughness: 0.0,
            scene_capture_unit: 0,
            skybox_unit: 0,
            shadowmap_unit: 1,
            light_direction: Vec3::NEG_Y,
            light_color: Vec3::ONE,
            ambient_color: Vec3::ZERO,
            shadow_bias: 0.005,
            sample_delta: 0.025,
            sample_count: 1024,
        }
    }
}

impl UniformBlock {
    pub fn set(&mut self, name: &str, value: UniformValue) -> Result<(), RenderError> {
        use names::*;
        match name {
            PROJECTION => self.projection = mat4(name, value)?,
            VIEW => self.view = mat4(name, value)?,
            MODEL => self.model = mat4(name, value)?,
            LIGHT_SPACE_VIEW_PROJECTION => self.light_space_view_projection = mat4(name, value)?,
            VIEW_POS => self.view_pos = vec3(name, value)?,
            LIGHT_DIRECTION => self.light_direction = vec3(name, value)?,
            LIGHT_COLOR => self.light_color = vec3(name, value)?,
            AMBIENT_COLOR => self.ambient_color = vec3(name, value)?,
            ALBEDO => self.albedo = vec4(name, value)?,
            ROUGHNESS => self.roughness = float(name, value)?,
            SHADOW_BIAS => self.shadow_bias = float(name, value)?,
            SAMPLE_DELTA => self.sample_delta = float(name, value)?,
            SCENE_CAPTURE_CUBEMAP => self.scene_capture_unit = unsigned(name, value)?,
            SKYBOX => self.skybox_unit = unsigned(name, value)?,
            SHADOWMAP => self.shadowmap_unit = unsigned(name, value)?,
            SAMPLE_COUNT => self.sample_count = unsigned(name, value)?,
            _ => return Err(RenderError::UnknownUniform(name.to_string())),
        }
        Ok(())
    }

    /// Transform from world space to clip space for `shader`.
    pub fn clip_from_world(&self, shader: ShaderKind) -> Mat4 {
        match shader {
            ShaderKind::ShadowDepth => self.light_space_view_projection,
            _ => self.projection * self.view,
        }
    }
}

fn type_error(name: &str, expected: &'static str) -> RenderError {
    RenderError::UniformType {
        name: name.to_string(),
        expected,
    }
}

fn mat4(name: &str, value: UniformValue) -> Result<Mat4, RenderError> {
    match value {
        UniformValue::Mat4(m) => Ok(m),
        _ => Err(type_error(name, "mat4")),
    }
}

fn vec3(name: &str, value: UniformValue) -> Result<Vec3, RenderError> {
    match value {
        UniformValue::Vec3(v) => Ok(v),
        _ => Err(type_error(name, "vec3")),
    }
}

fn vec4(name: &str, value: UniformValue) -> Result<Vec4, RenderError> {
    match value {
        UniformValue::Vec4(v) => Ok(v),
        _ => Err(type_error(name, "vec4")),
    }
}

fn float(name: &str, value: UniformValue) -> Result<f32, RenderError> {
    match value {
        UniformValue::Float(v) => Ok(v),
        _ => Err(type_error(name, "float")),
    }
}

/// Sampler units and counts accept either integer type, as long as the value
/// is not negative.
fn unsigned(name: &str, value: UniformValue) -> Result<u32, RenderError> {
    match value {
        UniformValue::UInt(v) => Ok(v),
        UniformValue::Int(v) if v >= 0 => Ok(v as u32),
        _ => Err(type_error(name, "non-negative int")),
    }
}
