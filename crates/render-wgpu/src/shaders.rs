//! WGSL programs, one per [`ShaderKind`].
//!
//! Every program shares [`PRELUDE`]: the uniform block, the sampled
//! environment cubemap with its sampler, and the shadowmap. Unused bindings
//! are still declared so one bind group layout serves every pipeline.

use radiance_render::ShaderKind;

/// Shared declarations. `params` packs roughness, shadow bias, sample delta
/// and sample count.
pub const PRELUDE: &str = r#"
struct Uniforms {
    projection: mat4x4<f32>,
    view: mat4x4<f32>,
    model: mat4x4<f32>,
    light_space: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    view_pos: vec4<f32>,
    albedo: vec4<f32>,
    light_direction: vec4<f32>,
    light_color: vec4<f32>,
    ambient_color: vec4<f32>,
    params: vec4<f32>,
};

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(0) @binding(1) var env_map: texture_cube<f32>;
@group(0) @binding(2) var env_sampler: sampler;
@group(0) @binding(3) var shadow_map: texture_depth_2d;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
};

const PI: f32 = 3.14159265359;
"#;

const SHADOW_DEPTH: &str = r#"
@vertex
fn vs_main(v: VertexInput) -> @builtin(position) vec4<f32> {
    return u.light_space * u.model * vec4<f32>(v.position, 1.0);
}
"#;

const GEOMETRY: &str = r#"
struct GeometryOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) normal: vec3<f32>,
};

struct GBufferTexels {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) albedo: vec4<f32>,
};

@vertex
fn vs_main(v: VertexInput) -> GeometryOutput {
    let world = u.model * vec4<f32>(v.position, 1.0);
    var out: GeometryOutput;
    out.clip = u.projection * u.view * world;
    out.world_pos = world.xyz;
    out.normal = (u.normal_matrix * vec4<f32>(v.normal, 0.0)).xyz;
    return out;
}

@fragment
fn fs_main(in: GeometryOutput) -> GBufferTexels {
    var out: GBufferTexels;
    out.position = vec4<f32>(in.world_pos, 1.0);
    out.normal = vec4<f32>(normalize(in.normal), 1.0);
    out.albedo = u.albedo;
    return out;
}
"#;

const FORWARD_LIGHTING: &str = r#"
struct LitOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) normal: vec3<f32>,
};

@vertex
fn vs_main(v: VertexInput) -> LitOutput {
    let world = u.model * vec4<f32>(v.position, 1.0);
    var out: LitOutput;
    out.clip = u.projection * u.view * world;
    out.world_pos = world.xyz;
    out.normal = (u.normal_matrix * vec4<f32>(v.normal, 0.0)).xyz;
    return out;
}

fn shadow_factor(world_pos: vec3<f32>) -> f32 {
    let light = u.light_space * vec4<f32>(world_pos, 1.0);
    let ndc = light.xyz / light.w;
    if (ndc.z > 1.0) {
        return 0.0;
    }
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if (any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0))) {
        return 0.0;
    }
    let dims = vec2<i32>(textureDimensions(shadow_map));
    let texel = clamp(vec2<i32>(uv * vec2<f32>(dims)), vec2<i32>(0), dims - vec2<i32>(1));
    let closest = textureLoad(shadow_map, texel, 0);
    return select(0.0, 1.0, ndc.z - u.params.y > closest);
}

@fragment
fn fs_main(in: LitOutput) -> @location(0) vec4<f32> {
    let n = normalize(in.normal);
    let l = -normalize(u.light_direction.xyz);
    let diffuse = max(dot(n, l), 0.0) * u.light_color.rgb;
    let shadow = shadow_factor(in.world_pos);
    let color = u.albedo.rgb * (u.ambient_color.rgb + (1.0 - shadow) * diffuse);
    return vec4<f32>(color, u.albedo.a);
}
"#;

/// Vertex stage for cube meshes drawn around the eye at the far plane.
const CUBE_VERTEX: &str = r#"
struct CubeOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) direction: vec3<f32>,
};

@vertex
fn vs_main(v: VertexInput) -> CubeOutput {
    let rotation = mat4x4<f32>(
        vec4<f32>(u.view[0].xyz, 0.0),
        vec4<f32>(u.view[1].xyz, 0.0),
        vec4<f32>(u.view[2].xyz, 0.0),
        vec4<f32>(0.0, 0.0, 0.0, 1.0),
    );
    let clip = u.projection * rotation * vec4<f32>(v.position, 1.0);
    var out: CubeOutput;
    out.clip = clip.xyww;
    out.direction = v.position;
    return out;
}
"#;

const SKYBOX: &str = r#"
@fragment
fn fs_main(in: CubeOutput) -> @location(0) vec4<f32> {
    return textureSampleLevel(env_map, env_sampler, in.direction, 0.0);
}
"#;

const IRRADIANCE: &str = r#"
@fragment
fn fs_main(in: CubeOutput) -> @location(0) vec4<f32> {
    let n = normalize(in.direction);
    var up = vec3<f32>(0.0, 1.0, 0.0);
    if (abs(n.y) >= 0.999) {
        up = vec3<f32>(0.0, 0.0, 1.0);
    }
    let right = normalize(cross(up, n));
    up = cross(n, right);

    let delta = u.params.z;
    let phi_steps = u32(ceil(2.0 * PI / delta));
    let theta_steps = u32(ceil(0.5 * PI / delta));
    var sum = vec3<f32>(0.0);
    var weight = 0.0;
    for (var i = 0u; i < phi_steps; i++) {
        let phi = f32(i) * delta;
        for (var j = 0u; j < theta_steps; j++) {
            let theta = f32(j) * delta;
            let local = vec3<f32>(sin(theta) * cos(phi), sin(theta) * sin(phi), cos(theta));
            let dir = right * local.x + up * local.y + n * local.z;
            let w = cos(theta) * sin(theta);
            sum += textureSampleLevel(env_map, env_sampler, dir, 0.0).rgb * w;
            weight += w;
        }
    }
    if (weight <= 0.0) {
        return vec4<f32>(textureSampleLevel(env_map, env_sampler, n, 0.0).rgb, 1.0);
    }
    return vec4<f32>(sum / weight, 1.0);
}
"#;

/// GGX sampling helpers shared by prefiltering and BRDF integration.
const GGX: &str = r#"
fn hammersley(i: u32, n: u32) -> vec2<f32> {
    return vec2<f32>(f32(i) / f32(n), f32(reverseBits(i)) * 2.3283064365386963e-10);
}

fn importance_sample_ggx(xi: vec2<f32>, n: vec3<f32>, roughness: f32) -> vec3<f32> {
    let a = roughness * roughness;
    let phi = 2.0 * PI * xi.x;
    let cos_theta = sqrt(max((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y), 0.0));
    let sin_theta = sqrt(max(1.0 - cos_theta * cos_theta, 0.0));
    let h = vec3<f32>(cos(phi) * sin_theta, sin(phi) * sin_theta, cos_theta);
    var up = vec3<f32>(0.0, 0.0, 1.0);
    if (abs(n.z) >= 0.999) {
        up = vec3<f32>(1.0, 0.0, 0.0);
    }
    let tangent = normalize(cross(up, n));
    let bitangent = cross(n, tangent);
    return normalize(tangent * h.x + bitangent * h.y + n * h.z);
}
"#;

const PREFILTER: &str = r#"
@fragment
fn fs_main(in: CubeOutput) -> @location(0) vec4<f32> {
    let n = normalize(in.direction);
    let roughness = u.params.x;
    let count = u32(u.params.w);
    var sum = vec3<f32>(0.0);
    var weight = 0.0;
    for (var i = 0u; i < count; i++) {
        let h = importance_sample_ggx(hammersley(i, count), n, roughness);
        let l = normalize(2.0 * dot(n, h) * h - n);
        let n_dot_l = dot(n, l);
        if (n_dot_l > 0.0) {
            sum += textureSampleLevel(env_map, env_sampler, l, 0.0).rgb * n_dot_l;
            weight += n_dot_l;
        }
    }
    if (weight <= 0.0) {
        return vec4<f32>(textureSampleLevel(env_map, env_sampler, n, 0.0).rgb, 1.0);
    }
    return vec4<f32>(sum / weight, 1.0);
}
"#;

const BRDF: &str = r#"
struct PlaneOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(v: VertexInput) -> PlaneOutput {
    var out: PlaneOutput;
    out.clip = vec4<f32>(v.position.xy, 0.0, 1.0);
    out.uv = vec2<f32>(v.position.x * 0.5 + 0.5, 0.5 - v.position.y * 0.5);
    return out;
}

fn geometry_schlick_ggx(n_dot_v: f32, roughness: f32) -> f32 {
    let k = roughness * roughness / 2.0;
    return n_dot_v / (n_dot_v * (1.0 - k) + k);
}

@fragment
fn fs_main(in: PlaneOutput) -> @location(0) vec4<f32> {
    let n_dot_v = max(in.uv.x, 1e-4);
    let roughness = in.uv.y;
    let count = u32(u.params.w);
    let v = vec3<f32>(sqrt(max(1.0 - n_dot_v * n_dot_v, 0.0)), 0.0, n_dot_v);
    let n = vec3<f32>(0.0, 0.0, 1.0);
    var a = 0.0;
    var b = 0.0;
    for (var i = 0u; i < count; i++) {
        let h = importance_sample_ggx(hammersley(i, count), n, roughness);
        let l = normalize(2.0 * dot(v, h) * h - v);
        let n_dot_l = max(l.z, 0.0);
        let n_dot_h = max(h.z, 0.0);
        let v_dot_h = max(dot(v, h), 0.0);
        if (n_dot_l > 0.0 && n_dot_h > 0.0) {
            let g = geometry_schlick_ggx(n_dot_v, roughness) * geometry_schlick_ggx(n_dot_l, roughness);
            let g_vis = g * v_dot_h / (n_dot_h * n_dot_v);
            let fc = pow(1.0 - v_dot_h, 5.0);
            a += (1.0 - fc) * g_vis;
            b += fc * g_vis;
        }
    }
    let scale = 1.0 / f32(max(count, 1u));
    return vec4<f32>(a * scale, b * scale, 0.0, 1.0);
}
"#;

/// Full WGSL source for `kind`.
pub fn source(kind: ShaderKind) -> String {
    let body: &[&str] = match kind {
        ShaderKind::ShadowDepth => &[SHADOW_DEPTH],
        ShaderKind::ModelGeometry | ShaderKind::TerrainGeometry => &[GEOMETRY],
        ShaderKind::ForwardLighting => &[FORWARD_LIGHTING],
        ShaderKind::Skybox => &[CUBE_VERTEX, SKYBOX],
        ShaderKind::IrradianceConvolution => &[CUBE_VERTEX, IRRADIANCE],
        ShaderKind::ImportanceSampling => &[CUBE_VERTEX, GGX, PREFILTER],
        ShaderKind::BrdfIntegration => &[GGX, BRDF],
    };
    let mut src = String::from(PRELUDE);
    for part in body {
        src.push_str(part);
    }
    src
}

/// Whether `kind` has a fragment stage.
pub fn has_fragment(kind: ShaderKind) -> bool {
    kind != ShaderKind::ShadowDepth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_program_has_entry_points() {
        for kind in ShaderKind::ALL {
            let src = source(kind);
            assert!(src.contains("fn vs_main"), "{}", kind.name());
            assert_eq!(src.contains("fn fs_main"), has_fragment(kind), "{}", kind.name());
        }
    }

    #[test]
    fn geometry_programs_write_three_targets() {
        let src = source(ShaderKind::ModelGeometry);
        for location in 0..ShaderKind::ModelGeometry.color_outputs() {
            assert!(src.contains(&format!("@location({location}) ")));
        }
    }
}
