//! IBL integrals evaluated per texel.
//!
//! The irradiance and prefilter kernels divide by their accumulated weight,
//! so a constant environment filters to exactly that constant.

use std::f32::consts::{FRAC_PI_2, TAU};

use glam::{Vec2, Vec3, Vec4};

/// Low-discrepancy point `i` of `n`.
pub fn hammersley(i: u32, n: u32) -> Vec2 {
    let radical_inverse = i.reverse_bits() as f32 * 2.328_306_4e-10;
    Vec2::new(i as f32 / n as f32, radical_inverse)
}

/// Orthonormal basis around `n`, with `n` as the third axis.
fn tangent_frame(n: Vec3) -> (Vec3, Vec3) {
    let up = if n.z.abs() < 0.999 { Vec3::Z } else { Vec3::X };
    let tangent = up.cross(n).normalize();
    let bitangent = n.cross(tangent);
    (tangent, bitangent)
}

/// GGX half vector for sample `xi` around normal `n`.
pub fn importance_sample_ggx(xi: Vec2, n: Vec3, roughness: f32) -> Vec3 {
    let a = roughness * roughness;
    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).max(0.0).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let h = Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta);
    let (tangent, bitangent) = tangent_frame(n);
    (tangent * h.x + bitangent * h.y + n * h.z).normalize()
}

fn geometry_schlick_ggx(n_dot_v: f32, roughness: f32) -> f32 {
    // IBL remapping of k.
    let k = roughness * roughness / 2.0;
    n_dot_v / (n_dot_v * (1.0 - k) + k)
}

fn geometry_smith(n_dot_v: f32, n_dot_l: f32, roughness: f32) -> f32 {
    geometry_schlick_ggx(n_dot_v, roughness) * geometry_schlick_ggx(n_dot_l, roughness)
}

/// Cosine-weighted hemisphere average of `sample` around `normal`, walked in
/// steps of `delta` radians.
pub fn irradiance(normal: Vec3, delta: f32, mut sample: impl FnMut(Vec3) -> Vec4) -> Vec3 {
    let n = normal.normalize();
    let up = if n.y.abs() < 0.999 { Vec3::Y } else { Vec3::Z };
    let right = up.cross(n).normalize();
    let up = n.cross(right);

    let phi_steps = (TAU / delta).ceil() as u32;
    let theta_steps = (FRAC_PI_2 / delta).ceil() as u32;
    let mut sum = Vec3::ZERO;
    let mut weight = 0.0;
    for i in 0..phi_steps {
        let phi = i as f32 * delta;
        for j in 0..theta_steps {
            let theta = j as f32 * delta;
            let (sin_t, cos_t) = theta.sin_cos();
            let local = Vec3::new(sin_t * phi.cos(), sin_t * phi.sin(), cos_t);
            let dir = right * local.x + up * local.y + n * local.z;
            let w = cos_t * sin_t;
            sum += sample(dir).truncate() * w;
            weight += w;
        }
    }
    if weight > 0.0 {
        sum / weight
    } else {
        sample(n).truncate()
    }
}

/// GGX-prefiltered radiance around `normal` (taken as view and reflection
/// direction).
pub fn prefilter(
    normal: Vec3,
    roughness: f32,
    sample_count: u32,
    mut sample: impl FnMut(Vec3) -> Vec4,
) -> Vec3 {
    let n = normal.normalize();
    let v = n;
    let mut sum = Vec3::ZERO;
    let mut weight = 0.0;
    for i in 0..sample_count {
        let h = importance_sample_ggx(hammersley(i, sample_count), n, roughness);
        let l = (2.0 * v.dot(h) * h - v).normalize();
        let n_dot_l = n.dot(l);
        if n_dot_l > 0.0 {
            sum += sample(l).truncate() * n_dot_l;
            weight += n_dot_l;
        }
    }
    if weight > 0.0 {
        sum / weight
    } else {
        sample(n).truncate()
    }
}

/// Split-sum scale and bias for the given N.V and roughness.
pub fn integrate_brdf(n_dot_v: f32, roughness: f32, sample_count: u32) -> Vec2 {
    let n_dot_v = n_dot_v.max(1e-4);
    let v = Vec3::new((1.0 - n_dot_v * n_dot_v).max(0.0).sqrt(), 0.0, n_dot_v);
    let n = Vec3::Z;

    let mut a = 0.0;
    let mut b = 0.0;
    for i in 0..sample_count {
        let h = importance_sample_ggx(hammersley(i, sample_count), n, roughness);
        let l = (2.0 * v.dot(h) * h - v).normalize();
        let n_dot_l = l.z.max(0.0);
        let n_dot_h = h.z.max(0.0);
        let v_dot_h = v.dot(h).max(0.0);
        if n_dot_l > 0.0 && n_dot_h > 0.0 {
            let g = geometry_smith(n_dot_v, n_dot_l, roughness);
            let g_vis = g * v_dot_h / (n_dot_h * n_dot_v);
            let fc = (1.0 - v_dot_h).powi(5);
            a += (1.0 - fc) * g_vis;
            b += fc * g_vis;
        }
    }
    Vec2::new(a, b) / sample_count.max(1) as f32
}

/// Lambert term plus ambient, darkened where `shadow` is 1.
pub fn forward_lighting(
    albedo: Vec3,
    normal: Vec3,
    light_direction: Vec3,
    light_color: Vec3,
    ambient: Vec3,
    shadow: f32,
) -> Vec3 {
    let l = -light_direction.normalize_or_zero();
    let diffuse = normal.dot(l).max(0.0) * light_color;
    albedo * (ambient + (1.0 - shadow) * diffuse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hammersley_points_cover_the_unit_square() {
        let n = 16;
        for i in 0..n {
            let p = hammersley(i, n);
            assert!((0.0..1.0).contains(&p.x) && (0.0..1.0).contains(&p.y));
        }
        assert_eq!(hammersley(0, n), Vec2::ZERO);
        assert_eq!(hammersley(1, n).y, 0.5);
    }

    #[test]
    fn zero_roughness_samples_the_normal() {
        let n = Vec3::new(0.3, -0.5, 0.8).normalize();
        for i in 0..8 {
            let h = importance_sample_ggx(hammersley(i, 8), n, 0.0);
            assert!(h.abs_diff_eq(n, 1e-5));
        }
    }

    #[test]
    fn constant_environment_is_preserved() {
        let c = Vec4::new(0.25, 0.5, 1.0, 1.0);
        for n in [Vec3::X, Vec3::Y, Vec3::NEG_Y, Vec3::new(1.0, 1.0, -1.0)] {
            let irr = irradiance(n, 0.1, |_| c);
            assert!(irr.abs_diff_eq(c.truncate(), 1e-5), "{irr}");
            for roughness in [0.0, 0.5, 1.0] {
                let pre = prefilter(n, roughness, 64, |_| c);
                assert!(pre.abs_diff_eq(c.truncate(), 1e-5), "{pre}");
            }
        }
    }

    #[test]
    fn irradiance_only_sees_the_upper_hemisphere() {
        // Bright above, black below: a downward normal sees nothing.
        let sky = |d: Vec3| if d.y > 0.0 { Vec4::ONE } else { Vec4::ZERO };
        let up = irradiance(Vec3::Y, 0.05, sky);
        let down = irradiance(Vec3::NEG_Y, 0.05, sky);
        assert!(up.x > 0.99);
        assert!(down.x < 0.01);
    }

    #[test]
    fn brdf_scale_dominates_for_smooth_head_on_views() {
        let ab = integrate_brdf(1.0, 0.0, 64);
        assert!((ab.x - 1.0).abs() < 1e-3, "{ab}");
        assert!(ab.y < 1e-3);
        let rough = integrate_brdf(0.5, 1.0, 256);
        assert!(rough.x < ab.x);
    }

    #[test]
    fn lighting_respects_shadow() {
        let lit = forward_lighting(Vec3::ONE, Vec3::Y, Vec3::NEG_Y, Vec3::ONE, Vec3::ZERO, 0.0);
        let shadowed =
            forward_lighting(Vec3::ONE, Vec3::Y, Vec3::NEG_Y, Vec3::ONE, Vec3::splat(0.1), 1.0);
        assert_eq!(lit, Vec3::ONE);
        assert_eq!(shadowed, Vec3::splat(0.1));
    }
}
