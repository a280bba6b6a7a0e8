//! Ray-cast rasterization of the built-in meshes.
//!
//! Each pixel's NDC position is unprojected to a segment between the near
//! and far planes; the mesh is intersected analytically in model space.

use glam::{Mat3, Mat4, Vec2, Vec3};

use crate::device::{Geometry, ShaderKind};
use crate::uniforms::UniformBlock;

#[derive(Debug, Clone, Copy)]
pub(super) struct Fragment {
    pub depth: f32,
    pub world_pos: Vec3,
    pub normal: Vec3,
    /// View direction for cube meshes.
    pub direction: Vec3,
    pub uv: Vec2,
}

pub(super) struct Rasterizer {
    geometry: Geometry,
    face_cull: bool,
    clip_from_world: Mat4,
    model: Mat4,
    model_from_clip: Mat4,
    normal_matrix: Mat3,
    /// Inverse of projection times the rotation-only view, for cube meshes.
    inv_rotation_clip: Mat4,
}

impl Rasterizer {
    pub fn new(
        geometry: Geometry,
        shader: ShaderKind,
        uniforms: &UniformBlock,
        face_cull: bool,
    ) -> Self {
        let clip_from_world = uniforms.clip_from_world(shader);
        let rotation = Mat4::from_mat3(Mat3::from_mat4(uniforms.view));
        Self {
            geometry,
            face_cull,
            clip_from_world,
            model: uniforms.model,
            model_from_clip: (clip_from_world * uniforms.model).inverse(),
            normal_matrix: Mat3::from_mat4(uniforms.model.inverse()).transpose(),
            inv_rotation_clip: (uniforms.projection * rotation).inverse(),
        }
    }

    /// Fragment produced at `ndc`, if the mesh covers it.
    pub fn fragment(&self, ndc: Vec2, uv: Vec2) -> Option<Fragment> {
        match self.geometry {
            Geometry::NdcPlane => Some(Fragment {
                depth: 0.0,
                world_pos: ndc.extend(0.0),
                normal: Vec3::Z,
                direction: Vec3::Z,
                uv,
            }),
            Geometry::NdcCube => {
                // Seen from inside, every face is a back face.
                if self.face_cull {
                    return None;
                }
                let near = self.inv_rotation_clip.project_point3(ndc.extend(0.0));
                let far = self.inv_rotation_clip.project_point3(ndc.extend(1.0));
                let direction = (far - near).try_normalize()?;
                Some(Fragment {
                    depth: 1.0,
                    world_pos: direction,
                    normal: -direction,
                    direction,
                    uv,
                })
            }
            Geometry::Sphere => self.sphere(ndc, uv),
            Geometry::TerrainPatch => self.patch(ndc, uv),
        }
    }

    /// Segment through `ndc` in model space, origin at the near plane and
    /// `t = 1` at the far plane.
    fn model_segment(&self, ndc: Vec2) -> (Vec3, Vec3) {
        let near = self.model_from_clip.project_point3(ndc.extend(0.0));
        let far = self.model_from_clip.project_point3(ndc.extend(1.0));
        (near, far - near)
    }

    fn finish(&self, model_pos: Vec3, model_normal: Vec3, uv: Vec2) -> Option<Fragment> {
        let world_pos = self.model.transform_point3(model_pos);
        let depth = self.clip_from_world.project_point3(world_pos).z;
        if !(0.0..=1.0).contains(&depth) {
            return None;
        }
        Some(Fragment {
            depth,
            world_pos,
            normal: (self.normal_matrix * model_normal).normalize_or_zero(),
            direction: Vec3::ZERO,
            uv,
        })
    }

    fn sphere(&self, ndc: Vec2, uv: Vec2) -> Option<Fragment> {
        let (o, d) = self.model_segment(ndc);
        let a = d.dot(d);
        let b = 2.0 * o.dot(d);
        let c = o.dot(o) - 1.0;
        let disc = b * b - 4.0 * a * c;
        if a == 0.0 || disc < 0.0 {
            return None;
        }
        let root = disc.sqrt();
        let entry = (-b - root) / (2.0 * a);
        let exit = (-b + root) / (2.0 * a);
        let t = if (0.0..=1.0).contains(&entry) {
            entry
        } else if !self.face_cull && (0.0..=1.0).contains(&exit) {
            exit
        } else {
            return None;
        };
        let p = o + d * t;
        self.finish(p, p, uv)
    }

    fn patch(&self, ndc: Vec2, uv: Vec2) -> Option<Fragment> {
        let (o, d) = self.model_segment(ndc);
        if d.y == 0.0 {
            return None;
        }
        let front_facing = d.y < 0.0;
        if self.face_cull && !front_facing {
            return None;
        }
        let t = -o.y / d.y;
        if !(0.0..=1.0).contains(&t) {
            return None;
        }
        let p = o + d * t;
        if p.x.abs() > 0.5 || p.z.abs() > 0.5 {
            return None;
        }
        self.finish(p, Vec3::Y, uv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniforms(eye: Vec3, target: Vec3, model: Mat4) -> UniformBlock {
        UniformBlock {
            projection: Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0),
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            model,
            ..UniformBlock::default()
        }
    }

    #[test]
    fn sphere_front_hit_faces_the_camera() {
        let u = uniforms(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Mat4::IDENTITY);
        let r = Rasterizer::new(Geometry::Sphere, ShaderKind::ModelGeometry, &u, true);
        let f = r.fragment(Vec2::ZERO, Vec2::splat(0.5)).unwrap();
        assert!(f.world_pos.abs_diff_eq(Vec3::Z, 1e-3), "{}", f.world_pos);
        assert!(f.normal.abs_diff_eq(Vec3::Z, 1e-3));
        assert!(f.depth > 0.0 && f.depth < 1.0);
        assert!(r.fragment(Vec2::new(0.9, 0.9), Vec2::ZERO).is_none());
    }

    #[test]
    fn scaled_sphere_is_larger() {
        let model = Mat4::from_scale(Vec3::splat(2.0));
        let u = uniforms(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, model);
        let r = Rasterizer::new(Geometry::Sphere, ShaderKind::ModelGeometry, &u, true);
        let f = r.fragment(Vec2::ZERO, Vec2::splat(0.5)).unwrap();
        assert!(f.world_pos.abs_diff_eq(Vec3::new(0.0, 0.0, 2.0), 1e-3));
    }

    #[test]
    fn inside_sphere_needs_culling_off() {
        let u = uniforms(Vec3::ZERO, Vec3::NEG_Z, Mat4::from_scale(Vec3::splat(3.0)));
        let culled = Rasterizer::new(Geometry::Sphere, ShaderKind::ModelGeometry, &u, true);
        assert!(culled.fragment(Vec2::ZERO, Vec2::ZERO).is_none());
        let open = Rasterizer::new(Geometry::Sphere, ShaderKind::ModelGeometry, &u, false);
        let f = open.fragment(Vec2::ZERO, Vec2::ZERO).unwrap();
        assert!(f.world_pos.abs_diff_eq(Vec3::new(0.0, 0.0, -3.0), 1e-3));
    }

    #[test]
    fn patch_is_one_sided() {
        let model = Mat4::from_scale(Vec3::new(10.0, 1.0, 10.0));
        let above = uniforms(Vec3::new(0.0, 5.0, 0.1), Vec3::ZERO, model);
        let r = Rasterizer::new(Geometry::TerrainPatch, ShaderKind::TerrainGeometry, &above, true);
        let f = r.fragment(Vec2::ZERO, Vec2::ZERO).unwrap();
        assert!(f.world_pos.y.abs() < 1e-4);
        assert!(f.normal.abs_diff_eq(Vec3::Y, 1e-5));

        let below = uniforms(Vec3::new(0.0, -5.0, 0.1), Vec3::ZERO, model);
        let r = Rasterizer::new(Geometry::TerrainPatch, ShaderKind::TerrainGeometry, &below, true);
        assert!(r.fragment(Vec2::ZERO, Vec2::ZERO).is_none());
    }

    #[test]
    fn cube_direction_ignores_eye_translation() {
        let u = uniforms(Vec3::new(30.0, 4.0, -2.0), Vec3::new(30.0, 4.0, -3.0), Mat4::IDENTITY);
        let r = Rasterizer::new(Geometry::NdcCube, ShaderKind::Skybox, &u, false);
        let f = r.fragment(Vec2::ZERO, Vec2::splat(0.5)).unwrap();
        assert!(f.direction.abs_diff_eq(Vec3::NEG_Z, 1e-4));
        assert_eq!(f.depth, 1.0);
        let culled = Rasterizer::new(Geometry::NdcCube, ShaderKind::Skybox, &u, true);
        assert!(culled.fragment(Vec2::ZERO, Vec2::ZERO).is_none());
    }
}
