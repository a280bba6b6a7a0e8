//! Triangle lists for the built-in [`Geometry`] meshes.
//!
//! Every mesh is wound counter-clockwise when seen from outside (from above
//! for the terrain patch).

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use radiance_render::Geometry;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl Vertex {
    fn new(position: Vec3, normal: Vec3) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
        }
    }
}

const SPHERE_STACKS: u32 = 24;
const SPHERE_SLICES: u32 = 48;

pub fn mesh(geometry: Geometry) -> Vec<Vertex> {
    match geometry {
        Geometry::NdcPlane => plane(),
        Geometry::NdcCube => cube(),
        Geometry::Sphere => sphere(SPHERE_STACKS, SPHERE_SLICES),
        Geometry::TerrainPatch => patch(),
    }
}

/// Flip any triangle whose winding disagrees with `outward`.
fn orient(triangles: &mut [[Vertex; 3]], outward: impl Fn(Vec3) -> Vec3) {
    for tri in triangles {
        let [a, b, c] = tri.map(|v| Vec3::from_array(v.position));
        let centroid = (a + b + c) / 3.0;
        if (b - a).cross(c - a).dot(outward(centroid)) < 0.0 {
            tri.swap(1, 2);
        }
    }
}

fn quad(a: Vec3, b: Vec3, c: Vec3, d: Vec3, normal: Vec3) -> [[Vertex; 3]; 2] {
    let v = |p| Vertex::new(p, normal);
    [[v(a), v(b), v(c)], [v(a), v(c), v(d)]]
}

fn plane() -> Vec<Vertex> {
    let [a, b] = quad(
        Vec3::new(-1.0, -1.0, 0.0),
        Vec3::new(1.0, -1.0, 0.0),
        Vec3::new(1.0, 1.0, 0.0),
        Vec3::new(-1.0, 1.0, 0.0),
        Vec3::Z,
    );
    [a, b].concat()
}

fn cube() -> Vec<Vertex> {
    let p = 1.0_f32;
    let mut triangles = Vec::with_capacity(12);
    for axis in [Vec3::X, Vec3::Y, Vec3::Z] {
        for sign in [1.0, -1.0] {
            let n = axis * sign;
            let (t, b) = n.any_orthonormal_pair();
            let c = n * p;
            triangles.extend(quad(
                c - t * p - b * p,
                c + t * p - b * p,
                c + t * p + b * p,
                c - t * p + b * p,
                n,
            ));
        }
    }
    orient(&mut triangles, |c| c);
    triangles.concat()
}

fn sphere(stacks: u32, slices: u32) -> Vec<Vertex> {
    let point = |stack: u32, slice: u32| {
        let theta = std::f32::consts::PI * stack as f32 / stacks as f32;
        let phi = std::f32::consts::TAU * slice as f32 / slices as f32;
        Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin())
    };
    let v = |p: Vec3| Vertex::new(p, p);
    let mut triangles = Vec::new();
    for stack in 0..stacks {
        for slice in 0..slices {
            let a = point(stack, slice);
            let b = point(stack + 1, slice);
            let c = point(stack + 1, slice + 1);
            let d = point(stack, slice + 1);
            if stack != 0 {
                triangles.push([v(a), v(c), v(d)]);
            }
            if stack + 1 != stacks {
                triangles.push([v(a), v(b), v(c)]);
            }
        }
    }
    orient(&mut triangles, |c| c);
    triangles.concat()
}

fn patch() -> Vec<Vertex> {
    let h = 0.5;
    let mut triangles = quad(
        Vec3::new(-h, 0.0, -h),
        Vec3::new(-h, 0.0, h),
        Vec3::new(h, 0.0, h),
        Vec3::new(h, 0.0, -h),
        Vec3::Y,
    );
    orient(&mut triangles, |_| Vec3::Y);
    triangles.concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn winding_ok(vertices: &[Vertex], outward: impl Fn(Vec3) -> Vec3) -> bool {
        vertices.chunks(3).all(|tri| {
            let [a, b, c] = [0, 1, 2].map(|i| Vec3::from_array(tri[i].position));
            (b - a).cross(c - a).dot(outward((a + b + c) / 3.0)) > 0.0
        })
    }

    #[test]
    fn meshes_are_triangle_lists_wound_outward() {
        for geometry in [Geometry::NdcPlane, Geometry::NdcCube, Geometry::Sphere, Geometry::TerrainPatch] {
            let m = mesh(geometry);
            assert!(!m.is_empty());
            assert_eq!(m.len() % 3, 0, "{geometry:?}");
        }
        assert!(winding_ok(&mesh(Geometry::NdcCube), |c| c));
        assert!(winding_ok(&mesh(Geometry::Sphere), |c| c));
        assert!(winding_ok(&mesh(Geometry::TerrainPatch), |_| Vec3::Y));
        assert!(winding_ok(&mesh(Geometry::NdcPlane), |_| Vec3::Z));
    }

    #[test]
    fn sphere_vertices_lie_on_the_unit_sphere() {
        for v in mesh(Geometry::Sphere) {
            let p = Vec3::from_array(v.position);
            assert!((p.length() - 1.0).abs() < 1e-5);
        }
    }
}
