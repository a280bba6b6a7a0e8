use glam::{Mat4, Vec3};
use radiance_common::{CubeFace, RenderError, CAPTURE_FAR_PLANE, CAPTURE_NEAR_PLANE};

/// Anything a pass can render from.
pub trait Camera {
    fn position(&self) -> Vec3;
    fn view_matrix(&self) -> Mat4;
    fn projection_matrix(&self) -> Mat4;

    fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Camera that renders the six faces of a cubemap from one point.
///
/// The face views are left-handed so that row 0 of every rendered face is the
/// top row of the standard face layout; all faces share one 90 degree
/// projection.
#[derive(Debug, Clone)]
pub struct CubemapCamera {
    position: Vec3,
    face: CubeFace,
    projection: Mat4,
}

impl CubemapCamera {
    pub fn new(position: Vec3, near: f32, far: f32) -> Self {
        Self {
            position,
            face: CubeFace::PositiveX,
            projection: Mat4::perspective_lh(std::f32::consts::FRAC_PI_2, 1.0, near, far),
        }
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn face(&self) -> CubeFace {
        self.face
    }

    pub fn switch_to_face(&mut self, face: CubeFace) {
        self.face = face;
    }

    /// Select face `index` in the standard order +X, -X, +Y, -Y, +Z, -Z.
    pub fn switch_camera_to_face(&mut self, index: usize) -> Result<(), RenderError> {
        let face = CubeFace::from_index(index).ok_or(RenderError::InvalidCubeFace(index))?;
        self.face = face;
        Ok(())
    }

    pub fn face_view(&self, face: CubeFace) -> Mat4 {
        Mat4::look_to_lh(self.position, face.forward(), face.up())
    }
}

impl Default for CubemapCamera {
    fn default() -> Self {
        Self::new(Vec3::ZERO, CAPTURE_NEAR_PLANE, CAPTURE_FAR_PLANE)
    }
}

impl Camera for CubemapCamera {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn view_matrix(&self) -> Mat4 {
        self.face_view(self.face)
    }

    fn projection_matrix(&self) -> Mat4 {
        self.projection
    }
}

/// Free-look perspective camera for regular frames, oriented by yaw and
/// pitch (radians, yaw 0 looking down +X).
#[derive(Debug, Clone)]
pub struct FlyCamera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            yaw: -std::f32::consts::FRAC_PI_2,
            pitch: 0.0,
            fov: 60.0_f32.to_radians(),
            aspect: 1.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl FlyCamera {
    pub fn looking_at(position: Vec3, target: Vec3) -> Self {
        let dir = (target - position).normalize_or_zero();
        Self {
            position,
            yaw: dir.z.atan2(dir.x),
            pitch: dir.y.clamp(-1.0, 1.0).asin(),
            ..Self::default()
        }
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }
}

impl Camera for FlyCamera {
    fn position(&self) -> Vec3 {
        self.position
    }

    fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// World-space direction through normalized screen coordinate `(u, v)`,
    /// `v` growing downwards.
    fn ray(camera: &impl Camera, u: f32, v: f32) -> Vec3 {
        let inv = camera.view_projection().inverse();
        let ndc_x = 2.0 * u - 1.0;
        let ndc_y = 1.0 - 2.0 * v;
        let near = inv.project_point3(Vec3::new(ndc_x, ndc_y, 0.0));
        let far = inv.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
        (far - near).normalize()
    }

    #[test]
    fn each_face_looks_along_its_axis() {
        let mut cam = CubemapCamera::new(Vec3::new(3.0, -2.0, 5.0), 0.1, 100.0);
        for (i, face) in CubeFace::ALL.into_iter().enumerate() {
            cam.switch_camera_to_face(i).unwrap();
            assert_eq!(cam.face(), face);
            let centre = ray(&cam, 0.5, 0.5);
            assert!(centre.abs_diff_eq(face.forward(), 1e-4), "{face:?}: {centre}");
        }
    }

    #[test]
    fn texel_rays_match_face_table() {
        let mut cam = CubemapCamera::default();
        for face in CubeFace::ALL {
            cam.switch_to_face(face);
            for &(u, v) in &[(0.1, 0.1), (0.9, 0.2), (0.3, 0.8), (0.75, 0.6)] {
                let expected = face.direction(u, v).normalize();
                let actual = ray(&cam, u, v);
                assert!(
                    actual.abs_diff_eq(expected, 1e-4),
                    "{face:?} ({u}, {v}): {actual} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn out_of_range_face_is_rejected() {
        let mut cam = CubemapCamera::default();
        cam.switch_camera_to_face(2).unwrap();
        assert!(matches!(
            cam.switch_camera_to_face(6),
            Err(RenderError::InvalidCubeFace(6))
        ));
        assert_eq!(cam.face(), CubeFace::PositiveY);
    }

    #[test]
    fn faces_share_one_projection() {
        let mut cam = CubemapCamera::default();
        let p = cam.projection_matrix();
        cam.switch_to_face(CubeFace::NegativeZ);
        assert_eq!(cam.projection_matrix(), p);
    }

    #[test]
    fn fly_camera_looks_where_asked() {
        let cam = FlyCamera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO);
        assert!(cam.forward().abs_diff_eq(Vec3::NEG_Z, 1e-5));
        let centre = ray(&cam, 0.5, 0.5);
        assert!(centre.abs_diff_eq(Vec3::NEG_Z, 1e-4));

        let down = FlyCamera::looking_at(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, 0.0, 1.0));
        assert!(down.pitch < 0.0);
        assert!(ray(&down, 0.5, 0.5).abs_diff_eq(Vec3::new(0.0, -5.0, 1.0).normalize(), 1e-4));
    }
}
