use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use radiance_common::{EntityId, Transform};

/// A change to the scene. Consumers use the log to decide whether baked
/// probes are stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SceneEvent {
    ModelAdded { id: EntityId, is_static: bool },
    ModelRemoved { id: EntityId, is_static: bool },
    ModelMoved { id: EntityId, is_static: bool },
    TerrainChanged,
    SkyboxChanged,
    SunChanged,
    ProbePlaced { position: Vec3 },
}

impl SceneEvent {
    /// Whether the event changes what a probe capture would see.
    pub fn invalidates_probes(&self) -> bool {
        match self {
            SceneEvent::ModelAdded { is_static, .. }
            | SceneEvent::ModelRemoved { is_static, .. }
            | SceneEvent::ModelMoved { is_static, .. } => *is_static,
            SceneEvent::TerrainChanged
            | SceneEvent::SkyboxChanged
            | SceneEvent::SunChanged
            | SceneEvent::ProbePlaced { .. } => true,
        }
    }
}

/// An opaque model. Geometry is a unit sphere shaped by the transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneModel {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default = "default_albedo")]
    pub albedo: Vec4,
    /// Static models are the only ones captured into probes.
    #[serde(default = "default_true", rename = "static")]
    pub is_static: bool,
}

impl SceneModel {
    pub fn new(transform: Transform, albedo: Vec4) -> Self {
        Self {
            name: None,
            transform,
            albedo,
            is_static: true,
        }
    }

    pub fn dynamic(mut self) -> Self {
        self.is_static = false;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Flat terrain patch: the unit XZ quad centred on the transform origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terrain {
    #[serde(default)]
    pub transform: Transform,
    #[serde(default = "default_albedo")]
    pub albedo: Vec4,
}

/// Environment seen where no geometry is hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Skybox {
    Solid { color: Vec3 },
    Gradient { zenith: Vec3, horizon: Vec3, ground: Vec3 },
}

impl Default for Skybox {
    fn default() -> Self {
        Skybox::Gradient {
            zenith: Vec3::new(0.25, 0.45, 0.85),
            horizon: Vec3::new(0.8, 0.85, 0.9),
            ground: Vec3::new(0.2, 0.18, 0.16),
        }
    }
}

impl Skybox {
    /// Radiance arriving from direction `dir`.
    pub fn radiance(&self, dir: Vec3) -> Vec3 {
        match self {
            Skybox::Solid { color } => *color,
            Skybox::Gradient {
                zenith,
                horizon,
                ground,
            } => {
                let y = dir.normalize_or_zero().y;
                if y >= 0.0 {
                    horizon.lerp(*zenith, y)
                } else {
                    horizon.lerp(*ground, (-y * 4.0).min(1.0))
                }
            }
        }
    }
}

/// The directional light.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sun {
    /// Direction the light travels (from the sun towards the scene).
    pub direction: Vec3,
    pub color: Vec3,
    pub ambient: Vec3,
}

impl Default for Sun {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.3, -1.0, -0.4).normalize(),
            color: Vec3::splat(1.0),
            ambient: Vec3::splat(0.1),
        }
    }
}

fn default_albedo() -> Vec4 {
    Vec4::new(0.8, 0.8, 0.8, 1.0)
}

fn default_true() -> bool {
    true
}

/// Scene contents consumed by the renderer.
///
/// Models are stored in a BTreeMap so draw order is deterministic across
/// runs. Every mutation is recorded in the event log.
#[derive(Debug, Clone, Default)]
pub struct Scene3D {
    models: BTreeMap<EntityId, SceneModel>,
    terrain: Option<Terrain>,
    skybox: Skybox,
    sun: Sun,
    probe_placements: Vec<Vec3>,
    event_log: Vec<SceneEvent>,
}

impl Scene3D {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty scene lit only by a uniform skybox.
    pub fn with_skybox(skybox: Skybox) -> Self {
        Self {
            skybox,
            ..Self::default()
        }
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn models(&self) -> &BTreeMap<EntityId, SceneModel> {
        &self.models
    }

    pub fn get(&self, id: EntityId) -> Option<&SceneModel> {
        self.models.get(&id)
    }

    /// Opaque models in draw order, optionally restricted to static ones.
    pub fn opaque_models(&self, static_only: bool) -> impl Iterator<Item = &SceneModel> {
        self.models
            .values()
            .filter(move |m| !static_only || m.is_static)
            .filter(|m| m.albedo.w >= 1.0)
    }

    pub fn terrain(&self) -> Option<&Terrain> {
        self.terrain.as_ref()
    }

    pub fn skybox(&self) -> &Skybox {
        &self.skybox
    }

    pub fn sun(&self) -> &Sun {
        &self.sun
    }

    pub fn probe_placements(&self) -> &[Vec3] {
        &self.probe_placements
    }

    pub fn events(&self) -> &[SceneEvent] {
        &self.event_log
    }

    pub fn drain_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.event_log)
    }

    /// True if anything a probe would capture changed since the log was last
    /// drained.
    pub fn needs_probe_rebake(&self) -> bool {
        self.event_log.iter().any(SceneEvent::invalidates_probes)
    }

    pub fn spawn_model(&mut self, model: SceneModel) -> EntityId {
        let id = EntityId::new();
        self.event_log.push(SceneEvent::ModelAdded {
            id,
            is_static: model.is_static,
        });
        self.models.insert(id, model);
        id
    }

    pub fn despawn_model(&mut self, id: EntityId) -> Option<SceneModel> {
        let model = self.models.remove(&id);
        if let Some(ref m) = model {
            self.event_log.push(SceneEvent::ModelRemoved {
                id,
                is_static: m.is_static,
            });
        }
        model
    }

    pub fn set_transform(&mut self, id: EntityId, transform: Transform) -> bool {
        match self.models.get_mut(&id) {
            Some(model) => {
                model.transform = transform;
                self.event_log.push(SceneEvent::ModelMoved {
                    id,
                    is_static: model.is_static,
                });
                true
            }
            None => false,
        }
    }

    pub fn set_terrain(&mut self, terrain: Option<Terrain>) {
        self.terrain = terrain;
        self.event_log.push(SceneEvent::TerrainChanged);
    }

    pub fn set_skybox(&mut self, skybox: Skybox) {
        self.skybox = skybox;
        self.event_log.push(SceneEvent::SkyboxChanged);
    }

    pub fn set_sun(&mut self, sun: Sun) {
        self.sun = sun;
        self.event_log.push(SceneEvent::SunChanged);
    }

    pub fn place_probe(&mut self, position: Vec3) {
        self.probe_placements.push(position);
        self.event_log.push(SceneEvent::ProbePlaced { position });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_at(x: f32) -> SceneModel {
        SceneModel::new(
            Transform::from_position(Vec3::new(x, 0.0, 0.0)),
            Vec4::new(1.0, 0.0, 0.0, 1.0),
        )
    }

    #[test]
    fn scene_starts_empty() {
        let s = Scene3D::new();
        assert_eq!(s.model_count(), 0);
        assert!(s.terrain().is_none());
        assert!(!s.needs_probe_rebake());
    }

    #[test]
    fn spawn_and_despawn() {
        let mut s = Scene3D::new();
        let id = s.spawn_model(sphere_at(1.0));
        assert_eq!(s.model_count(), 1);
        assert!(s.get(id).is_some());
        assert!(s.despawn_model(id).is_some());
        assert_eq!(s.model_count(), 0);
        assert_eq!(s.events().len(), 2);
    }

    #[test]
    fn static_filter_skips_dynamic_models() {
        let mut s = Scene3D::new();
        s.spawn_model(sphere_at(0.0));
        s.spawn_model(sphere_at(2.0).dynamic());
        assert_eq!(s.opaque_models(false).count(), 2);
        assert_eq!(s.opaque_models(true).count(), 1);
    }

    #[test]
    fn translucent_models_are_not_opaque() {
        let mut s = Scene3D::new();
        let mut glass = sphere_at(0.0);
        glass.albedo.w = 0.5;
        s.spawn_model(glass);
        assert_eq!(s.opaque_models(false).count(), 0);
    }

    #[test]
    fn only_static_changes_invalidate_probes() {
        let mut s = Scene3D::new();
        s.spawn_model(sphere_at(0.0).dynamic());
        assert!(!s.needs_probe_rebake());

        s.drain_events();
        let id = s.spawn_model(sphere_at(1.0));
        assert!(s.needs_probe_rebake());

        s.drain_events();
        assert!(s.set_transform(id, Transform::from_position(Vec3::Y)));
        assert!(s.needs_probe_rebake());
    }

    #[test]
    fn draw_order_is_deterministic() {
        let mut s = Scene3D::new();
        for i in 0..50 {
            s.spawn_model(sphere_at(i as f32));
        }
        let keys: Vec<EntityId> = s.models().keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn gradient_sky_blends_towards_zenith() {
        let sky = Skybox::Gradient {
            zenith: Vec3::Z,
            horizon: Vec3::X,
            ground: Vec3::Y,
        };
        assert_eq!(sky.radiance(Vec3::Y), Vec3::Z);
        assert_eq!(sky.radiance(Vec3::X), Vec3::X);
        assert_eq!(sky.radiance(Vec3::NEG_Y), Vec3::Y);
    }

    #[test]
    fn solid_sky_is_constant() {
        let sky = Skybox::Solid {
            color: Vec3::new(0.2, 0.4, 0.6),
        };
        for dir in [Vec3::X, Vec3::NEG_Y, Vec3::new(1.0, 2.0, -3.0)] {
            assert_eq!(sky.radiance(dir), Vec3::new(0.2, 0.4, 0.6));
        }
    }
}
