//! Scene description files.
//!
//! A scene file lists models, an optional terrain patch, the skybox, the sun
//! and probe placements. YAML and JSON are accepted; the format is picked from
//! the file extension.
//!
//! ```yaml
//! skybox: { kind: solid, color: [0.5, 0.6, 0.7] }
//! models:
//!   - name: boulder
//!     transform: { position: [0.0, 1.0, 0.0] }
//!     albedo: [0.9, 0.2, 0.1, 1.0]
//! probes:
//!   - [0.0, 2.0, 0.0]
//! ```

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::scene::{Scene3D, SceneModel, Skybox, Sun, Terrain};

/// Errors from loading a scene description.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported scene file extension: {0:?}")]
    UnsupportedExtension(String),
    #[error("invalid scene: {0}")]
    Invalid(String),
}

/// Serialized form of a [`Scene3D`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneFile {
    pub models: Vec<SceneModel>,
    pub terrain: Option<Terrain>,
    pub skybox: Skybox,
    pub sun: Sun,
    pub probes: Vec<Vec3>,
}

impl SceneFile {
    pub fn from_yaml_str(text: &str) -> Result<Self, SceneError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SceneError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let text = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let file = match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&text)?,
            "json" => Self::from_json_str(&text)?,
            other => return Err(SceneError::UnsupportedExtension(other.to_string())),
        };
        tracing::debug!(
            path = %path.display(),
            models = file.models.len(),
            probes = file.probes.len(),
            "loaded scene file"
        );
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<(), SceneError> {
        let text = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            _ => serde_yaml::to_string(self)?,
        };
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SceneError> {
        for (i, model) in self.models.iter().enumerate() {
            if model.transform.scale.min_element() <= 0.0 {
                return Err(SceneError::Invalid(format!(
                    "model {i} has a non-positive scale"
                )));
            }
        }
        if self.sun.direction.length_squared() == 0.0 {
            return Err(SceneError::Invalid("sun direction is zero".into()));
        }
        Ok(())
    }

    /// Validate and build the runtime scene. The construction events are
    /// kept so the first bake sees the scene as dirty.
    pub fn into_scene(self) -> Result<Scene3D, SceneError> {
        self.validate()?;
        let mut scene = Scene3D::new();
        scene.set_skybox(self.skybox);
        scene.set_sun(Sun {
            direction: self.sun.direction.normalize(),
            ..self.sun
        });
        if self.terrain.is_some() {
            scene.set_terrain(self.terrain);
        }
        for model in self.models {
            scene.spawn_model(model);
        }
        for position in self.probes {
            scene.place_probe(position);
        }
        Ok(scene)
    }
}

/// Load a scene description file into a [`Scene3D`].
pub fn load_scene(path: &Path) -> Result<Scene3D, SceneError> {
    SceneFile::load(path)?.into_scene()
}
