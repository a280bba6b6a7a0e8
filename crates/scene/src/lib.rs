//! Scene description: the data a probe bake captures.
//!
//! # Invariants
//! - Model iteration order is deterministic (BTreeMap keyed by EntityId).
//! - All mutations go through explicit operations and are logged, so callers
//!   can tell when baked probes are stale.

mod file;
mod scene;

pub use file::{load_scene, SceneError, SceneFile};
pub use scene::{Scene3D, SceneEvent, SceneModel, Skybox, Sun, Terrain};

pub fn crate_info() -> &'static str {
    "radiance-scene v0.1.0"
}
