//! Baked lighting probes and their registry.

mod bake;

pub use bake::{BakeReport, ProbePass};

use glam::Vec3;

use crate::device::{CubemapId, TextureId};
use crate::resource::{Cubemap, Texture};

/// Diffuse irradiance captured at a point.
#[derive(Debug)]
pub struct LightProbe {
    position: Vec3,
    irradiance: Cubemap,
}

impl LightProbe {
    pub fn new(position: Vec3, irradiance: Cubemap) -> Self {
        Self {
            position,
            irradiance,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn irradiance_map(&self) -> &Cubemap {
        &self.irradiance
    }
}

/// Prefiltered specular environment captured at a point. Mip `m` holds
/// roughness `m / (mips - 1)`.
#[derive(Debug)]
pub struct ReflectionProbe {
    position: Vec3,
    prefiltered: Cubemap,
}

impl ReflectionProbe {
    pub fn new(position: Vec3, prefiltered: Cubemap) -> Self {
        Self {
            position,
            prefiltered,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn prefilter_map(&self) -> &Cubemap {
        &self.prefiltered
    }
}

#[derive(Debug)]
pub enum Probe {
    Light(LightProbe),
    Reflection(ReflectionProbe),
}

impl From<LightProbe> for Probe {
    fn from(probe: LightProbe) -> Self {
        Probe::Light(probe)
    }
}

impl From<ReflectionProbe> for Probe {
    fn from(probe: ReflectionProbe) -> Self {
        Probe::Reflection(probe)
    }
}

/// Owns every baked probe plus the shared BRDF lookup table.
///
/// Lookups return the nearest scene probe, or the fallback probe when no
/// scene probe exists.
#[derive(Debug, Default)]
pub struct ProbeManager {
    light_probes: Vec<LightProbe>,
    reflection_probes: Vec<ReflectionProbe>,
    light_fallback: Option<LightProbe>,
    reflection_fallback: Option<ReflectionProbe>,
    brdf_lut: Option<Texture>,
}

impl ProbeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_probe(&mut self, probe: impl Into<Probe>) {
        match probe.into() {
            Probe::Light(p) => self.light_probes.push(p),
            Probe::Reflection(p) => self.reflection_probes.push(p),
        }
    }

    pub fn set_light_probe_fallback(&mut self, probe: LightProbe) {
        self.light_fallback = Some(probe);
    }

    pub fn set_reflection_probe_fallback(&mut self, probe: ReflectionProbe) {
        self.reflection_fallback = Some(probe);
    }

    pub fn set_brdf_lut(&mut self, lut: Texture) {
        self.brdf_lut = Some(lut);
    }

    pub fn light_probes(&self) -> &[LightProbe] {
        &self.light_probes
    }

    pub fn reflection_probes(&self) -> &[ReflectionProbe] {
        &self.reflection_probes
    }

    pub fn light_probe_fallback(&self) -> Option<&LightProbe> {
        self.light_fallback.as_ref()
    }

    pub fn reflection_probe_fallback(&self) -> Option<&ReflectionProbe> {
        self.reflection_fallback.as_ref()
    }

    pub fn brdf_lut(&self) -> Option<TextureId> {
        self.brdf_lut.as_ref().map(Texture::id)
    }

    pub fn closest_light_probe(&self, position: Vec3) -> Option<&LightProbe> {
        self.light_probes
            .iter()
            .min_by(|a, b| {
                a.position
                    .distance_squared(position)
                    .total_cmp(&b.position.distance_squared(position))
            })
            .or(self.light_fallback.as_ref())
    }

    pub fn closest_reflection_probe(&self, position: Vec3) -> Option<&ReflectionProbe> {
        self.reflection_probes
            .iter()
            .min_by(|a, b| {
                a.position
                    .distance_squared(position)
                    .total_cmp(&b.position.distance_squared(position))
            })
            .or(self.reflection_fallback.as_ref())
    }

    /// Irradiance map to shade a point with.
    pub fn irradiance_at(&self, position: Vec3) -> Option<CubemapId> {
        self.closest_light_probe(position)
            .map(|p| p.irradiance_map().id())
    }

    /// Drop scene probes ahead of a rebake. Fallbacks and the LUT stay.
    pub fn clear_scene_probes(&mut self) {
        let light = self.light_probes.len();
        let reflection = self.reflection_probes.len();
        self.light_probes.clear();
        self.reflection_probes.clear();
        tracing::debug!(light, reflection, "scene probes cleared");
    }
}
