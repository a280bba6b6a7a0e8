use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use glam::Vec4;
use radiance_common::{CubeFace, IblSettings};
use radiance_render::{GpuScene, GraphicsDevice, ProbeManager, ProbePass, RenderContext, SoftwareDevice};
use radiance_render_wgpu::WgpuDevice;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "radiance-cli", about = "CLI tool for radiance IBL baking")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Software,
    Wgpu,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate versions and default IBL constants
    Info,
    /// Bake the fallback IBL and every probe placed in a scene file
    Bake {
        /// Scene description (.yaml, .yml or .json)
        #[arg(short, long)]
        scene: PathBuf,
        #[arg(short, long, value_enum, default_value = "software")]
        backend: Backend,
        /// YAML file overriding IBL settings
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Start from the small preview settings instead of the defaults
        #[arg(long)]
        preview: bool,
    },
    /// Bake only the BRDF lookup table and print a few samples
    BrdfLut {
        #[arg(short, long, default_value = "32")]
        resolution: u32,
        #[arg(short, long, value_enum, default_value = "software")]
        backend: Backend,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            let defaults = IblSettings::default();
            println!("radiance-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", radiance_common::crate_info());
            println!("scene: {}", radiance_scene::crate_info());
            println!("render: {}", radiance_render::crate_info());
            println!("render-wgpu: {}", radiance_render_wgpu::crate_info());
            println!(
                "ibl: capture={} light_probe={} reflection_probe={}x{} mips brdf_lut={} shadowmap={}",
                defaults.capture_resolution,
                defaults.light_probe_resolution,
                defaults.reflection_probe_resolution,
                defaults.reflection_probe_mip_count,
                defaults.brdf_lut_resolution,
                defaults.shadowmap_resolution,
            );
        }
        Commands::Bake {
            scene,
            backend,
            settings,
            preview,
        } => {
            let settings = load_settings(settings.as_deref(), preview)?;
            match backend {
                Backend::Software => bake(SoftwareDevice::new(), &scene, settings)?,
                Backend::Wgpu => bake(WgpuDevice::new_headless()?, &scene, settings)?,
            }
        }
        Commands::BrdfLut {
            resolution,
            backend,
        } => {
            let settings = IblSettings {
                brdf_lut_resolution: resolution,
                ..IblSettings::preview()
            };
            match backend {
                Backend::Software => brdf_lut(SoftwareDevice::new(), settings)?,
                Backend::Wgpu => brdf_lut(WgpuDevice::new_headless()?, settings)?,
            }
        }
    }

    Ok(())
}

fn load_settings(path: Option<&Path>, preview: bool) -> anyhow::Result<IblSettings> {
    let settings = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings {}", path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing settings {}", path.display()))?
        }
        None if preview => IblSettings::preview(),
        None => IblSettings::default(),
    };
    settings.validate()?;
    Ok(settings)
}

fn bake<D: GraphicsDevice>(device: D, scene: &Path, settings: IblSettings) -> anyhow::Result<()> {
    let scene3d = radiance_scene::load_scene(scene)
        .with_context(|| format!("loading scene {}", scene.display()))?;
    let backend = device.backend_name();
    let mut ctx = RenderContext::new(device)?;
    let mut gpu_scene = GpuScene::upload(&mut ctx, scene3d, settings.skybox_resolution)?;
    let mut pass = ProbePass::new(&mut ctx, settings)?;
    let mut probes = ProbeManager::new();

    println!("Baking {} on {backend}", scene.display());
    // A freshly loaded scene still carries its construction events.
    if let Some(baked) = pass.rebake_if_stale(&mut ctx, &mut gpu_scene, &mut probes)? {
        println!("Baked: {baked}");
    }
    if probes.brdf_lut().is_none() {
        let ibl = pass.pregenerate_ibl(&mut ctx, &gpu_scene, &mut probes)?;
        println!("IBL: {ibl}");
    }

    let fallback = probes
        .light_probe_fallback()
        .map(|p| (p.position(), p.irradiance_map().id()));
    let light = fallback
        .into_iter()
        .chain(probes.light_probes().iter().map(|p| (p.position(), p.irradiance_map().id())));
    for (i, (position, cubemap)) in light.enumerate() {
        let label = if i == 0 { "fallback".to_string() } else { format!("light #{i}") };
        println!("{label} at {position}:");
        for face in CubeFace::ALL {
            let texels = ctx.device_mut().read_cubemap_face(cubemap, face, 0)?;
            let mean = mean(&texels);
            println!("  {face:?}: ({:.3}, {:.3}, {:.3})", mean.x, mean.y, mean.z);
        }
    }

    let reflection = probes
        .reflection_probe_fallback()
        .into_iter()
        .chain(probes.reflection_probes());
    for (i, probe) in reflection.enumerate() {
        let map = probe.prefilter_map();
        let extents: Vec<String> = (0..map.mip_count())
            .map(|mip| {
                let size = map.mip_size(mip);
                format!("{size}x{size}")
            })
            .collect();
        let label = if i == 0 { "fallback".to_string() } else { format!("reflection #{i}") };
        println!("{label} at {}: mips [{}]", probe.position(), extents.join(", "));
    }
    Ok(())
}

fn brdf_lut<D: GraphicsDevice>(device: D, settings: IblSettings) -> anyhow::Result<()> {
    let resolution = settings.brdf_lut_resolution;
    let mut ctx = RenderContext::new(device)?;
    let mut pass = ProbePass::new(&mut ctx, settings)?;
    let lut = pass.generate_brdf_lut(&mut ctx)?;
    let texels = ctx.device_mut().read_texture(lut.id())?;

    println!("BRDF LUT {resolution}x{resolution} (x: N.V, y: roughness)");
    let last = resolution - 1;
    for (row, col) in [(0, last), (0, last / 2), (last / 2, last / 2), (last, last), (last, 0)] {
        let texel = texels[(row * resolution + col) as usize];
        println!(
            "  N.V={:.2} roughness={:.2}: scale={:.3} bias={:.3}",
            (col as f32 + 0.5) / resolution as f32,
            (row as f32 + 0.5) / resolution as f32,
            texel.x,
            texel.y
        );
    }
    Ok(())
}

fn mean(texels: &[Vec4]) -> Vec4 {
    if texels.is_empty() {
        return Vec4::ZERO;
    }
    texels.iter().copied().sum::<Vec4>() / texels.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_bake() {
        let cli = Cli::try_parse_from([
            "radiance-cli",
            "bake",
            "--scene",
            "scene.yaml",
            "--backend",
            "wgpu",
            "--preview",
        ])
        .unwrap();
        match cli.command {
            Commands::Bake {
                scene,
                backend,
                settings,
                preview,
            } => {
                assert_eq!(scene, PathBuf::from("scene.yaml"));
                assert_eq!(backend, Backend::Wgpu);
                assert!(settings.is_none());
                assert!(preview);
            }
            _ => panic!("expected bake"),
        }
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ibl.yaml");
        std::fs::write(&path, "capture_resolution: 64\nreflection_probe_mip_count: 4\n").unwrap();
        let settings = load_settings(Some(&path), false).unwrap();
        assert_eq!(settings.capture_resolution, 64);
        assert_eq!(settings.reflection_probe_mip_count, 4);
        assert_eq!(settings.brdf_lut_resolution, IblSettings::default().brdf_lut_resolution);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ibl.yaml");
        std::fs::write(&path, "capture_resolution: 0\n").unwrap();
        assert!(load_settings(Some(&path), false).is_err());
    }

    #[test]
    fn software_bake_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.yaml");
        std::fs::write(
            &path,
            "skybox: { kind: solid, color: [0.5, 0.6, 0.7] }\nprobes:\n  - [0.0, 2.0, 0.0]\n",
        )
        .unwrap();
        bake(SoftwareDevice::new(), &path, IblSettings::preview()).unwrap();
    }

    #[test]
    fn mean_of_texels() {
        let m = mean(&[Vec4::ONE, Vec4::ZERO]);
        assert_eq!(m, Vec4::splat(0.5));
        assert_eq!(mean(&[]), Vec4::ZERO);
    }
}
