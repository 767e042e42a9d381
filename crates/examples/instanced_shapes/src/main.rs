use std::{fs, path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use args::Args;
use clap::Parser;
use glam::{Vec3, Vec4};
use rt_core::{
    CameraPose, Renderer, RendererConfig, ShaderLibrary, ShaderStage, CLOSEST_HIT_HALF_LAMBERT,
    CLOSEST_HIT_LAMBERT, MISS, RAY_GENERATOR,
};
use surface::ReadbackSurface;
use vulkan::{ContextBuilder, VulkanDevice};

mod args;
mod scene;
mod surface;

const APP_NAME: &str = "Instanced shapes";

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();
    log::debug!("{args:?}");

    let context = ContextBuilder::new()
        .app_name(APP_NAME)
        .validation(args.validation)
        .with_raytracing_context(true)
        .build()?;
    log::info!("Running on {}", context.device_name());
    if !context.ray_tracing_enabled() {
        log::warn!("No ray tracing pipeline support, initialization will fail");
    }
    let device = Arc::new(VulkanDevice::new(context));

    let config = RendererConfig::default()
        .with_resolution(args.width, args.height)
        .with_fence_timeout(args.fence_timeout());
    let scene = scene::box_and_sphere(args.sphere_longitude, args.sphere_latitude)?;
    let shaders = load_shaders(&args.shader_dir)?;

    let mut renderer = Renderer::initialize(device.clone(), &scene, shaders, config)?;
    let mut surface = ReadbackSurface::new(&device, args.width, args.height)?;

    let light_direction = Vec3::new(1.0, -1.0, -1.0);
    for frame in 0..args.frames {
        let camera = CameraPose::orbit(frame as f32);
        renderer.render_frame(&mut surface, &camera, light_direction, Vec4::ONE)?;
    }
    log::info!("Rendered {} frames", surface.frames());

    surface.save(&args.output)?;
    renderer.shutdown()?;

    Ok(())
}

fn load_shaders(dir: &Path) -> Result<Vec<ShaderLibrary>> {
    [
        ("raygen.rgen.spv", RAY_GENERATOR, ShaderStage::RayGeneration),
        ("miss.rmiss.spv", MISS, ShaderStage::Miss),
        ("lambert.rchit.spv", CLOSEST_HIT_LAMBERT, ShaderStage::ClosestHit),
        ("half_lambert.rchit.spv", CLOSEST_HIT_HALF_LAMBERT, ShaderStage::ClosestHit),
    ]
    .into_iter()
    .map(|(file, export, stage)| {
        let path = dir.join(file);
        let bytecode = fs::read(&path).with_context(|| format!("Couldn't find spv file {}", path.display()))?;
        Ok(ShaderLibrary::single(bytecode, export, stage))
    })
    .collect()
}
