use anyhow::Result;
use bevy::math::Vec3;
use std::{cell::RefCell, f32::consts::PI, rc::Rc};
use terra::prelude::*;

const TERRAIN_SIZE: u32 = 1024;
const HEIGHT: f32 = 200.0;
const WORLD_SIZE: f32 = 4096.0;

fn procedural_heightmap() -> Result<HeightmapImage> {
    let samples = itertools::iproduct!(0..TERRAIN_SIZE, 0..TERRAIN_SIZE)
        .map(|(z, x)| {
            let (u, v) = (x as f32 / TERRAIN_SIZE as f32, z as f32 / TERRAIN_SIZE as f32);
            let height = 0.5 + 0.25 * (u * 4.0 * PI).sin() * (v * 3.0 * PI).cos();
            (height.clamp(0.0, 1.0) * 65535.0) as u16
        })
        .collect();

    Ok(HeightmapImage::new(
        TERRAIN_SIZE,
        TERRAIN_SIZE,
        HeightSamples::R16(samples),
    )?)
}

fn main() -> Result<()> {
    let backend = Rc::new(RefCell::new(HeadlessBackend::with_terra_jobs()));
    let services = RenderServices::from_backend(backend.clone());

    let camera = TerraCamera::perspective(
        Vec3::new(0.0, HEIGHT * 2.0, 0.0),
        Vec3::new(500.0, HEIGHT, -500.0),
        Vec3::Y,
        PI / 3.0,
        16.0 / 9.0,
        0.5,
        None,
    );

    let mut terra = Terra::new(0, services, camera, TerraConfig::default());
    terra.set_shared_resources(Some(TerraSharedResources::new_shared()))?;
    terra.load(
        &procedural_heightmap()?,
        Vec3::new(0.0, HEIGHT * 0.5, 0.0),
        Vec3::new(WORLD_SIZE, HEIGHT, WORLD_SIZE),
        false,
        false,
    )?;

    for frame in 0..4 {
        let angle = frame as f32 * 0.25 * PI;
        terra.update_default(Vec3::new(angle.cos(), -1.0, angle.sin()))?;

        println!("frame {frame}: {} cells", terra.renderables().count());
        for cell in terra.renderables() {
            println!(
                "  lod {} at {:?}, {} x {} pixels, {} vertices",
                cell.lod_level(),
                cell.grid_position(),
                cell.size().x,
                cell.size().y,
                cell.primitive_count()
            );
        }
    }

    let mut probe = Vec3::new(100.0, 0.0, -100.0);
    if terra.get_height_at(&mut probe) {
        println!("terrain height at (100, -100): {}", probe.y);
    }

    println!(
        "workspace updates: {}",
        backend.borrow().workspace_updates().len()
    );

    Ok(())
}
