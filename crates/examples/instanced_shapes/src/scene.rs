use anyhow::{anyhow, Result};
use glam::{Mat4, Vec3, Vec4};
use rt_core::{HitGroup, InstancePlacement, MeshData, StaticScene, Vertex};

const BOX: usize = 0;
const SPHERE: usize = 1;

fn mesh_data(mesh: shapes::Mesh) -> MeshData {
    MeshData {
        vertices: mesh
            .vertices
            .iter()
            .map(|v| Vertex {
                position: v.position,
                normal: v.normal,
            })
            .collect(),
        indices: mesh.indices,
    }
}

/// A red and a yellow box shaded with Lambert, and a green half-Lambert sphere behind them.
pub fn box_and_sphere(sphere_longitude: u16, sphere_latitude: u16) -> Result<StaticScene> {
    let sphere = shapes::sphere(sphere_longitude, sphere_latitude).ok_or_else(|| {
        anyhow!(
            "A {sphere_longitude}x{sphere_latitude} sphere needs more than {} vertices",
            shapes::MAX_VERTICES
        )
    })?;
    let meshes = vec![mesh_data(shapes::unit_box()), mesh_data(sphere)];

    let instances = vec![
        InstancePlacement {
            mesh: BOX,
            transform: Mat4::from_translation(Vec3::new(-1.5, 0.0, 0.0)),
            color: Vec4::new(1.0, 0.0, 0.0, 1.0),
            hit_group: HitGroup::Lambert,
            hit_group_index: 0,
        },
        InstancePlacement {
            mesh: BOX,
            transform: Mat4::from_translation(Vec3::new(1.5, 0.0, 0.0))
                * Mat4::from_rotation_y(45f32.to_radians()),
            color: Vec4::new(1.0, 1.0, 0.0, 1.0),
            hit_group: HitGroup::Lambert,
            hit_group_index: 1,
        },
        InstancePlacement {
            mesh: SPHERE,
            transform: Mat4::from_translation(Vec3::new(0.0, 0.0, 2.5)),
            color: Vec4::new(0.0, 1.0, 0.0, 1.0),
            hit_group: HitGroup::HalfLambert,
            hit_group_index: 2,
        },
    ];

    Ok(StaticScene { meshes, instances })
}
