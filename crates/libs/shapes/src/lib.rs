//! Procedural indexed triangle meshes with per-vertex normals.

use std::f32::consts::TAU;

use bytemuck::{Pod, Zeroable};
use glam::{vec3, Vec3};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
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

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Box spanning [-1, 1] on every axis. Each face has its own four vertices so normals stay flat.
pub fn unit_box() -> Mesh {
    let faces = [
        (Vec3::Y, [vec3(-1., 1., -1.), vec3(1., 1., -1.), vec3(-1., 1., 1.), vec3(1., 1., 1.)]),
        (Vec3::NEG_Y, [vec3(1., -1., -1.), vec3(-1., -1., -1.), vec3(1., -1., 1.), vec3(-1., -1., 1.)]),
        (Vec3::X, [vec3(1., 1., -1.), vec3(1., 1., 1.), vec3(1., -1., -1.), vec3(1., -1., 1.)]),
        (Vec3::NEG_X, [vec3(-1., 1., -1.), vec3(-1., 1., 1.), vec3(-1., -1., -1.), vec3(-1., -1., 1.)]),
        (Vec3::NEG_Z, [vec3(-1., 1., -1.), vec3(1., 1., -1.), vec3(-1., -1., -1.), vec3(1., -1., -1.)]),
        (Vec3::Z, [vec3(-1., 1., 1.), vec3(1., 1., 1.), vec3(-1., -1., 1.), vec3(1., -1., 1.)]),
    ];
    // Per-face winding, relative to the face's first vertex.
    const FACE_INDICES: [[u16; 6]; 6] = [
        [0, 2, 1, 1, 2, 3],
        [0, 2, 1, 1, 2, 3],
        [0, 1, 2, 1, 3, 2],
        [0, 2, 1, 1, 2, 3],
        [0, 1, 2, 1, 3, 2],
        [0, 2, 1, 1, 2, 3],
    ];

    let vertices = faces
        .iter()
        .flat_map(|(normal, corners)| corners.iter().map(|&p| Vertex::new(p, *normal)))
        .collect();
    let indices = FACE_INDICES
        .iter()
        .enumerate()
        .flat_map(|(face, indices)| indices.iter().map(move |i| i + 4 * face as u16))
        .collect();

    Mesh { vertices, indices }
}

/// Most vertices a mesh can address with 16-bit indices.
pub const MAX_VERTICES: usize = u16::MAX as usize + 1;

/// Unit sphere with a vertex at each pole and `longitude` vertices on each of
/// `latitude - 1` rings. At least 4 longitude and 2 latitude divisions are used.
///
/// `None` when the sphere needs more than [`MAX_VERTICES`] vertices.
pub fn sphere(longitude: u16, latitude: u16) -> Option<Mesh> {
    let longitude = longitude.max(4);
    let latitude = latitude.max(2);
    if sphere_vertex_count(longitude, latitude) > MAX_VERTICES {
        return None;
    }

    let mut vertices = Vec::with_capacity(sphere_vertex_count(longitude, latitude));
    vertices.push(Vertex::new(Vec3::Y, Vec3::Y));
    for ring in 0..latitude - 1 {
        let h = 2.0 * (latitude - 1 - ring) as f32 / latitude as f32 - 1.0;
        let radius = (1.0 - h * h).sqrt();
        for x in 0..longitude {
            let angle = TAU * x as f32 / longitude as f32;
            let p = vec3(angle.cos() * radius, h, angle.sin() * radius);
            vertices.push(Vertex::new(p, p));
        }
    }
    vertices.push(Vertex::new(Vec3::NEG_Y, Vec3::NEG_Y));

    let mut indices = Vec::with_capacity(sphere_index_count(longitude, latitude));
    let wrap = |x: u16| x % longitude;

    let mut base = 1;
    for x in 0..longitude {
        indices.extend([0, base + wrap(x + 1), base + wrap(x)]);
    }
    for _ in 0..latitude - 2 {
        let next = base + longitude;
        for x in 0..longitude {
            indices.extend([base + wrap(x), base + wrap(x + 1), next + wrap(x)]);
            indices.extend([base + wrap(x + 1), next + wrap(x + 1), next + wrap(x)]);
        }
        base = next;
    }
    let south = base + longitude;
    for x in 0..longitude {
        indices.extend([south, base + wrap(x), base + wrap(x + 1)]);
    }

    Some(Mesh { vertices, indices })
}

fn sphere_vertex_count(longitude: u16, latitude: u16) -> usize {
    longitude as usize * (latitude as usize - 1) + 2
}

fn sphere_index_count(longitude: u16, latitude: u16) -> usize {
    let longitude = longitude as usize;
    longitude * 6 + longitude * 6 * (latitude as usize - 2)
}
