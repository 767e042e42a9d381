use std::{collections::BTreeSet, sync::Arc};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::{
    gpu::{
        BufferPurpose, GpuBuffer, IndexFormat, RenderDevice, TriangleGeometry, VertexFormat, ViewDesc,
    },
    pipeline::{HIT_GROUP_HALF_LAMBERT, HIT_GROUP_LAMBERT},
    utils::compute_aligned_size,
    Descriptor, DescriptorHeapCategory, DescriptorHeaps, Error, Result,
};

/// Interleaved vertex as the hit shaders read it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

impl MeshData {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitGroup {
    Lambert,
    HalfLambert,
}

impl HitGroup {
    pub fn export_name(self) -> &'static str {
        match self {
            Self::Lambert => HIT_GROUP_LAMBERT,
            Self::HalfLambert => HIT_GROUP_HALF_LAMBERT,
        }
    }
}

/// One object placed in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancePlacement {
    /// Index into [`GeometrySource::meshes`].
    pub mesh: usize,
    pub transform: Mat4,
    pub color: Vec4,
    pub hit_group: HitGroup,
    /// Slot of this instance's record in the hit group table.
    pub hit_group_index: u32,
}

/// Static meshes and their placements.
pub trait GeometrySource {
    fn meshes(&self) -> &[MeshData];

    fn instances(&self) -> &[InstancePlacement];
}

#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    pub meshes: Vec<MeshData>,
    pub instances: Vec<InstancePlacement>,
}

impl GeometrySource for StaticScene {
    fn meshes(&self) -> &[MeshData] {
        &self.meshes
    }

    fn instances(&self) -> &[InstancePlacement] {
        &self.instances
    }
}

/// Where a mesh lives inside the shared vertex and index buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRange {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
}

/// A placement resolved against the shared geometry buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryInstance {
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub transform: Mat4,
    pub material_color: Vec4,
    /// Index of the bottom level structure built for the mesh.
    pub bottom: usize,
    pub hit_group: HitGroup,
    pub hit_group_index: u32,
}

pub fn resolve_instances(
    placements: &[InstancePlacement],
    meshes: &[MeshRange],
) -> Result<Vec<GeometryInstance>> {
    if placements.is_empty() {
        return Err(Error::InvalidScene("no instances placed".to_owned()));
    }

    let mut used = BTreeSet::new();
    placements
        .iter()
        .enumerate()
        .map(|(i, placement)| {
            let range = meshes.get(placement.mesh).ok_or_else(|| {
                Error::InvalidScene(format!(
                    "instance {i} references mesh {} of {}",
                    placement.mesh,
                    meshes.len()
                ))
            })?;
            if placement.hit_group_index as usize >= placements.len() {
                return Err(Error::InvalidScene(format!(
                    "instance {i} hit group index {} out of range for {} records",
                    placement.hit_group_index,
                    placements.len()
                )));
            }
            if !used.insert(placement.hit_group_index) {
                return Err(Error::InvalidScene(format!(
                    "hit group index {} used twice",
                    placement.hit_group_index
                )));
            }

            Ok(GeometryInstance {
                vertex_offset: range.vertex_offset,
                index_offset: range.index_offset,
                vertex_count: range.vertex_count,
                index_count: range.index_count,
                transform: placement.transform,
                material_color: placement.color,
                bottom: placement.mesh,
                hit_group: placement.hit_group,
                hit_group_index: placement.hit_group_index,
            })
        })
        .collect()
}

/// All meshes concatenated into one vertex buffer and one index buffer.
pub struct SceneGeometry<D: RenderDevice> {
    // Created after the vertex buffer, released before it.
    index_buffer: GpuBuffer<D>,
    vertex_buffer: GpuBuffer<D>,
    vertex_view: Descriptor,
    index_view: Descriptor,
    ranges: Vec<MeshRange>,
}

impl<D: RenderDevice> SceneGeometry<D> {
    pub fn new(device: &Arc<D>, heaps: &mut DescriptorHeaps<D>, meshes: &[MeshData]) -> Result<Self> {
        if meshes.is_empty() {
            return Err(Error::InvalidScene("no meshes".to_owned()));
        }

        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut ranges = Vec::with_capacity(meshes.len());
        for (i, mesh) in meshes.iter().enumerate() {
            if let Some(index) = mesh
                .indices
                .iter()
                .find(|&&index| index as usize >= mesh.vertices.len())
            {
                return Err(Error::InvalidScene(format!(
                    "mesh {i} index {index} exceeds {} vertices",
                    mesh.vertices.len()
                )));
            }

            ranges.push(MeshRange {
                vertex_offset: vertices.len() as _,
                vertex_count: mesh.vertices.len() as _,
                index_offset: indices.len() as _,
                index_count: mesh.indices.len() as _,
            });
            vertices.extend_from_slice(&mesh.vertices);
            indices.extend_from_slice(&mesh.indices);
        }

        // The index view reads 32-bit elements.
        let mut index_bytes = bytemuck::cast_slice::<u16, u8>(&indices).to_vec();
        index_bytes.resize(compute_aligned_size(index_bytes.len() as _, 4) as _, 0);

        let vertex_buffer = GpuBuffer::with_data(
            device,
            "vertices",
            BufferPurpose::Geometry,
            bytemuck::cast_slice(&vertices),
        )?;
        let index_buffer = GpuBuffer::with_data(device, "indices", BufferPurpose::Geometry, &index_bytes)?;

        let vertex_view = heaps.allocate(DescriptorHeapCategory::CbvSrvUav)?;
        device
            .create_view(
                &ViewDesc::StructuredBuffer {
                    buffer: vertex_buffer.id(),
                    num_elements: vertices.len() as _,
                    stride: std::mem::size_of::<Vertex>() as _,
                },
                &vertex_view,
            )
            .map_err(|e| Error::creation("vertex buffer view", e))?;

        let index_view = heaps.allocate(DescriptorHeapCategory::CbvSrvUav)?;
        device
            .create_view(
                &ViewDesc::StructuredBuffer {
                    buffer: index_buffer.id(),
                    num_elements: (index_bytes.len() / 4) as _,
                    stride: 4,
                },
                &index_view,
            )
            .map_err(|e| Error::creation("index buffer view", e))?;

        log::info!(
            "Uploaded {} meshes: {} vertices, {} indices",
            meshes.len(),
            vertices.len(),
            indices.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_view,
            index_view,
            ranges,
        })
    }

    pub fn ranges(&self) -> &[MeshRange] {
        &self.ranges
    }

    pub fn vertex_view(&self) -> &Descriptor {
        &self.vertex_view
    }

    pub fn index_view(&self) -> &Descriptor {
        &self.index_view
    }

    /// Build input for the mesh's bottom level structure.
    pub fn triangles(&self, mesh: usize) -> Option<TriangleGeometry> {
        let range = self.ranges.get(mesh)?;
        let stride = std::mem::size_of::<Vertex>() as u64;

        Some(TriangleGeometry {
            vertex_buffer: self.vertex_buffer.gpu_address() + stride * range.vertex_offset as u64,
            vertex_stride: stride,
            vertex_count: range.vertex_count,
            vertex_format: VertexFormat::Float3,
            index_buffer: self.index_buffer.gpu_address()
                + IndexFormat::Uint16.size() * range.index_offset as u64,
            index_count: range.index_count,
            index_format: IndexFormat::Uint16,
            opaque: true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 5.0, -5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 60f32.to_radians(),
            near: 0.01,
            far: 100.0,
        }
    }
}

impl CameraPose {
    /// The default pose rotated about the Y axis by `degrees`.
    pub fn orbit(degrees: f32) -> Self {
        let camera = Self::default();
        let rotation = Mat4::from_rotation_y(degrees.to_radians());

        Self {
            position: rotation.transform_point3(camera.position),
            ..camera
        }
    }

    pub fn view_projection(&self, aspect_ratio: f32) -> Mat4 {
        let view = Mat4::look_at_lh(self.position, self.target, self.up);
        let projection = Mat4::perspective_lh(self.fov_y, aspect_ratio, self.near, self.far);
        projection * view
    }
}

/// Per-frame constants, padded to the 256-byte constant buffer placement alignment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneConstants {
    pub proj_to_world: Mat4,
    pub camera_position: Vec4,
    pub light_direction: Vec4,
    pub light_color: Vec4,
    _padding: [[f32; 4]; 9],
}

pub const SCENE_CONSTANTS_SIZE: u64 = 256;

impl SceneConstants {
    pub fn new(camera: &CameraPose, aspect_ratio: f32, light_direction: Vec3, light_color: Vec4) -> Self {
        Self {
            proj_to_world: camera.view_projection(aspect_ratio).inverse(),
            camera_position: camera.position.extend(1.0),
            light_direction: light_direction.normalize_or_zero().extend(0.0),
            light_color,
            _padding: Zeroable::zeroed(),
        }
    }
}
