use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use rt_core::gpu::{BuildInputs, BuildPreference, IndexFormat, TriangleGeometry, VertexFormat};

use crate::{Buffer, RayTracingContext};

/// Acceleration structure placed over a buffer the core allocated.
///
/// Created with the generic type so one object serves either level; the level is only
/// known once a build is recorded into it.
pub struct AccelerationStructure {
    ray_tracing: Arc<RayTracingContext>,
    pub(crate) inner: vk::AccelerationStructureKHR,
    pub address: u64,
}

impl AccelerationStructure {
    pub(crate) fn new(ray_tracing: Arc<RayTracingContext>, buffer: &Buffer, size: u64) -> Result<Self> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(size)
            .ty(vk::AccelerationStructureTypeKHR::GENERIC);
        let inner = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)?
        };

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(inner);
        let address = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(Self {
            ray_tracing,
            inner,
            address,
        })
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}

/// Vulkan form of a build's inputs, kept together so the geometry pointers outlive the
/// build info that references them.
pub struct BuildGeometry {
    pub level: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR>,
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl BuildGeometry {
    pub fn new(inputs: &BuildInputs, preference: BuildPreference) -> Self {
        let flags = match preference {
            BuildPreference::PreferFastTrace => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            BuildPreference::PreferFastBuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
        };

        match inputs {
            BuildInputs::BottomLevel { geometries } => Self {
                level: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags,
                geometries: geometries.iter().map(triangles).collect(),
                ranges: geometries
                    .iter()
                    .map(|g| {
                        vk::AccelerationStructureBuildRangeInfoKHR::builder()
                            .primitive_count(g.primitive_count())
                            .build()
                    })
                    .collect(),
            },
            BuildInputs::TopLevel {
                instance_count,
                instance_descs,
            } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *instance_descs,
                    })
                    .build();

                let geometry = vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                    .build();

                Self {
                    level: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    flags,
                    geometries: vec![geometry],
                    ranges: vec![vk::AccelerationStructureBuildRangeInfoKHR::builder()
                        .primitive_count(*instance_count)
                        .build()],
                }
            }
        }
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|r| r.primitive_count).collect()
    }

    pub fn build_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHRBuilder<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(self.level)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&self.geometries)
    }
}

fn triangles(geometry: &TriangleGeometry) -> vk::AccelerationStructureGeometryKHR {
    let vertex_format = match geometry.vertex_format {
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
    };
    let index_type = match geometry.index_format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
    };

    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vertex_format)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.vertex_buffer,
        })
        .vertex_stride(geometry.vertex_stride)
        .max_vertex(geometry.vertex_count.saturating_sub(1))
        .index_type(index_type)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.index_buffer,
        })
        .build();

    let flags = if geometry.opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    };

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(flags)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .build()
}

impl RayTracingContext {
    pub fn build_sizes(&self, geometry: &BuildGeometry) -> vk::AccelerationStructureBuildSizesInfoKHR {
        let build_info = geometry.build_info();

        unsafe {
            self.acceleration_structure_fn
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &geometry.primitive_counts(),
                )
        }
    }
}
