mod acceleration_structure;
mod driver;
mod pipeline;

pub use acceleration_structure::*;
pub use driver::*;
pub use pipeline::*;

use ash::{
    extensions::khr::{AccelerationStructure as AshAccelerationStructure, RayTracingPipeline as AshRayTracingPipeline},
    vk,
};

use crate::{device::Device, instance::Instance, physical_device::PhysicalDevice};

/// Largest handle alignment a shader record may need; records are packed on 32 bytes.
pub const MAX_SHADER_GROUP_HANDLE_ALIGNMENT: u32 = 32;
/// Largest table start alignment the core's shader table layout honors.
pub const MAX_SHADER_GROUP_BASE_ALIGNMENT: u32 = 64;

pub const REQUIRED_EXTENSIONS: [&str; 3] = [
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_deferred_host_operations",
];

pub struct RayTracingContext {
    pub pipeline_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub pipeline_fn: AshRayTracingPipeline,
    pub acceleration_structure_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    pub acceleration_structure_fn: AshAccelerationStructure,
}

impl RayTracingContext {
    pub(crate) fn new(instance: &Instance, pdevice: &PhysicalDevice, device: &Device) -> Self {
        let pipeline_properties = unsafe { AshRayTracingPipeline::get_properties(&instance.inner, pdevice.inner) };
        let pipeline_fn = AshRayTracingPipeline::new(&instance.inner, &device.inner);

        let acceleration_structure_properties =
            unsafe { AshAccelerationStructure::get_properties(&instance.inner, pdevice.inner) };
        let acceleration_structure_fn = AshAccelerationStructure::new(&instance.inner, &device.inner);

        Self {
            pipeline_properties,
            pipeline_fn,
            acceleration_structure_properties,
            acceleration_structure_fn,
        }
    }

    pub fn shader_group_handle_size(&self) -> u32 {
        self.pipeline_properties.shader_group_handle_size
    }

    /// Whether shader tables laid out on the core's fixed alignments are valid here.
    pub fn supports_table_layout(&self) -> bool {
        table_layout_supported(&self.pipeline_properties)
    }
}

fn table_layout_supported(properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR) -> bool {
    properties.shader_group_handle_alignment <= MAX_SHADER_GROUP_HANDLE_ALIGNMENT
        && properties.shader_group_base_alignment <= MAX_SHADER_GROUP_BASE_ALIGNMENT
        && properties.shader_group_handle_size <= MAX_SHADER_GROUP_HANDLE_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_alignments_fit_the_table_layout() {
        let properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            ..Default::default()
        };
        assert!(table_layout_supported(&properties));

        let coarse = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            shader_group_base_alignment: 128,
            ..properties
        };
        assert!(!table_layout_supported(&coarse));
    }
}
