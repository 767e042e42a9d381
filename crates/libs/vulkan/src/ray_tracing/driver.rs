use std::sync::Arc;

use anyhow::{anyhow, Result};
use ash::vk;
use rt_core::{
    gpu::{
        BuildDesc, BuildInputs, BuildPreference, BufferId, DispatchRaysDesc, GpuDescriptorHandle, PrebuildInfo,
        RaytracingDriver, RootSignatureId, StateObjectId, ViewDesc,
    },
    DescriptorRangeKind, PipelineStateDesc, RootParameter, RootSignatureDesc,
};

use crate::{
    render_device::{decode_handle, Registry, RootSignature, Shared},
    AccelerationStructure, BuildGeometry, DescriptorSetLayout, PipelineLayout, RayTracingContext,
    RayTracingPipeline, ShaderRegions, VulkanCommandList, WriteDescriptorSet, WriteDescriptorSetKind,
};

/// Every ray tracing stage may read the global arguments.
fn ray_tracing_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::ANY_HIT_KHR
        | vk::ShaderStageFlags::INTERSECTION_KHR
}

/// Global root parameters become bindings of descriptor set 0, numbered by parameter index.
pub(crate) fn set_layout_bindings(desc: &RootSignatureDesc) -> Result<Vec<vk::DescriptorSetLayoutBinding>> {
    desc.parameters
        .iter()
        .enumerate()
        .map(|(index, parameter)| {
            let (descriptor_type, descriptor_count) = match parameter {
                RootParameter::DescriptorTable(range) => {
                    let ty = match range.kind {
                        DescriptorRangeKind::Uav => vk::DescriptorType::STORAGE_IMAGE,
                        DescriptorRangeKind::Srv => vk::DescriptorType::STORAGE_BUFFER,
                        DescriptorRangeKind::Cbv => vk::DescriptorType::UNIFORM_BUFFER,
                        DescriptorRangeKind::Sampler => vk::DescriptorType::SAMPLER,
                    };
                    (ty, range.count)
                }
                RootParameter::ShaderResourceView { .. } => (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1),
                RootParameter::Constants { .. } => {
                    return Err(anyhow!("Parameter {index}: root constants are only supported in shader records"))
                }
            };

            Ok(vk::DescriptorSetLayoutBinding::builder()
                .binding(index as u32)
                .descriptor_type(descriptor_type)
                .descriptor_count(descriptor_count)
                .stage_flags(ray_tracing_stages())
                .build())
        })
        .collect()
}

/// Local arguments live in the shader record, so a local signature may only hold constants.
fn check_local(desc: &RootSignatureDesc) -> Result<()> {
    match desc
        .parameters
        .iter()
        .position(|p| !matches!(p, RootParameter::Constants { .. }))
    {
        Some(index) => Err(anyhow!("Local parameter {index} must be root constants")),
        None => Ok(()),
    }
}

/// The descriptor a view turns into for a table of the given kind.
fn write_kind<'a>(
    registry: &'a Registry,
    kind: DescriptorRangeKind,
    view: ViewDesc,
) -> Result<WriteDescriptorSetKind<'a>> {
    Ok(match (kind, view) {
        (DescriptorRangeKind::Uav, ViewDesc::StorageTexture { texture }) => WriteDescriptorSetKind::StorageImage {
            view: &registry.texture(texture)?.view,
            layout: vk::ImageLayout::GENERAL,
        },
        (
            DescriptorRangeKind::Srv,
            ViewDesc::StructuredBuffer {
                buffer,
                num_elements,
                stride,
            },
        ) => WriteDescriptorSetKind::StorageBuffer {
            buffer: registry.buffer(buffer)?,
            range: Some(num_elements as u64 * stride as u64),
        },
        (DescriptorRangeKind::Srv, ViewDesc::RawBuffer { buffer, num_elements }) => {
            WriteDescriptorSetKind::StorageBuffer {
                buffer: registry.buffer(buffer)?,
                range: Some(num_elements as u64 * 4),
            }
        }
        (DescriptorRangeKind::Cbv, ViewDesc::ConstantBuffer { buffer, size }) => WriteDescriptorSetKind::UniformBuffer {
            buffer: registry.buffer(buffer)?,
            range: Some(size),
        },
        (kind, view) => return Err(anyhow!("{kind:?} table cannot hold {view:?}")),
    })
}

/// Native ray tracing through `VK_KHR_ray_tracing_pipeline`.
///
/// Root signatures map to descriptor set layouts, state objects to ray tracing pipelines.
/// Descriptor tables point into host side heaps and are written into a fresh descriptor set
/// from the command list's pool at every dispatch.
pub struct VulkanRaytracing {
    shared: Arc<Shared>,
    ray_tracing: Arc<RayTracingContext>,
}

impl VulkanRaytracing {
    pub(crate) fn new(shared: Arc<Shared>, ray_tracing: Arc<RayTracingContext>) -> Self {
        Self { shared, ray_tracing }
    }

    fn table_handle(list: &VulkanCommandList, parameter: u32) -> Result<GpuDescriptorHandle> {
        let handle = list
            .root
            .tables
            .get(&parameter)
            .copied()
            .ok_or_else(|| anyhow!("Root parameter {parameter} is not bound"))?;
        let (category, _) =
            decode_handle(handle.0).ok_or_else(|| anyhow!("Invalid descriptor handle {:#x}", handle.0))?;
        if !list.root.heaps.contains(&category) {
            return Err(anyhow!("{category} heap is not bound for parameter {parameter}"));
        }

        Ok(handle)
    }
}

impl RaytracingDriver<VulkanCommandList> for VulkanRaytracing {
    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<RootSignatureId> {
        let root_signature = if desc.local {
            check_local(desc)?;
            RootSignature {
                desc: desc.clone(),
                pipeline_layout: None,
                set_layout: None,
            }
        } else {
            let device = &self.shared.context.device;
            let set_layout = DescriptorSetLayout::new(device.clone(), &set_layout_bindings(desc)?)?;
            let pipeline_layout = PipelineLayout::new(device.clone(), &set_layout)?;
            RootSignature {
                desc: desc.clone(),
                pipeline_layout: Some(pipeline_layout),
                set_layout: Some(set_layout),
            }
        };

        let mut registry = self.shared.registry();
        let id = RootSignatureId(registry.next_id());
        registry.root_signatures.insert(id, root_signature);
        log::debug!("Created root signature {} with {} parameters", id.0, desc.parameters.len());

        Ok(id)
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        self.shared.registry().root_signatures.remove(&root_signature);
    }

    fn create_state_object(&self, desc: &PipelineStateDesc) -> Result<StateObjectId> {
        let global = desc
            .global_root_signature()
            .ok_or_else(|| anyhow!("Pipeline has no global root signature"))?;

        let mut registry = self.shared.registry();
        let layout = registry
            .root_signatures
            .get(&global)
            .and_then(|r| r.pipeline_layout.as_ref())
            .ok_or_else(|| anyhow!("Root signature {} is not a global signature", global.0))?;
        let pipeline = RayTracingPipeline::new(self.shared.context.device.clone(), &self.ray_tracing, layout, desc)?;

        let id = StateObjectId(registry.next_id());
        registry.pipelines.insert(id, pipeline);

        Ok(id)
    }

    fn destroy_state_object(&self, state_object: StateObjectId) {
        self.shared.registry().pipelines.remove(&state_object);
    }

    fn shader_identifier_size(&self) -> u32 {
        self.ray_tracing.shader_group_handle_size()
    }

    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Option<Vec<u8>> {
        self.shared
            .registry()
            .pipelines
            .get(&state_object)?
            .shader_handle(export)
            .map(<[u8]>::to_vec)
    }

    fn prebuild_info(&self, inputs: &BuildInputs, preference: BuildPreference) -> PrebuildInfo {
        let sizes = self
            .ray_tracing
            .build_sizes(&BuildGeometry::new(inputs, preference));

        PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
        }
    }

    fn acceleration_structure_address(&self, buffer: BufferId, _gpu_va: u64, size: u64) -> Result<u64> {
        let mut registry = self.shared.registry();
        if let Some(structure) = registry.acceleration_structures.get(&buffer) {
            return Ok(structure.address);
        }

        let structure = AccelerationStructure::new(self.ray_tracing.clone(), registry.buffer(buffer)?, size)?;
        let address = structure.address;
        registry.acceleration_structures.insert(buffer, structure);

        Ok(address)
    }

    fn build_acceleration_structure(&self, list: &mut VulkanCommandList, desc: &BuildDesc) -> Result<()> {
        let command_buffer = list.recording()?;
        let registry = self.shared.registry();
        let structure = registry
            .acceleration_structures
            .get(&desc.dest_buffer)
            .ok_or_else(|| anyhow!("Buffer {} holds no acceleration structure", desc.dest_buffer.0))?;

        let geometry = BuildGeometry::new(&desc.inputs, desc.preference);
        let build_info = geometry
            .build_info()
            .dst_acceleration_structure(structure.inner)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: desc.scratch.address,
            })
            .build();

        command_buffer.build_acceleration_structures(&build_info, &geometry.ranges)
    }

    fn dispatch_rays(
        &self,
        list: &mut VulkanCommandList,
        state_object: StateObjectId,
        desc: &DispatchRaysDesc,
    ) -> Result<()> {
        let registry = self.shared.registry();
        let pipeline = registry
            .pipelines
            .get(&state_object)
            .ok_or_else(|| anyhow!("Unknown state object {}", state_object.0))?;
        let root_signature_id = list
            .root
            .root_signature
            .ok_or_else(|| anyhow!("Dispatch without a root signature"))?;
        let root_signature = registry
            .root_signatures
            .get(&root_signature_id)
            .ok_or_else(|| anyhow!("Unknown root signature {}", root_signature_id.0))?;
        let (Some(set_layout), Some(pipeline_layout)) = (&root_signature.set_layout, &root_signature.pipeline_layout)
        else {
            return Err(anyhow!("Root signature {} is not a global signature", root_signature_id.0));
        };

        let mut writes = vec![];
        for (index, parameter) in root_signature.desc.parameters.iter().enumerate() {
            let binding = index as u32;
            match parameter {
                RootParameter::DescriptorTable(range) => {
                    let base = Self::table_handle(list, binding)?;
                    for element in 0..range.count {
                        let view = registry.view(GpuDescriptorHandle(base.0 + element as u64))?;
                        writes.push(WriteDescriptorSet {
                            binding,
                            array_element: element,
                            kind: write_kind(&registry, range.kind, view)?,
                        });
                    }
                }
                RootParameter::ShaderResourceView { .. } => {
                    let address = list
                        .root
                        .shader_resource_views
                        .get(&binding)
                        .ok_or_else(|| anyhow!("Root parameter {index} is not bound"))?;
                    let structure = registry
                        .acceleration_structure_at(*address)
                        .ok_or_else(|| anyhow!("No acceleration structure at {address:#x}"))?;
                    writes.push(WriteDescriptorSet {
                        binding,
                        array_element: 0,
                        kind: WriteDescriptorSetKind::AccelerationStructure {
                            acceleration_structure: structure.inner,
                        },
                    });
                }
                RootParameter::Constants { .. } => {
                    return Err(anyhow!("Parameter {index}: root constants are only supported in shader records"))
                }
            }
        }

        let set = list.descriptor_pool.allocate_set(set_layout)?;
        set.update(&writes);

        let regions = ShaderRegions {
            raygen: vk::StridedDeviceAddressRegionKHR {
                device_address: desc.raygen.address,
                stride: desc.raygen.size,
                size: desc.raygen.size,
            },
            miss: vk::StridedDeviceAddressRegionKHR {
                device_address: desc.miss.address,
                stride: desc.miss.stride,
                size: desc.miss.size,
            },
            hit: vk::StridedDeviceAddressRegionKHR {
                device_address: desc.hit_group.address,
                stride: desc.hit_group.stride,
                size: desc.hit_group.size,
            },
        };

        let command_buffer = list.recording()?;
        command_buffer.bind_rt_pipeline(pipeline);
        command_buffer.bind_descriptor_sets(vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline_layout, 0, &[&set]);
        command_buffer.trace_rays(&regions, desc.width, desc.height, desc.depth)
    }
}

#[cfg(test)]
mod tests {
    use rt_core::{DescriptorRange, GlobalRootParameter};

    use super::*;

    #[test]
    fn scene_signature_becomes_one_set() {
        let bindings = set_layout_bindings(&RootSignatureDesc::global_scene()).unwrap();
        let types = bindings.iter().map(|b| b.descriptor_type).collect::<Vec<_>>();

        assert_eq!(
            types,
            vec![
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::UNIFORM_BUFFER,
            ]
        );
        assert_eq!(
            bindings[GlobalRootParameter::Scene as usize].binding,
            GlobalRootParameter::Scene as u32
        );
        assert!(bindings
            .iter()
            .all(|b| b.stage_flags.contains(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR)));
    }

    #[test]
    fn ranges_keep_their_descriptor_count() {
        let desc = RootSignatureDesc {
            parameters: vec![RootParameter::DescriptorTable(DescriptorRange {
                kind: DescriptorRangeKind::Srv,
                count: 3,
                base_register: 0,
                space: 0,
            })],
            local: false,
        };
        assert_eq!(set_layout_bindings(&desc).unwrap()[0].descriptor_count, 3);
    }

    #[test]
    fn global_root_constants_are_rejected() {
        let mut desc = RootSignatureDesc::instance_constants_local();
        desc.local = false;
        assert!(set_layout_bindings(&desc).is_err());
    }

    #[test]
    fn local_signatures_only_carry_constants() {
        assert!(check_local(&RootSignatureDesc::instance_constants_local()).is_ok());
        assert!(check_local(&RootSignatureDesc::empty_local()).is_ok());

        let mut desc = RootSignatureDesc::global_scene();
        desc.local = true;
        assert!(check_local(&desc).is_err());
    }
}
