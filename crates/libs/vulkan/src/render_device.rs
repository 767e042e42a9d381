use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use rt_core::{
    gpu::{
        BufferDesc, BufferId, BufferPurpose, CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapInfo,
        FallbackDriver, FenceId, FenceWait, GpuDescriptorHandle, HeapKind, RaytracingDriver, RenderDevice,
        RootSignatureId, StateObjectId, TextureDesc, TextureFormat, TextureId, ViewDesc,
    },
    Descriptor, DescriptorHeapCategory, RootSignatureDesc,
};
use strum::IntoEnumIterator;

use crate::{
    command_list::{state_layout, state_masks},
    AccelerationStructure, Buffer, Context, DescriptorSetLayout, Image, ImageBarrier, ImageView, PipelineLayout,
    RayTracingPipeline, SemaphoreSubmitInfo, TimelineSemaphore, VulkanCommandList, VulkanRaytracing,
};

pub(crate) struct Texture {
    pub(crate) view: ImageView,
    pub(crate) image: Image,
}

pub(crate) struct RootSignature {
    pub(crate) desc: RootSignatureDesc,
    pub(crate) pipeline_layout: Option<PipelineLayout>,
    pub(crate) set_layout: Option<DescriptorSetLayout>,
}

/// Descriptor heap emulated on the host. Views are only turned into descriptor set writes
/// when a dispatch binds them.
pub(crate) struct EmulatedHeap {
    pub(crate) shader_visible: bool,
    pub(crate) views: Vec<Option<ViewDesc>>,
}

/// Every Vulkan object the core refers to by id.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    pub(crate) pipelines: HashMap<StateObjectId, RayTracingPipeline>,
    pub(crate) root_signatures: HashMap<RootSignatureId, RootSignature>,
    pub(crate) acceleration_structures: HashMap<BufferId, AccelerationStructure>,
    pub(crate) textures: HashMap<TextureId, Texture>,
    pub(crate) buffers: HashMap<BufferId, Buffer>,
    pub(crate) fences: HashMap<FenceId, Arc<TimelineSemaphore>>,
    pub(crate) heaps: BTreeMap<DescriptorHeapCategory, EmulatedHeap>,
}

impl Registry {
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn buffer(&self, id: BufferId) -> Result<&Buffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| anyhow!("Unknown buffer {}", id.0))
    }

    pub(crate) fn texture(&self, id: TextureId) -> Result<&Texture> {
        self.textures
            .get(&id)
            .ok_or_else(|| anyhow!("Unknown texture {}", id.0))
    }

    pub(crate) fn acceleration_structure_at(&self, address: u64) -> Option<&AccelerationStructure> {
        self.acceleration_structures
            .values()
            .find(|a| a.address == address)
    }

    /// The view written at a shader visible handle.
    pub(crate) fn view(&self, handle: GpuDescriptorHandle) -> Result<ViewDesc> {
        let (category, index) =
            decode_handle(handle.0).ok_or_else(|| anyhow!("Invalid descriptor handle {:#x}", handle.0))?;
        let heap = self
            .heaps
            .get(&category)
            .ok_or_else(|| anyhow!("No {category} heap for handle {:#x}", handle.0))?;
        if !heap.shader_visible {
            return Err(anyhow!("{category} heap is not shader visible"));
        }

        heap.views
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| anyhow!("No view written at {category} descriptor {index}"))
    }

    /// Releases dependents before the objects they were created from.
    fn clear(&mut self) {
        self.pipelines.clear();
        self.root_signatures.clear();
        self.acceleration_structures.clear();
        self.textures.clear();
        self.buffers.clear();
        self.fences.clear();
        self.heaps.clear();
    }
}

/// Emulated handles carry the heap category in the high word and the slot in the low word.
fn heap_start(category: DescriptorHeapCategory) -> u64 {
    (category as u64 + 1) << 32
}

pub(crate) fn decode_handle(handle: u64) -> Option<(DescriptorHeapCategory, u32)> {
    let category = (handle >> 32).checked_sub(1)?;
    let category = DescriptorHeapCategory::iter().nth(category as usize)?;

    Some((category, handle as u32))
}

fn buffer_usage(purpose: BufferPurpose, allow_unordered_access: bool) -> vk::BufferUsageFlags {
    let usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    let usage = match purpose {
        BufferPurpose::Constants => usage | vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferPurpose::Geometry => {
            usage
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        }
        BufferPurpose::InstanceDescs => usage | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        BufferPurpose::AccelerationStructure => {
            usage | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::STORAGE_BUFFER
        }
        BufferPurpose::Scratch => usage | vk::BufferUsageFlags::STORAGE_BUFFER,
        BufferPurpose::ShaderTable => usage | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        BufferPurpose::Readback => usage,
    };

    if allow_unordered_access {
        usage | vk::BufferUsageFlags::STORAGE_BUFFER
    } else {
        usage
    }
}

fn memory_location(heap: HeapKind) -> MemoryLocation {
    match heap {
        HeapKind::Upload => MemoryLocation::CpuToGpu,
        HeapKind::Default => MemoryLocation::GpuOnly,
        HeapKind::Readback => MemoryLocation::GpuToCpu,
    }
}

fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
    }
}

pub(crate) struct Shared {
    registry: Mutex<Registry>,
    pub(crate) context: Context,
}

impl Shared {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Err(e) = self.context.device_wait_idle() {
            log::error!("Failed to wait for device idle: {e}");
        }
        self.registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// [`RenderDevice`] over a headless Vulkan [`Context`].
pub struct VulkanDevice {
    shared: Arc<Shared>,
    raytracing: Option<Arc<VulkanRaytracing>>,
}

impl VulkanDevice {
    pub fn new(context: Context) -> Self {
        let ray_tracing = context.ray_tracing.clone();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            context,
        });

        let raytracing = match ray_tracing {
            Some(ray_tracing) if ray_tracing.supports_table_layout() => {
                Some(Arc::new(VulkanRaytracing::new(shared.clone(), ray_tracing)))
            }
            Some(ray_tracing) => {
                log::warn!(
                    "Shader group alignments {}/{} exceed the shader table layout, disabling ray tracing",
                    ray_tracing.pipeline_properties.shader_group_handle_alignment,
                    ray_tracing.pipeline_properties.shader_group_base_alignment
                );
                None
            }
            None => None,
        };

        Self { shared, raytracing }
    }

    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    fn min_alignment(&self, purpose: BufferPurpose) -> vk::DeviceSize {
        let Some(ray_tracing) = &self.shared.context.ray_tracing else {
            return 0;
        };

        match purpose {
            BufferPurpose::Scratch => ray_tracing
                .acceleration_structure_properties
                .min_acceleration_structure_scratch_offset_alignment
                as _,
            BufferPurpose::ShaderTable => ray_tracing.pipeline_properties.shader_group_base_alignment as _,
            BufferPurpose::AccelerationStructure => 256,
            _ => 0,
        }
    }
}

impl RenderDevice for VulkanDevice {
    type CommandList = VulkanCommandList;

    fn native_raytracing(&self) -> Option<Arc<dyn RaytracingDriver<VulkanCommandList>>> {
        self.raytracing
            .clone()
            .map(|driver| driver as Arc<dyn RaytracingDriver<VulkanCommandList>>)
    }

    fn compute_fallback(&self) -> Option<Arc<dyn FallbackDriver<VulkanCommandList>>> {
        None
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo> {
        let mut registry = self.shared.registry();
        if registry.heaps.contains_key(&desc.category) {
            return Err(anyhow!("{} heap already exists", desc.category));
        }
        registry.heaps.insert(
            desc.category,
            EmulatedHeap {
                shader_visible: desc.shader_visible,
                views: vec![None; desc.capacity as usize],
            },
        );

        let start = heap_start(desc.category);
        Ok(DescriptorHeapInfo {
            cpu_start: start,
            gpu_start: if desc.shader_visible { start } else { 0 },
            increment: 1,
        })
    }

    fn destroy_descriptor_heap(&self, category: DescriptorHeapCategory) {
        self.shared.registry().heaps.remove(&category);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId> {
        let buffer = self.shared.context.create_buffer(
            desc.name,
            buffer_usage(desc.purpose, desc.allow_unordered_access),
            memory_location(desc.heap),
            desc.size,
            self.min_alignment(desc.purpose),
        )?;

        let mut registry = self.shared.registry();
        let id = BufferId(registry.next_id());
        registry.buffers.insert(id, buffer);

        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        self.shared
            .registry()
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| anyhow!("Unknown buffer {}", buffer.0))?
            .write(offset, data)
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, data: &mut [u8]) -> Result<()> {
        self.shared.registry().buffer(buffer)?.read(offset, data)
    }

    fn buffer_gpu_address(&self, buffer: BufferId) -> u64 {
        self.shared
            .registry()
            .buffers
            .get(&buffer)
            .map_or(0, Buffer::get_device_address)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut registry = self.shared.registry();
        registry.acceleration_structures.remove(&buffer);
        registry.buffers.remove(&buffer);
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        let context = &self.shared.context;
        // Held across the upload so one-time commands never share the pool between threads.
        let mut registry = self.shared.registry();

        let image = context.create_image(
            desc.name,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            texture_format(desc.format),
            desc.width,
            desc.height,
        )?;
        let view = image.create_image_view()?;

        let (dst_access_mask, dst_stage_mask) = state_masks(desc.initial_state);
        context.execute_one_time_commands(|cmd_buffer| {
            cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
                image: &image,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: state_layout(desc.initial_state),
                src_access_mask: vk::AccessFlags2::NONE,
                src_stage_mask: vk::PipelineStageFlags2::NONE,
                dst_access_mask,
                dst_stage_mask,
            }]);
        })?;

        let id = TextureId(registry.next_id());
        registry.textures.insert(id, Texture { view, image });

        Ok(id)
    }

    fn destroy_texture(&self, texture: TextureId) {
        self.shared.registry().textures.remove(&texture);
    }

    fn create_view(&self, view: &ViewDesc, descriptor: &Descriptor) -> Result<()> {
        let mut registry = self.shared.registry();
        match view {
            ViewDesc::ConstantBuffer { buffer, .. }
            | ViewDesc::StructuredBuffer { buffer, .. }
            | ViewDesc::RawBuffer { buffer, .. } => {
                registry.buffer(*buffer)?;
            }
            ViewDesc::StorageTexture { texture } => {
                registry.texture(*texture)?;
            }
        }

        let CpuDescriptorHandle(handle) = descriptor.cpu_handle;
        let (category, index) =
            decode_handle(handle).ok_or_else(|| anyhow!("Invalid descriptor handle {handle:#x}"))?;
        let slot = registry
            .heaps
            .get_mut(&category)
            .and_then(|heap| heap.views.get_mut(index as usize))
            .ok_or_else(|| anyhow!("{category} descriptor {index} is outside its heap"))?;
        *slot = Some(*view);

        Ok(())
    }

    fn create_command_list(&self) -> Result<VulkanCommandList> {
        VulkanCommandList::new(self.shared.clone())
    }

    fn execute_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        let command_buffer = list.executable()?;
        // The queue is externally synchronized.
        let _registry = self.shared.registry();
        self.shared.context.queue.submit(Some(command_buffer), None)
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        let semaphore = TimelineSemaphore::new(self.shared.context.device.clone(), initial_value)?;

        let mut registry = self.shared.registry();
        let id = FenceId(registry.next_id());
        registry.fences.insert(id, Arc::new(semaphore));

        Ok(id)
    }

    fn signal_fence(&self, fence: FenceId, value: u64) -> Result<()> {
        let registry = self.shared.registry();
        let semaphore = registry
            .fences
            .get(&fence)
            .ok_or_else(|| anyhow!("Unknown fence {}", fence.0))?;

        self.shared.context.queue.submit(
            None,
            Some(SemaphoreSubmitInfo {
                semaphore,
                value,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }),
        )
    }

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64> {
        self.fence(fence)?.value()
    }

    fn wait_for_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<FenceWait> {
        // Waits without the registry lock so other threads keep recording.
        let semaphore = self.fence(fence)?;
        Ok(if semaphore.wait(value, timeout)? {
            FenceWait::Reached
        } else {
            FenceWait::TimedOut
        })
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.shared.registry().fences.remove(&fence);
    }
}

impl VulkanDevice {
    fn fence(&self, fence: FenceId) -> Result<Arc<TimelineSemaphore>> {
        self.shared
            .registry()
            .fences
            .get(&fence)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown fence {}", fence.0))
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_round_trip_through_their_heap() {
        for category in DescriptorHeapCategory::iter() {
            let start = heap_start(category);
            assert_eq!(decode_handle(start), Some((category, 0)));
            assert_eq!(decode_handle(start + 41), Some((category, 41)));
        }
        // Non shader visible heaps hand out a zero gpu start.
        assert_eq!(decode_handle(0), None);
        assert_eq!(decode_handle(7), None);
        assert_eq!(decode_handle(99 << 32), None);
    }

    #[test]
    fn heaps_do_not_overlap() {
        let starts = DescriptorHeapCategory::iter().map(heap_start).collect::<Vec<_>>();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= 1 << 32);
        }
    }

    #[test]
    fn every_buffer_has_a_device_address() {
        use BufferPurpose::*;

        for purpose in [Constants, Geometry, InstanceDescs, AccelerationStructure, Scratch, ShaderTable, Readback] {
            let usage = buffer_usage(purpose, false);
            assert!(usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
            assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        }
        assert!(buffer_usage(ShaderTable, false).contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
        assert!(buffer_usage(AccelerationStructure, true)
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));
        assert!(buffer_usage(Readback, true).contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(!buffer_usage(Readback, false).contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn heaps_map_to_allocator_locations() {
        assert_eq!(memory_location(HeapKind::Upload), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(HeapKind::Default), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(HeapKind::Readback), MemoryLocation::GpuToCpu);
    }
}
