use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use ash::vk;
use rt_core::{
    gpu::{Barrier, BufferId, CommandList, GpuDescriptorHandle, ResourceId, ResourceState, RootSignatureId, TextureId},
    DescriptorHeapCategory,
};

use crate::{
    render_device::{Registry, Shared},
    BufferBarrier, CommandBuffer, CommandPool, DescriptorPool, ImageBarrier,
};

const MAX_SETS_PER_LIST: u32 = 16;

/// Image layout a texture is kept in for each resource state.
pub(crate) fn state_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Common
        | ResourceState::GenericRead
        | ResourceState::UnorderedAccess
        | ResourceState::RaytracingAccelerationStructure => vk::ImageLayout::GENERAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    }
}

/// Accesses and stages a resource in `state` may see.
pub(crate) fn state_masks(state: ResourceState) -> (vk::AccessFlags2, vk::PipelineStageFlags2) {
    match state {
        ResourceState::Common => (
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        ),
        ResourceState::GenericRead => (
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::UNIFORM_READ | vk::AccessFlags2::TRANSFER_READ,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        ),
        ResourceState::UnorderedAccess => (
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags2::COMPUTE_SHADER,
        ),
        ResourceState::RaytracingAccelerationStructure => (
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        ResourceState::CopySource => (vk::AccessFlags2::TRANSFER_READ, vk::PipelineStageFlags2::TRANSFER),
        ResourceState::CopyDest => (vk::AccessFlags2::TRANSFER_WRITE, vk::PipelineStageFlags2::TRANSFER),
    }
}

/// Orders every earlier read and write against every later one.
const UAV_ACCESS: vk::AccessFlags2 =
    vk::AccessFlags2::from_raw(vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw());

/// Root arguments set since the last reset, resolved into a descriptor set at dispatch.
#[derive(Debug, Default)]
pub(crate) struct RootState {
    pub(crate) root_signature: Option<RootSignatureId>,
    pub(crate) heaps: Vec<DescriptorHeapCategory>,
    pub(crate) tables: BTreeMap<u32, GpuDescriptorHandle>,
    pub(crate) shader_resource_views: BTreeMap<u32, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Recording,
    Closed,
}

/// Command buffer with the recording model the core expects: reset, record, close, execute.
///
/// Methods that cannot fail in the trait keep the first recording error and report it from
/// [`close`](CommandList::close).
pub struct VulkanCommandList {
    pub(crate) descriptor_pool: DescriptorPool,
    command_buffer: CommandBuffer,
    _command_pool: CommandPool,
    pub(crate) root: RootState,
    state: ListState,
    error: Option<anyhow::Error>,
    shared: Arc<Shared>,
}

impl VulkanCommandList {
    pub(crate) fn new(shared: Arc<Shared>) -> Result<Self> {
        let context = &shared.context;
        let command_pool = context.create_command_pool(Some(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER))?;
        let command_buffer = command_pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
        let pool_sizes = [
            (vk::DescriptorType::STORAGE_IMAGE, MAX_SETS_PER_LIST),
            (vk::DescriptorType::STORAGE_BUFFER, MAX_SETS_PER_LIST * 4),
            (vk::DescriptorType::UNIFORM_BUFFER, MAX_SETS_PER_LIST * 2),
            (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, MAX_SETS_PER_LIST),
        ]
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count });
        let descriptor_pool = context.create_descriptor_pool(MAX_SETS_PER_LIST, &pool_sizes)?;

        // Lists start out open, ready to record.
        command_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        Ok(Self {
            descriptor_pool,
            command_buffer,
            _command_pool: command_pool,
            root: RootState::default(),
            state: ListState::Recording,
            error: None,
            shared,
        })
    }

    /// The command buffer, if the list is still open for recording.
    pub(crate) fn recording(&self) -> Result<&CommandBuffer> {
        match self.state {
            ListState::Recording => Ok(&self.command_buffer),
            ListState::Closed => Err(anyhow!("Command list is closed")),
        }
    }

    /// The command buffer, if the list was closed and can be submitted.
    pub(crate) fn executable(&self) -> Result<&CommandBuffer> {
        match self.state {
            ListState::Closed => Ok(&self.command_buffer),
            ListState::Recording => Err(anyhow!("Command list must be closed before execution")),
        }
    }

    fn defer(&mut self, result: Result<()>) {
        if let Err(e) = result {
            log::error!("Command recording failed: {e:#}");
            if self.error.is_none() {
                self.error = Some(e);
            }
        }
    }

    fn record_barriers(&self, barriers: &[Barrier]) -> Result<()> {
        let command_buffer = self.recording()?;
        let registry = self.shared.registry();

        let mut buffer_barriers = vec![];
        let mut image_barriers = vec![];
        for barrier in barriers {
            match *barrier {
                Barrier::Uav(ResourceId::Buffer(id)) => buffer_barriers.push(BufferBarrier {
                    buffer: registry.buffer(id)?,
                    src_access_mask: UAV_ACCESS,
                    dst_access_mask: UAV_ACCESS,
                    src_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                    dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                }),
                Barrier::Uav(ResourceId::Texture(id)) => image_barriers.push(ImageBarrier {
                    image: &registry.texture(id)?.image,
                    old_layout: vk::ImageLayout::GENERAL,
                    new_layout: vk::ImageLayout::GENERAL,
                    src_access_mask: UAV_ACCESS,
                    dst_access_mask: UAV_ACCESS,
                    src_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                    dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                }),
                Barrier::Transition {
                    resource,
                    before,
                    after,
                } => {
                    let (src_access_mask, src_stage_mask) = state_masks(before);
                    let (dst_access_mask, dst_stage_mask) = state_masks(after);
                    match resource {
                        ResourceId::Buffer(id) => buffer_barriers.push(BufferBarrier {
                            buffer: registry.buffer(id)?,
                            src_access_mask,
                            dst_access_mask,
                            src_stage_mask,
                            dst_stage_mask,
                        }),
                        ResourceId::Texture(id) => image_barriers.push(ImageBarrier {
                            image: &registry.texture(id)?.image,
                            old_layout: state_layout(before),
                            new_layout: state_layout(after),
                            src_access_mask,
                            dst_access_mask,
                            src_stage_mask,
                            dst_stage_mask,
                        }),
                    }
                }
            }
        }

        if !buffer_barriers.is_empty() {
            command_buffer.pipeline_buffer_barriers(&buffer_barriers);
        }
        if !image_barriers.is_empty() {
            command_buffer.pipeline_image_barriers(&image_barriers);
        }

        Ok(())
    }

    fn record_copy(&self, dst: ResourceId, src: ResourceId) -> Result<()> {
        let command_buffer = self.recording()?;
        let registry = self.shared.registry();

        let src_layout = state_layout(ResourceState::CopySource);
        let dst_layout = state_layout(ResourceState::CopyDest);
        match (dst, src) {
            (ResourceId::Buffer(dst), ResourceId::Buffer(src)) => {
                command_buffer.copy_buffer(registry.buffer(src)?, registry.buffer(dst)?);
                host_read_barrier(command_buffer, &registry, dst)?;
            }
            (ResourceId::Buffer(dst), ResourceId::Texture(src)) => {
                command_buffer.copy_image_to_buffer(&registry.texture(src)?.image, src_layout, registry.buffer(dst)?);
                host_read_barrier(command_buffer, &registry, dst)?;
            }
            (ResourceId::Texture(dst), ResourceId::Buffer(src)) => {
                command_buffer.copy_buffer_to_image(registry.buffer(src)?, &registry.texture(dst)?.image, dst_layout);
            }
            (ResourceId::Texture(dst), ResourceId::Texture(src)) => command_buffer.copy_image(
                &registry.texture(src)?.image,
                src_layout,
                &registry.texture(dst)?.image,
                dst_layout,
            ),
        }

        Ok(())
    }
}

/// Makes copied bytes visible to host reads once the submission retires.
fn host_read_barrier(command_buffer: &CommandBuffer, registry: &Registry, buffer: BufferId) -> Result<()> {
    command_buffer.pipeline_buffer_barriers(&[BufferBarrier {
        buffer: registry.buffer(buffer)?,
        src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
        dst_access_mask: vk::AccessFlags2::HOST_READ,
        src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
        dst_stage_mask: vk::PipelineStageFlags2::HOST,
    }]);

    Ok(())
}

impl CommandList for VulkanCommandList {
    fn reset(&mut self) -> Result<()> {
        self.command_buffer.reset()?;
        self.descriptor_pool.reset()?;
        self.root = RootState::default();
        self.error = None;

        self.command_buffer
            .begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;
        self.state = ListState::Recording;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.recording()?.end()?;
        self.state = ListState::Closed;

        match self.error.take() {
            Some(e) => Err(e.context("Command list recorded with errors")),
            None => Ok(()),
        }
    }

    fn resource_barriers(&mut self, barriers: &[Barrier]) {
        let result = self.record_barriers(barriers);
        self.defer(result);
    }

    fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapCategory]) {
        self.root.heaps = heaps.to_vec();
    }

    fn set_compute_root_signature(&mut self, root_signature: RootSignatureId) {
        // Arguments bound under another signature do not carry over.
        if self.root.root_signature != Some(root_signature) {
            self.root.tables.clear();
            self.root.shader_resource_views.clear();
        }
        self.root.root_signature = Some(root_signature);
    }

    fn set_compute_root_descriptor_table(&mut self, parameter: u32, base: GpuDescriptorHandle) {
        self.root.tables.insert(parameter, base);
    }

    fn set_compute_root_shader_resource_view(&mut self, parameter: u32, address: u64) {
        self.root.shader_resource_views.insert(parameter, address);
    }

    fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) {
        let result = self.record_copy(dst, src);
        self.defer(result);
    }

    fn copy_texture_to_buffer(&mut self, src: TextureId, dst: BufferId) {
        let result = self.record_copy(ResourceId::Buffer(dst), ResourceId::Texture(src));
        self.defer(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_states_use_transfer_layouts() {
        assert_eq!(
            state_layout(ResourceState::CopySource),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(state_layout(ResourceState::CopyDest), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(state_layout(ResourceState::UnorderedAccess), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn unordered_access_is_visible_to_ray_tracing() {
        let (access, stages) = state_masks(ResourceState::UnorderedAccess);
        assert!(access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
        assert!(stages.contains(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR));

        let (access, stages) = state_masks(ResourceState::CopySource);
        assert_eq!(access, vk::AccessFlags2::TRANSFER_READ);
        assert_eq!(stages, vk::PipelineStageFlags2::TRANSFER);
    }

    #[test]
    fn uav_barriers_cover_reads_and_writes() {
        assert!(UAV_ACCESS.contains(vk::AccessFlags2::MEMORY_READ));
        assert!(UAV_ACCESS.contains(vk::AccessFlags2::MEMORY_WRITE));
    }
}
