use std::sync::Arc;

use anyhow::{anyhow, Result};
use ash::vk;

use crate::{
    device::Device, Buffer, Context, DescriptorSet, Image, PipelineLayout, QueueFamily, RayTracingContext,
    RayTracingPipeline,
};

pub struct CommandPool {
    device: Arc<Device>,
    ray_tracing: Option<Arc<RayTracingContext>>,
    pub inner: vk::CommandPool,
}

impl CommandPool {
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing: Option<Arc<RayTracingContext>>,
        queue_family: QueueFamily,
        flags: Option<vk::CommandPoolCreateFlags>,
    ) -> Result<Self> {
        let flags = flags.unwrap_or_else(vk::CommandPoolCreateFlags::empty);

        let command_pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family.index)
            .flags(flags);
        let inner = unsafe { device.inner.create_command_pool(&command_pool_info, None)? };

        Ok(Self {
            device,
            ray_tracing,
            inner,
        })
    }

    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.inner)
            .level(level)
            .command_buffer_count(1);

        let inner = unsafe { self.device.inner.allocate_command_buffers(&allocate_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Driver returned no command buffer"))?;

        Ok(CommandBuffer {
            device: self.device.clone(),
            ray_tracing: self.ray_tracing.clone(),
            inner,
        })
    }

    pub fn free_command_buffer(&self, buffer: &CommandBuffer) {
        let buffs = [buffer.inner];
        unsafe { self.device.inner.free_command_buffers(self.inner, &buffs) };
    }
}

impl Context {
    pub fn create_command_pool(&self, flags: Option<vk::CommandPoolCreateFlags>) -> Result<CommandPool> {
        CommandPool::new(self.device.clone(), self.ray_tracing.clone(), self.queue_family, flags)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_command_pool(self.inner, None) };
    }
}

pub struct CommandBuffer {
    device: Arc<Device>,
    ray_tracing: Option<Arc<RayTracingContext>>,
    pub inner: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn begin(&self, flags: Option<vk::CommandBufferUsageFlags>) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(flags.unwrap_or(vk::CommandBufferUsageFlags::empty()));
        unsafe { self.device.inner.begin_command_buffer(self.inner, &begin_info)? };

        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.inner.end_command_buffer(self.inner)? };

        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .inner
                .reset_command_buffer(self.inner, vk::CommandBufferResetFlags::empty())?
        };

        Ok(())
    }

    pub fn bind_rt_pipeline(&self, pipeline: &RayTracingPipeline) {
        unsafe {
            self.device.inner.cmd_bind_pipeline(
                self.inner,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline.inner,
            )
        }
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        sets: &[&DescriptorSet],
    ) {
        let sets = sets.iter().map(|s| s.inner).collect::<Vec<_>>();
        unsafe {
            self.device
                .inner
                .cmd_bind_descriptor_sets(self.inner, bind_point, layout.inner, first_set, &sets, &[])
        }
    }

    pub fn pipeline_buffer_barriers(&self, barriers: &[BufferBarrier]) {
        let barriers = barriers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .buffer(b.buffer.inner)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build()
            })
            .collect::<Vec<_>>();

        let dependency_info = vk::DependencyInfo::builder().buffer_memory_barriers(&barriers);

        unsafe { self.device.inner.cmd_pipeline_barrier2(self.inner, &dependency_info) };
    }

    pub fn pipeline_image_barriers(&self, barriers: &[ImageBarrier]) {
        let barriers = barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .old_layout(b.old_layout)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .new_layout(b.new_layout)
                    .image(b.image.inner)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .build()
            })
            .collect::<Vec<_>>();

        let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);

        unsafe { self.device.inner.cmd_pipeline_barrier2(self.inner, &dependency_info) };
    }

    pub fn copy_buffer(&self, src_buffer: &Buffer, dst_buffer: &Buffer) {
        unsafe {
            let region = vk::BufferCopy::builder().size(src_buffer.size.min(dst_buffer.size));
            self.device.inner.cmd_copy_buffer(
                self.inner,
                src_buffer.inner,
                dst_buffer.inner,
                std::slice::from_ref(&region),
            )
        };
    }

    pub fn copy_image(&self, src_image: &Image, src_layout: vk::ImageLayout, dst_image: &Image, dst_layout: vk::ImageLayout) {
        let region = vk::ImageCopy::builder()
            .src_subresource(color_layers())
            .dst_subresource(color_layers())
            .extent(vk::Extent3D {
                width: src_image.extent.width,
                height: src_image.extent.height,
                depth: 1,
            });

        unsafe {
            self.device.inner.cmd_copy_image(
                self.inner,
                src_image.inner,
                src_layout,
                dst_image.inner,
                dst_layout,
                std::slice::from_ref(&region),
            )
        };
    }

    pub fn copy_buffer_to_image(&self, src: &Buffer, dst: &Image, layout: vk::ImageLayout) {
        let region = vk::BufferImageCopy::builder()
            .image_subresource(color_layers())
            .image_extent(dst.extent);

        unsafe {
            self.device.inner.cmd_copy_buffer_to_image(
                self.inner,
                src.inner,
                dst.inner,
                layout,
                std::slice::from_ref(&region),
            );
        };
    }

    /// Rows land tightly packed in `dst`.
    pub fn copy_image_to_buffer(&self, src: &Image, layout: vk::ImageLayout, dst: &Buffer) {
        let region = vk::BufferImageCopy::builder()
            .image_subresource(color_layers())
            .image_extent(src.extent);

        unsafe {
            self.device.inner.cmd_copy_image_to_buffer(
                self.inner,
                src.inner,
                layout,
                dst.inner,
                std::slice::from_ref(&region),
            );
        };
    }

    pub fn build_acceleration_structures(
        &self,
        as_build_geo_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        as_build_range_info: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) -> Result<()> {
        let ray_tracing = self
            .ray_tracing
            .as_ref()
            .ok_or_else(|| anyhow!("Acceleration structure build recorded without ray tracing enabled"))?;

        unsafe {
            ray_tracing.acceleration_structure_fn.cmd_build_acceleration_structures(
                self.inner,
                std::slice::from_ref(as_build_geo_info),
                std::slice::from_ref(&as_build_range_info),
            )
        };

        Ok(())
    }

    pub fn trace_rays(&self, regions: &ShaderRegions, width: u32, height: u32, depth: u32) -> Result<()> {
        let ray_tracing = self
            .ray_tracing
            .as_ref()
            .ok_or_else(|| anyhow!("Ray dispatch recorded without ray tracing enabled"))?;

        unsafe {
            ray_tracing.pipeline_fn.cmd_trace_rays(
                self.inner,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &vk::StridedDeviceAddressRegionKHR::default(),
                width,
                height,
                depth,
            )
        };

        Ok(())
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Shader table regions read by a ray dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
}

#[derive(Clone, Copy)]
pub struct BufferBarrier<'a> {
    pub buffer: &'a Buffer,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy)]
pub struct ImageBarrier<'a> {
    pub image: &'a Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
}
