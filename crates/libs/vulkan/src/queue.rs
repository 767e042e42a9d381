use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, CommandBuffer, TimelineSemaphore};

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub(crate) inner: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub(crate) fn new(index: u32, inner: vk::QueueFamilyProperties) -> Self {
        Self { index, inner }
    }

    pub fn supports_compute(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn has_queues(&self) -> bool {
        self.inner.queue_count > 0
    }
}

pub struct Queue {
    device: Arc<Device>,
    pub inner: vk::Queue,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>, inner: vk::Queue) -> Self {
        Self { device, inner }
    }

    /// Submits a command buffer, or only a signal when `command_buffer` is `None`.
    pub fn submit(
        &self,
        command_buffer: Option<&CommandBuffer>,
        signal_semaphore: Option<SemaphoreSubmitInfo>,
    ) -> Result<()> {
        let signal_semaphore_submit_info = signal_semaphore.map(|s| {
            vk::SemaphoreSubmitInfo::builder()
                .semaphore(s.semaphore.inner)
                .value(s.value)
                .stage_mask(s.stage_mask)
        });

        let cmd_buffer_submit_info =
            command_buffer.map(|c| vk::CommandBufferSubmitInfo::builder().command_buffer(c.inner));

        let submit_info = vk::SubmitInfo2::builder();

        let submit_info = match cmd_buffer_submit_info.as_ref() {
            Some(info) => submit_info.command_buffer_infos(std::slice::from_ref(info)),
            None => submit_info,
        };

        let submit_info = match signal_semaphore_submit_info.as_ref() {
            Some(info) => submit_info.signal_semaphore_infos(std::slice::from_ref(info)),
            None => submit_info,
        };

        unsafe {
            self.device
                .inner
                .queue_submit2(self.inner, std::slice::from_ref(&submit_info), vk::Fence::null())?
        };

        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.inner.queue_wait_idle(self.inner)? };

        Ok(())
    }
}

pub struct SemaphoreSubmitInfo<'a> {
    pub semaphore: &'a TimelineSemaphore,
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags2,
}
