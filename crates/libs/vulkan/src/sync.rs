use std::{sync::Arc, time::Duration};

use anyhow::Result;
use ash::vk;

use crate::device::Device;

/// Monotonic counter the queue advances as submitted work completes.
pub struct TimelineSemaphore {
    device: Arc<Device>,
    pub(crate) inner: vk::Semaphore,
}

impl TimelineSemaphore {
    pub(crate) fn new(device: Arc<Device>, initial_value: u64) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn value(&self) -> Result<u64> {
        Ok(unsafe { self.device.inner.get_semaphore_counter_value(self.inner)? })
    }

    /// Returns `false` when the timeout elapsed first. `None` waits forever.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);

        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(std::slice::from_ref(&self.inner))
            .values(std::slice::from_ref(&value));

        match unsafe { self.device.inner.wait_semaphores(&wait_info, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_semaphore(self.inner, None);
        }
    }
}
