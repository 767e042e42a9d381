use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use ash::vk;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, Allocator},
    MemoryLocation,
};

use crate::{device::Device, Context};

pub struct Buffer {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl Buffer {
    pub fn as_raw(&self) -> u64 {
        use vk::Handle;
        self.inner.as_raw()
    }

    pub(crate) fn new(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        name: &str,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
        min_alignment: vk::DeviceSize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(anyhow!("Buffer {name} has zero size"));
        }

        let create_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let inner = unsafe { device.inner.create_buffer(&create_info, None)? };
        let mut requirements = unsafe { device.inner.get_buffer_memory_requirements(inner) };
        requirements.alignment = requirements.alignment.max(min_alignment);

        let allocation = allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.inner.destroy_buffer(inner, None) };
                return Err(e.into());
            }
        };

        let buffer = Self {
            device,
            allocator,
            inner,
            allocation: Some(allocation),
            size,
        };
        if let Some(allocation) = &buffer.allocation {
            unsafe {
                buffer
                    .device
                    .inner
                    .bind_buffer_memory(inner, allocation.memory(), allocation.offset())?
            };
        }

        Ok(buffer)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = checked_range(offset, data.len(), self.size)?;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| anyhow!("Buffer is not host visible"))?;
        mapped[range].copy_from_slice(data);

        Ok(())
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let range = checked_range(offset, data.len(), self.size)?;
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| anyhow!("Buffer is not host visible"))?;
        data.copy_from_slice(&mapped[range]);

        Ok(())
    }

    pub fn get_device_address(&self) -> u64 {
        let addr_info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe { self.device.inner.get_buffer_device_address(&addr_info) }
    }
}

fn checked_range(offset: u64, len: usize, size: u64) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len as u64)
        .filter(|end| *end <= size)
        .ok_or_else(|| anyhow!("Access of {len} bytes at {offset} overruns a {size} byte buffer"))?;

    Ok(offset as usize..end as usize)
}

impl Context {
    pub fn create_buffer(
        &self,
        name: &str,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
        min_alignment: vk::DeviceSize,
    ) -> Result<Buffer> {
        Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            name,
            usage,
            memory_location,
            size,
            min_alignment,
        )
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_buffer(self.inner, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self
                .allocator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .free(allocation)
            {
                log::error!("Failed to free buffer memory: {e}");
            }
        }
    }
}
