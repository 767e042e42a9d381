use std::sync::Arc;

use anyhow::{anyhow, Result};
use ash::vk;

use crate::{device::Device, Buffer, Context, ImageView};

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub(crate) fn new(device: Arc<Device>, bindings: &[vk::DescriptorSetLayoutBinding]) -> Result<Self> {
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let inner = unsafe { device.inner.create_descriptor_set_layout(&dsl_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_descriptor_set_layout(self.inner, None);
        }
    }
}

pub struct DescriptorPool {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorPool,
}

impl DescriptorPool {
    pub(crate) fn new(device: Arc<Device>, max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> Result<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let inner = unsafe { device.inner.create_descriptor_pool(&pool_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn allocate_set(&self, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        let sets_alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.inner)
            .set_layouts(std::slice::from_ref(&layout.inner));
        let inner = unsafe { self.device.inner.allocate_descriptor_sets(&sets_alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Driver returned no descriptor set"))?;

        Ok(DescriptorSet {
            device: self.device.clone(),
            inner,
        })
    }

    /// Returns every set allocated from the pool. Sets must no longer be in use.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .inner
                .reset_descriptor_pool(self.inner, vk::DescriptorPoolResetFlags::empty())?
        };

        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_descriptor_pool(self.inner, None) };
    }
}

pub struct DescriptorSet {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn update(&self, writes: &[WriteDescriptorSet]) {
        use WriteDescriptorSetKind::*;

        // Backing storage for the info structs the writes point into. Reserved up front so
        // pushing never moves an element already referenced.
        let mut img_infos = Vec::with_capacity(writes.len());
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut as_handles = Vec::with_capacity(writes.len());
        let mut as_infos = Vec::with_capacity(writes.len());

        for write in writes {
            match write.kind {
                AccelerationStructure {
                    acceleration_structure,
                } => as_handles.push(acceleration_structure),
                _ => {}
            }
        }
        let mut as_handles = as_handles.iter();

        let descriptor_writes = writes
            .iter()
            .map(|write| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(self.inner)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element);

                match write.kind {
                    StorageImage { view, layout } => {
                        img_infos.push(
                            vk::DescriptorImageInfo::builder()
                                .image_view(view.inner)
                                .image_layout(layout)
                                .build(),
                        );

                        builder
                            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                            .image_info(std::slice::from_ref(&img_infos[img_infos.len() - 1]))
                            .build()
                    }
                    AccelerationStructure { .. } => {
                        let handle = as_handles.next().map_or(&[][..], std::slice::from_ref);
                        as_infos.push(
                            vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                                .acceleration_structures(handle)
                                .build(),
                        );

                        let last = as_infos.len() - 1;
                        let mut write = builder
                            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                            .push_next(&mut as_infos[last])
                            .build();
                        write.descriptor_count = 1;

                        write
                    }
                    UniformBuffer { buffer, range } | StorageBuffer { buffer, range } => {
                        buffer_infos.push(
                            vk::DescriptorBufferInfo::builder()
                                .buffer(buffer.inner)
                                .range(range.unwrap_or(vk::WHOLE_SIZE))
                                .build(),
                        );

                        let ty = match write.kind {
                            UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
                            _ => vk::DescriptorType::STORAGE_BUFFER,
                        };
                        builder
                            .descriptor_type(ty)
                            .buffer_info(std::slice::from_ref(&buffer_infos[buffer_infos.len() - 1]))
                            .build()
                    }
                }
            })
            .collect::<Vec<_>>();

        unsafe { self.device.inner.update_descriptor_sets(&descriptor_writes, &[]) };
    }
}

impl Context {
    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(self.device.clone(), bindings)
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorPool> {
        DescriptorPool::new(self.device.clone(), max_sets, pool_sizes)
    }
}

#[derive(Clone, Copy)]
pub struct WriteDescriptorSet<'a> {
    pub binding: u32,
    pub array_element: u32,
    pub kind: WriteDescriptorSetKind<'a>,
}

#[derive(Clone, Copy)]
pub enum WriteDescriptorSetKind<'a> {
    StorageImage {
        view: &'a ImageView,
        layout: vk::ImageLayout,
    },
    AccelerationStructure {
        acceleration_structure: vk::AccelerationStructureKHR,
    },
    /// `None` binds the whole buffer.
    UniformBuffer {
        buffer: &'a Buffer,
        range: Option<vk::DeviceSize>,
    },
    StorageBuffer {
        buffer: &'a Buffer,
        range: Option<vk::DeviceSize>,
    },
}
