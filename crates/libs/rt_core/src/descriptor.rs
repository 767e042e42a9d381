use std::{collections::BTreeMap, sync::Arc};

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::{
    gpu::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapInfo, GpuDescriptorHandle, RenderDevice},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display)]
pub enum DescriptorHeapCategory {
    RenderTarget,
    DepthStencil,
    CbvSrvUav,
    Sampler,
}

impl DescriptorHeapCategory {
    /// Only these heaps can be bound while shaders run.
    pub fn shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

/// A heap slot. Never reclaimed once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub category: DescriptorHeapCategory,
    pub cpu_handle: CpuDescriptorHandle,
    pub gpu_handle: GpuDescriptorHandle,
    pub index: u32,
}

/// Bump allocator over one fixed-capacity descriptor heap.
#[derive(Debug)]
pub struct DescriptorAllocator {
    category: DescriptorHeapCategory,
    info: DescriptorHeapInfo,
    capacity: u32,
    next: u32,
}

impl DescriptorAllocator {
    pub fn new(category: DescriptorHeapCategory, info: DescriptorHeapInfo, capacity: u32) -> Self {
        Self {
            category,
            info,
            capacity,
            next: 0,
        }
    }

    pub fn allocate(&mut self) -> Result<Descriptor> {
        if self.next >= self.capacity {
            return Err(Error::DescriptorHeapExhausted {
                category: self.category,
                capacity: self.capacity,
            });
        }

        let index = self.next;
        self.next += 1;

        let offset = index as u64 * self.info.increment as u64;
        let descriptor = Descriptor {
            category: self.category,
            cpu_handle: CpuDescriptorHandle(self.info.cpu_start + offset),
            gpu_handle: GpuDescriptorHandle(self.info.gpu_start + offset),
            index,
        };
        log::debug!("Allocated {} descriptor {index}", self.category);

        Ok(descriptor)
    }

    pub fn category(&self) -> DescriptorHeapCategory {
        self.category
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }
}

/// One heap and allocator per category. Heaps are destroyed on drop.
pub struct DescriptorHeaps<D: RenderDevice> {
    device: Arc<D>,
    allocators: BTreeMap<DescriptorHeapCategory, DescriptorAllocator>,
}

impl<D: RenderDevice> DescriptorHeaps<D> {
    pub fn new(device: &Arc<D>, capacity: u32) -> Result<Self> {
        let mut heaps = Self {
            device: device.clone(),
            allocators: BTreeMap::new(),
        };

        // Already created heaps are released by drop if a later one fails.
        for category in DescriptorHeapCategory::iter() {
            let desc = DescriptorHeapDesc {
                category,
                capacity,
                shader_visible: category.shader_visible(),
            };
            let info = device
                .create_descriptor_heap(&desc)
                .map_err(|e| Error::creation(format!("{category} descriptor heap"), e))?;
            heaps
                .allocators
                .insert(category, DescriptorAllocator::new(category, info, capacity));
        }

        Ok(heaps)
    }

    pub fn allocate(&mut self, category: DescriptorHeapCategory) -> Result<Descriptor> {
        self.allocators
            .get_mut(&category)
            .ok_or(Error::DescriptorHeapExhausted {
                category,
                capacity: 0,
            })?
            .allocate()
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn allocator(&self, category: DescriptorHeapCategory) -> Option<&DescriptorAllocator> {
        self.allocators.get(&category)
    }

    /// Categories bound for shader access during dispatch.
    pub fn shader_visible(&self) -> Vec<DescriptorHeapCategory> {
        self.allocators
            .keys()
            .copied()
            .filter(|c| c.shader_visible())
            .collect()
    }
}

impl<D: RenderDevice> Drop for DescriptorHeaps<D> {
    fn drop(&mut self) {
        for category in self.allocators.keys().rev() {
            self.device.destroy_descriptor_heap(*category);
        }
    }
}
