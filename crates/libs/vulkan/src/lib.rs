//! Headless Vulkan host for the ray tracing core.
//!
//! [`VulkanDevice`] implements [`rt_core::gpu::RenderDevice`] on a single compute-capable
//! queue. Native ray tracing is exposed through `VK_KHR_ray_tracing_pipeline` when the
//! physical device supports it; there is no compute fallback layer on Vulkan.

pub use ash;
pub use gpu_allocator;

mod buffer;
mod command;
mod command_list;
mod context;
mod descriptor;
mod device;
mod image;
mod instance;
mod physical_device;
mod pipeline;
mod queue;
mod ray_tracing;
mod render_device;
mod sync;

pub use buffer::*;
pub use command::*;
pub use command_list::*;
pub use context::*;
pub use descriptor::*;
pub use device::*;
pub use image::*;
pub use pipeline::*;
pub use queue::*;
pub use ray_tracing::*;
pub use render_device::*;
pub use sync::*;

pub const VERSION_1_2: Version = Version::from_major_minor(1, 2);
pub const VERSION_1_3: Version = Version::from_major_minor(1, 3);

#[derive(Debug, Clone, Copy)]
pub struct Version {
    pub variant: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            variant,
            major,
            minor,
            patch,
        }
    }

    pub const fn from_major_minor(major: u32, minor: u32) -> Self {
        Self::new(0, major, minor, 0)
    }

    pub(crate) fn make_api_version(&self) -> u32 {
        ash::vk::make_api_version(self.variant, self.major, self.minor, self.patch)
    }
}
