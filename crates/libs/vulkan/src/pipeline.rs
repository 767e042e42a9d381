use std::sync::Arc;

use anyhow::{Context as _, Result};
use ash::vk;

use crate::{device::Device, DescriptorSetLayout};

/// One compiled SPIR-V blob, live for as long as the pipelines built from it are being created.
pub struct ShaderModule {
    device: Arc<Device>,
    pub(crate) inner: vk::ShaderModule,
}

/// Decodes little endian SPIR-V words, rejecting blobs that are not a whole number of words.
pub fn read_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = std::io::Cursor::new(bytes);
    ash::util::read_spv(&mut cursor).context("Invalid SPIR-V bytecode")
}

impl ShaderModule {
    pub(crate) fn from_bytes(device: Arc<Device>, bytecode: &[u8]) -> Result<Self> {
        let code = read_spirv(bytecode)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let inner = unsafe { device.inner.create_shader_module(&create_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_shader_module(self.inner, None) };
    }
}

/// Layout of a ray tracing pipeline: the single descriptor set of a global root signature.
pub struct PipelineLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::PipelineLayout,
}

impl PipelineLayout {
    pub(crate) fn new(device: Arc<Device>, set_layout: &DescriptorSetLayout) -> Result<Self> {
        let layouts = [set_layout.inner];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
        let inner = unsafe { device.inner.create_pipeline_layout(&layout_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline_layout(self.inner, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_must_be_whole_words() {
        let magic = 0x0723_0203u32.to_le_bytes();
        assert_eq!(read_spirv(&magic).unwrap(), vec![0x0723_0203]);
        assert!(read_spirv(&magic[..3]).is_err());
    }
}
