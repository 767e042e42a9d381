use std::sync::Arc;

use super::{checked_identifier, checked_prebuild, validate_build_inputs, AccelerationHandle, BackendKind};
use crate::{
    gpu::{
        BuildDesc, BuildInputs, BuildPreference, DispatchRaysDesc, FallbackDriver, GpuBuffer, PrebuildInfo,
        RenderDevice, ResourceState, RootSignatureId, StateObjectId, ViewDesc, WrappedGpuPointer,
    },
    CapabilityBackend, DescriptorHeapCategory, DescriptorHeaps, Error, PipelineStateDesc, Result,
    RootSignatureDesc,
};

/// Ray tracing emulated with compute shaders.
///
/// Compute shaders cannot dereference an acceleration structure's GPU address, so every
/// structure is also exposed as a raw buffer UAV and referenced through a wrapped pointer
/// naming that descriptor.
pub struct FallbackBackend<D: RenderDevice> {
    driver: Arc<dyn FallbackDriver<D::CommandList>>,
}

impl<D: RenderDevice> FallbackBackend<D> {
    pub fn new(driver: Arc<dyn FallbackDriver<D::CommandList>>) -> Self {
        Self { driver }
    }
}

impl<D: RenderDevice> CapabilityBackend<D> for FallbackBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::ComputeFallback
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<RootSignatureId> {
        self.driver
            .create_root_signature(desc)
            .map_err(Error::RootSignatureCreationFailed)
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        self.driver.destroy_root_signature(root_signature);
    }

    fn create_pipeline_state(&self, desc: &PipelineStateDesc) -> Result<StateObjectId> {
        self.driver
            .create_state_object(desc)
            .map_err(Error::PipelineCreationFailed)
    }

    fn destroy_pipeline_state(&self, state_object: StateObjectId) {
        self.driver.destroy_state_object(state_object);
    }

    fn identifier_size(&self) -> u32 {
        self.driver.shader_identifier_size()
    }

    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Result<Vec<u8>> {
        checked_identifier(
            self.driver.shader_identifier(state_object, export),
            export,
            self.identifier_size(),
        )
    }

    fn prebuild_size(&self, inputs: &BuildInputs, preference: BuildPreference) -> Result<PrebuildInfo> {
        validate_build_inputs(inputs)?;
        checked_prebuild(inputs, self.driver.prebuild_info(inputs, preference))
    }

    fn acceleration_structure_state(&self) -> ResourceState {
        self.driver.acceleration_structure_state()
    }

    fn acceleration_handle(
        &self,
        buffer: &GpuBuffer<D>,
        heaps: &mut DescriptorHeaps<D>,
    ) -> Result<AccelerationHandle> {
        let mut descriptor_index = 0;
        if !self.driver.using_raytracing_driver() {
            let descriptor = heaps.allocate(DescriptorHeapCategory::CbvSrvUav)?;
            let view = ViewDesc::RawBuffer {
                buffer: buffer.id(),
                num_elements: (buffer.size() / 4) as u32,
            };
            heaps
                .device()
                .create_view(&view, &descriptor)
                .map_err(|e| Error::creation(format!("raw view of {}", buffer.name()), e))?;
            descriptor_index = descriptor.index;
        }

        let pointer = self
            .driver
            .wrapped_pointer(descriptor_index, buffer.gpu_address());
        log::debug!(
            "Wrapped {} as descriptor {descriptor_index} ({:#x})",
            buffer.name(),
            pointer.0
        );

        Ok(AccelerationHandle::wrapped(pointer))
    }

    fn bind_descriptor_heaps(&self, list: &mut D::CommandList, heaps: &[DescriptorHeapCategory]) {
        self.driver.set_descriptor_heaps(list, heaps);
    }

    fn build_acceleration_structure(&self, list: &mut D::CommandList, desc: &BuildDesc) -> Result<()> {
        self.driver
            .build_acceleration_structure(list, desc)
            .map_err(Error::Submission)
    }

    fn bind_top_level(&self, list: &mut D::CommandList, parameter: u32, handle: AccelerationHandle) {
        self.driver
            .set_top_level_acceleration_structure(list, parameter, WrappedGpuPointer(handle.to_bits()));
    }

    fn dispatch_rays(
        &self,
        list: &mut D::CommandList,
        state_object: StateObjectId,
        desc: &DispatchRaysDesc,
    ) -> Result<()> {
        self.driver
            .dispatch_rays(list, state_object, desc)
            .map_err(Error::Submission)
    }
}
