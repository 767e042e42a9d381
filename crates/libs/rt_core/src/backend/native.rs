use std::sync::Arc;

use super::{checked_identifier, checked_prebuild, validate_build_inputs, AccelerationHandle, BackendKind};
use crate::{
    gpu::{
        BuildDesc, BuildInputs, BuildPreference, CommandList, DispatchRaysDesc, GpuBuffer, PrebuildInfo,
        RaytracingDriver, RenderDevice, ResourceState, RootSignatureId, StateObjectId,
    },
    CapabilityBackend, DescriptorHeapCategory, DescriptorHeaps, Error, PipelineStateDesc, Result,
    RootSignatureDesc,
};

/// Hardware ray tracing. Acceleration structures are referenced by GPU address.
pub struct NativeBackend<D: RenderDevice> {
    driver: Arc<dyn RaytracingDriver<D::CommandList>>,
}

impl<D: RenderDevice> NativeBackend<D> {
    pub fn new(driver: Arc<dyn RaytracingDriver<D::CommandList>>) -> Self {
        Self { driver }
    }
}

impl<D: RenderDevice> CapabilityBackend<D> for NativeBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeRaytracing
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
        ResourceState::RaytracingAccelerationStructure
    }

    fn acceleration_handle(
        &self,
        buffer: &GpuBuffer<D>,
        _heaps: &mut DescriptorHeaps<D>,
    ) -> Result<AccelerationHandle> {
        let address = self
            .driver
            .acceleration_structure_address(buffer.id(), buffer.gpu_address(), buffer.size())
            .map_err(|e| Error::creation(format!("address of {}", buffer.name()), e))?;

        Ok(AccelerationHandle::address(address))
    }

    fn bind_descriptor_heaps(&self, list: &mut D::CommandList, heaps: &[DescriptorHeapCategory]) {
        list.set_descriptor_heaps(heaps);
    }

    fn build_acceleration_structure(&self, list: &mut D::CommandList, desc: &BuildDesc) -> Result<()> {
        self.driver
            .build_acceleration_structure(list, desc)
            .map_err(Error::Submission)
    }

    fn bind_top_level(&self, list: &mut D::CommandList, parameter: u32, handle: AccelerationHandle) {
        list.set_compute_root_shader_resource_view(parameter, handle.to_bits());
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
