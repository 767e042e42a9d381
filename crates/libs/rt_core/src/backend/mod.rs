//! The two ray tracing execution paths behind one interface.
//!
//! A backend is chosen once by [`select_backend`] and shared as
//! `Arc<dyn CapabilityBackend<D>>`. Callers never learn which variant is active: the one
//! place the paths really differ, referencing an acceleration structure from shaders, is
//! hidden behind [`AccelerationHandle`].

mod fallback;
mod native;

use std::sync::Arc;

pub use fallback::*;
pub use native::*;
use strum_macros::Display;

use crate::{
    gpu::{
        BuildDesc, BuildInputs, BuildPreference, DispatchRaysDesc, GpuBuffer, PrebuildInfo, RenderDevice,
        ResourceState, RootSignatureId, StateObjectId, WrappedGpuPointer,
    },
    DescriptorHeapCategory, DescriptorHeaps, Error, PipelineStateDesc, Result, RootSignatureDesc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BackendKind {
    NativeRaytracing,
    ComputeFallback,
}

/// How shaders reference an acceleration structure on the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelerationHandle(HandleRepr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HandleRepr {
    Address(u64),
    Wrapped(WrappedGpuPointer),
}

impl AccelerationHandle {
    pub(crate) fn address(address: u64) -> Self {
        Self(HandleRepr::Address(address))
    }

    pub(crate) fn wrapped(pointer: WrappedGpuPointer) -> Self {
        Self(HandleRepr::Wrapped(pointer))
    }

    /// The 64-bit value stored in instance descriptors.
    pub(crate) fn to_bits(self) -> u64 {
        match self.0 {
            HandleRepr::Address(address) => address,
            HandleRepr::Wrapped(pointer) => pointer.0,
        }
    }
}

pub trait CapabilityBackend<D: RenderDevice> {
    fn kind(&self) -> BackendKind;

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<RootSignatureId>;

    fn destroy_root_signature(&self, root_signature: RootSignatureId);

    fn create_pipeline_state(&self, desc: &PipelineStateDesc) -> Result<StateObjectId>;

    fn destroy_pipeline_state(&self, state_object: StateObjectId);

    fn identifier_size(&self) -> u32;

    /// Fixed-size identifier of a shader or hit group export.
    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Result<Vec<u8>>;

    /// Fails on empty inputs or when the driver reports a zero result size.
    fn prebuild_size(&self, inputs: &BuildInputs, preference: BuildPreference) -> Result<PrebuildInfo>;

    /// State acceleration structure buffers must be created in.
    fn acceleration_structure_state(&self) -> ResourceState;

    fn acceleration_handle(
        &self,
        buffer: &GpuBuffer<D>,
        heaps: &mut DescriptorHeaps<D>,
    ) -> Result<AccelerationHandle>;

    fn bind_descriptor_heaps(&self, list: &mut D::CommandList, heaps: &[DescriptorHeapCategory]);

    /// Records a build. The work runs asynchronously once the list is submitted.
    fn build_acceleration_structure(&self, list: &mut D::CommandList, desc: &BuildDesc) -> Result<()>;

    fn bind_top_level(&self, list: &mut D::CommandList, parameter: u32, handle: AccelerationHandle);

    fn dispatch_rays(
        &self,
        list: &mut D::CommandList,
        state_object: StateObjectId,
        desc: &DispatchRaysDesc,
    ) -> Result<()>;
}

/// Tries native ray tracing first, then the compute fallback.
pub fn select_backend<D: RenderDevice>(device: &Arc<D>) -> Result<Arc<dyn CapabilityBackend<D>>> {
    if let Some(driver) = device.native_raytracing() {
        log::info!("Using {} backend", BackendKind::NativeRaytracing);
        return Ok(Arc::new(NativeBackend::new(driver)));
    }
    log::warn!("Native ray tracing unavailable, probing compute fallback");

    if let Some(driver) = device.compute_fallback() {
        log::info!(
            "Using {} backend (native driver underneath: {})",
            BackendKind::ComputeFallback,
            driver.using_raytracing_driver()
        );
        return Ok(Arc::new(FallbackBackend::new(driver)));
    }

    Err(Error::CapabilityUnavailable)
}

fn validate_build_inputs(inputs: &BuildInputs) -> Result<()> {
    match inputs {
        BuildInputs::BottomLevel { geometries } => {
            if geometries.is_empty() {
                return Err(Error::SizingFailed("bottom level has no geometry".to_owned()));
            }
            for (i, geometry) in geometries.iter().enumerate() {
                if geometry.vertex_count == 0 || geometry.index_count == 0 {
                    return Err(Error::SizingFailed(format!("geometry {i} has no triangles")));
                }
                if geometry.index_count % 3 != 0 {
                    return Err(Error::SizingFailed(format!(
                        "geometry {i} index count {} is not a multiple of 3",
                        geometry.index_count
                    )));
                }
            }
        }
        BuildInputs::TopLevel { instance_count, .. } => {
            if *instance_count == 0 {
                return Err(Error::SizingFailed("top level has no instances".to_owned()));
            }
        }
    }

    Ok(())
}

fn checked_prebuild(inputs: &BuildInputs, info: PrebuildInfo) -> Result<PrebuildInfo> {
    if info.result_size == 0 {
        return Err(Error::SizingFailed(format!(
            "driver reported a zero result size for {:?} level",
            inputs.level()
        )));
    }
    log::debug!(
        "Prebuild {:?}: result {} bytes, scratch {} bytes",
        inputs.level(),
        info.result_size,
        info.scratch_size
    );

    Ok(info)
}

fn checked_identifier(identifier: Option<Vec<u8>>, export: &str, size: u32) -> Result<Vec<u8>> {
    match identifier {
        Some(identifier) if identifier.len() == size as usize => Ok(identifier),
        Some(identifier) => Err(Error::TableBuildFailed {
            table: "identifier",
            reason: format!(
                "identifier of {export} is {} bytes, expected {size}",
                identifier.len()
            ),
        }),
        None => Err(Error::UnknownShaderExport(export.to_owned())),
    }
}
