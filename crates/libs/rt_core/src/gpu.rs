//! Contract between the ray tracing core and the rendering device that hosts it.
//!
//! The core never talks to a graphics API directly. Buffer allocation, descriptor heap
//! creation, command recording and queue submission are provided by an implementation
//! of [`RenderDevice`]; the two ray tracing execution paths are provided by the device
//! as a [`RaytracingDriver`] (native) and a [`FallbackDriver`] (compute emulation).

use std::{sync::Arc, time::Duration};

use anyhow::Result;

use crate::{Descriptor, DescriptorHeapCategory, Error, PipelineStateDesc, RootSignatureDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootSignatureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateObjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
}

impl From<BufferId> for ResourceId {
    fn from(id: BufferId) -> Self {
        Self::Buffer(id)
    }
}

impl From<TextureId> for ResourceId {
    fn from(id: TextureId) -> Self {
        Self::Texture(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// CPU writable, GPU readable.
    Upload,
    /// GPU only.
    Default,
    /// GPU writable, CPU readable.
    Readback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    GenericRead,
    UnorderedAccess,
    RaytracingAccelerationStructure,
    CopySource,
    CopyDest,
}

/// What a buffer is used for. Devices that need usage flags up front derive them from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPurpose {
    Constants,
    Geometry,
    InstanceDescs,
    AccelerationStructure,
    Scratch,
    ShaderTable,
    Readback,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub heap: HeapKind,
    pub purpose: BufferPurpose,
    pub allow_unordered_access: bool,
    pub initial_state: ResourceState,
}

impl<'a> BufferDesc<'a> {
    pub fn upload(name: &'a str, size: u64, purpose: BufferPurpose) -> Self {
        Self {
            name,
            size,
            heap: HeapKind::Upload,
            purpose,
            allow_unordered_access: false,
            initial_state: ResourceState::GenericRead,
        }
    }

    pub fn unordered_access(name: &'a str, size: u64, purpose: BufferPurpose, initial_state: ResourceState) -> Self {
        Self {
            name,
            size,
            heap: HeapKind::Default,
            purpose,
            allow_unordered_access: true,
            initial_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub allow_unordered_access: bool,
    pub initial_state: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub category: DescriptorHeapCategory,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// Where a freshly created descriptor heap starts and how far apart its slots are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub cpu_start: u64,
    pub gpu_start: u64,
    pub increment: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDesc {
    ConstantBuffer {
        buffer: BufferId,
        size: u64,
    },
    StructuredBuffer {
        buffer: BufferId,
        num_elements: u32,
        stride: u32,
    },
    /// Raw (byte address) UAV over 32-bit elements.
    RawBuffer {
        buffer: BufferId,
        num_elements: u32,
    },
    StorageTexture {
        texture: TextureId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Orders every unordered access to the resource recorded before the barrier
    /// against every access recorded after it.
    Uav(ResourceId),
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::Uint16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_buffer: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: VertexFormat,
    pub index_buffer: u64,
    pub index_count: u32,
    pub index_format: IndexFormat,
    pub opaque: bool,
}

impl TriangleGeometry {
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildInputs<'a> {
    BottomLevel {
        geometries: &'a [TriangleGeometry],
    },
    /// `instance_descs` is the GPU address of the instance array; it is ignored when
    /// only querying prebuild info.
    TopLevel {
        instance_count: u32,
        instance_descs: u64,
    },
}

impl BuildInputs<'_> {
    pub fn level(&self) -> AccelerationStructureLevel {
        match self {
            Self::BottomLevel { .. } => AccelerationStructureLevel::Bottom,
            Self::TopLevel { .. } => AccelerationStructureLevel::Top,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildPreference {
    #[default]
    PreferFastTrace,
    PreferFastBuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuRange {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedGpuRange {
    pub address: u64,
    pub size: u64,
    pub stride: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildDesc<'a> {
    pub inputs: BuildInputs<'a>,
    pub preference: BuildPreference,
    pub dest_buffer: BufferId,
    pub dest: GpuRange,
    pub scratch: GpuRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub raygen: GpuRange,
    pub miss: StridedGpuRange,
    pub hit_group: StridedGpuRange,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Reference to an acceleration structure usable from compute-emulated ray tracing.
///
/// Either a descriptor heap slot plus offset, or a plain GPU address when the fallback
/// layer runs on top of a native driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WrappedGpuPointer(pub u64);

impl WrappedGpuPointer {
    pub fn emulated(descriptor_heap_index: u32, offset_in_bytes: u32) -> Self {
        Self(descriptor_heap_index as u64 | (offset_in_bytes as u64) << 32)
    }

    pub fn from_gpu_va(gpu_va: u64) -> Self {
        Self(gpu_va)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Reached,
    TimedOut,
}

pub trait CommandList {
    fn reset(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn resource_barriers(&mut self, barriers: &[Barrier]);

    fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapCategory]);

    fn set_compute_root_signature(&mut self, root_signature: RootSignatureId);

    fn set_compute_root_descriptor_table(&mut self, parameter: u32, base: GpuDescriptorHandle);

    fn set_compute_root_shader_resource_view(&mut self, parameter: u32, address: u64);

    fn copy_resource(&mut self, dst: ResourceId, src: ResourceId);

    /// Copies a whole texture into a buffer with tightly packed rows.
    fn copy_texture_to_buffer(&mut self, src: TextureId, dst: BufferId);
}

/// The operations shared by native ray tracing and the compute fallback layer.
pub trait RaytracingDriver<L: CommandList> {
    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<RootSignatureId>;

    fn destroy_root_signature(&self, root_signature: RootSignatureId);

    fn create_state_object(&self, desc: &PipelineStateDesc) -> Result<StateObjectId>;

    fn destroy_state_object(&self, state_object: StateObjectId);

    fn shader_identifier_size(&self) -> u32;

    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Option<Vec<u8>>;

    fn prebuild_info(&self, inputs: &BuildInputs, preference: BuildPreference) -> PrebuildInfo;

    /// Address an instance descriptor or a root SRV must use to reference the structure
    /// stored in `buffer`.
    fn acceleration_structure_address(&self, buffer: BufferId, gpu_va: u64, size: u64) -> Result<u64>;

    fn build_acceleration_structure(&self, list: &mut L, desc: &BuildDesc) -> Result<()>;

    fn dispatch_rays(&self, list: &mut L, state_object: StateObjectId, desc: &DispatchRaysDesc) -> Result<()>;
}

/// Extra surface of the compute emulation layer, needed because compute shaders cannot
/// dereference raw acceleration structure addresses.
pub trait FallbackDriver<L: CommandList>: RaytracingDriver<L> {
    fn acceleration_structure_state(&self) -> ResourceState;

    /// True when the layer forwards to a native driver and wrapped pointers are plain
    /// GPU addresses.
    fn using_raytracing_driver(&self) -> bool;

    fn wrapped_pointer(&self, descriptor_heap_index: u32, gpu_va: u64) -> WrappedGpuPointer;

    fn set_descriptor_heaps(&self, list: &mut L, heaps: &[DescriptorHeapCategory]);

    fn set_top_level_acceleration_structure(&self, list: &mut L, parameter: u32, pointer: WrappedGpuPointer);
}

pub trait RenderDevice: 'static {
    type CommandList: CommandList + 'static;

    fn native_raytracing(&self) -> Option<Arc<dyn RaytracingDriver<Self::CommandList>>>;

    fn compute_fallback(&self) -> Option<Arc<dyn FallbackDriver<Self::CommandList>>>;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo>;

    fn destroy_descriptor_heap(&self, category: DescriptorHeapCategory);

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId>;

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;

    fn read_buffer(&self, buffer: BufferId, offset: u64, data: &mut [u8]) -> Result<()>;

    fn buffer_gpu_address(&self, buffer: BufferId) -> u64;

    fn destroy_buffer(&self, buffer: BufferId);

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId>;

    fn destroy_texture(&self, texture: TextureId);

    fn create_view(&self, view: &ViewDesc, descriptor: &Descriptor) -> Result<()>;

    fn create_command_list(&self) -> Result<Self::CommandList>;

    /// Submits a closed command list to the device's single queue.
    fn execute_command_list(&self, list: &mut Self::CommandList) -> Result<()>;

    fn create_fence(&self, initial_value: u64) -> Result<FenceId>;

    /// Schedules the queue to write `value` into the fence once prior work completes.
    fn signal_fence(&self, fence: FenceId, value: u64) -> Result<()>;

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64>;

    /// Blocks the calling thread until the fence reaches `value` or the timeout elapses.
    /// `None` waits forever.
    fn wait_for_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<FenceWait>;

    fn destroy_fence(&self, fence: FenceId);
}

/// Receives the final color image of every frame.
pub trait PresentationSurface<L: CommandList> {
    /// Records a full copy of `source` (in copy-source state) into the surface.
    fn record_copy(&mut self, list: &mut L, source: TextureId) -> Result<()>;

    /// Called once the frame's GPU work has retired.
    fn present(&mut self) -> Result<()>;
}

/// A device buffer released when dropped.
pub struct GpuBuffer<D: RenderDevice> {
    device: Arc<D>,
    id: BufferId,
    name: String,
    size: u64,
    gpu_address: u64,
}

impl<D: RenderDevice> GpuBuffer<D> {
    pub fn new(device: &Arc<D>, desc: &BufferDesc) -> crate::Result<Self> {
        let id = device
            .create_buffer(desc)
            .map_err(|e| Error::creation(desc.name, e))?;
        let gpu_address = device.buffer_gpu_address(id);
        log::trace!("Created buffer {} ({} bytes)", desc.name, desc.size);

        Ok(Self {
            device: device.clone(),
            id,
            name: desc.name.to_owned(),
            size: desc.size,
            gpu_address,
        })
    }

    /// Creates an upload buffer holding `data`.
    pub fn with_data(device: &Arc<D>, name: &str, purpose: BufferPurpose, data: &[u8]) -> crate::Result<Self> {
        let buffer = Self::new(device, &BufferDesc::upload(name, data.len() as _, purpose))?;
        buffer
            .write(0, data)
            .map_err(|e| Error::creation(name, e))?;

        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn range(&self) -> GpuRange {
        GpuRange {
            address: self.gpu_address,
            size: self.size,
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.device.write_buffer(self.id, offset, data)
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.device.read_buffer(self.id, offset, data)
    }
}

impl<D: RenderDevice> Drop for GpuBuffer<D> {
    fn drop(&mut self) {
        log::trace!("Releasing buffer {}", self.name);
        self.device.destroy_buffer(self.id);
    }
}

/// A device texture released when dropped.
pub struct GpuTexture<D: RenderDevice> {
    device: Arc<D>,
    id: TextureId,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl<D: RenderDevice> GpuTexture<D> {
    pub fn new(device: &Arc<D>, desc: &TextureDesc) -> crate::Result<Self> {
        let id = device
            .create_texture(desc)
            .map_err(|e| Error::creation(desc.name, e))?;

        Ok(Self {
            device: device.clone(),
            id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

impl<D: RenderDevice> Drop for GpuTexture<D> {
    fn drop(&mut self) {
        self.device.destroy_texture(self.id);
    }
}
