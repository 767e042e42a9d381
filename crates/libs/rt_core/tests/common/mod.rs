//! In-memory device that records every command and tracks every live object.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{anyhow, Result};
use rt_core::{
    glam::{Mat4, Vec3, Vec4},
    gpu::*,
    Descriptor, DescriptorHeapCategory, HitGroup, InstancePlacement, MeshData, PipelineStateDesc, Renderer,
    RendererConfig, RootSignatureDesc, ShaderExport, ShaderLibrary, ShaderStage, StaticScene, Vertex,
    CLOSEST_HIT_HALF_LAMBERT, CLOSEST_HIT_LAMBERT, MISS, RAY_GENERATOR,
};

pub const IDENTIFIER_SIZE: u32 = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset,
    Close,
    Barriers(Vec<Barrier>),
    SetDescriptorHeaps(Vec<DescriptorHeapCategory>),
    SetRootSignature(RootSignatureId),
    SetDescriptorTable(u32, GpuDescriptorHandle),
    SetRootSrv(u32, u64),
    SetTopLevel(u32, WrappedGpuPointer),
    Build {
        level: AccelerationStructureLevel,
        dest_buffer: BufferId,
        dest: GpuRange,
        scratch: GpuRange,
        instance_descs: Option<u64>,
    },
    DispatchRays(StateObjectId, DispatchRaysDesc),
    Copy {
        dst: ResourceId,
        src: ResourceId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Created(String),
    Destroyed(String),
    View(ViewDesc, u32),
    Submitted(Vec<Command>),
    Signaled(u64),
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub native: bool,
    pub fallback: bool,
    pub fallback_uses_driver: bool,
    pub zero_prebuild: bool,
    /// Buffer creation fails when the name contains this.
    pub fail_buffer: Option<&'static str>,
    pub fail_state_object: bool,
    pub fail_constant_writes: bool,
    pub fence_hangs: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            native: true,
            fallback: true,
            fallback_uses_driver: false,
            zero_prebuild: false,
            fail_buffer: None,
            fail_state_object: false,
            fail_constant_writes: false,
            fence_hangs: false,
        }
    }
}

impl MockConfig {
    pub fn fallback_only() -> Self {
        Self {
            native: false,
            ..Default::default()
        }
    }
}

pub struct MockBuffer {
    pub name: String,
    pub purpose: BufferPurpose,
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MockState {
    pub config: MockConfig,
    next_id: u64,
    next_address: u64,
    pub buffers: BTreeMap<BufferId, MockBuffer>,
    /// Contents of destroyed buffers, by name.
    pub retired: Vec<(String, Vec<u8>)>,
    pub textures: BTreeMap<TextureId, String>,
    pub heaps: BTreeSet<DescriptorHeapCategory>,
    pub root_signatures: BTreeMap<RootSignatureId, RootSignatureDesc>,
    pub state_objects: BTreeMap<StateObjectId, PipelineStateDesc>,
    pub fences: BTreeMap<FenceId, u64>,
    pub events: Vec<Event>,
}

impl MockState {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn live_resources(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.heaps.len()
            + self.root_signatures.len()
            + self.state_objects.len()
            + self.fences.len()
    }

    pub fn buffer_named(&self, name: &str) -> Option<(&BufferId, &MockBuffer)> {
        self.buffers.iter().find(|(_, b)| b.name == name)
    }

    pub fn retired_named(&self, name: &str) -> Option<&[u8]> {
        self.retired
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    pub fn submissions(&self) -> Vec<&Vec<Command>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Submitted(commands) => Some(commands),
                _ => None,
            })
            .collect()
    }

    pub fn views(&self) -> Vec<ViewDesc> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::View(view, _) => Some(*view),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events.iter().position(|e| e == event)
    }
}

pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new(config: MockConfig) -> Arc<Self> {
        let state = MockState {
            config,
            next_address: 0x1_0000_0000,
            ..Default::default()
        };
        Arc::new(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockConfig)) {
        f(&mut self.state().config);
    }
}

#[derive(Default)]
pub struct MockCommandList {
    pub commands: Vec<Command>,
    open: bool,
}

impl MockCommandList {
    fn push(&mut self, command: Command) {
        assert!(self.open, "recording into a closed command list");
        self.commands.push(command);
    }
}

impl CommandList for MockCommandList {
    fn reset(&mut self) -> Result<()> {
        self.commands = vec![Command::Reset];
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(anyhow!("command list closed twice"));
        }
        self.commands.push(Command::Close);
        self.open = false;
        Ok(())
    }

    fn resource_barriers(&mut self, barriers: &[Barrier]) {
        self.push(Command::Barriers(barriers.to_vec()));
    }

    fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapCategory]) {
        self.push(Command::SetDescriptorHeaps(heaps.to_vec()));
    }

    fn set_compute_root_signature(&mut self, root_signature: RootSignatureId) {
        self.push(Command::SetRootSignature(root_signature));
    }

    fn set_compute_root_descriptor_table(&mut self, parameter: u32, base: GpuDescriptorHandle) {
        self.push(Command::SetDescriptorTable(parameter, base));
    }

    fn set_compute_root_shader_resource_view(&mut self, parameter: u32, address: u64) {
        self.push(Command::SetRootSrv(parameter, address));
    }

    fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) {
        self.push(Command::Copy { dst, src });
    }

    fn copy_texture_to_buffer(&mut self, src: TextureId, dst: BufferId) {
        self.push(Command::Copy {
            dst: dst.into(),
            src: src.into(),
        });
    }
}

pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    uses_driver: bool,
}

impl MockDriver {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

/// Deterministic identifier bytes derived from the export name.
pub fn identifier_for(export: &str) -> Vec<u8> {
    let seed = export.bytes().fold(17u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..IDENTIFIER_SIZE).map(|i| seed.wrapping_add(i as u8)).collect()
}

impl RaytracingDriver<MockCommandList> for MockDriver {
    fn create_root_signature(&self, desc: &RootSignatureDesc) -> Result<RootSignatureId> {
        let mut state = self.state();
        let id = RootSignatureId(state.id());
        state.root_signatures.insert(id, desc.clone());
        state.record(Event::Created("root signature".to_owned()));
        Ok(id)
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        let mut state = self.state();
        state.root_signatures.remove(&root_signature);
        state.record(Event::Destroyed("root signature".to_owned()));
    }

    fn create_state_object(&self, desc: &PipelineStateDesc) -> Result<StateObjectId> {
        let mut state = self.state();
        if state.config.fail_state_object {
            return Err(anyhow!("state object compilation failed"));
        }
        let id = StateObjectId(state.id());
        state.state_objects.insert(id, desc.clone());
        state.record(Event::Created("state object".to_owned()));
        Ok(id)
    }

    fn destroy_state_object(&self, state_object: StateObjectId) {
        let mut state = self.state();
        state.state_objects.remove(&state_object);
        state.record(Event::Destroyed("state object".to_owned()));
    }

    fn shader_identifier_size(&self) -> u32 {
        IDENTIFIER_SIZE
    }

    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let desc = state.state_objects.get(&state_object)?;
        desc.exports(export).then(|| identifier_for(export))
    }

    fn prebuild_info(&self, inputs: &BuildInputs, _preference: BuildPreference) -> PrebuildInfo {
        if self.state().config.zero_prebuild {
            return PrebuildInfo::default();
        }
        match inputs {
            BuildInputs::BottomLevel { geometries } => {
                let triangles = geometries.iter().map(|g| g.primitive_count() as u64).sum::<u64>();
                PrebuildInfo {
                    result_size: 1024 + 64 * triangles,
                    scratch_size: 128 * triangles,
                }
            }
            BuildInputs::TopLevel { instance_count, .. } => PrebuildInfo {
                result_size: 256 + 64 * *instance_count as u64,
                scratch_size: 512 * *instance_count as u64,
            },
        }
    }

    fn acceleration_structure_address(&self, _buffer: BufferId, gpu_va: u64, _size: u64) -> Result<u64> {
        Ok(gpu_va)
    }

    fn build_acceleration_structure(&self, list: &mut MockCommandList, desc: &BuildDesc) -> Result<()> {
        let instance_descs = match desc.inputs {
            BuildInputs::TopLevel { instance_descs, .. } => Some(instance_descs),
            BuildInputs::BottomLevel { .. } => None,
        };
        list.push(Command::Build {
            level: desc.inputs.level(),
            dest_buffer: desc.dest_buffer,
            dest: desc.dest,
            scratch: desc.scratch,
            instance_descs,
        });
        Ok(())
    }

    fn dispatch_rays(
        &self,
        list: &mut MockCommandList,
        state_object: StateObjectId,
        desc: &DispatchRaysDesc,
    ) -> Result<()> {
        list.push(Command::DispatchRays(state_object, *desc));
        Ok(())
    }
}

impl FallbackDriver<MockCommandList> for MockDriver {
    fn acceleration_structure_state(&self) -> ResourceState {
        ResourceState::UnorderedAccess
    }

    fn using_raytracing_driver(&self) -> bool {
        self.uses_driver
    }

    fn wrapped_pointer(&self, descriptor_heap_index: u32, gpu_va: u64) -> WrappedGpuPointer {
        if self.uses_driver {
            WrappedGpuPointer::from_gpu_va(gpu_va)
        } else {
            WrappedGpuPointer::emulated(descriptor_heap_index, 0)
        }
    }

    fn set_descriptor_heaps(&self, list: &mut MockCommandList, heaps: &[DescriptorHeapCategory]) {
        list.push(Command::SetDescriptorHeaps(heaps.to_vec()));
    }

    fn set_top_level_acceleration_structure(
        &self,
        list: &mut MockCommandList,
        parameter: u32,
        pointer: WrappedGpuPointer,
    ) {
        list.push(Command::SetTopLevel(parameter, pointer));
    }
}

impl RenderDevice for MockDevice {
    type CommandList = MockCommandList;

    fn native_raytracing(&self) -> Option<Arc<dyn RaytracingDriver<MockCommandList>>> {
        if !self.state().config.native {
            return None;
        }
        let driver: Arc<dyn RaytracingDriver<MockCommandList>> = Arc::new(MockDriver {
            state: self.state.clone(),
            uses_driver: true,
        });
        Some(driver)
    }

    fn compute_fallback(&self) -> Option<Arc<dyn FallbackDriver<MockCommandList>>> {
        let config = self.state().config.clone();
        if !config.fallback {
            return None;
        }
        let driver: Arc<dyn FallbackDriver<MockCommandList>> = Arc::new(MockDriver {
            state: self.state.clone(),
            uses_driver: config.fallback_uses_driver,
        });
        Some(driver)
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo> {
        let mut state = self.state();
        state.heaps.insert(desc.category);
        state.record(Event::Created(format!("heap:{}", desc.category)));
        let base = 0x10_0000 * (desc.category as u64 + 1);
        Ok(DescriptorHeapInfo {
            cpu_start: base,
            gpu_start: if desc.shader_visible { base << 16 } else { 0 },
            increment: 32,
        })
    }

    fn destroy_descriptor_heap(&self, category: DescriptorHeapCategory) {
        let mut state = self.state();
        state.heaps.remove(&category);
        state.record(Event::Destroyed(format!("heap:{category}")));
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId> {
        let mut state = self.state();
        if matches!(state.config.fail_buffer, Some(name) if desc.name.contains(name)) {
            return Err(anyhow!("out of memory"));
        }
        let id = BufferId(state.id());
        let address = state.next_address;
        state.next_address += (desc.size + 0xffff) & !0xffff;
        state.buffers.insert(
            id,
            MockBuffer {
                name: desc.name.to_owned(),
                purpose: desc.purpose,
                address,
                data: vec![0; desc.size as usize],
            },
        );
        state.record(Event::Created(format!("buffer:{}", desc.name)));
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let fail_constants = state.config.fail_constant_writes;
        let buffer = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| anyhow!("unknown buffer"))?;
        if fail_constants && buffer.purpose == BufferPurpose::Constants {
            return Err(anyhow!("map failed"));
        }
        let offset = offset as usize;
        buffer
            .data
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow!("write out of bounds"))?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, data: &mut [u8]) -> Result<()> {
        let state = self.state();
        let buffer = state.buffers.get(&buffer).ok_or_else(|| anyhow!("unknown buffer"))?;
        let offset = offset as usize;
        data.copy_from_slice(
            buffer
                .data
                .get(offset..offset + data.len())
                .ok_or_else(|| anyhow!("read out of bounds"))?,
        );
        Ok(())
    }

    fn buffer_gpu_address(&self, buffer: BufferId) -> u64 {
        self.state()
            .buffers
            .get(&buffer)
            .map(|b| b.address)
            .unwrap_or_default()
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state();
        if let Some(buffer) = state.buffers.remove(&buffer) {
            state.record(Event::Destroyed(format!("buffer:{}", buffer.name)));
            state.retired.push((buffer.name, buffer.data));
        }
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        let mut state = self.state();
        let id = TextureId(state.id());
        state.textures.insert(id, desc.name.to_owned());
        state.record(Event::Created(format!("texture:{}", desc.name)));
        Ok(id)
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut state = self.state();
        if let Some(name) = state.textures.remove(&texture) {
            state.record(Event::Destroyed(format!("texture:{name}")));
        }
    }

    fn create_view(&self, view: &ViewDesc, descriptor: &Descriptor) -> Result<()> {
        self.state().record(Event::View(*view, descriptor.index));
        Ok(())
    }

    fn create_command_list(&self) -> Result<MockCommandList> {
        Ok(MockCommandList::default())
    }

    fn execute_command_list(&self, list: &mut MockCommandList) -> Result<()> {
        if list.open {
            return Err(anyhow!("executing an open command list"));
        }
        self.state()
            .record(Event::Submitted(list.commands.clone()));
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        let mut state = self.state();
        let id = FenceId(state.id());
        state.fences.insert(id, initial_value);
        state.record(Event::Created("fence".to_owned()));
        Ok(id)
    }

    fn signal_fence(&self, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state();
        state.record(Event::Signaled(value));
        if !state.config.fence_hangs {
            state.fences.insert(fence, value);
        }
        Ok(())
    }

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64> {
        self.state()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| anyhow!("unknown fence"))
    }

    fn wait_for_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<FenceWait> {
        let completed = self.fence_completed_value(fence)?;
        match (completed >= value, timeout) {
            (true, _) => Ok(FenceWait::Reached),
            (false, Some(_)) => Ok(FenceWait::TimedOut),
            (false, None) => Err(anyhow!("unbounded wait on a fence that never completes")),
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        let mut state = self.state();
        state.fences.remove(&fence);
        state.record(Event::Destroyed("fence".to_owned()));
    }
}

#[derive(Default)]
pub struct RecordingSurface {
    pub copies: usize,
    pub presents: usize,
}

pub const SURFACE: TextureId = TextureId(u64::MAX);

impl PresentationSurface<MockCommandList> for RecordingSurface {
    fn record_copy(&mut self, list: &mut MockCommandList, source: TextureId) -> Result<()> {
        list.copy_resource(SURFACE.into(), source.into());
        self.copies += 1;
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        self.presents += 1;
        Ok(())
    }
}

fn mesh(shape: shapes::Mesh) -> MeshData {
    MeshData {
        vertices: shape
            .vertices
            .iter()
            .map(|v| Vertex {
                position: v.position,
                normal: v.normal,
            })
            .collect(),
        indices: shape.indices,
    }
}

/// Two boxes and a sphere, the sphere shaded with the half-Lambert hit group.
pub fn box_and_sphere() -> StaticScene {
    StaticScene {
        meshes: vec![mesh(shapes::unit_box()), mesh(shapes::sphere(16, 16).unwrap())],
        instances: vec![
            InstancePlacement {
                mesh: 0,
                transform: Mat4::from_translation(Vec3::new(-1.5, 0.0, 0.0)),
                color: Vec4::new(1.0, 0.0, 0.0, 1.0),
                hit_group: HitGroup::Lambert,
                hit_group_index: 0,
            },
            InstancePlacement {
                mesh: 0,
                transform: Mat4::from_translation(Vec3::new(1.5, 0.0, 0.0))
                    * Mat4::from_rotation_y(45f32.to_radians()),
                color: Vec4::new(1.0, 1.0, 0.0, 1.0),
                hit_group: HitGroup::Lambert,
                hit_group_index: 1,
            },
            InstancePlacement {
                mesh: 1,
                transform: Mat4::from_translation(Vec3::new(0.0, 0.0, 2.5)),
                color: Vec4::new(0.0, 1.0, 0.0, 1.0),
                hit_group: HitGroup::HalfLambert,
                hit_group_index: 2,
            },
        ],
    }
}

pub fn shader_library() -> Vec<ShaderLibrary> {
    vec![ShaderLibrary::new(
        vec![0x44, 0x58, 0x42, 0x43],
        vec![
            ShaderExport::new(RAY_GENERATOR, ShaderStage::RayGeneration),
            ShaderExport::new(CLOSEST_HIT_LAMBERT, ShaderStage::ClosestHit),
            ShaderExport::new(CLOSEST_HIT_HALF_LAMBERT, ShaderStage::ClosestHit),
            ShaderExport::new(MISS, ShaderStage::Miss),
        ],
    )]
}

pub fn config() -> RendererConfig {
    RendererConfig::default()
        .with_resolution(64, 32)
        .with_fence_timeout(Some(Duration::from_millis(10)))
}

pub fn initialize(device: &Arc<MockDevice>) -> rt_core::Result<Renderer<MockDevice>> {
    Renderer::initialize(device.clone(), &box_and_sphere(), shader_library(), config())
}
