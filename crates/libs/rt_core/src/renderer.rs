use std::sync::Arc;

use glam::{Vec3, Vec4};

use crate::{
    gpu::{
        Barrier, BufferDesc, BufferPurpose, CommandList, DispatchRaysDesc, GpuBuffer, GpuTexture,
        PresentationSurface, RenderDevice, ResourceId, ResourceState, TextureDesc, TextureFormat, ViewDesc,
    },
    pipeline::{MISS, RAY_GENERATOR},
    select_backend, AccelerationStructureBuilder, BackendKind, CameraPose, CapabilityBackend, Descriptor,
    DescriptorHeapCategory, DescriptorHeaps, Error, FrameSync, GeometryInstance, GeometrySource,
    GlobalRootParameter, InstanceConstants, PipelineResources, RendererConfig, Result,
    SceneAccelerationStructures, SceneConstants, SceneGeometry, ShaderLibrary, ShaderTableBuilder, ShaderTables,
    SCENE_CONSTANTS_SIZE,
};

/// Owns every GPU object of the ray traced scene.
///
/// Fields are declared in reverse construction order, so dropping the renderer releases
/// shader tables, acceleration structures, geometry, per-frame resources and the pipeline
/// before the command list, fence and descriptor heaps they were created against.
pub struct Renderer<D: RenderDevice> {
    config: RendererConfig,
    instances: Vec<GeometryInstance>,
    frame: u64,
    /// Set once [`shutdown`](Self::shutdown) has waited for the GPU.
    drained: bool,
    shader_tables: ShaderTables<D>,
    acceleration_structures: SceneAccelerationStructures<D>,
    geometry: SceneGeometry<D>,
    scene_constants: GpuBuffer<D>,
    scene_constants_view: Descriptor,
    output: GpuTexture<D>,
    output_view: Descriptor,
    pipeline: PipelineResources<D>,
    list: D::CommandList,
    sync: FrameSync<D>,
    heaps: DescriptorHeaps<D>,
    backend: Arc<dyn CapabilityBackend<D>>,
    device: Arc<D>,
}

impl<D: RenderDevice> Renderer<D> {
    /// Selects a backend and builds everything a frame needs.
    ///
    /// On failure every object created so far is released before returning.
    pub fn initialize(
        device: Arc<D>,
        geometry: &dyn GeometrySource,
        shaders: Vec<ShaderLibrary>,
        config: RendererConfig,
    ) -> Result<Self> {
        let backend = select_backend(&device)?;
        let mut heaps = DescriptorHeaps::new(&device, config.descriptor_heap_capacity)?;
        let mut sync = FrameSync::new(&device, config.fence_timeout)?;
        let mut list = device
            .create_command_list()
            .map_err(|e| Error::creation("command list", e))?;

        let pipeline = PipelineResources::new(&backend, shaders, &config)?;

        let output = GpuTexture::new(
            &device,
            &TextureDesc {
                name: "output",
                width: config.width,
                height: config.height,
                format: TextureFormat::Rgba8Unorm,
                allow_unordered_access: true,
                initial_state: ResourceState::UnorderedAccess,
            },
        )?;
        let output_view = heaps.allocate(DescriptorHeapCategory::CbvSrvUav)?;
        device
            .create_view(&ViewDesc::StorageTexture { texture: output.id() }, &output_view)
            .map_err(|e| Error::creation("output view", e))?;

        let camera = CameraPose::default();
        let initial_constants = SceneConstants::new(
            &camera,
            aspect_ratio(&config),
            Vec3::new(1.0, -1.0, -1.0),
            Vec4::ONE,
        );
        let scene_constants = GpuBuffer::new(
            &device,
            &BufferDesc::upload("scene constants", SCENE_CONSTANTS_SIZE, BufferPurpose::Constants),
        )?;
        scene_constants
            .write(0, bytemuck::bytes_of(&initial_constants))
            .map_err(|e| Error::creation("scene constants", e))?;
        let scene_constants_view = heaps.allocate(DescriptorHeapCategory::CbvSrvUav)?;
        device
            .create_view(
                &ViewDesc::ConstantBuffer {
                    buffer: scene_constants.id(),
                    size: SCENE_CONSTANTS_SIZE,
                },
                &scene_constants_view,
            )
            .map_err(|e| Error::creation("scene constants view", e))?;

        let scene_geometry = SceneGeometry::new(&device, &mut heaps, geometry.meshes())?;
        let instances = crate::resolve_instances(geometry.instances(), scene_geometry.ranges())?;

        let acceleration_structures = AccelerationStructureBuilder::new(&device, &backend, &config).build(
            &scene_geometry,
            &instances,
            &mut heaps,
            &mut list,
            &mut sync,
        )?;

        let shader_tables = build_shader_tables(&device, backend.as_ref(), &pipeline, &instances)?;

        log::info!(
            "Renderer ready on {} backend: {}x{}, {} instances",
            backend.kind(),
            config.width,
            config.height,
            instances.len()
        );

        Ok(Self {
            config,
            instances,
            frame: 0,
            drained: false,
            shader_tables,
            acceleration_structures,
            geometry: scene_geometry,
            scene_constants,
            scene_constants_view,
            output,
            output_view,
            pipeline,
            list,
            sync,
            heaps,
            backend,
            device,
        })
    }

    /// Traces one frame into the output image and hands it to `surface`.
    ///
    /// Blocks until the GPU has finished the frame.
    pub fn render_frame(
        &mut self,
        surface: &mut dyn PresentationSurface<D::CommandList>,
        camera: &CameraPose,
        light_direction: Vec3,
        light_color: Vec4,
    ) -> Result<()> {
        let tables = &self.shader_tables;
        let structures = &self.acceleration_structures;
        let geometry = &self.geometry;
        let pipeline = &self.pipeline;
        let output = &self.output;
        let heaps = &self.heaps;
        let list = &mut self.list;
        let sync = &mut self.sync;

        let constants = SceneConstants::new(camera, aspect_ratio(&self.config), light_direction, light_color);
        if let Err(e) = self.scene_constants.write(0, bytemuck::bytes_of(&constants)) {
            log::warn!("Skipping camera update for frame {}: {e:#}", self.frame);
        }

        list.reset().map_err(Error::Submission)?;
        list.set_compute_root_signature(pipeline.global_root_signature());
        self.backend
            .bind_descriptor_heaps(list, &heaps.shader_visible());
        list.set_compute_root_descriptor_table(GlobalRootParameter::Output as _, self.output_view.gpu_handle);
        self.backend
            .bind_top_level(list, GlobalRootParameter::Scene as _, structures.top.handle);
        list.set_compute_root_descriptor_table(
            GlobalRootParameter::Indices as _,
            geometry.index_view().gpu_handle,
        );
        list.set_compute_root_descriptor_table(
            GlobalRootParameter::Vertices as _,
            geometry.vertex_view().gpu_handle,
        );
        list.set_compute_root_descriptor_table(
            GlobalRootParameter::SceneConstants as _,
            self.scene_constants_view.gpu_handle,
        );

        self.backend.dispatch_rays(
            list,
            pipeline.state_object(),
            &DispatchRaysDesc {
                raygen: tables.raygen.range(),
                miss: tables.miss.strided_range(),
                hit_group: tables.hit_group.strided_range(),
                width: output.width(),
                height: output.height(),
                depth: 1,
            },
        )?;

        let resource = ResourceId::Texture(output.id());
        list.resource_barriers(&[Barrier::Transition {
            resource,
            before: ResourceState::UnorderedAccess,
            after: ResourceState::CopySource,
        }]);
        surface
            .record_copy(list, output.id())
            .map_err(Error::Submission)?;
        list.resource_barriers(&[Barrier::Transition {
            resource,
            before: ResourceState::CopySource,
            after: ResourceState::UnorderedAccess,
        }]);

        list.close().map_err(Error::Submission)?;
        self.device
            .execute_command_list(list)
            .map_err(Error::Submission)?;
        sync.signal()?;
        sync.wait_until_current()?;
        surface.present().map_err(Error::Submission)?;

        self.frame += 1;
        Ok(())
    }

    /// Waits for outstanding GPU work, then releases everything in reverse creation order.
    pub fn shutdown(mut self) -> Result<()> {
        let idle = self.sync.wait_until_current();
        self.drained = true;
        log::info!("Renderer shut down after {} frames", self.frame);

        idle
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn instances(&self) -> &[GeometryInstance] {
        &self.instances
    }

    pub fn shader_tables(&self) -> &ShaderTables<D> {
        &self.shader_tables
    }

    pub fn acceleration_structures(&self) -> &SceneAccelerationStructures<D> {
        &self.acceleration_structures
    }

    pub fn output(&self) -> &GpuTexture<D> {
        &self.output
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frame
    }
}

impl<D: RenderDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        if self.drained {
            return;
        }
        if let Err(e) = self.sync.wait_until_current() {
            log::error!("Releasing renderer while GPU work may be in flight: {e}");
        }
    }
}

fn aspect_ratio(config: &RendererConfig) -> f32 {
    config.width as f32 / config.height.max(1) as f32
}

/// Raygen and miss tables hold one bare record each; the hit group table holds one record
/// per instance at its `hit_group_index`, carrying the instance constants.
fn build_shader_tables<D: RenderDevice>(
    device: &Arc<D>,
    backend: &dyn CapabilityBackend<D>,
    pipeline: &PipelineResources<D>,
    instances: &[GeometryInstance],
) -> Result<ShaderTables<D>> {
    let state_object = pipeline.state_object();
    let builder = ShaderTableBuilder::new(device);

    let raygen_id = backend.shader_identifier(state_object, RAY_GENERATOR)?;
    let miss_id = backend.shader_identifier(state_object, MISS)?;

    let mut ordered = instances.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|i| i.hit_group_index);
    let hit_group_ids = ordered
        .iter()
        .map(|i| backend.shader_identifier(state_object, i.hit_group.export_name()))
        .collect::<Result<Vec<_>>>()?;
    let constants = ordered
        .iter()
        .map(|i| InstanceConstants::from(*i))
        .collect::<Vec<_>>();
    let arguments = bytemuck::cast_slice::<_, u8>(&constants);
    if arguments.len() as u64 != pipeline.hit_group_arguments_size() * instances.len() as u64 {
        return Err(Error::TableBuildFailed {
            table: "hit group",
            reason: "instance constants do not match the local root signature".to_owned(),
        });
    }

    let raygen = builder.build_table("raygen", &[raygen_id.as_slice()], &[], 1)?;
    let miss = builder.build_table("miss", &[miss_id.as_slice()], &[], 1)?;
    let hit_group = builder.build_table(
        "hit group",
        &hit_group_ids.iter().map(Vec::as_slice).collect::<Vec<_>>(),
        arguments,
        instances.len(),
    )?;

    Ok(ShaderTables {
        raygen,
        miss,
        hit_group,
    })
}
