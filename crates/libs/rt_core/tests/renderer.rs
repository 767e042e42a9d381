mod common;

use common::{Command, Event, MockConfig, MockDevice, RecordingSurface, IDENTIFIER_SIZE, SURFACE};
use rt_core::{
    glam::{Vec3, Vec4},
    gpu::{Barrier, ResourceId, ResourceState, WrappedGpuPointer},
    BackendKind, CameraPose, Error, GlobalRootParameter, InstanceConstants, Renderer, RendererConfig,
    RootSignatureDesc, SceneConstants, HIT_GROUP_HALF_LAMBERT, HIT_GROUP_LAMBERT, MISS, RAY_GENERATOR, SHADER_RECORD_ALIGNMENT,
};

fn light() -> (Vec3, Vec4) {
    (Vec3::new(1.0, -1.0, -1.0), Vec4::ONE)
}

fn assert_scenario_tables(device: &MockDevice, renderer: &Renderer<MockDevice>) {
    let tables = renderer.shader_tables();

    assert_eq!(tables.raygen.record_count(), 1);
    assert_eq!(tables.miss.record_count(), 1);
    assert_eq!(tables.hit_group.record_count(), 3);
    for table in [&tables.raygen, &tables.miss, &tables.hit_group] {
        assert_eq!(table.stride() % SHADER_RECORD_ALIGNMENT, 0);
        assert!(table.stride() >= IDENTIFIER_SIZE as u64);
    }
    assert_eq!(tables.raygen.stride(), 32);
    assert_eq!(tables.hit_group.stride(), 96);

    assert_eq!(tables.raygen.record(0).unwrap(), common::identifier_for(RAY_GENERATOR));
    assert_eq!(tables.miss.record(0).unwrap(), common::identifier_for(MISS));

    let hit_groups = [HIT_GROUP_LAMBERT, HIT_GROUP_LAMBERT, HIT_GROUP_HALF_LAMBERT];
    for (i, instance) in renderer.instances().iter().enumerate() {
        let record = tables.hit_group.record(instance.hit_group_index as usize).unwrap();
        assert_eq!(&record[..32], common::identifier_for(hit_groups[i]).as_slice());
        assert_eq!(
            &record[32..72],
            bytemuck::bytes_of(&InstanceConstants::from(instance))
        );
        assert!(record[72..].iter().all(|&b| b == 0));
    }

    // The sphere instance finds its data after the box in the shared buffers.
    let sphere = InstanceConstants::from(&renderer.instances()[2]);
    assert_eq!((sphere.vertex_offset, sphere.index_offset), (24, 36));
    assert_eq!(sphere.material_color, [0.0, 1.0, 0.0, 1.0]);

    assert!(device.state().live_resources() > 0);
}

#[test]
fn box_and_sphere_scene_on_native_backend() {
    let device = MockDevice::new(MockConfig::default());
    let renderer = common::initialize(&device).unwrap();

    assert_eq!(renderer.backend_kind(), BackendKind::NativeRaytracing);
    assert_scenario_tables(&device, &renderer);
}

#[test]
fn box_and_sphere_scene_on_fallback_backend() {
    let device = MockDevice::new(MockConfig::fallback_only());
    let renderer = common::initialize(&device).unwrap();

    assert_eq!(renderer.backend_kind(), BackendKind::ComputeFallback);
    assert_scenario_tables(&device, &renderer);
}

#[test]
fn no_capability_fails_without_leaking() {
    let device = MockDevice::new(MockConfig {
        native: false,
        fallback: false,
        ..Default::default()
    });

    let err = common::initialize(&device).err().unwrap();
    assert!(matches!(err, Error::CapabilityUnavailable));

    let state = device.state();
    assert_eq!(state.live_resources(), 0);
    assert!(!state.events.iter().any(|e| matches!(e, Event::Created(_))));
}

#[test]
fn pipeline_failure_releases_root_signatures() {
    let device = MockDevice::new(MockConfig {
        fail_state_object: true,
        ..Default::default()
    });

    let err = common::initialize(&device).err().unwrap();
    assert!(matches!(err, Error::PipelineCreationFailed(_)), "{err}");

    let state = device.state();
    assert_eq!(state.live_resources(), 0);
    let created = state
        .events
        .iter()
        .filter(|e| **e == Event::Created("root signature".to_owned()))
        .count();
    assert_eq!(created, 3);
}

#[test]
fn missing_shader_export_fails_pipeline_creation() {
    let device = MockDevice::new(MockConfig::default());
    let mut shaders = common::shader_library();
    shaders[0].exports.retain(|e| e.name != MISS);

    let err = Renderer::initialize(device.clone(), &common::box_and_sphere(), shaders, common::config())
        .err()
        .unwrap();
    assert!(matches!(err, Error::PipelineCreationFailed(_)), "{err}");
    assert_eq!(device.state().live_resources(), 0);
}

#[test]
fn small_descriptor_heap_is_exhausted_explicitly() {
    let device = MockDevice::new(MockConfig::fallback_only());
    let config = RendererConfig {
        descriptor_heap_capacity: 5,
        ..common::config()
    };

    // Output, constants and two geometry views leave one slot for three wrapped pointers.
    let err = Renderer::initialize(device.clone(), &common::box_and_sphere(), common::shader_library(), config)
        .err()
        .unwrap();
    assert!(matches!(err, Error::DescriptorHeapExhausted { capacity: 5, .. }), "{err}");
    assert_eq!(device.state().live_resources(), 0);
}

#[test]
fn frame_dispatches_and_copies_to_surface() {
    let device = MockDevice::new(MockConfig::default());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();

    renderer
        .render_frame(&mut surface, &CameraPose::default(), direction, color)
        .unwrap();
    assert_eq!((surface.copies, surface.presents), (1, 1));
    assert_eq!(renderer.frames_rendered(), 1);

    let top_address = renderer.acceleration_structures().top.buffer.gpu_address();
    let hit_group = renderer.shader_tables().hit_group.strided_range();
    let output = ResourceId::Texture(renderer.output().id());

    let state = device.state();
    let submissions = state.submissions();
    assert_eq!(submissions.len(), 2);
    let commands = submissions[1];

    assert!(matches!(commands[0], Command::Reset));
    assert!(matches!(commands[1], Command::SetRootSignature(_)));
    assert!(commands.contains(&Command::SetRootSrv(GlobalRootParameter::Scene as u32, top_address)));
    for parameter in [
        GlobalRootParameter::Output,
        GlobalRootParameter::Indices,
        GlobalRootParameter::Vertices,
        GlobalRootParameter::SceneConstants,
    ] {
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::SetDescriptorTable(p, _) if *p == parameter as u32)));
    }

    let dispatch = commands
        .iter()
        .position(|c| matches!(c, Command::DispatchRays(..)))
        .unwrap();
    let Command::DispatchRays(_, desc) = &commands[dispatch] else {
        unreachable!()
    };
    assert_eq!((desc.width, desc.height, desc.depth), (64, 32, 1));
    assert_eq!(desc.hit_group, hit_group);
    assert_eq!(desc.hit_group.size, 3 * 96);

    assert_eq!(
        &commands[dispatch + 1..],
        &[
            Command::Barriers(vec![Barrier::Transition {
                resource: output,
                before: ResourceState::UnorderedAccess,
                after: ResourceState::CopySource,
            }]),
            Command::Copy {
                dst: SURFACE.into(),
                src: output,
            },
            Command::Barriers(vec![Barrier::Transition {
                resource: output,
                before: ResourceState::CopySource,
                after: ResourceState::UnorderedAccess,
            }]),
            Command::Close,
        ]
    );
    assert_eq!(state.events.last(), Some(&Event::Signaled(2)));
}

#[test]
fn frame_binds_the_live_global_root_signature_and_state_object() {
    let device = MockDevice::new(MockConfig::default());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();
    renderer
        .render_frame(&mut surface, &CameraPose::default(), direction, color)
        .unwrap();

    let state = device.state();
    let commands = state.submissions()[1];
    let root_signature = commands
        .iter()
        .find_map(|c| match c {
            Command::SetRootSignature(id) => Some(*id),
            _ => None,
        })
        .unwrap();
    let state_object = commands
        .iter()
        .find_map(|c| match c {
            Command::DispatchRays(id, _) => Some(*id),
            _ => None,
        })
        .unwrap();

    assert_eq!(
        state.root_signatures.get(&root_signature),
        Some(&RootSignatureDesc::global_scene())
    );
    assert!(state.state_objects.contains_key(&state_object));
}

#[test]
fn fallback_frame_binds_wrapped_top_level() {
    let device = MockDevice::new(MockConfig::fallback_only());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();

    renderer
        .render_frame(&mut surface, &CameraPose::orbit(1.0), direction, color)
        .unwrap();

    let state = device.state();
    let commands = state.submissions()[1];
    assert!(!commands.iter().any(|c| matches!(c, Command::SetRootSrv(..))));
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::SetTopLevel(1, WrappedGpuPointer(bits)) if *bits < 100
    )));
}

#[test]
fn camera_update_follows_the_pose() {
    let device = MockDevice::new(MockConfig::default());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();
    let camera = CameraPose::orbit(30.0);

    renderer
        .render_frame(&mut surface, &camera, direction, color)
        .unwrap();

    let expected = SceneConstants::new(&camera, 2.0, direction, color);
    let state = device.state();
    let (_, buffer) = state.buffer_named("scene constants").unwrap();
    assert_eq!(buffer.data.as_slice(), bytemuck::bytes_of(&expected));
}

#[test]
fn failed_constant_update_skips_camera_but_renders() {
    let device = MockDevice::new(MockConfig::default());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();

    let before = device.state().buffer_named("scene constants").unwrap().1.data.clone();
    device.configure(|c| c.fail_constant_writes = true);

    renderer
        .render_frame(&mut surface, &CameraPose::orbit(45.0), direction, color)
        .unwrap();

    assert_eq!(surface.presents, 1);
    let state = device.state();
    assert_eq!(state.buffer_named("scene constants").unwrap().1.data, before);
    assert_eq!(state.submissions().len(), 2);
}

#[test]
fn hung_frame_reports_device_lost() {
    let device = MockDevice::new(MockConfig::default());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();

    device.configure(|c| c.fence_hangs = true);
    let err = renderer
        .render_frame(&mut surface, &CameraPose::default(), direction, color)
        .unwrap_err();

    assert!(matches!(err, Error::DeviceLost { expected: 2, .. }), "{err}");
    assert_eq!(surface.presents, 0);
}

#[test]
fn shutdown_releases_in_reverse_construction_order() {
    let device = MockDevice::new(MockConfig::default());
    let mut renderer = common::initialize(&device).unwrap();
    let mut surface = RecordingSurface::default();
    let (direction, color) = light();
    renderer
        .render_frame(&mut surface, &CameraPose::default(), direction, color)
        .unwrap();

    let released_from = device.state().events.len();
    renderer.shutdown().unwrap();

    let state = device.state();
    assert_eq!(state.live_resources(), 0);

    let position = |name: &str| {
        state.events[released_from..]
            .iter()
            .position(|e| *e == Event::Destroyed(name.to_owned()))
            .unwrap_or_else(|| panic!("{name} not released"))
    };
    let order = [
        position("buffer:hit group shader table"),
        position("buffer:miss shader table"),
        position("buffer:raygen shader table"),
        position("buffer:top level"),
        position("buffer:bottom level 1"),
        position("buffer:bottom level 0"),
        position("buffer:indices"),
        position("buffer:vertices"),
        position("buffer:scene constants"),
        position("texture:output"),
        position("state object"),
        position("root signature"),
        position("fence"),
        position("heap:CbvSrvUav"),
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");
}

#[test]
fn dropping_the_renderer_releases_everything() {
    let device = MockDevice::new(MockConfig::fallback_only());
    drop(common::initialize(&device).unwrap());

    assert_eq!(device.state().live_resources(), 0);
}
