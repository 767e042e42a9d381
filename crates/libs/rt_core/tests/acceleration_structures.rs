mod common;

use common::{Command, Event, MockConfig, MockDevice};
use rt_core::{
    gpu::{AccelerationStructureLevel, Barrier, ResourceId, ViewDesc, WrappedGpuPointer},
    Error, InstanceDesc,
};

fn builds(commands: &[Command]) -> Vec<(usize, AccelerationStructureLevel, rt_core::gpu::BufferId)> {
    commands
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match c {
            Command::Build {
                level, dest_buffer, ..
            } => Some((i, *level, *dest_buffer)),
            _ => None,
        })
        .collect()
}

fn instance_descs(bytes: &[u8]) -> Vec<InstanceDesc> {
    bytes
        .chunks_exact(std::mem::size_of::<InstanceDesc>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

#[test]
fn top_level_is_built_after_barrier_on_every_bottom() {
    let device = MockDevice::new(MockConfig::default());
    let renderer = common::initialize(&device).unwrap();

    let state = device.state();
    let submissions = state.submissions();
    assert_eq!(submissions.len(), 1, "one round trip for the whole build");
    let commands = submissions[0];

    let builds = builds(commands);
    assert_eq!(builds.len(), 3);
    let (top_position, top_level, _) = builds[2];
    assert_eq!(top_level, AccelerationStructureLevel::Top);

    let structures = renderer.acceleration_structures();
    for bottom in &structures.bottoms {
        let id = bottom.buffer.id();
        let build_position = builds
            .iter()
            .find(|(_, level, dest)| *level == AccelerationStructureLevel::Bottom && *dest == id)
            .map(|(i, ..)| *i)
            .expect("bottom level built");
        let barrier_position = commands
            .iter()
            .position(|c| matches!(c, Command::Barriers(b) if b.contains(&Barrier::Uav(ResourceId::Buffer(id)))))
            .expect("UAV barrier on bottom level");

        assert!(build_position < barrier_position);
        assert!(barrier_position < top_position);
    }
    assert_eq!(commands.last(), Some(&Command::Close));
}

#[test]
fn scratch_is_shared_and_results_are_exactly_sized() {
    let device = MockDevice::new(MockConfig::default());
    let renderer = common::initialize(&device).unwrap();
    let structures = renderer.acceleration_structures();

    // Box: 12 triangles, sphere: 480, top: 3 instances.
    let sizes = structures.bottoms.iter().map(|b| b.size).collect::<Vec<_>>();
    assert_eq!(sizes, vec![1024 + 64 * 12, 1024 + 64 * 480]);
    assert_eq!(structures.top.size, 256 + 64 * 3);
    assert_eq!(structures.top.level, AccelerationStructureLevel::Top);

    let state = device.state();
    let commands = state.submissions()[0];
    let scratches = commands
        .iter()
        .filter_map(|c| match c {
            Command::Build { scratch, dest, .. } => Some((*scratch, dest.size)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(scratches.windows(2).all(|w| w[0].0 == w[1].0));
    assert_eq!(scratches[0].0.size, 128 * 480);
    assert_eq!(
        scratches.iter().map(|(_, size)| *size).collect::<Vec<_>>(),
        vec![1024 + 64 * 12, 1024 + 64 * 480, 256 + 64 * 3]
    );

    // Scratch and instance buffers do not outlive the build.
    assert!(state.buffer_named("acceleration structure scratch").is_none());
    assert!(state.buffer_named("instance descs").is_none());
}

#[test]
fn instances_reference_bottom_addresses_on_native() {
    let device = MockDevice::new(MockConfig::default());
    let renderer = common::initialize(&device).unwrap();
    let structures = renderer.acceleration_structures();

    let state = device.state();
    let descs = instance_descs(state.retired_named("instance descs").unwrap());
    assert_eq!(descs.len(), 3);

    let box_address = structures.bottoms[0].buffer.gpu_address();
    let sphere_address = structures.bottoms[1].buffer.gpu_address();
    assert_eq!(
        descs.iter().map(|d| d.acceleration_structure).collect::<Vec<_>>(),
        vec![box_address, box_address, sphere_address]
    );
    assert_eq!(
        descs.iter().map(|d| d.hit_group_offset()).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(descs.iter().all(|d| d.mask() == 1));
    assert_eq!(descs[0].transform[3], -1.5);
    assert_eq!(descs[2].transform[11], 2.5);

    // No raw views are needed when addresses are usable directly.
    assert!(!state.views().iter().any(|v| matches!(v, ViewDesc::RawBuffer { .. })));
}

#[test]
fn fallback_instances_reference_wrapped_pointers() {
    let device = MockDevice::new(MockConfig::fallback_only());
    let renderer = common::initialize(&device).unwrap();
    let structures = renderer.acceleration_structures();

    let state = device.state();
    let raw_views = state
        .events
        .iter()
        .filter_map(|e| match e {
            Event::View(ViewDesc::RawBuffer { buffer, num_elements }, index) => {
                Some((*buffer, *num_elements, *index))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(raw_views.len(), 3, "two bottom levels and the top level");

    let view_of = |id| raw_views.iter().find(|(buffer, ..)| *buffer == id).unwrap();
    for structure in structures.bottoms.iter().chain(Some(&structures.top)) {
        let (_, num_elements, _) = view_of(structure.buffer.id());
        assert_eq!(*num_elements as u64, structure.size / 4);
    }

    let descs = instance_descs(state.retired_named("instance descs").unwrap());
    let box_index = view_of(structures.bottoms[0].buffer.id()).2;
    let sphere_index = view_of(structures.bottoms[1].buffer.id()).2;
    assert_eq!(
        descs.iter().map(|d| d.acceleration_structure).collect::<Vec<_>>(),
        vec![
            WrappedGpuPointer::emulated(box_index, 0).0,
            WrappedGpuPointer::emulated(box_index, 0).0,
            WrappedGpuPointer::emulated(sphere_index, 0).0,
        ]
    );
}

#[test]
fn fallback_on_native_driver_uses_plain_addresses() {
    let device = MockDevice::new(MockConfig {
        fallback_uses_driver: true,
        ..MockConfig::fallback_only()
    });
    let renderer = common::initialize(&device).unwrap();
    let structures = renderer.acceleration_structures();

    let state = device.state();
    assert!(!state.views().iter().any(|v| matches!(v, ViewDesc::RawBuffer { .. })));
    let descs = instance_descs(state.retired_named("instance descs").unwrap());
    assert_eq!(
        descs[2].acceleration_structure,
        structures.bottoms[1].buffer.gpu_address()
    );
}

#[test]
fn zero_prebuild_size_fails_before_any_build() {
    let device = MockDevice::new(MockConfig {
        zero_prebuild: true,
        ..Default::default()
    });

    let err = common::initialize(&device).err().unwrap();
    assert!(matches!(err, Error::SizingFailed(_)), "{err}");

    let state = device.state();
    assert!(state.submissions().is_empty());
    assert!(!state
        .events
        .iter()
        .any(|e| matches!(e, Event::Created(name) if name.contains("level"))));
    assert_eq!(state.live_resources(), 0);
}

#[test]
fn failed_result_allocation_releases_everything() {
    let device = MockDevice::new(MockConfig {
        fail_buffer: Some("top level"),
        ..Default::default()
    });

    let err = common::initialize(&device).err().unwrap();
    assert!(
        matches!(&err, Error::ResourceCreationFailed { what, .. } if what == "top level"),
        "{err}"
    );
    assert_eq!(device.state().live_resources(), 0);
}

#[test]
fn hung_build_reports_device_lost() {
    let device = MockDevice::new(MockConfig {
        fence_hangs: true,
        ..Default::default()
    });

    let err = common::initialize(&device).err().unwrap();
    assert!(matches!(err, Error::DeviceLost { expected: 1, .. }), "{err}");
}
