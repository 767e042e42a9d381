use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use strum_macros::Display;

use crate::{
    gpu::{
        AccelerationStructureLevel, Barrier, BufferDesc, BufferPurpose, BuildDesc, BuildInputs,
        BuildPreference, CommandList, GpuBuffer, GpuRange, PrebuildInfo, RenderDevice, ResourceId,
        ResourceState,
    },
    AccelerationHandle, CapabilityBackend, DescriptorHeaps, Error, FrameSync, GeometryInstance, RendererConfig,
    Result, SceneGeometry,
};

/// Instance record consumed by a top level build. Same layout for both backends.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
    /// Instance id in the low 24 bits, mask in the high 8.
    pub instance_id_and_mask: u32,
    /// Hit group record offset in the low 24 bits, flags in the high 8.
    pub hit_group_offset_and_flags: u32,
    pub acceleration_structure: u64,
}

impl InstanceDesc {
    pub fn new(
        transform: &Mat4,
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: u8,
        acceleration_structure: AccelerationHandle,
    ) -> Self {
        let mut rows = [0.0; 12];
        rows.copy_from_slice(&transform.transpose().to_cols_array()[..12]);

        Self {
            transform: rows,
            instance_id_and_mask: pack_24_8(instance_id, mask),
            hit_group_offset_and_flags: pack_24_8(hit_group_offset, flags),
            acceleration_structure: acceleration_structure.to_bits(),
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & 0x00ff_ffff
    }
}

fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & 0x00ff_ffff) | (high_8 as u32) << 24
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BuildState {
    Idle,
    PrebuildSizing,
    ScratchAllocated,
    BottomBuilding,
    BottomBarrier,
    TopBuilding,
    Done,
}

pub struct AccelerationStructure<D: RenderDevice> {
    pub level: AccelerationStructureLevel,
    pub buffer: GpuBuffer<D>,
    pub size: u64,
    pub handle: AccelerationHandle,
}

/// One bottom level structure per mesh and the top level structure over all instances.
///
/// Released newest first: the top level before the bottom levels it references.
pub struct SceneAccelerationStructures<D: RenderDevice> {
    pub top: AccelerationStructure<D>,
    pub bottoms: Vec<AccelerationStructure<D>>,
}

impl<D: RenderDevice> Drop for SceneAccelerationStructures<D> {
    fn drop(&mut self) {
        // Fields drop after this, `top` first, then `bottoms` front to back.
        self.bottoms.reverse();
    }
}

pub struct AccelerationStructureBuilder<'a, D: RenderDevice> {
    device: &'a Arc<D>,
    backend: &'a Arc<dyn CapabilityBackend<D>>,
    preference: BuildPreference,
    instance_mask: u8,
    state: BuildState,
}

impl<'a, D: RenderDevice> AccelerationStructureBuilder<'a, D> {
    pub fn new(device: &'a Arc<D>, backend: &'a Arc<dyn CapabilityBackend<D>>, config: &RendererConfig) -> Self {
        Self {
            device,
            backend,
            preference: config.build_preference,
            instance_mask: config.instance_mask,
            state: BuildState::Idle,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    fn enter(&mut self, state: BuildState) {
        log::debug!("Acceleration structure build: {} -> {state}", self.state);
        self.state = state;
    }

    /// Builds every structure in a single submission and waits for it to retire.
    pub fn build(
        &mut self,
        geometry: &SceneGeometry<D>,
        instances: &[GeometryInstance],
        heaps: &mut DescriptorHeaps<D>,
        list: &mut D::CommandList,
        sync: &mut FrameSync<D>,
    ) -> Result<SceneAccelerationStructures<D>> {
        self.enter(BuildState::PrebuildSizing);

        let triangles = (0..geometry.ranges().len())
            .map(|mesh| {
                geometry
                    .triangles(mesh)
                    .map(|t| [t])
                    .ok_or_else(|| Error::InvalidScene(format!("mesh {mesh} has no geometry")))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(instance) = instances.iter().find(|i| i.bottom >= triangles.len()) {
            return Err(Error::InvalidScene(format!(
                "instance references mesh {} of {}",
                instance.bottom,
                triangles.len()
            )));
        }

        let bottom_sizes = triangles
            .iter()
            .map(|geometries| {
                self.backend
                    .prebuild_size(&BuildInputs::BottomLevel { geometries }, self.preference)
            })
            .collect::<Result<Vec<_>>>()?;
        let top_size = self.backend.prebuild_size(
            &BuildInputs::TopLevel {
                instance_count: instances.len() as _,
                instance_descs: 0,
            },
            self.preference,
        )?;

        let scratch_size = bottom_sizes
            .iter()
            .chain(std::iter::once(&top_size))
            .map(|info| info.scratch_size)
            .max()
            .unwrap_or_default()
            .max(1);
        let scratch = GpuBuffer::new(
            self.device,
            &BufferDesc::unordered_access(
                "acceleration structure scratch",
                scratch_size,
                BufferPurpose::Scratch,
                ResourceState::UnorderedAccess,
            ),
        )?;
        self.enter(BuildState::ScratchAllocated);

        let mut bottoms = Vec::with_capacity(bottom_sizes.len());
        for (mesh, info) in bottom_sizes.iter().enumerate() {
            bottoms.push(self.create_structure(
                &format!("bottom level {mesh}"),
                AccelerationStructureLevel::Bottom,
                info,
                heaps,
            )?);
        }
        let top = self.create_structure("top level", AccelerationStructureLevel::Top, &top_size, heaps)?;

        let descs = instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                InstanceDesc::new(
                    &instance.transform,
                    i as u32,
                    self.instance_mask,
                    instance.hit_group_index,
                    0,
                    bottoms[instance.bottom].handle,
                )
            })
            .collect::<Vec<_>>();
        let instance_buffer = GpuBuffer::with_data(
            self.device,
            "instance descs",
            BufferPurpose::InstanceDescs,
            bytemuck::cast_slice(&descs),
        )?;

        list.reset().map_err(Error::Submission)?;
        self.backend
            .bind_descriptor_heaps(list, &heaps.shader_visible());

        self.enter(BuildState::BottomBuilding);
        for ((geometries, structure), info) in triangles.iter().zip(&bottoms).zip(&bottom_sizes) {
            self.backend.build_acceleration_structure(
                list,
                &BuildDesc {
                    inputs: BuildInputs::BottomLevel { geometries },
                    preference: self.preference,
                    dest_buffer: structure.buffer.id(),
                    dest: dest_range(&structure.buffer, info),
                    scratch: scratch.range(),
                },
            )?;
        }

        // Builds may otherwise overlap or reorder their UAV accesses.
        self.enter(BuildState::BottomBarrier);
        let barriers = bottoms
            .iter()
            .map(|b| Barrier::Uav(ResourceId::Buffer(b.buffer.id())))
            .collect::<Vec<_>>();
        list.resource_barriers(&barriers);

        self.enter(BuildState::TopBuilding);
        self.backend.build_acceleration_structure(
            list,
            &BuildDesc {
                inputs: BuildInputs::TopLevel {
                    instance_count: instances.len() as _,
                    instance_descs: instance_buffer.gpu_address(),
                },
                preference: self.preference,
                dest_buffer: top.buffer.id(),
                dest: dest_range(&top.buffer, &top_size),
                scratch: scratch.range(),
            },
        )?;

        list.close().map_err(Error::Submission)?;
        self.device
            .execute_command_list(list)
            .map_err(Error::Submission)?;
        sync.signal()?;
        sync.wait_until_current()?;

        drop(instance_buffer);
        drop(scratch);
        self.enter(BuildState::Done);
        log::info!(
            "Built {} bottom level structures and a top level structure over {} instances",
            bottoms.len(),
            instances.len()
        );

        Ok(SceneAccelerationStructures { top, bottoms })
    }

    fn create_structure(
        &self,
        name: &str,
        level: AccelerationStructureLevel,
        info: &PrebuildInfo,
        heaps: &mut DescriptorHeaps<D>,
    ) -> Result<AccelerationStructure<D>> {
        let buffer = GpuBuffer::new(
            self.device,
            &BufferDesc::unordered_access(
                name,
                info.result_size,
                BufferPurpose::AccelerationStructure,
                self.backend.acceleration_structure_state(),
            ),
        )?;
        let handle = self.backend.acceleration_handle(&buffer, heaps)?;

        Ok(AccelerationStructure {
            level,
            size: info.result_size,
            buffer,
            handle,
        })
    }
}

fn dest_range<D: RenderDevice>(buffer: &GpuBuffer<D>, info: &PrebuildInfo) -> GpuRange {
    GpuRange {
        address: buffer.gpu_address(),
        size: info.result_size,
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;

    #[test]
    fn instance_desc_matches_driver_layout() {
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);
    }

    #[test]
    fn transform_is_stored_row_major() {
        let transform = Mat4::from_translation(Vec3::new(-1.5, 2.0, 3.0));
        let desc = InstanceDesc::new(
            &transform,
            0,
            1,
            0,
            0,
            AccelerationHandle::address(0x1000),
        );

        assert_eq!(
            desc.transform,
            [1.0, 0.0, 0.0, -1.5, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
        assert_eq!(desc.acceleration_structure, 0x1000);
    }

    #[test]
    fn ids_and_masks_share_a_dword() {
        let desc = InstanceDesc::new(
            &Mat4::IDENTITY,
            0x12_3456,
            0xAB,
            2,
            0x01,
            AccelerationHandle::address(0),
        );

        assert_eq!(desc.instance_id(), 0x12_3456);
        assert_eq!(desc.mask(), 0xAB);
        assert_eq!(desc.hit_group_offset(), 2);
        assert_eq!(desc.hit_group_offset_and_flags >> 24, 0x01);
    }

    #[test]
    fn oversized_ids_are_truncated_to_24_bits() {
        assert_eq!(pack_24_8(0x0100_0001, 0xff), 0xff00_0001);
    }
}
