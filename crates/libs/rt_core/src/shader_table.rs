use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::{
    gpu::{BufferPurpose, GpuBuffer, GpuRange, RenderDevice, StridedGpuRange},
    utils::compute_aligned_size,
    Error, GeometryInstance, Result,
};

/// Record stride granularity inside a table.
pub const SHADER_RECORD_ALIGNMENT: u64 = 32;
/// Start address granularity of a table.
pub const SHADER_TABLE_ALIGNMENT: u64 = 64;

/// Root arguments of a hit group record: what a shared hit shader needs to find and
/// shade its instance inside the shared geometry buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceConstants {
    pub orientation: [f32; 4],
    pub material_color: [f32; 4],
    pub vertex_offset: u32,
    pub index_offset: u32,
}

impl From<&GeometryInstance> for InstanceConstants {
    fn from(instance: &GeometryInstance) -> Self {
        let (_, rotation, _) = instance.transform.to_scale_rotation_translation();

        Self {
            orientation: rotation.to_array(),
            material_color: instance.material_color.to_array(),
            vertex_offset: instance.vertex_offset,
            index_offset: instance.index_offset,
        }
    }
}

/// Lays out `[identifier][root arguments][zero padding]` records of a common stride.
///
/// `root_args` holds `count` equally sized chunks, or is empty when records carry none.
/// Returns the packed bytes and the stride.
pub fn pack_records(
    table: &'static str,
    identifiers: &[&[u8]],
    root_args: &[u8],
    count: usize,
) -> Result<(Vec<u8>, u64)> {
    let fail = |reason: String| Error::TableBuildFailed { table, reason };

    if count == 0 {
        return Err(fail("no records".to_owned()));
    }
    if identifiers.len() != count {
        return Err(fail(format!("{} identifiers for {count} records", identifiers.len())));
    }
    if root_args.len() % count != 0 {
        return Err(fail(format!(
            "{} bytes of root arguments do not split into {count} records",
            root_args.len()
        )));
    }

    let identifier_size = identifiers[0].len();
    if identifier_size == 0 || identifiers.iter().any(|id| id.len() != identifier_size) {
        return Err(fail("identifiers differ in size".to_owned()));
    }

    let args_size = root_args.len() / count;
    let stride = compute_aligned_size((identifier_size + args_size) as u64, SHADER_RECORD_ALIGNMENT);

    let mut data = vec![0u8; stride as usize * count];
    for (i, record) in data.chunks_exact_mut(stride as usize).enumerate() {
        record[..identifier_size].copy_from_slice(identifiers[i]);
        if args_size > 0 {
            record[identifier_size..identifier_size + args_size]
                .copy_from_slice(&root_args[i * args_size..(i + 1) * args_size]);
        }
    }

    Ok((data, stride))
}

/// A write-once table of same-stride records in an upload buffer.
pub struct ShaderTable<D: RenderDevice> {
    buffer: GpuBuffer<D>,
    stride: u64,
    record_count: usize,
}

impl<D: RenderDevice> ShaderTable<D> {
    pub fn buffer(&self) -> &GpuBuffer<D> {
        &self.buffer
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn range(&self) -> GpuRange {
        GpuRange {
            address: self.buffer.gpu_address(),
            size: self.stride * self.record_count as u64,
        }
    }

    pub fn strided_range(&self) -> StridedGpuRange {
        StridedGpuRange {
            address: self.buffer.gpu_address(),
            size: self.stride * self.record_count as u64,
            stride: self.stride,
        }
    }

    /// Reads back the bytes of one record.
    pub fn record(&self, index: usize) -> anyhow::Result<Vec<u8>> {
        let mut bytes = vec![0; self.stride as usize];
        self.buffer.read(index as u64 * self.stride, &mut bytes)?;
        Ok(bytes)
    }
}

pub struct ShaderTableBuilder<D: RenderDevice> {
    device: Arc<D>,
}

impl<D: RenderDevice> ShaderTableBuilder<D> {
    pub fn new(device: &Arc<D>) -> Self {
        Self {
            device: device.clone(),
        }
    }

    pub fn build_table(
        &self,
        table: &'static str,
        identifiers: &[&[u8]],
        root_args: &[u8],
        count: usize,
    ) -> Result<ShaderTable<D>> {
        let (data, stride) = pack_records(table, identifiers, root_args, count)?;

        let name = format!("{table} shader table");
        let buffer = GpuBuffer::with_data(&self.device, &name, BufferPurpose::ShaderTable, &data)?;
        if buffer.gpu_address() % SHADER_TABLE_ALIGNMENT != 0 {
            return Err(Error::TableBuildFailed {
                table,
                reason: format!("table address {:#x} is misaligned", buffer.gpu_address()),
            });
        }
        log::debug!("Built {name}: {count} records, stride {stride}");

        Ok(ShaderTable {
            buffer,
            stride,
            record_count: count,
        })
    }
}

/// The three tables a dispatch reads. Fields are declared in reverse build order so
/// they drop newest first.
pub struct ShaderTables<D: RenderDevice> {
    pub hit_group: ShaderTable<D>,
    pub miss: ShaderTable<D>,
    pub raygen: ShaderTable<D>,
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3, Vec4};

    use super::*;
    use crate::HitGroup;

    #[test]
    fn instance_constants_are_ten_dwords() {
        assert_eq!(std::mem::size_of::<InstanceConstants>(), 40);
    }

    #[test]
    fn single_record_without_arguments_pads_to_alignment() {
        let id = [7u8; 32];
        let (data, stride) = pack_records("raygen", &[&id], &[], 1).unwrap();
        assert_eq!(stride, 32);
        assert_eq!(data, id.to_vec());

        let short = [1u8; 20];
        let (data, stride) = pack_records("miss", &[&short], &[], 1).unwrap();
        assert_eq!(stride, 32);
        assert_eq!(&data[..20], &short);
        assert!(data[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn hit_group_records_hold_identifier_then_arguments() {
        let ids = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let args = (0..3)
            .map(|i| InstanceConstants {
                vertex_offset: i,
                index_offset: i * 10,
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let arg_bytes = bytemuck::cast_slice::<_, u8>(&args);

        let (data, stride) = pack_records(
            "hit group",
            &[&ids[0], &ids[1], &ids[2]],
            arg_bytes,
            3,
        )
        .unwrap();

        assert_eq!(stride, 96);
        assert_eq!(data.len(), 3 * 96);
        for (i, record) in data.chunks_exact(96).enumerate() {
            assert_eq!(&record[..32], &ids[i]);
            assert_eq!(&record[32..72], bytemuck::bytes_of(&args[i]));
            assert!(record[72..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn stride_is_aligned_and_covers_identifier() {
        for id_size in [8usize, 16, 32, 33, 64] {
            for args_size in [0usize, 4, 40] {
                let id = vec![0xAB; id_size];
                let args = vec![0xCD; args_size];
                let (_, stride) = pack_records("test", &[id.as_slice()], &args, 1).unwrap();
                assert_eq!(stride % SHADER_RECORD_ALIGNMENT, 0);
                assert!(stride >= (id_size + args_size) as u64);
            }
        }
    }

    #[test]
    fn mismatched_inputs_fail() {
        let id = [0u8; 32];
        assert!(matches!(
            pack_records("hit group", &[&id], &[0; 40], 2),
            Err(Error::TableBuildFailed { table: "hit group", .. })
        ));
        assert!(pack_records("hit group", &[&id, &id], &[0; 41], 2).is_err());
        assert!(pack_records("hit group", &[], &[], 0).is_err());
        assert!(pack_records("hit group", &[&id, &[0u8; 16]], &[], 2).is_err());
    }

    #[test]
    fn constants_take_rotation_of_the_transform() {
        let instance = GeometryInstance {
            vertex_offset: 24,
            index_offset: 36,
            vertex_count: 242,
            index_count: 1440,
            transform: Mat4::from_translation(Vec3::new(1.5, 0.0, 0.0))
                * Mat4::from_rotation_y(45f32.to_radians()),
            material_color: Vec4::new(1.0, 1.0, 0.0, 1.0),
            bottom: 1,
            hit_group: HitGroup::Lambert,
            hit_group_index: 1,
        };

        let constants = InstanceConstants::from(&instance);
        let expected = glam::Quat::from_rotation_y(45f32.to_radians());
        let actual = glam::Quat::from_array(constants.orientation);
        assert!(actual.abs_diff_eq(expected, 1e-5) || actual.abs_diff_eq(-expected, 1e-5));
        assert_eq!(constants.material_color, [1.0, 1.0, 0.0, 1.0]);
        assert_eq!((constants.vertex_offset, constants.index_offset), (24, 36));
    }
}
