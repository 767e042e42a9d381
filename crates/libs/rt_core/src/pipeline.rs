use std::sync::Arc;

use anyhow::anyhow;

use crate::{
    gpu::{RenderDevice, RootSignatureId, StateObjectId},
    CapabilityBackend, Error, InstanceConstants, RendererConfig, Result,
};

pub const RAY_GENERATOR: &str = "RayGenerator";
pub const CLOSEST_HIT_LAMBERT: &str = "ClosestHitProcessorLambert";
pub const CLOSEST_HIT_HALF_LAMBERT: &str = "ClosestHitProcessorHalfLambert";
pub const MISS: &str = "MissProcessor";
pub const HIT_GROUP_LAMBERT: &str = "HitGroup0";
pub const HIT_GROUP_HALF_LAMBERT: &str = "HitGroup1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorRangeKind {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub count: u32,
    pub base_register: u32,
    pub space: u32,
}

impl DescriptorRange {
    pub fn single(kind: DescriptorRangeKind, base_register: u32) -> Self {
        Self {
            kind,
            count: 1,
            base_register,
            space: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootParameter {
    DescriptorTable(DescriptorRange),
    ShaderResourceView { register: u32, space: u32 },
    Constants { register: u32, space: u32, num_32bit_values: u32 },
}

/// Slots of the global root signature shared by every ray tracing shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GlobalRootParameter {
    /// u0, output image.
    Output = 0,
    /// t0, top-level acceleration structure.
    Scene = 1,
    /// t1, shared index buffer.
    Indices = 2,
    /// t2, shared vertex buffer.
    Vertices = 3,
    /// b0, scene constants.
    SceneConstants = 4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub local: bool,
}

impl RootSignatureDesc {
    pub fn global_scene() -> Self {
        use DescriptorRangeKind::*;

        Self {
            parameters: vec![
                RootParameter::DescriptorTable(DescriptorRange::single(Uav, 0)),
                RootParameter::ShaderResourceView { register: 0, space: 0 },
                RootParameter::DescriptorTable(DescriptorRange::single(Srv, 1)),
                RootParameter::DescriptorTable(DescriptorRange::single(Srv, 2)),
                RootParameter::DescriptorTable(DescriptorRange::single(Cbv, 0)),
            ],
            local: false,
        }
    }

    pub fn empty_local() -> Self {
        Self {
            parameters: vec![],
            local: true,
        }
    }

    /// Per-instance constants at b1, read from the hit group's shader record.
    pub fn instance_constants_local() -> Self {
        Self {
            parameters: vec![RootParameter::Constants {
                register: 1,
                space: 0,
                num_32bit_values: (std::mem::size_of::<InstanceConstants>() / 4) as u32,
            }],
            local: true,
        }
    }

    /// Bytes a shader record needs for this signature's root arguments.
    pub fn root_arguments_size(&self) -> u64 {
        self.parameters
            .iter()
            .map(|p| match p {
                RootParameter::Constants {
                    num_32bit_values, ..
                } => *num_32bit_values as u64 * 4,
                _ => 8,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderExport {
    pub name: String,
    pub stage: ShaderStage,
}

impl ShaderExport {
    pub fn new(name: &str, stage: ShaderStage) -> Self {
        Self {
            name: name.to_owned(),
            stage,
        }
    }
}

/// Compiled shader code with the entry points it exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLibrary {
    pub bytecode: Vec<u8>,
    pub exports: Vec<ShaderExport>,
}

impl ShaderLibrary {
    pub fn new(bytecode: Vec<u8>, exports: Vec<ShaderExport>) -> Self {
        Self { bytecode, exports }
    }

    pub fn single(bytecode: Vec<u8>, name: &str, stage: ShaderStage) -> Self {
        Self::new(bytecode, vec![ShaderExport::new(name, stage)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitGroupDesc {
    pub export: String,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
    pub intersection: Option<String>,
}

impl HitGroupDesc {
    pub fn triangles(export: &str, closest_hit: &str) -> Self {
        Self {
            export: export.to_owned(),
            closest_hit: Some(closest_hit.to_owned()),
            any_hit: None,
            intersection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subobject {
    ShaderLibrary(ShaderLibrary),
    HitGroup(HitGroupDesc),
    ShaderConfig {
        max_payload_size: u32,
        max_attribute_size: u32,
    },
    LocalRootSignature(RootSignatureId),
    /// Associates the subobject at `subobject` with the named exports.
    ExportAssociation {
        subobject: usize,
        exports: Vec<String>,
    },
    GlobalRootSignature(RootSignatureId),
    PipelineConfig {
        max_trace_recursion_depth: u32,
    },
}

/// The subobject graph a ray tracing state object is compiled from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStateDesc {
    pub subobjects: Vec<Subobject>,
}

impl PipelineStateDesc {
    /// Appends a subobject and returns its index for later associations.
    pub fn push(&mut self, subobject: Subobject) -> usize {
        self.subobjects.push(subobject);
        self.subobjects.len() - 1
    }

    pub fn libraries(&self) -> impl Iterator<Item = &ShaderLibrary> {
        self.subobjects.iter().filter_map(|s| match s {
            Subobject::ShaderLibrary(library) => Some(library),
            _ => None,
        })
    }

    pub fn hit_groups(&self) -> impl Iterator<Item = &HitGroupDesc> {
        self.subobjects.iter().filter_map(|s| match s {
            Subobject::HitGroup(group) => Some(group),
            _ => None,
        })
    }

    pub fn global_root_signature(&self) -> Option<RootSignatureId> {
        self.subobjects.iter().find_map(|s| match s {
            Subobject::GlobalRootSignature(id) => Some(*id),
            _ => None,
        })
    }

    pub fn max_trace_recursion_depth(&self) -> u32 {
        self.subobjects
            .iter()
            .find_map(|s| match s {
                Subobject::PipelineConfig {
                    max_trace_recursion_depth,
                } => Some(*max_trace_recursion_depth),
                _ => None,
            })
            .unwrap_or(1)
    }

    pub fn local_root_signature_for(&self, export: &str) -> Option<RootSignatureId> {
        self.subobjects.iter().find_map(|s| match s {
            Subobject::ExportAssociation { subobject, exports } if exports.iter().any(|e| e == export) => {
                match self.subobjects.get(*subobject) {
                    Some(Subobject::LocalRootSignature(id)) => Some(*id),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Whether a shader or hit group is exported under `name`.
    pub fn exports(&self, name: &str) -> bool {
        self.libraries()
            .flat_map(|l| l.exports.iter())
            .any(|e| e.name == name)
            || self.hit_groups().any(|g| g.export == name)
    }

    /// Checks the graph is self-consistent before handing it to a driver.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.libraries().next().is_none() {
            return Err(anyhow!("Pipeline has no shader library"));
        }
        if self.global_root_signature().is_none() {
            return Err(anyhow!("Pipeline has no global root signature"));
        }

        for group in self.hit_groups() {
            for shader in [&group.closest_hit, &group.any_hit, &group.intersection]
                .into_iter()
                .flatten()
            {
                if !self.exports(shader) {
                    return Err(anyhow!(
                        "Hit group {} references missing shader {shader}",
                        group.export
                    ));
                }
            }
        }

        for subobject in &self.subobjects {
            if let Subobject::ExportAssociation { subobject, exports } = subobject {
                match self.subobjects.get(*subobject) {
                    Some(Subobject::LocalRootSignature(_)) => {}
                    _ => return Err(anyhow!("Association target {subobject} is not a local root signature")),
                }
                if let Some(missing) = exports.iter().find(|e| !self.exports(e)) {
                    return Err(anyhow!("Association references missing export {missing}"));
                }
            }
        }

        Ok(())
    }
}

/// Root signatures created so far, destroyed newest first. Releases a partially built
/// pipeline when creation fails midway.
struct RootSignatures<D: RenderDevice> {
    backend: Arc<dyn CapabilityBackend<D>>,
    created: Vec<RootSignatureId>,
}

impl<D: RenderDevice> RootSignatures<D> {
    fn create(&mut self, desc: &RootSignatureDesc) -> Result<RootSignatureId> {
        let root_signature = self.backend.create_root_signature(desc)?;
        self.created.push(root_signature);
        Ok(root_signature)
    }
}

impl<D: RenderDevice> Drop for RootSignatures<D> {
    fn drop(&mut self) {
        for root_signature in self.created.drain(..).rev() {
            self.backend.destroy_root_signature(root_signature);
        }
    }
}

/// Root signatures and the compiled state object. Destroyed through the backend on drop.
pub struct PipelineResources<D: RenderDevice> {
    global_root_signature: RootSignatureId,
    state_object: StateObjectId,
    hit_group_local: RootSignatureDesc,
    root_signatures: RootSignatures<D>,
}

impl<D: RenderDevice> PipelineResources<D> {
    pub fn new(
        backend: &Arc<dyn CapabilityBackend<D>>,
        libraries: Vec<ShaderLibrary>,
        config: &RendererConfig,
    ) -> Result<Self> {
        let mut root_signatures = RootSignatures {
            backend: backend.clone(),
            created: Vec::new(),
        };
        let hit_group_local_desc = RootSignatureDesc::instance_constants_local();

        let global = root_signatures.create(&RootSignatureDesc::global_scene())?;
        let empty_local = root_signatures.create(&RootSignatureDesc::empty_local())?;
        let hit_group_local = root_signatures.create(&hit_group_local_desc)?;

        let mut desc = PipelineStateDesc::default();
        for library in libraries {
            desc.push(Subobject::ShaderLibrary(library));
        }
        desc.push(Subobject::HitGroup(HitGroupDesc::triangles(
            HIT_GROUP_LAMBERT,
            CLOSEST_HIT_LAMBERT,
        )));
        desc.push(Subobject::HitGroup(HitGroupDesc::triangles(
            HIT_GROUP_HALF_LAMBERT,
            CLOSEST_HIT_HALF_LAMBERT,
        )));
        desc.push(Subobject::ShaderConfig {
            max_payload_size: config.max_payload_size,
            max_attribute_size: config.max_attribute_size,
        });
        let index = desc.push(Subobject::LocalRootSignature(empty_local));
        desc.push(Subobject::ExportAssociation {
            subobject: index,
            exports: vec![RAY_GENERATOR.to_owned(), MISS.to_owned()],
        });
        let index = desc.push(Subobject::LocalRootSignature(hit_group_local));
        desc.push(Subobject::ExportAssociation {
            subobject: index,
            exports: vec![HIT_GROUP_LAMBERT.to_owned(), HIT_GROUP_HALF_LAMBERT.to_owned()],
        });
        desc.push(Subobject::GlobalRootSignature(global));
        desc.push(Subobject::PipelineConfig {
            max_trace_recursion_depth: config.max_trace_recursion_depth,
        });

        desc.validate().map_err(Error::PipelineCreationFailed)?;
        let state_object = backend.create_pipeline_state(&desc)?;
        log::info!("Created ray tracing pipeline with {} subobjects", desc.subobjects.len());

        Ok(Self {
            global_root_signature: global,
            state_object,
            hit_group_local: hit_group_local_desc,
            root_signatures,
        })
    }

    pub fn global_root_signature(&self) -> RootSignatureId {
        self.global_root_signature
    }

    pub fn state_object(&self) -> StateObjectId {
        self.state_object
    }

    /// Size of the root arguments carried by every hit group record.
    pub fn hit_group_arguments_size(&self) -> u64 {
        self.hit_group_local.root_arguments_size()
    }
}

impl<D: RenderDevice> Drop for PipelineResources<D> {
    fn drop(&mut self) {
        // Root signatures follow when the fields drop.
        self.root_signatures
            .backend
            .destroy_pipeline_state(self.state_object);
    }
}
