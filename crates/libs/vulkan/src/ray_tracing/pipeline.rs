use std::{collections::HashMap, ffi::CString, sync::Arc};

use anyhow::{anyhow, Result};
use ash::vk;
use rt_core::{HitGroupDesc, PipelineStateDesc, ShaderStage};

use crate::{device::Device, PipelineLayout, RayTracingContext, ShaderModule};

pub struct RayTracingPipeline {
    device: Arc<Device>,
    pub(crate) inner: vk::Pipeline,
    handles: HashMap<String, Vec<u8>>,
}

/// Stage index of every exported shader, in the order they were added.
#[derive(Default)]
struct Stages {
    modules: Vec<ShaderModule>,
    entry_points: Vec<CString>,
    flags: Vec<vk::ShaderStageFlags>,
    module_of: Vec<usize>,
    index_of: HashMap<String, u32>,
    general: Vec<String>,
}

impl Stages {
    fn index(&self, export: &Option<String>) -> Result<u32> {
        match export {
            None => Ok(vk::SHADER_UNUSED_KHR),
            Some(name) => self
                .index_of
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("No shader exported as {name}")),
        }
    }
}

fn stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
    }
}

/// SPIR-V compiled from GLSL names its single entry point `main`; libraries exporting
/// several shaders keep one entry point per export.
fn entry_point(export: &str, library_exports: usize) -> &str {
    if library_exports == 1 {
        "main"
    } else {
        export
    }
}

fn hit_group_type(group: &HitGroupDesc) -> vk::RayTracingShaderGroupTypeKHR {
    if group.intersection.is_some() {
        vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
    } else {
        vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
    }
}

impl RayTracingPipeline {
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing: &RayTracingContext,
        layout: &PipelineLayout,
        desc: &PipelineStateDesc,
    ) -> Result<Self> {
        let mut stages = Stages::default();
        for library in desc.libraries() {
            let module = ShaderModule::from_bytes(device.clone(), &library.bytecode)?;
            stages.modules.push(module);

            for export in &library.exports {
                let index = stages.flags.len() as u32;
                stages
                    .entry_points
                    .push(CString::new(entry_point(&export.name, library.exports.len()))?);
                stages.flags.push(stage_flags(export.stage));
                stages.module_of.push(stages.modules.len() - 1);
                stages.index_of.insert(export.name.clone(), index);
                if matches!(export.stage, ShaderStage::RayGeneration | ShaderStage::Miss) {
                    stages.general.push(export.name.clone());
                }
            }
        }

        let stage_infos = (0..stages.flags.len())
            .map(|i| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stages.flags[i])
                    .module(stages.modules[stages.module_of[i]].inner)
                    .name(&stages.entry_points[i])
                    .build()
            })
            .collect::<Vec<_>>();

        let mut group_names = vec![];
        let mut groups = vec![];
        for name in &stages.general {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(stages.index(&Some(name.clone()))?)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build(),
            );
            group_names.push(name.clone());
        }
        for group in desc.hit_groups() {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(hit_group_type(group))
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(stages.index(&group.closest_hit)?)
                    .any_hit_shader(stages.index(&group.any_hit)?)
                    .intersection_shader(stages.index(&group.intersection)?)
                    .build(),
            );
            group_names.push(group.export.clone());
        }

        // Payload and attribute sizes are implied by the SPIR-V itself.
        let max_depth = ray_tracing.pipeline_properties.max_ray_recursion_depth;
        let recursion_depth = desc.max_trace_recursion_depth().min(max_depth);
        if recursion_depth < desc.max_trace_recursion_depth() {
            log::warn!(
                "Trace recursion depth {} clamped to device limit {max_depth}",
                desc.max_trace_recursion_depth()
            );
        }

        let pipe_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .layout(layout.inner)
            .stages(&stage_infos)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(recursion_depth);

        let inner = unsafe {
            ray_tracing.pipeline_fn.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipe_info),
                None,
            )?
        }
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Driver returned no ray tracing pipeline"))?;

        // Owns the handle from here, so a failed handle query still destroys it.
        let mut pipeline = Self {
            device,
            inner,
            handles: HashMap::new(),
        };

        let handle_size = ray_tracing.shader_group_handle_size() as usize;
        let data = unsafe {
            ray_tracing.pipeline_fn.get_ray_tracing_shader_group_handles(
                pipeline.inner,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )?
        };
        pipeline.handles = group_names
            .into_iter()
            .zip(data.chunks_exact(handle_size))
            .map(|(name, handle)| (name, handle.to_vec()))
            .collect();
        log::debug!("Created ray tracing pipeline with {} shader groups", groups.len());

        Ok(pipeline)
    }

    /// Handle of a general shader or hit group, `None` if nothing is exported under `export`.
    pub fn shader_handle(&self, export: &str) -> Option<&[u8]> {
        self.handles.get(export).map(Vec::as_slice)
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline(self.inner, None) };
    }
}
