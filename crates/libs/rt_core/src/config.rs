use std::time::Duration;

use crate::gpu::BuildPreference;

/// Knobs of a [`Renderer`](crate::Renderer). Everything has a sensible default.
#[derive(Debug, Clone, Copy)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    /// Capacity of every descriptor heap category.
    pub descriptor_heap_capacity: u32,
    pub max_trace_recursion_depth: u32,
    /// Ray payload, a float4 color.
    pub max_payload_size: u32,
    /// Intersection attributes, float2 barycentrics.
    pub max_attribute_size: u32,
    /// Bound on every fence wait. `None` waits forever.
    pub fence_timeout: Option<Duration>,
    pub instance_mask: u8,
    pub build_preference: BuildPreference,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            descriptor_heap_capacity: 100,
            max_trace_recursion_depth: 2,
            max_payload_size: 16,
            max_attribute_size: 8,
            fence_timeout: Some(Duration::from_secs(5)),
            instance_mask: 1,
            build_preference: BuildPreference::PreferFastTrace,
        }
    }
}

impl RendererConfig {
    pub fn with_resolution(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self
        }
    }

    pub fn with_fence_timeout(self, fence_timeout: Option<Duration>) -> Self {
        Self {
            fence_timeout,
            ..self
        }
    }
}
