use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use ash::{vk, Entry};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocatorDebugSettings,
};

use crate::{
    device::{Device, DeviceFeatures},
    instance::Instance,
    physical_device::PhysicalDevice,
    queue::{Queue, QueueFamily},
    ray_tracing::REQUIRED_EXTENSIONS,
    CommandBuffer, CommandPool, RayTracingContext, Version, VERSION_1_3,
};

/// Headless Vulkan device with a single compute queue.
pub struct Context {
    pub allocator: Arc<Mutex<Allocator>>,
    pub command_pool: CommandPool,
    pub ray_tracing: Option<Arc<RayTracingContext>>,
    pub queue: Queue,
    pub device: Arc<Device>,
    pub queue_family: QueueFamily,
    pub physical_device: PhysicalDevice,
    pub instance: Instance,
    _entry: Entry,
}

pub struct ContextBuilder<'a> {
    vulkan_version: Version,
    app_name: &'a str,
    validation: bool,
    with_raytracing_context: bool,
}

impl Default for ContextBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ContextBuilder<'a> {
    pub fn new() -> Self {
        Self {
            vulkan_version: VERSION_1_3,
            app_name: "",
            validation: false,
            with_raytracing_context: true,
        }
    }

    pub fn vulkan_version(self, vulkan_version: Version) -> Self {
        Self {
            vulkan_version,
            ..self
        }
    }

    pub fn app_name(self, app_name: &'a str) -> Self {
        Self { app_name, ..self }
    }

    pub fn validation(self, validation: bool) -> Self {
        Self { validation, ..self }
    }

    /// Requests native ray tracing. Devices without it are still accepted; the context then
    /// simply has no [`RayTracingContext`].
    pub fn with_raytracing_context(self, with_raytracing_context: bool) -> Self {
        Self {
            with_raytracing_context,
            ..self
        }
    }

    pub fn build(self) -> Result<Context> {
        Context::new(self)
    }
}

impl Context {
    fn new(
        ContextBuilder {
            vulkan_version,
            app_name,
            validation,
            with_raytracing_context,
        }: ContextBuilder,
    ) -> Result<Self> {
        // Vulkan instance
        let entry = Entry::linked();
        let mut instance = Instance::new(&entry, vulkan_version, app_name, validation)?;

        let physical_devices = instance.enumerate_physical_devices()?;
        let (physical_device, queue_family, ray_tracing_supported) =
            select_suitable_physical_device(physical_devices, with_raytracing_context)?;
        log::info!("Selected physical device: {:?}", physical_device.name);

        let with_ray_tracing = with_raytracing_context && ray_tracing_supported;
        if with_raytracing_context && !with_ray_tracing {
            log::warn!("{} does not support ray tracing pipelines", physical_device.name);
        }
        let (extensions, features) = if with_ray_tracing {
            (&REQUIRED_EXTENSIONS[..], DeviceFeatures::baseline().with_ray_tracing())
        } else {
            (&[][..], DeviceFeatures::baseline())
        };

        let device = Arc::new(Device::new(
            &instance,
            &physical_device,
            queue_family,
            extensions,
            &features,
        )?);
        let queue = device.get_queue(queue_family, 0);

        let ray_tracing = with_ray_tracing.then(|| {
            let ray_tracing = Arc::new(RayTracingContext::new(&instance, &physical_device, &device));
            log::debug!("Ray tracing pipeline properties {:#?}", ray_tracing.pipeline_properties);
            log::debug!(
                "Acceleration structure properties {:#?}",
                ray_tracing.acceleration_structure_properties
            );
            ray_tracing
        });

        let command_pool = CommandPool::new(
            device.clone(),
            ray_tracing.clone(),
            queue_family,
            Some(vk::CommandPoolCreateFlags::TRANSIENT),
        )?;

        // Gpu allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.inner.clone(),
            device: device.inner.clone(),
            physical_device: physical_device.inner,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: features.buffer_device_address,
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            command_pool,
            ray_tracing,
            queue,
            device,
            queue_family,
            physical_device,
            instance,
            _entry: entry,
        })
    }
}

/// Prefers a device with ray tracing when asked for, otherwise the first usable one.
fn select_suitable_physical_device(
    devices: &[PhysicalDevice],
    with_raytracing_context: bool,
) -> Result<(PhysicalDevice, QueueFamily, bool)> {
    log::debug!("Choosing Vulkan physical device");

    let baseline = DeviceFeatures::baseline();
    let ray_tracing = baseline.with_ray_tracing();
    let supports_ray_tracing = |device: &PhysicalDevice| {
        device.supports_extensions(&REQUIRED_EXTENSIONS)
            && device
                .supported_device_features
                .is_compatible_with(&ray_tracing)
    };

    let usable = devices
        .iter()
        .filter_map(|device| device.compute_queue_family().map(|family| (device, family)))
        .filter(|(device, _)| device.supported_device_features.is_compatible_with(&baseline))
        .collect::<Vec<_>>();

    let preferred = with_raytracing_context
        .then(|| usable.iter().find(|&&(device, _)| supports_ray_tracing(device)))
        .flatten()
        .or_else(|| usable.first())
        .ok_or_else(|| anyhow!("Could not find a suitable device"))?;

    let (device, family) = *preferred;
    Ok((device.clone(), family, supports_ray_tracing(device)))
}

impl Context {
    pub fn device_wait_idle(&self) -> Result<()> {
        unsafe { self.device.inner.device_wait_idle()? };

        Ok(())
    }

    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing.is_some()
    }

    pub fn device_name(&self) -> &str {
        &self.physical_device.name
    }

    /// Records `executor` into a transient command buffer, submits it and waits for the
    /// queue to drain.
    pub fn execute_one_time_commands<R, F: FnOnce(&CommandBuffer) -> R>(&self, executor: F) -> Result<R> {
        let command_buffer = self
            .command_pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        // Begin recording
        command_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        // Execute user function
        let executor_result = executor(&command_buffer);

        // End recording
        command_buffer.end()?;

        // Submit and wait
        let submitted = self
            .queue
            .submit(Some(&command_buffer), None)
            .and_then(|_| self.queue.wait_idle());

        // Free
        self.command_pool.free_command_buffer(&command_buffer);
        submitted?;

        Ok(executor_result)
    }
}
