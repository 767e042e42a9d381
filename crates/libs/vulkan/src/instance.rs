use std::ffi::{c_void, CStr, CString};

use anyhow::Result;
use ash::{extensions::ext::DebugUtils, vk, Entry, Instance as AshInstance};

use crate::{physical_device::PhysicalDevice, Version};

const VALIDATION: &str = "VK_LAYER_KHRONOS_validation";

struct DebugMessenger {
    debug_utils: DebugUtils,
    inner: vk::DebugUtilsMessengerEXT,
}

pub struct Instance {
    pub(crate) inner: AshInstance,
    debug_messenger: Option<DebugMessenger>,
    physical_devices: Vec<PhysicalDevice>,
}

impl Instance {
    pub(crate) fn new(entry: &Entry, api_version: Version, app_name: &str, validation: bool) -> Result<Self> {
        let app_name = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name.as_c_str())
            .api_version(api_version.make_api_version());

        let validation = validation && has_layer(entry, VALIDATION)?;
        let mut extension_names = vec![];
        let mut enabled_layer_names = vec![];
        let layer_name = CString::new(VALIDATION)?;
        if validation {
            extension_names.push(DebugUtils::name().as_ptr());
            enabled_layer_names.push(layer_name.as_ptr());
        }

        let instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&enabled_layer_names);

        let inner = unsafe { entry.create_instance(&instance_create_info, None)? };

        let debug_messenger = if validation {
            let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .flags(vk::DebugUtilsMessengerCreateFlagsEXT::empty())
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let debug_utils = DebugUtils::new(entry, &inner);
            let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
            Some(DebugMessenger {
                debug_utils,
                inner: messenger,
            })
        } else {
            None
        };

        Ok(Self {
            inner,
            debug_messenger,
            physical_devices: vec![],
        })
    }

    pub(crate) fn enumerate_physical_devices(&mut self) -> Result<&[PhysicalDevice]> {
        if self.physical_devices.is_empty() {
            let physical_devices = unsafe { self.inner.enumerate_physical_devices()? };

            let mut physical_devices = physical_devices
                .into_iter()
                .map(|pd| PhysicalDevice::new(&self.inner, pd))
                .collect::<Result<Vec<_>>>()?;

            physical_devices.sort_by_key(|pd| match pd.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                _ => 2,
            });

            self.physical_devices = physical_devices;
        }

        Ok(&self.physical_devices)
    }
}

fn has_layer(entry: &Entry, name: &str) -> Result<bool> {
    let layers = entry.enumerate_instance_layer_properties()?;
    let found = layers
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }.to_string_lossy() == name);
    if !found {
        log::warn!("{name} requested but not installed, continuing without it");
    }

    Ok(found)
}

unsafe extern "system" fn vulkan_debug_callback(
    flag: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Flag;

    let message = CStr::from_ptr((*p_callback_data).p_message);
    match flag {
        Flag::VERBOSE => log::debug!("{:?} - {:?}", typ, message),
        Flag::INFO => log::info!("{:?} - {:?}", typ, message),
        Flag::WARNING => log::warn!("{:?} - {:?}", typ, message),
        _ => log::error!("{:?} - {:?}", typ, message),
    }
    vk::FALSE
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(messenger) = self.debug_messenger.take() {
                messenger
                    .debug_utils
                    .destroy_debug_utils_messenger(messenger.inner, None);
            }
            self.inner.destroy_instance(None);
        }
    }
}
