//! Vulkan instance creation.

use crate::error::{Result, RhiError};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr, CString};

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Keep the `requested` layers the loader reports in `available`.
pub fn available_layers_of(
    requested: Vec<&'static CStr>,
    available: &[vk::LayerProperties],
) -> Vec<&'static CStr> {
    requested
        .into_iter()
        .filter(|layer| {
            let found = available.iter().any(|props| {
                // SAFETY: the loader writes a NUL-terminated name
                let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
                name == *layer
            });
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect()
}

/// Instance extensions needed to present to the given display.
pub fn required_instance_extensions(
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<Vec<*const std::ffi::c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display)?.to_vec();

    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    }

    Ok(extensions)
}

/// Create a Vulkan instance.
///
/// Missing validation layers are logged and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| RhiError::InvalidState(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Creation")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names = required_instance_extensions(display, enable_validation)?;

    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers = if enable_validation {
        available_layers_of(validation_layers(), &available_layers)
    } else {
        vec![]
    };
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };

    Ok(instance)
}

/// Routes validation-layer messages into `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install the messenger.
    ///
    /// # Safety
    /// The instance must have been created with the debug-utils extension.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };

        Ok(Self { loader, messenger })
    }

    /// Destroy the messenger.
    ///
    /// # Safety
    /// Must be called before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the layer passes either null or a valid callback struct
    let message = unsafe {
        data.as_ref()
            .filter(|d| !d.p_message.is_null())
            .map(|d| CStr::from_ptr(d.p_message).to_string_lossy())
    };
    let message = message.unwrap_or_default();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{message_type:?}: {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{message_type:?}: {message}");
    } else {
        tracing::debug!(target: "vulkan", "{message_type:?}: {message}");
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &CStr) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.to_bytes_with_nul()) {
            *dst = *src as std::ffi::c_char;
        }
        props
    }

    #[test]
    fn present_layers_are_kept() {
        let available = [layer(c"VK_LAYER_LUNARG_monitor"), layer(c"VK_LAYER_KHRONOS_validation")];
        assert_eq!(
            available_layers_of(validation_layers(), &available),
            vec![c"VK_LAYER_KHRONOS_validation"]
        );
    }

    #[test]
    fn missing_layers_are_skipped() {
        let available = [layer(c"VK_LAYER_KHRONOS_validation_extra")];
        assert!(available_layers_of(validation_layers(), &available).is_empty());
        assert!(available_layers_of(validation_layers(), &[]).is_empty());
    }
}
