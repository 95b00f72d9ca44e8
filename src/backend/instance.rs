// Vulkan Instance - loader entry, instance, validation and debug messages
//
// Responsibilities:
// - Load the Vulkan library and create the instance
// - Check requested validation layers against what the loader offers
// - Route driver debug messages into the engine Logger

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use crate::logging::{Logger, Severity};
use crate::{ENGINE_NAME, ENGINE_VERSION_MAJOR, ENGINE_VERSION_MINOR, ENGINE_VERSION_PATCH};

/// Validation layer settings, handed in explicitly at initialization
#[derive(Debug, Clone, Default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub layer_names: Vec<String>,
}

struct DebugMessenger {
    loader: ash::extensions::ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
    // Read by the driver callback through p_user_data; must outlive `messenger`
    _user_data: Box<Arc<dyn Logger>>,
}

/// Loader entry + instance, destroyed together
pub struct VulkanInstance {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug: Option<DebugMessenger>,
    logger: Arc<dyn Logger>,
}

impl VulkanInstance {
    /// Create the instance with the extensions `display_handle` needs for
    /// presentation.
    pub fn new(
        app_name: &str,
        display_handle: RawDisplayHandle,
        validation: &ValidationConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let use_validation = validation.enabled && Self::check_validation_layers(&entry, validation, &*logger)?;

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new(ENGINE_NAME)?;
        let engine_version = vk::make_api_version(
            0,
            ENGINE_VERSION_MAJOR,
            ENGINE_VERSION_MINOR,
            ENGINE_VERSION_PATCH,
        );

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(engine_version)
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions for this window system")?
            .to_vec();
        if use_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_cstrings = if use_validation {
            validation
                .layer_names
                .iter()
                .map(|name| CString::new(name.as_str()))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        let layer_names: Vec<_> = layer_cstrings.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = match unsafe { entry.create_instance(&create_info, None) } {
            Ok(instance) => instance,
            Err(e) => {
                logger.rendering(
                    Severity::Fatal,
                    &format!("Failed to create Vulkan instance \"{}\": {:?}", app_name, e),
                );
                return Err(e).context("Failed to create Vulkan instance");
            }
        };

        let debug = if use_validation {
            match Self::setup_debug_messenger(&entry, &instance, logger.clone()) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            entry,
            instance,
            debug,
            logger,
        }))
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }

    /// Returns whether every requested layer is available. Missing layers
    /// disable validation for this run; they are not fatal.
    fn check_validation_layers(
        entry: &Entry,
        validation: &ValidationConfig,
        logger: &dyn Logger,
    ) -> Result<bool> {
        let properties = unsafe { entry.enumerate_instance_layer_properties() }
            .context("Failed to enumerate instance layers")?;

        let available: Vec<String> = properties
            .iter()
            .map(|layer| {
                unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        let missing = missing_layers(&validation.layer_names, &available);
        if missing.is_empty() {
            return Ok(true);
        }

        logger.rendering(
            Severity::Error,
            &format!(
                "Requested validation layers are not available: {}. Validation will be disabled.",
                missing.join(", ")
            ),
        );
        Ok(false)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        logger: Arc<dyn Logger>,
    ) -> Result<DebugMessenger> {
        let loader = ash::extensions::ext::DebugUtils::new(entry, instance);
        let user_data = Box::new(logger);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
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
            .pfn_user_callback(Some(debug_callback))
            .user_data(&*user_data as *const Arc<dyn Logger> as *mut c_void);

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(DebugMessenger {
            loader,
            messenger,
            _user_data: user_data,
        })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Requested layer names absent from `available`, in request order
pub fn missing_layers(requested: &[String], available: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|name| !available.contains(name))
        .cloned()
        .collect()
}

/// Driver message severity to engine severity
pub fn map_debug_severity(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Severity {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Severity::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Severity::Warning
    } else {
        Severity::Info
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_user_data.is_null() || p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }

    let logger = &*(p_user_data as *const Arc<dyn Logger>);
    let message = CStr::from_ptr((*p_callback_data).p_message);

    logger.rendering(
        map_debug_severity(message_severity),
        &format!("[Vulkan] {}", message.to_string_lossy()),
    );

    vk::FALSE
}
