use std::ffi::{c_char, c_void, CStr, CString};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use crate::renderer::error::{HriError, Result};

/// Creates a presentation surface once the instance exists, supplied by the windowing collaborator
pub type SurfaceCreateFunc = Box<dyn FnOnce(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR>>;

/// Loads Vulkan and keeps the instance plus its debug messenger alive
pub struct RenderInstance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
}

impl RenderInstance {
    const ENABLE_VALIDATION_LAYERS: bool = cfg!(debug_assertions);
    const REQUIRED_VALIDATION_LAYERS: &'static [&'static CStr] = &[
        c"VK_LAYER_KHRONOS_validation",
    ];

    pub fn new(
        app_name: &str,
        app_version: u32,
        extra_extensions: &[&'static CStr],
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let validation = Self::ENABLE_VALIDATION_LAYERS
            && Self::validation_layers_supported(&entry)?;
        if Self::ENABLE_VALIDATION_LAYERS && !validation {
            log::warn!("Validation layers requested but not available");
        }

        let instance = Self::create_instance(
            &entry,
            app_name,
            app_version,
            extra_extensions,
            validation,
        )?;

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = unsafe {
                loader.create_debug_utils_messenger(&debug_utils_messenger_create_info(), None)?
            };
            Some((messenger, loader))
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn create_instance(
        entry: &ash::Entry,
        app_name: &str,
        app_version: u32,
        extra_extensions: &[&'static CStr],
        validation: bool,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(app_name)
            .map_err(|e| HriError::precondition(format!("Invalid application name: {e}")))?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(app_version)
            .engine_name(c"hri")
            .api_version(vk::API_VERSION_1_3);

        let enabled_layer_names = if validation {
            Self::REQUIRED_VALIDATION_LAYERS
                .iter()
                .map(|layer| layer.as_ptr())
                .collect::<Vec<*const c_char>>()
        } else {
            Vec::new()
        };

        let mut extensions = extra_extensions.to_vec();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME);
        }
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME);
            extensions.push(ash::khr::get_physical_device_properties2::NAME);
        }
        extensions.sort();
        extensions.dedup();
        let enabled_extension_names = extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if validation {
            instance_info = instance_info.push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info
            .flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        Ok(unsafe {
            entry.create_instance(&instance_info, None)?
        })
    }

    fn validation_layers_supported(entry: &ash::Entry) -> Result<bool> {
        let supported_layers = unsafe {
            entry.enumerate_instance_layer_properties()?
        };

        Ok(Self::REQUIRED_VALIDATION_LAYERS.iter().all(|required| {
            supported_layers
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *required))
        }))
    }
}

impl Drop for RenderInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((messenger, loader)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance extensions the platform needs to present to the given display
pub fn required_surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    Ok(ash_window::enumerate_required_extensions(display)?
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(*ext) })
        .collect())
}

/// Surface creation callback backed by any raw-window-handle provider
pub fn surface_create_func<W>(window: W) -> SurfaceCreateFunc
where
    W: HasWindowHandle + HasDisplayHandle + 'static,
{
    Box::new(move |entry, instance| {
        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                None,
            )?
        };
        Ok(surface)
    })
}

fn debug_utils_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    type Severity = vk::DebugUtilsMessageSeverityFlagsEXT;
    type Kind = vk::DebugUtilsMessageTypeFlagsEXT;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(Severity::VERBOSE | Severity::INFO | Severity::WARNING | Severity::ERROR)
        .message_type(Kind::GENERAL | Kind::VALIDATION | Kind::PERFORMANCE)
        .pfn_user_callback(Some(vulkan_log_callback))
}

/// Log level a validation message of the given severity is reported at
fn log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Trace
    }
}

fn message_kind(kind: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

unsafe extern "system" fn vulkan_log_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // Safety: the loader passes either null or a valid callback struct for the call's duration
    let Some(data) = (unsafe { callback_data.as_ref() }) else {
        return vk::FALSE;
    };
    if data.p_message.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy();
    log::log!(target: "hri::vulkan", log_level(severity), "[{}] {}", message_kind(kind), message);

    vk::FALSE
}
