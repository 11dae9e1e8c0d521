//! Vulkan instance creation and physical device selection.

use crate::capabilities::QueueFamilies;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

const ENGINE_NAME: &CStr = c"Crystal Engine";

/// Instance extensions. Presentation is out of scope, so no surface extensions.
fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    app_version: u32,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState("application name contains NUL".to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(app_version)
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const std::ffi::c_char> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut layer_names: Vec<*const std::ffi::c_char> = Vec::new();
    if enable_validation {
        let available_layers = entry.enumerate_instance_layer_properties()?;
        let found = available_layers
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER);
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation layer {:?} not available", VALIDATION_LAYER);
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Select the best physical device. Ray tracing capable devices win ties
/// when `prefer_ray_tracing` is set.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    prefer_ray_tracing: bool,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    devices
        .into_iter()
        .map(|device| {
            (
                device,
                score_physical_device(instance, device, prefer_ray_tracing),
            )
        })
        .filter(|(_, score)| *score > 0)
        .max_by_key(|(_, score)| *score)
        .map(|(device, _)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

unsafe fn score_physical_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    prefer_ray_tracing: bool,
) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = 1;

    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32;

    if prefer_ray_tracing {
        let extensions = instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default();
        let has_rt = crate::capabilities::RAY_TRACING_EXTENSIONS.iter().all(|name| {
            extensions
                .iter()
                .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == *name)
        });
        if has_rt {
            score += 2000;
        }
    }

    score
}

/// Find queue families for graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilies> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics = None;
    let mut compute = None;
    let mut transfer = None;

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        let flags = family.queue_flags;

        if flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && compute.is_none()
        {
            compute = Some(i);
        }

        if flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            && transfer.is_none()
        {
            transfer = Some(i);
        }

        if flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
            graphics = Some(i);
        }
    }

    let graphics = graphics.ok_or(GpuError::NoSuitableDevice)?;
    let compute = compute.unwrap_or(graphics);
    let transfer = transfer.unwrap_or(compute);

    Ok(QueueFamilies {
        graphics,
        compute,
        transfer,
    })
}
