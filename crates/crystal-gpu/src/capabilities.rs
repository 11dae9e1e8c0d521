//! Physical device capability snapshot.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions required for hardware ray tracing.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Ray tracing pipeline limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    /// Minimum alignment of each record in the shader binding table.
    pub shader_group_handle_alignment: u32,
    /// Minimum alignment of each region base address.
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

impl Default for RayTracingProperties {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
        }
    }
}

/// Queue family indices. Compute and transfer fall back to graphics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

/// Immutable capability snapshot, queried once at context creation.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    /// `Some` only when every ray tracing extension and feature is present.
    pub ray_tracing: Option<RayTracingProperties>,
    pub supports_buffer_device_address: bool,
    pub supports_synchronization2: bool,

    pub sampler_anisotropy: bool,
    pub max_sampler_anisotropy: f32,
    /// Highest sample count usable for both colour and depth attachments.
    pub max_msaa_samples: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub queue_families: QueueFamilies,

    pub available_extensions: HashSet<String>,
}

impl PhysicalDeviceInfo {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 3;

        let has_rt_extensions = RAY_TRACING_EXTENSIONS.iter().all(|name| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        });
        let ray_tracing = if has_rt_extensions {
            query_ray_tracing(instance, physical_device)
        } else {
            None
        };

        let sample_counts = properties.limits.framebuffer_color_sample_counts
            & properties.limits.framebuffer_depth_sample_counts;

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version,
            driver_version: properties.driver_version,
            ray_tracing,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_synchronization2: has_vulkan_1_3,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            max_msaa_samples: max_sample_count(sample_counts),
            device_local_memory_mb,
            queue_families,
            available_extensions,
        }
    }

    /// A plausible desktop GPU with ray tracing, used by the headless device.
    pub fn headless() -> Self {
        Self {
            vendor: GpuVendor::Other(0),
            device_name: "Headless".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            ray_tracing: Some(RayTracingProperties::default()),
            supports_buffer_device_address: true,
            supports_synchronization2: true,
            sampler_anisotropy: true,
            max_sampler_anisotropy: 16.0,
            max_msaa_samples: 8,
            device_local_memory_mb: 4096,
            queue_families: QueueFamilies::default(),
            available_extensions: HashSet::new(),
        }
    }

    /// Same device without hardware ray tracing.
    pub fn without_ray_tracing(mut self) -> Self {
        self.ray_tracing = None;
        self
    }

    /// Override the ray tracing limits.
    pub fn with_ray_tracing(mut self, properties: RayTracingProperties) -> Self {
        self.ray_tracing = Some(properties);
        self
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing.is_some()
    }

    /// Clamp a requested anisotropy level to what the device allows.
    ///
    /// Returns `None` when anisotropic filtering is unsupported or not requested.
    pub fn clamp_anisotropy(&self, requested: f32) -> Option<f32> {
        if !self.sampler_anisotropy || requested <= 1.0 {
            return None;
        }
        Some(requested.min(self.max_sampler_anisotropy))
    }

    /// Clamp a requested MSAA sample count to the closest supported power of two.
    pub fn clamp_msaa(&self, requested: u32) -> u32 {
        let requested = requested.max(1).min(self.max_msaa_samples.max(1));
        1 << (31 - requested.leading_zeros())
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }
        self.supports_buffer_device_address && self.supports_synchronization2
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_ray_tracing() { "yes" } else { "no" },
        )
    }
}

/// # Safety
/// The instance and physical device must be valid.
unsafe fn query_ray_tracing(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<RayTracingProperties> {
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    {
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut as_features)
            .push_next(&mut rt_features);
        instance.get_physical_device_features2(physical_device, &mut features2);
    }
    if as_features.acceleration_structure != vk::TRUE
        || rt_features.ray_tracing_pipeline != vk::TRUE
    {
        return None;
    }

    let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    {
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
    }

    Some(RayTracingProperties {
        shader_group_handle_size: rt_properties.shader_group_handle_size,
        shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
        shader_group_base_alignment: rt_properties.shader_group_base_alignment,
        max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
    })
}

fn max_sample_count(counts: vk::SampleCountFlags) -> u32 {
    [
        (vk::SampleCountFlags::TYPE_64, 64),
        (vk::SampleCountFlags::TYPE_32, 32),
        (vk::SampleCountFlags::TYPE_16, 16),
        (vk::SampleCountFlags::TYPE_8, 8),
        (vk::SampleCountFlags::TYPE_4, 4),
        (vk::SampleCountFlags::TYPE_2, 2),
    ]
    .into_iter()
    .find(|(flag, _)| counts.contains(*flag))
    .map_or(1, |(_, n)| n)
}
