//! Graphics context: device, queues, capability snapshot and dependency graph.

use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::capabilities::{PhysicalDeviceInfo, RayTracingProperties};
use crate::device::vulkan::VulkanDeviceDesc;
use crate::device::{Device, HeadlessDevice, VulkanDevice};
use crate::error::Result;
use crate::graph::{DependencyGraph, ResourceId, ResourceKind, TeardownPolicy};

/// Process-wide handle bundle shared by every resource.
///
/// Queues may alias. Submitting to one queue from several threads at once is
/// not synchronized here; callers serialize submissions per queue.
pub struct GraphicsContext {
    device: Device,
    info: PhysicalDeviceInfo,
    ray_tracing_enabled: bool,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    graph: Mutex<DependencyGraph>,
    root: ResourceId,
    app_name: String,
}

impl GraphicsContext {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Simulation hooks, when running on the headless backend.
    pub fn headless(&self) -> Option<&HeadlessDevice> {
        self.device.as_headless()
    }

    /// Capability snapshot taken at creation.
    pub fn physical_device_info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    /// Whether ray tracing was both requested and supported.
    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing_enabled
    }

    /// Ray tracing limits, only when ray tracing is enabled.
    pub fn ray_tracing_properties(&self) -> Option<&RayTracingProperties> {
        self.info
            .ray_tracing
            .as_ref()
            .filter(|_| self.ray_tracing_enabled)
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.info.queue_families.graphics
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.info.queue_families.compute
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.info.queue_families.transfer
    }

    pub fn application_name(&self) -> &str {
        &self.app_name
    }

    /// Lock the dependency graph.
    ///
    /// Every mutation and every teardown traversal goes through this one lock.
    pub fn graph(&self) -> MutexGuard<'_, DependencyGraph> {
        self.graph.lock()
    }

    /// Graph node of the context itself. Every resource depends on it.
    pub fn root(&self) -> ResourceId {
        self.root
    }

    /// Register a resource that depends on the context.
    pub fn register(&self, kind: ResourceKind, label: &str) -> Result<ResourceId> {
        let mut graph = self.graph.lock();
        let id = graph.register(kind, label);
        graph.add_dependency(id, self.root)?;
        Ok(id)
    }

    /// Whether `id` is live and valid.
    pub fn is_valid(&self, id: ResourceId) -> bool {
        self.graph.lock().is_valid(id)
    }

    /// Wait for device to be idle.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Run `op`, and on an allocation failure wait for the device, run
    /// `reclaim` to drop unused resources and try exactly once more.
    pub fn with_allocation_retry<T>(
        &self,
        reclaim: impl FnOnce() -> Result<()>,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        match op() {
            Err(e) if e.is_allocation() => {
                tracing::warn!("Allocation failed ({e}), reclaiming and retrying once");
                self.wait_idle()?;
                reclaim()?;
                op()
            }
            other => other,
        }
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        let mut graph = self.graph.lock();
        let leaked = graph.len().saturating_sub(1);
        if leaked > 0 {
            tracing::warn!(leaked, "Resources still registered at context teardown");
        }
        graph.force_release(self.root);
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("device", &self.info.device_name)
            .field("headless", &self.device.is_headless())
            .field("ray_tracing_enabled", &self.ray_tracing_enabled)
            .finish_non_exhaustive()
    }
}

/// Which device backend to create.
#[derive(Debug, Clone, Default)]
pub enum Backend {
    #[default]
    Vulkan,
    /// Simulated device with the given capabilities.
    Headless(PhysicalDeviceInfo),
}

/// Builder for creating a graphics context.
#[derive(Debug, Clone)]
pub struct GraphicsContextBuilder {
    app_name: String,
    app_version: u32,
    ray_tracing: bool,
    enable_validation: bool,
    teardown_policy: TeardownPolicy,
    backend: Backend,
}

impl Default for GraphicsContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Crystal Engine".to_string(),
            app_version: vk::make_api_version(0, 0, 1, 0),
            ray_tracing: false,
            enable_validation: cfg!(debug_assertions),
            teardown_policy: TeardownPolicy::default(),
            backend: Backend::default(),
        }
    }
}

impl GraphicsContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn app_version(mut self, version: u32) -> Self {
        self.app_version = version;
        self
    }

    /// Request hardware ray tracing. Unsupported requests are downgraded.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.ray_tracing = enable;
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    pub fn teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown_policy = policy;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Use the headless backend with the given capabilities.
    pub fn headless(self, info: PhysicalDeviceInfo) -> Self {
        self.backend(Backend::Headless(info))
    }

    /// Build the context.
    pub fn build(self) -> Result<Arc<GraphicsContext>> {
        let (device, info, ray_tracing_enabled) = match self.backend {
            Backend::Vulkan => {
                let (device, info, enabled) = VulkanDevice::create(&VulkanDeviceDesc {
                    app_name: &self.app_name,
                    app_version: self.app_version,
                    validation: self.enable_validation,
                    request_ray_tracing: self.ray_tracing,
                })?;
                (Device::Vulkan(device), info, enabled)
            }
            Backend::Headless(info) => {
                let enabled = self.ray_tracing && info.supports_ray_tracing();
                tracing::info!("Using headless device: {}", info.summary());
                (Device::Headless(HeadlessDevice::new(enabled)), info, enabled)
            }
        };

        if self.ray_tracing && !ray_tracing_enabled {
            tracing::warn!(
                device = %info.device_name,
                "Ray tracing requested but not supported, continuing without it"
            );
        }

        let graphics_queue = device.queue(info.queue_families.graphics);
        let compute_queue = device.queue(info.queue_families.compute);
        let transfer_queue = device.queue(info.queue_families.transfer);

        let mut graph = DependencyGraph::new(self.teardown_policy);
        let root = graph.register(ResourceKind::Context, self.app_name.as_str());

        Ok(Arc::new(GraphicsContext {
            device,
            info,
            ray_tracing_enabled,
            graphics_queue,
            compute_queue,
            transfer_queue,
            graph: Mutex::new(graph),
            root,
            app_name: self.app_name,
        }))
    }
}
