//! GPU context management.
//!
//! [`GpuContext`] owns the instance, surface, and logical device, and tears
//! them down in reverse order of construction.

use crate::adapter::{select_adapter, AdapterFeatures, AdapterRequirements, QueueFamilyRoles};
use crate::backend::BackendKind;
use crate::device::{DeviceBuilder, LogicalDevice};
use crate::error::{Result, RhiError};
use crate::instance::{create_instance, DebugMessenger};
use crate::memory::GpuAllocator;
use crate::surface::{Surface, SurfaceSupport};
use crate::swapchain::SwapchainPreferences;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Renderer configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer and debug messenger.
    pub validation: bool,
    pub requirements: AdapterRequirements,
    /// Number of frame slots (K).
    pub frames_in_flight: usize,
    pub swapchain: SwapchainPreferences,
    pub clear_color: [f32; 4],
    pub backend: BackendKind,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "Creation".to_string(),
            validation: cfg!(debug_assertions),
            requirements: AdapterRequirements::default(),
            frames_in_flight: 2,
            swapchain: SwapchainPreferences::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            backend: BackendKind::Vulkan,
        }
    }
}

impl RendererConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    #[must_use]
    pub fn requirements(mut self, requirements: AdapterRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Set the number of frame slots; at least one.
    #[must_use]
    pub fn frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    #[must_use]
    pub const fn swapchain(mut self, preferences: SwapchainPreferences) -> Self {
        self.swapchain = preferences;
        self
    }

    /// Prefer a present mode; FIFO is used when it is unavailable.
    #[must_use]
    pub const fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.swapchain.present_mode = mode;
        self
    }

    #[must_use]
    pub const fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    #[must_use]
    pub const fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }
}

/// What a pipeline or asset builder needs from the renderer.
pub struct PipelineTargets<'a> {
    pub device: &'a ash::Device,
    pub allocator: &'a Mutex<GpuAllocator>,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub descriptor_set_layouts: &'a [vk::DescriptorSetLayout],
}

/// What a UI overlay needs to record its own draws.
pub struct OverlayTargets<'a> {
    pub device: &'a ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_family: u32,
    pub color_format: vk::Format,
}

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug: Option<DebugMessenger>,
    pub(crate) surface: Surface,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) adapter_summary: String,
    pub(crate) max_sampler_anisotropy: f32,
    pub(crate) device: LogicalDevice,
    pub(crate) config: RendererConfig,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        self.device.raw()
    }

    /// Get the logical device with its queues and allocator.
    pub const fn logical_device(&self) -> &LogicalDevice {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub const fn surface(&self) -> &Surface {
        &self.surface
    }

    pub const fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue()
    }

    pub const fn present_queue(&self) -> vk::Queue {
        self.device.present_queue()
    }

    pub const fn queue_roles(&self) -> QueueFamilyRoles {
        self.device.queue_roles()
    }

    pub const fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        self.device.swapchain_loader()
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        self.device.allocator()
    }

    pub const fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Summary of the selected adapter.
    pub fn adapter_summary(&self) -> &str {
        &self.adapter_summary
    }

    /// Anisotropy limit usable on this device; 1.0 unless sampler anisotropy was requested.
    pub const fn max_sampler_anisotropy(&self) -> f32 {
        self.max_sampler_anisotropy
    }

    /// Re-query the surface; the result changes as the window resizes.
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        unsafe { self.surface.support(self.physical_device) }
    }

    /// First depth format usable as an optimal-tiling attachment.
    pub fn depth_format(&self) -> Option<vk::Format> {
        [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ]
        .into_iter()
        .find(|&format| {
            let properties = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            };
            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
    }

    pub fn pipeline_targets<'a>(
        &'a self,
        color_format: vk::Format,
        descriptor_set_layouts: &'a [vk::DescriptorSetLayout],
    ) -> PipelineTargets<'a> {
        PipelineTargets {
            device: self.device(),
            allocator: self.allocator(),
            color_format,
            depth_format: self.depth_format(),
            descriptor_set_layouts,
        }
    }

    pub fn overlay_targets(&self, color_format: vk::Format) -> OverlayTargets<'_> {
        OverlayTargets {
            device: self.device(),
            graphics_queue: self.graphics_queue(),
            present_queue: self.present_queue(),
            queue_family: self.queue_roles().graphics,
            color_format,
        }
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy();
            self.surface.destroy();
            if let Some(debug) = &self.debug {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::info!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    config: RendererConfig,
}

impl GpuContextBuilder {
    pub const fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    /// Build the GPU context presenting to `window`.
    ///
    /// Fails with [`RhiError::NoSuitableAdapter`] or
    /// [`RhiError::DeviceCreation`]; neither is worth retrying.
    pub fn build<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let config = self.config;

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::Loader(format!("Failed to load Vulkan: {e}")))?;

        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        let instance =
            unsafe { create_instance(&entry, &config.app_name, display, config.validation)? };

        let debug = if config.validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let teardown = |surface: Option<&Surface>| unsafe {
            if let Some(surface) = surface {
                surface.destroy();
            }
            if let Some(debug) = &debug {
                debug.destroy();
            }
            instance.destroy_instance(None);
        };

        let surface = match unsafe { Surface::from_window(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(e) => {
                teardown(None);
                return Err(e);
            }
        };

        let selected = unsafe { select_adapter(&instance, &surface, &config.requirements) };
        let (physical_device, adapter) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                teardown(Some(&surface));
                return Err(e);
            }
        };

        let device = adapter.queue_roles().ok_or(RhiError::NoSuitableAdapter).and_then(|roles| {
            unsafe {
                DeviceBuilder::new()
                    .extensions(&config.requirements.extensions)
                    .features(config.requirements.features)
                    .validation(config.validation)
                    .build(&instance, physical_device, roles)
            }
        });
        let device = match device {
            Ok(device) => device,
            Err(e) => {
                teardown(Some(&surface));
                return Err(e);
            }
        };

        // The descriptor is not kept past device creation.
        let adapter_summary = adapter.summary();
        let max_sampler_anisotropy = if device
            .features()
            .contains(AdapterFeatures::SAMPLER_ANISOTROPY)
        {
            adapter.max_sampler_anisotropy
        } else {
            1.0
        };
        drop(adapter);

        Ok(GpuContext {
            entry,
            instance,
            debug,
            surface,
            physical_device,
            adapter_summary,
            max_sampler_anisotropy,
            device,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert_eq!(config.swapchain.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.validation, cfg!(debug_assertions));
    }

    #[test]
    fn frames_in_flight_is_at_least_one() {
        let config = RendererConfig::new()
            .frames_in_flight(0)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clear_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.frames_in_flight, 1);
        assert_eq!(config.swapchain.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.clear_color, [1.0, 0.0, 0.0, 1.0]);
    }
}
