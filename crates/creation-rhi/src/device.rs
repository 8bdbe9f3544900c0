//! Logical device creation.
//!
//! Feature requests are declared per Vulkan version and folded into the
//! `pNext` chain of `VkDeviceCreateInfo`. There is no fallback: a rejected
//! combination fails device creation.

use crate::adapter::{AdapterFeatures, QueueFamilyRoles};
use crate::error::{Result, RhiError};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Vulkan version whose feature struct carries a feature bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    Core,
    Vulkan12,
    Vulkan13,
}

impl FeatureLevel {
    /// Level of the feature struct that enables `feature`.
    pub fn of(feature: AdapterFeatures) -> Self {
        if feature.intersects(AdapterFeatures::SYNCHRONIZATION_2 | AdapterFeatures::DYNAMIC_RENDERING)
        {
            Self::Vulkan13
        } else if feature.intersects(
            AdapterFeatures::TIMELINE_SEMAPHORE
                | AdapterFeatures::DESCRIPTOR_INDEXING
                | AdapterFeatures::BUFFER_DEVICE_ADDRESS,
        ) {
            Self::Vulkan12
        } else {
            Self::Core
        }
    }
}

/// A versioned group of features to enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRequest {
    pub level: FeatureLevel,
    pub features: AdapterFeatures,
}

/// Split a feature set into one request per Vulkan version, oldest first.
pub fn feature_chain(features: AdapterFeatures) -> Vec<FeatureRequest> {
    let mut chain: Vec<FeatureRequest> = Vec::new();
    for feature in features.iter() {
        let level = FeatureLevel::of(feature);
        match chain.iter_mut().find(|r| r.level == level) {
            Some(request) => request.features |= feature,
            None => chain.push(FeatureRequest {
                level,
                features: feature,
            }),
        }
    }
    chain.sort_by_key(|r| r.level);
    chain
}

/// The live device, its queues, and its memory allocator.
pub struct LogicalDevice {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    pub(crate) roles: QueueFamilyRoles,
    pub(crate) features: AdapterFeatures,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
    pub(crate) allocator: Mutex<GpuAllocator>,
}

impl LogicalDevice {
    /// Get the Vulkan device handle.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// Get a shared handle to the Vulkan device.
    pub fn shared(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the graphics queue.
    pub const fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the presentation queue. May be the graphics queue.
    pub const fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Get the queue family roles.
    pub const fn queue_roles(&self) -> QueueFamilyRoles {
        self.roles
    }

    /// Features enabled at creation.
    pub const fn features(&self) -> AdapterFeatures {
        self.features
    }

    /// Get the swapchain extension loader.
    pub const fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Destroy the device.
    ///
    /// Waits for idle, then frees all device memory before the device itself.
    ///
    /// # Safety
    /// Every object created from the device must already be destroyed.
    pub unsafe fn destroy(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.allocator.lock().shutdown();
            self.device.destroy_device(None);
        }
    }
}

/// Builder for the logical device.
pub struct DeviceBuilder {
    extensions: Vec<&'static CStr>,
    requests: Vec<FeatureRequest>,
    enable_validation: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            extensions: vec![ash::khr::swapchain::NAME],
            requests: Vec::new(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl DeviceBuilder {
    /// Create a new builder requesting only the swapchain extension.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an extension.
    pub fn extension(mut self, name: &'static CStr) -> Self {
        if !self.extensions.contains(&name) {
            self.extensions.push(name);
        }
        self
    }

    /// Require several extensions.
    pub fn extensions(self, names: &[&'static CStr]) -> Self {
        names.iter().fold(self, |builder, name| builder.extension(name))
    }

    /// Add a versioned feature request.
    pub fn request(mut self, request: FeatureRequest) -> Self {
        self.requests.push(request);
        self
    }

    /// Request a feature set, split by version.
    pub fn features(self, features: AdapterFeatures) -> Self {
        feature_chain(features)
            .into_iter()
            .fold(self, Self::request)
    }

    /// Whether the device may log allocator diagnostics.
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// All requested features, regardless of level.
    pub fn requested_features(&self) -> AdapterFeatures {
        self.requests
            .iter()
            .fold(AdapterFeatures::empty(), |acc, r| acc | r.features)
    }

    fn features_at(&self, level: FeatureLevel) -> AdapterFeatures {
        self.requests
            .iter()
            .filter(|r| r.level == level)
            .fold(AdapterFeatures::empty(), |acc, r| acc | r.features)
    }

    /// Create the logical device and retrieve its queues.
    ///
    /// # Safety
    /// The instance and physical device must be valid and `roles` must name
    /// queue families of that device.
    pub unsafe fn build(
        self,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        roles: QueueFamilyRoles,
    ) -> Result<LogicalDevice> {
        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = roles
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_names: Vec<*const std::ffi::c_char> =
            self.extensions.iter().map(|ext| ext.as_ptr()).collect();

        let core = self.features_at(FeatureLevel::Core);
        let level_1_2 = self.features_at(FeatureLevel::Vulkan12);
        let level_1_3 = self.features_at(FeatureLevel::Vulkan13);

        let base_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(core.contains(AdapterFeatures::SAMPLER_ANISOTROPY));

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(level_1_2.contains(AdapterFeatures::TIMELINE_SEMAPHORE))
            .descriptor_indexing(level_1_2.contains(AdapterFeatures::DESCRIPTOR_INDEXING))
            .buffer_device_address(level_1_2.contains(AdapterFeatures::BUFFER_DEVICE_ADDRESS));

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(level_1_3.contains(AdapterFeatures::SYNCHRONIZATION_2))
            .dynamic_rendering(level_1_3.contains(AdapterFeatures::DYNAMIC_RENDERING));

        let mut features2 = vk::PhysicalDeviceFeatures2::default().features(base_features);
        if !level_1_2.is_empty() {
            features2 = features2.push_next(&mut vulkan_1_2_features);
        }
        if !level_1_3.is_empty() {
            features2 = features2.push_next(&mut vulkan_1_3_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(RhiError::DeviceCreation)?;

        let graphics_queue = unsafe { device.get_device_queue(roles.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(roles.present, 0) };

        let device = Arc::new(device);
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        let requested = self.requested_features();
        let allocator = unsafe {
            GpuAllocator::new(
                instance,
                Arc::clone(&device),
                physical_device,
                requested.contains(AdapterFeatures::BUFFER_DEVICE_ADDRESS),
                self.enable_validation,
            )
        };
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        tracing::info!(
            "Logical device created (graphics family {}, present family {}, features {:?})",
            roles.graphics,
            roles.present,
            requested
        );

        Ok(LogicalDevice {
            device,
            graphics_queue,
            present_queue,
            roles,
            features: requested,
            swapchain_loader,
            allocator: Mutex::new(allocator),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_split_by_version() {
        let chain = feature_chain(
            AdapterFeatures::DYNAMIC_RENDERING
                | AdapterFeatures::SAMPLER_ANISOTROPY
                | AdapterFeatures::SYNCHRONIZATION_2
                | AdapterFeatures::TIMELINE_SEMAPHORE,
        );

        assert_eq!(
            chain,
            vec![
                FeatureRequest {
                    level: FeatureLevel::Core,
                    features: AdapterFeatures::SAMPLER_ANISOTROPY,
                },
                FeatureRequest {
                    level: FeatureLevel::Vulkan12,
                    features: AdapterFeatures::TIMELINE_SEMAPHORE,
                },
                FeatureRequest {
                    level: FeatureLevel::Vulkan13,
                    features: AdapterFeatures::SYNCHRONIZATION_2
                        | AdapterFeatures::DYNAMIC_RENDERING,
                },
            ]
        );
    }

    #[test]
    fn empty_feature_set_has_no_requests() {
        assert!(feature_chain(AdapterFeatures::empty()).is_empty());
    }

    #[test]
    fn builder_deduplicates_extensions() {
        let builder = DeviceBuilder::new()
            .extension(ash::khr::swapchain::NAME)
            .extensions(&[ash::khr::swapchain::NAME, ash::khr::push_descriptor::NAME]);
        assert_eq!(builder.extensions.len(), 2);
    }

    #[test]
    fn builder_collects_requested_features() {
        let builder = DeviceBuilder::new()
            .features(AdapterFeatures::DYNAMIC_RENDERING)
            .request(FeatureRequest {
                level: FeatureLevel::Vulkan12,
                features: AdapterFeatures::DESCRIPTOR_INDEXING,
            });

        assert_eq!(
            builder.requested_features(),
            AdapterFeatures::DYNAMIC_RENDERING | AdapterFeatures::DESCRIPTOR_INDEXING
        );
        assert_eq!(
            builder.features_at(FeatureLevel::Vulkan13),
            AdapterFeatures::DYNAMIC_RENDERING
        );
        assert!(builder.features_at(FeatureLevel::Core).is_empty());
    }
}
