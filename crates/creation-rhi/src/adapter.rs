//! Adapter capability detection and negotiation.
//!
//! Every enumerated physical device is described once by an
//! [`AdapterDescriptor`]. [`negotiate`] then picks exactly one adapter that
//! satisfies an [`AdapterRequirements`] set. The negotiation itself is pure so
//! the selection policy can be exercised without a GPU.

use crate::error::{Result, RhiError};
use crate::surface::{Surface, SurfaceSupport};
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
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Broad performance class of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterClass {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

impl AdapterClass {
    pub fn from_device_type(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Other,
        }
    }
}

bitflags::bitflags! {
    /// Fine-grained device capabilities the engine may require.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdapterFeatures: u32 {
        const SAMPLER_ANISOTROPY = 1 << 0;
        const TIMELINE_SEMAPHORE = 1 << 1;
        const DESCRIPTOR_INDEXING = 1 << 2;
        const BUFFER_DEVICE_ADDRESS = 1 << 3;
        const SYNCHRONIZATION_2 = 1 << 4;
        const DYNAMIC_RENDERING = 1 << 5;
    }
}

/// Capabilities of one queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub graphics: bool,
    pub present: bool,
    pub queue_count: u32,
}

/// Queue family indices chosen for each role.
///
/// Both roles may name the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyRoles {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyRoles {
    /// Whether graphics and presentation share one family.
    pub const fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// The distinct family indices, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Immutable description of one physical GPU as seen through a surface.
#[derive(Debug, Clone)]
pub struct AdapterDescriptor {
    pub name: String,
    pub vendor: GpuVendor,
    pub class: AdapterClass,
    pub api_version: u32,
    pub features: AdapterFeatures,
    pub extensions: HashSet<String>,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub surface: SurfaceSupport,
    pub device_local_memory_mb: u64,
    /// Upper bound for sampler anisotropy.
    pub max_sampler_anisotropy: f32,
}

/// Capabilities an adapter must provide to be selected.
#[derive(Debug, Clone)]
pub struct AdapterRequirements {
    pub min_api_version: u32,
    pub extensions: Vec<&'static CStr>,
    pub features: AdapterFeatures,
}

impl Default for AdapterRequirements {
    fn default() -> Self {
        Self {
            min_api_version: vk::API_VERSION_1_3,
            extensions: vec![ash::khr::swapchain::NAME],
            features: AdapterFeatures::SYNCHRONIZATION_2 | AdapterFeatures::DYNAMIC_RENDERING,
        }
    }
}

/// Why an adapter failed negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    ApiVersion(u32),
    NoGraphicsQueue,
    NoPresentQueue,
    MissingExtension(String),
    MissingFeatures(AdapterFeatures),
    NoSurfaceFormats,
    NoPresentModes,
}

impl AdapterDescriptor {
    /// Pick queue families for graphics and presentation.
    ///
    /// A family that can do both is preferred so the queues can alias.
    pub fn queue_roles(&self) -> Option<QueueFamilyRoles> {
        let index = |i: usize| u32::try_from(i).ok();

        if let Some(shared) = self
            .queue_families
            .iter()
            .position(|f| f.graphics && f.present)
        {
            let shared = index(shared)?;
            return Some(QueueFamilyRoles {
                graphics: shared,
                present: shared,
            });
        }

        let graphics = self.queue_families.iter().position(|f| f.graphics)?;
        let present = self.queue_families.iter().position(|f| f.present)?;
        Some(QueueFamilyRoles {
            graphics: index(graphics)?,
            present: index(present)?,
        })
    }

    /// Check the adapter against the requirements.
    pub fn check(&self, requirements: &AdapterRequirements) -> std::result::Result<(), Rejection> {
        if self.api_version < requirements.min_api_version {
            return Err(Rejection::ApiVersion(self.api_version));
        }
        if !self.queue_families.iter().any(|f| f.graphics) {
            return Err(Rejection::NoGraphicsQueue);
        }
        if !self.queue_families.iter().any(|f| f.present) {
            return Err(Rejection::NoPresentQueue);
        }
        for ext in &requirements.extensions {
            let name = ext.to_string_lossy();
            if !self.extensions.contains(name.as_ref()) {
                return Err(Rejection::MissingExtension(name.into_owned()));
            }
        }
        let missing = requirements.features.difference(self.features);
        if !missing.is_empty() {
            return Err(Rejection::MissingFeatures(missing));
        }
        if self.surface.formats.is_empty() {
            return Err(Rejection::NoSurfaceFormats);
        }
        if self.surface.present_modes.is_empty() {
            return Err(Rejection::NoPresentModes);
        }
        Ok(())
    }

    /// Get a human-readable summary of the adapter.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.name,
            self.vendor,
            self.class,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }

    /// Query the descriptor of a physical device against a surface.
    ///
    /// Query failures are folded into the descriptor as missing capabilities,
    /// so a misbehaving adapter is rejected by [`negotiate`] instead of
    /// aborting enumeration.
    ///
    /// # Safety
    /// The instance, surface, and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default()
                .iter()
                .filter_map(|ext| {
                    // SAFETY: the driver writes a NUL-terminated name
                    unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                        .to_str()
                        .ok()
                        .map(String::from)
                })
                .collect();

        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_families = families
            .iter()
            .enumerate()
            .map(|(i, family)| QueueFamilyInfo {
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present: u32::try_from(i)
                    .ok()
                    .is_some_and(|i| unsafe { surface.supports_present(physical_device, i) }),
                queue_count: family.queue_count,
            })
            .collect();

        let features = unsafe { query_features(instance, physical_device, properties.api_version) };

        Self {
            name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            class: AdapterClass::from_device_type(properties.device_type),
            api_version: properties.api_version,
            features,
            extensions,
            queue_families,
            surface: unsafe { surface.support(physical_device) }.unwrap_or_default(),
            device_local_memory_mb,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
        }
    }
}

/// Read the feature bits the engine cares about.
unsafe fn query_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    api_version: u32,
) -> AdapterFeatures {
    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default();

    // Chained structs newer than the device's API version are not filled in
    let has_1_2 = api_version >= vk::API_VERSION_1_2;
    let has_1_3 = api_version >= vk::API_VERSION_1_3;
    if has_1_2 {
        features2 = features2.push_next(&mut vulkan_1_2);
    }
    if has_1_3 {
        features2 = features2.push_next(&mut vulkan_1_3);
    }

    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let core = features2.features;

    let mut features = AdapterFeatures::empty();
    features.set(
        AdapterFeatures::SAMPLER_ANISOTROPY,
        core.sampler_anisotropy == vk::TRUE,
    );
    features.set(
        AdapterFeatures::TIMELINE_SEMAPHORE,
        has_1_2 && vulkan_1_2.timeline_semaphore == vk::TRUE,
    );
    features.set(
        AdapterFeatures::DESCRIPTOR_INDEXING,
        has_1_2 && vulkan_1_2.descriptor_indexing == vk::TRUE,
    );
    features.set(
        AdapterFeatures::BUFFER_DEVICE_ADDRESS,
        has_1_2 && vulkan_1_2.buffer_device_address == vk::TRUE,
    );
    features.set(
        AdapterFeatures::SYNCHRONIZATION_2,
        has_1_3 && vulkan_1_3.synchronization2 == vk::TRUE,
    );
    features.set(
        AdapterFeatures::DYNAMIC_RENDERING,
        has_1_3 && vulkan_1_3.dynamic_rendering == vk::TRUE,
    );
    features
}

/// Pick one adapter out of `adapters`.
///
/// Discrete adapters win over every other class; otherwise the first
/// qualifying adapter in enumeration order is chosen.
pub fn negotiate(
    adapters: &[AdapterDescriptor],
    requirements: &AdapterRequirements,
) -> Result<usize> {
    let mut chosen: Option<usize> = None;

    for (index, adapter) in adapters.iter().enumerate() {
        if let Err(reason) = adapter.check(requirements) {
            tracing::debug!("Rejected adapter {}: {:?}", adapter.name, reason);
            continue;
        }

        match chosen {
            None => chosen = Some(index),
            Some(current)
                if adapter.class == AdapterClass::Discrete
                    && adapters[current].class != AdapterClass::Discrete =>
            {
                chosen = Some(index);
            }
            Some(_) => {}
        }
    }

    chosen.ok_or(RhiError::NoSuitableAdapter)
}

/// Enumerate, describe, and negotiate the physical devices of an instance.
///
/// # Safety
/// The instance and surface must be valid.
pub unsafe fn select_adapter(
    instance: &ash::Instance,
    surface: &Surface,
    requirements: &AdapterRequirements,
) -> Result<(vk::PhysicalDevice, AdapterDescriptor)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    tracing::info!("Found {} Vulkan adapter(s)", devices.len());

    let descriptors: Vec<AdapterDescriptor> = devices
        .iter()
        .map(|&device| unsafe { AdapterDescriptor::query(instance, surface, device) })
        .collect();

    let index = negotiate(&descriptors, requirements)?;
    let descriptor = descriptors
        .into_iter()
        .nth(index)
        .ok_or(RhiError::NoSuitableAdapter)?;

    tracing::info!("Selected GPU: {}", descriptor.summary());
    Ok((devices[index], descriptor))
}
