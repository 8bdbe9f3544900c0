//! Swapchain management.
//!
//! [`SwapchainPlan::negotiate`] turns surface capabilities and a requested
//! window size into the parameters of a chain. It is pure and deterministic,
//! so rebuilding at an unchanged size yields the same format and image count.
//! [`Swapchain`] owns the Vulkan chain built from a plan.

use crate::device::LogicalDevice;
use crate::error::{Result, RhiError};
use crate::surface::{Surface, SurfaceSupport};
use ash::vk;

/// Preferred swapchain parameters, resolved once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPreferences {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_usage: vk::ImageUsageFlags,
    /// Lower bound on the image count before clamping to the surface maximum.
    pub min_image_count: u32,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::MAILBOX,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            min_image_count: 3,
        }
    }
}

/// Negotiated parameters for one swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    /// Negotiate a plan for a window of `width` x `height` pixels.
    pub fn negotiate(
        support: &SurfaceSupport,
        width: u32,
        height: u32,
        preferences: &SwapchainPreferences,
    ) -> Result<Self> {
        let surface_format = select_surface_format(&support.formats, preferences.format)
            .ok_or_else(|| RhiError::SwapchainCreation("Surface reports no formats".into()))?;

        let extent = calculate_extent(&support.capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::ZeroExtent {
                width: extent.width,
                height: extent.height,
            });
        }

        Ok(Self {
            image_count: select_image_count(&support.capabilities, preferences.min_image_count),
            surface_format,
            present_mode: select_present_mode(&support.present_modes, preferences.present_mode),
            extent,
            composite_alpha: select_composite_alpha(
                support.capabilities.supported_composite_alpha,
            ),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// `max(preferred, min)`, clamped to the surface maximum when it is bounded.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, preferred: u32) -> u32 {
    let count = preferred.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Select the preferred surface format, else the first available.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| available.first())
        .copied()
}

/// Select the preferred present mode, falling back to FIFO (always supported).
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Pick a composite alpha mode; opaque when nothing else is offered.
pub fn select_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// An image index valid for one swapchain generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub generation: u64,
    pub suboptimal: bool,
}

impl AcquiredImage {
    /// Check that the image belongs to the chain of `generation`.
    pub fn check_generation(&self, generation: u64) -> Result<()> {
        debug_assert_eq!(
            self.generation, generation,
            "image {} presented to the wrong swapchain generation",
            self.index
        );
        if self.generation == generation {
            Ok(())
        } else {
            Err(RhiError::StaleImage {
                expected: generation,
                found: self.generation,
            })
        }
    }
}

/// Result of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(AcquiredImage),
    /// No image was acquired; the chain must be rebuilt.
    OutOfDate,
}

/// Result of presenting a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the chain should be rebuilt before the next frame.
    pub const fn needs_rebuild(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

fn map_surface_error(e: vk::Result) -> RhiError {
    match e {
        vk::Result::ERROR_SURFACE_LOST_KHR => RhiError::SurfaceLost,
        other => RhiError::Vulkan(other),
    }
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Incremented every time the chain is rebuilt.
    pub generation: u64,
}

impl Swapchain {
    /// Create a swapchain for the current surface state.
    ///
    /// `previous` is passed to the driver as the old swapchain; the caller
    /// keeps ownership and retires it once no presentation uses it.
    ///
    /// # Safety
    /// All handles must be valid and `physical_device` must be the device's adapter.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn create(
        device: &LogicalDevice,
        physical_device: vk::PhysicalDevice,
        surface: &Surface,
        width: u32,
        height: u32,
        preferences: &SwapchainPreferences,
        previous: Option<&Self>,
    ) -> Result<Self> {
        let support = unsafe { surface.support(physical_device)? };
        let plan = SwapchainPlan::negotiate(&support, width, height, preferences)?;
        let roles = device.queue_roles();

        let queue_families = [roles.graphics, roles.present];
        let (sharing_mode, family_indices): (vk::SharingMode, &[u32]) = if roles.is_shared() {
            (vk::SharingMode::EXCLUSIVE, &[])
        } else {
            (vk::SharingMode::CONCURRENT, &queue_families)
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(preferences.image_usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(plan.pre_transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(previous.map_or(vk::SwapchainKHR::null(), |p| p.handle));

        let loader = device.swapchain_loader();
        let handle = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => RhiError::SurfaceLost,
            other => RhiError::SwapchainCreation(other.to_string()),
        })?;

        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(plan.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );

            match unsafe { device.raw().create_image_view(&view_info, None) } {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for &view in &image_views {
                            device.raw().destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(handle, None);
                    }
                    return Err(e.into());
                }
            }
        }

        let generation = previous.map_or(1, |p| p.generation + 1);
        tracing::info!(
            "Swapchain generation {} created: {}x{}, {} images, {:?}, {:?}",
            generation,
            plan.extent.width,
            plan.extent.height,
            images.len(),
            plan.surface_format.format,
            plan.present_mode
        );

        Ok(Self {
            handle,
            images,
            image_views,
            format: plan.surface_format,
            present_mode: plan.present_mode,
            extent: plan.extent,
            generation,
        })
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// Out-of-date is an expected outcome, not an error.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let result =
            unsafe { loader.acquire_next_image(self.handle, timeout_ns, semaphore, vk::Fence::null()) };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired(AcquiredImage {
                index,
                generation: self.generation,
                suboptimal,
            })),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(map_surface_error(e)),
        }
    }

    /// Present an image once `wait_semaphore` is signaled.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image: AcquiredImage,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        image.check_generation(self.generation)?;

        let swapchains = [self.handle];
        let image_indices = [image.index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(false) if image.suboptimal => Ok(PresentOutcome::Suboptimal),
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(map_surface_error(e)),
        }
    }

    /// Destroy the swapchain and its image views.
    ///
    /// # Safety
    /// All handles must be valid and the swapchain must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            loader.destroy_swapchain(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::surface_support;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn unbounded_max_uses_three_images() {
        let mut support = surface_support();
        support.capabilities.min_image_count = 2;
        support.capabilities.max_image_count = 0;

        let plan =
            SwapchainPlan::negotiate(&support, 800, 600, &SwapchainPreferences::default()).unwrap();
        assert_eq!(plan.image_count, 3);
    }

    #[test]
    fn image_count_respects_surface_bounds() {
        let mut caps = surface_support().capabilities;
        caps.min_image_count = 4;
        caps.max_image_count = 6;
        assert_eq!(select_image_count(&caps, 3), 4);

        caps.min_image_count = 1;
        caps.max_image_count = 2;
        assert_eq!(select_image_count(&caps, 3), 2);
    }

    #[test]
    fn format_falls_back_to_first() {
        let preferred = SwapchainPreferences::default().format;
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(select_surface_format(&[unorm], preferred), Some(unorm));
        assert_eq!(
            select_surface_format(&[unorm, preferred], preferred),
            Some(preferred)
        );
        assert_eq!(select_surface_format(&[], preferred), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn extent_clamps_to_surface_limits() {
        let caps = surface_support().capabilities;
        assert_eq!(calculate_extent(&caps, 8000, 600), extent(4096, 600));
        assert_eq!(calculate_extent(&caps, 0, 0), extent(1, 1));
    }

    #[test]
    fn authoritative_extent_wins() {
        let mut caps = surface_support().capabilities;
        caps.current_extent = extent(1280, 720);
        assert_eq!(calculate_extent(&caps, 1920, 1080), extent(1280, 720));
    }

    #[test]
    fn zero_extent_is_rejected() {
        let mut support = surface_support();
        support.capabilities.current_extent = extent(0, 0);
        assert!(matches!(
            SwapchainPlan::negotiate(&support, 0, 0, &SwapchainPreferences::default()),
            Err(RhiError::ZeroExtent { width: 0, height: 0 })
        ));
    }

    #[test]
    fn surface_minimized_after_window_poll() {
        // The window still reported a size, the surface already shrank to nothing.
        let mut support = surface_support();
        support.capabilities.current_extent = extent(0, 0);
        let result =
            SwapchainPlan::negotiate(&support, 1920, 1080, &SwapchainPreferences::default());
        assert!(matches!(result, Err(RhiError::ZeroExtent { .. })));
        assert!(result.is_err_and(|e| e.is_transient()));
    }

    #[test]
    fn negotiation_is_deterministic() {
        let support = surface_support();
        let preferences = SwapchainPreferences::default();

        let first = SwapchainPlan::negotiate(&support, 1920, 1080, &preferences).unwrap();
        let rebuilt = SwapchainPlan::negotiate(&support, 1920, 1080, &preferences).unwrap();
        assert_eq!(first, rebuilt);
    }

    #[test]
    fn resize_sequences_end_in_valid_chain() {
        let preferences = SwapchainPreferences::default();
        let mut support = surface_support();

        for (w, h) in [(0, 0), (640, 480), (0, 0), (0, 0), (1920, 1080)] {
            support.capabilities.current_extent = extent(w, h);
            match SwapchainPlan::negotiate(&support, w, h, &preferences) {
                Ok(plan) => {
                    assert!(plan.extent.width > 0 && plan.extent.height > 0);
                    assert!(plan.image_count >= support.capabilities.min_image_count);
                    assert!(plan.image_count <= support.capabilities.max_image_count);
                }
                Err(e) => assert!(matches!(e, RhiError::ZeroExtent { .. })),
            }
        }

        let last = SwapchainPlan::negotiate(&support, 1920, 1080, &preferences).unwrap();
        assert_eq!(last.extent, extent(1920, 1080));
    }

    #[test]
    fn composite_alpha_preference() {
        assert_eq!(
            select_composite_alpha(
                vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT
            ),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
        assert_eq!(
            select_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
    }

    #[test]
    fn matching_generation_is_accepted() {
        let image = AcquiredImage {
            index: 1,
            generation: 2,
            suboptimal: false,
        };
        assert!(image.check_generation(2).is_ok());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "wrong swapchain generation"))]
    fn image_from_old_generation_is_flagged() {
        let image = AcquiredImage {
            index: 0,
            generation: 1,
            suboptimal: false,
        };
        assert!(matches!(
            image.check_generation(2),
            Err(RhiError::StaleImage {
                expected: 2,
                found: 1
            })
        ));
    }
}
