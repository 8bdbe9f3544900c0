//! Surface management for windowed rendering.
//!
//! Wraps the Vulkan surface created from a window's raw handles and answers
//! the capability queries the swapchain negotiation needs.

use crate::error::{Result, RhiError};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A presentable Vulkan surface.
pub struct Surface {
    /// The Vulkan surface handle.
    pub handle: vk::SurfaceKHR,
    /// Surface extension loader.
    pub loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The entry and instance must be valid and the window must outlive the surface.
    pub unsafe fn from_window<W>(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &W,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| RhiError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| RhiError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self { handle, loader })
    }

    /// Whether a queue family of the physical device can present to this surface.
    ///
    /// Query errors count as "cannot present".
    ///
    /// # Safety
    /// The physical device must belong to the surface's instance.
    pub unsafe fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
        }
        .unwrap_or(false)
    }

    /// Query surface capabilities, formats, and present modes.
    ///
    /// # Safety
    /// The physical device must belong to the surface's instance.
    pub unsafe fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        let query = || -> std::result::Result<SurfaceSupport, vk::Result> {
            unsafe {
                Ok(SurfaceSupport {
                    capabilities: self
                        .loader
                        .get_physical_device_surface_capabilities(physical_device, self.handle)?,
                    formats: self
                        .loader
                        .get_physical_device_surface_formats(physical_device, self.handle)?,
                    present_modes: self
                        .loader
                        .get_physical_device_surface_present_modes(physical_device, self.handle)?,
                })
            }
        };

        query().map_err(|e| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => RhiError::SurfaceLost,
            other => RhiError::Vulkan(other),
        })
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain created from the surface may still exist.
    pub unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
