//! RHI error types.

use ash::vk;
use thiserror::Error;

/// Errors raised by the rendering hardware interface.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// No enumerated adapter satisfies the requirements.
    #[error("No suitable GPU adapter found")]
    NoSuitableAdapter,

    /// The driver rejected the requested feature/extension combination.
    #[error("Logical device creation failed: {0}")]
    DeviceCreation(vk::Result),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// The presentation surface is no longer valid.
    #[error("Presentation surface lost")]
    SurfaceLost,

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The surface currently has no area, e.g. while the window is minimized.
    #[error("Surface extent is {width}x{height}")]
    ZeroExtent { width: u32, height: u32 },

    /// An image acquired from one swapchain generation was used with another.
    #[error("Image from swapchain generation {found} used with generation {expected}")]
    StaleImage { expected: u64, found: u64 },

    /// The descriptor pool has no room for more sets.
    #[error("Descriptor pool exhausted: {requested} sets requested, {available} of {capacity} left")]
    PoolExhausted {
        capacity: u32,
        available: u32,
        requested: u32,
    },

    /// A slot-owned resource was touched while the slot's GPU work is still pending.
    #[error("Frame slot {0} is still in flight")]
    SlotInUse(usize),

    /// Command recording failed for the current frame.
    #[error("Command recording failed: {0}")]
    Recording(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The requested backend is not implemented.
    #[error("Backend not supported: {0}")]
    Unsupported(&'static str),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RhiError {
    /// Whether this error ends the current frame but not the renderer.
    ///
    /// Transient errors are handled by rebuilding the swapchain, or by
    /// waiting for the window to become drawable again.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Recording(_)
                | Self::StaleImage { .. }
                | Self::ZeroExtent { .. }
                | Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RhiError::Recording("bad state".into()).is_transient());
        assert!(RhiError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_transient());
        assert!(RhiError::ZeroExtent { width: 0, height: 0 }.is_transient());
        assert!(!RhiError::SurfaceLost.is_transient());
        assert!(!RhiError::NoSuitableAdapter.is_transient());
        assert!(!RhiError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_transient());
    }
}
