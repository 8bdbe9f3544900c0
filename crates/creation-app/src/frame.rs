//! Per-frame context for rendering.

use creation_rhi::vk;
use creation_rhi::{GpuContext, RecordingScope, SlotLedger};

/// Context for the frame being recorded.
///
/// Dynamic rendering into the swapchain image is active; draws go straight
/// into [`FrameContext::command_buffer`].
pub struct FrameContext<'a> {
    /// The recording scope for this frame.
    pub scope: &'a RecordingScope<'a>,
    /// GPU context with device and queues.
    pub gpu: &'a GpuContext,
    /// Slot states, for writing slot-owned descriptor sets.
    pub ledger: &'a SlotLedger,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Number of frames submitted before this one.
    pub frame_number: u64,
}

impl FrameContext<'_> {
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.scope.command_buffer
    }

    /// Frame slot this frame records into.
    pub const fn slot(&self) -> usize {
        self.scope.slot
    }

    /// Index of the acquired swapchain image.
    pub const fn image_index(&self) -> u32 {
        self.scope.image_index
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.scope.target.extent
    }

    pub const fn color_format(&self) -> vk::Format {
        self.scope.target.format
    }

    pub fn device(&self) -> &ash::Device {
        self.scope.device
    }
}
