//! Command buffer management and per-frame recording.

use crate::error::{Result, RhiError};
use crate::sync::SlotLedger;
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    /// Destroy the command pool and every buffer allocated from it.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit one frame's command buffer.
///
/// Waits on `wait_semaphore` at the color-attachment-output stage, signals
/// `signal_semaphore`, and signals `fence` on completion.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_frame(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    wait_semaphore: vk::Semaphore,
    signal_semaphore: vk::Semaphore,
    fence: vk::Fence,
) -> Result<()> {
    let wait_semaphores = [wait_semaphore];
    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    let command_buffers = [command_buffer];
    let signal_semaphores = [signal_semaphore];

    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(&command_buffers)
        .signal_semaphores(&signal_semaphores);

    unsafe { device.queue_submit(queue, &[submit_info], fence)? };
    Ok(())
}

/// Execute a single-time command buffer and wait for it to finish.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn execute_single_time_commands<F>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let cmd = unsafe { pool.allocate_command_buffers(device, 1)? }[0];

    let result = (|| -> Result<()> {
        unsafe {
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            f(device, cmd);
            end_command_buffer(device, cmd)?;

            let cmd_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
            device.queue_submit(queue, &[submit_info], vk::Fence::null())?;
            device.queue_wait_idle(queue)?;
        }
        Ok(())
    })();

    unsafe { device.free_command_buffers(pool.handle(), &[cmd]) };
    result
}

/// Stage and access masks for one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageTransition {
    /// Make a freshly acquired swapchain image writable as a color attachment.
    ///
    /// Contents are discarded. The wait on the acquire semaphore happens at
    /// color-attachment output, so the barrier chains off that stage.
    pub const fn to_color_attachment() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        }
    }

    /// Hand a rendered image to the presentation engine.
    pub const fn to_present() -> Self {
        Self {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access: vk::AccessFlags2::NONE,
        }
    }

    /// Build the barrier for a single-mip color image.
    pub fn barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            )
    }

    /// Record the transition.
    ///
    /// # Safety
    /// The command buffer must be recording and the image must be valid.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
        let barriers = [self.barrier(image)];
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }
}

/// The image a frame renders into.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Everything a draw callback may use while the frame is recording.
///
/// Rendering is active on `target` when the callback runs; the callback
/// must not transition the target itself.
pub struct RecordingScope<'a> {
    pub device: &'a ash::Device,
    pub command_buffer: vk::CommandBuffer,
    pub target: RenderTarget,
    pub slot: usize,
    pub image_index: u32,
}

impl RecordingScope<'_> {
    /// Viewport and scissor covering the whole target.
    pub fn set_full_viewport(&self) {
        let extent = self.target.extent;
        let viewport = vk::Viewport::default()
            .width(extent.width as f32)
            .height(extent.height as f32)
            .max_depth(1.0);
        let scissor = vk::Rect2D::default().extent(extent);
        unsafe {
            self.device
                .cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }
}

/// One reusable command buffer per frame slot.
pub struct CommandRecorder {
    pool: CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    clear_color: [f32; 4],
}

impl CommandRecorder {
    /// Create a pool on the graphics family with `frames_in_flight` buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        graphics_family: u32,
        frames_in_flight: usize,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let count = u32::try_from(frames_in_flight)
            .map_err(|_| RhiError::InvalidState("Too many frames in flight".to_string()))?;

        let pool = unsafe {
            CommandPool::new(
                device,
                graphics_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let buffers = match unsafe { pool.allocate_command_buffers(device, count) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { pool.destroy(device) };
                return Err(e);
            }
        };

        Ok(Self {
            pool,
            buffers,
            clear_color,
        })
    }

    /// The command buffer owned by `slot`.
    pub fn buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.buffers[slot]
    }

    pub const fn pool(&self) -> &CommandPool {
        &self.pool
    }

    pub const fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Record slot `slot`'s frame into `target`.
    ///
    /// Resets the buffer, transitions the target for rendering, clears it,
    /// runs `draw` inside dynamic rendering, and transitions the target for
    /// presentation. Any failure, including one returned by `draw`, is
    /// reported as [`RhiError::Recording`]. A slot whose fence was not waited
    /// on is refused with [`RhiError::SlotInUse`].
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn record<F>(
        &self,
        device: &ash::Device,
        ledger: &SlotLedger,
        slot: usize,
        image_index: u32,
        target: RenderTarget,
        draw: F,
    ) -> Result<vk::CommandBuffer>
    where
        F: FnOnce(&RecordingScope<'_>) -> Result<()>,
    {
        ledger.check_recordable(slot)?;
        let cmd = self.buffers[slot];
        let recording = |e: RhiError| match e {
            RhiError::Recording(_) => e,
            other => RhiError::Recording(other.to_string()),
        };

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| recording(e.into()))?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .map_err(recording)?;

            ImageTransition::to_color_attachment().record(device, cmd, target.image);

            let color_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(target.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.clear_color,
                    },
                });
            let color_attachments = [color_attachment];
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D::default().extent(target.extent))
                .layer_count(1)
                .color_attachments(&color_attachments);

            device.cmd_begin_rendering(cmd, &rendering_info);
        }

        let scope = RecordingScope {
            device,
            command_buffer: cmd,
            target,
            slot,
            image_index,
        };
        let drawn = draw(&scope);

        unsafe {
            device.cmd_end_rendering(cmd);
        }
        drawn.map_err(recording)?;

        unsafe {
            ImageTransition::to_present().record(device, cmd, target.image);
            end_command_buffer(device, cmd).map_err(recording)?;
        }

        tracing::trace!("Recorded slot {} into image {}", slot, image_index);
        Ok(cmd)
    }

    /// Destroy the pool and its buffers.
    ///
    /// # Safety
    /// The device must be valid and no buffer may be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { self.pool.destroy(device) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_attachment_transition_masks() {
        let t = ImageTransition::to_color_attachment();
        assert_eq!(t.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(t.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(t.src_stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(t.src_access, vk::AccessFlags2::NONE);
        assert_eq!(t.dst_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn present_transition_masks() {
        let t = ImageTransition::to_present();
        assert_eq!(t.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(t.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(t.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(t.dst_access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn transitions_chain_layouts() {
        assert_eq!(
            ImageTransition::to_color_attachment().new_layout,
            ImageTransition::to_present().old_layout
        );
    }

    #[test]
    fn masks_avoid_all_commands() {
        for t in [
            ImageTransition::to_color_attachment(),
            ImageTransition::to_present(),
        ] {
            assert!(!t.src_stage.contains(vk::PipelineStageFlags2::ALL_COMMANDS));
            assert!(!t.dst_stage.contains(vk::PipelineStageFlags2::ALL_COMMANDS));
        }
    }

    #[test]
    fn barrier_targets_whole_color_image() {
        let barrier = ImageTransition::to_present().barrier(vk::Image::null());
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(barrier.subresource_range.level_count, 1);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
