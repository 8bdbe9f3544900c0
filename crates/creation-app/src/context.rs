//! Application context.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use creation_rhi::command::submit_frame;
use creation_rhi::vk;
use creation_rhi::{
    create_backend, AcquireOutcome, AcquiredImage, CommandRecorder, FrameSyncRing, GpuContext,
    PresentOutcome, RenderTarget, RendererConfig, Result, RetirementQueue, SlotLedger,
    Swapchain,
};
use winit::window::Window;

use crate::driver::FrameBackend;
use crate::frame::FrameContext;

/// Application context shared across all app methods.
///
/// Owns the GPU context and everything sized by the swapchain, and is the
/// Vulkan backend the frame driver runs on.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// Current swapchain.
    pub swapchain: Swapchain,
    sync: FrameSyncRing,
    recorder: CommandRecorder,
    /// Replaced swapchains waiting for their last frames to retire.
    retired: RetirementQueue<Swapchain>,
    /// Frames submitted so far.
    submitted: u64,
    last_frame_time: Instant,
    dt: f32,
    cleaned_up: bool,
}

impl AppContext {
    /// Create the GPU context, swapchain, sync ring, and command buffers.
    pub(crate) fn new(window: Arc<Window>, config: RendererConfig) -> anyhow::Result<Self> {
        let gpu = create_backend(config, window.as_ref())?.into_vulkan()?;

        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);
        let frames_in_flight = gpu.config().frames_in_flight;

        let swapchain = unsafe {
            Swapchain::create(
                gpu.logical_device(),
                gpu.physical_device(),
                gpu.surface(),
                width,
                height,
                &gpu.config().swapchain,
                None,
            )?
        };

        let (sync, recorder) = match unsafe { Self::create_frame_resources(&gpu, &swapchain) } {
            Ok(resources) => resources,
            Err(e) => {
                unsafe { swapchain.destroy(gpu.device(), gpu.swapchain_loader()) };
                return Err(e.into());
            }
        };

        tracing::info!(
            "Frame loop ready: {} frames in flight over {} images",
            frames_in_flight,
            swapchain.image_count()
        );

        Ok(Self {
            window,
            gpu,
            swapchain,
            sync,
            recorder,
            retired: RetirementQueue::new(frames_in_flight),
            submitted: 0,
            last_frame_time: Instant::now(),
            dt: 0.0,
            cleaned_up: false,
        })
    }

    /// # Safety
    /// The GPU context and swapchain must be valid.
    unsafe fn create_frame_resources(
        gpu: &GpuContext,
        swapchain: &Swapchain,
    ) -> Result<(FrameSyncRing, CommandRecorder)> {
        let config = gpu.config();
        let device = gpu.device();

        let mut sync =
            unsafe { FrameSyncRing::new(device, config.frames_in_flight, swapchain.image_count())? };
        let recorder = unsafe {
            CommandRecorder::new(
                device,
                gpu.queue_roles().graphics,
                config.frames_in_flight,
                config.clear_color,
            )
        };

        match recorder {
            Ok(recorder) => Ok((sync, recorder)),
            Err(e) => {
                unsafe { sync.destroy(device) };
                Err(e)
            }
        }
    }

    /// Get the current swapchain extent.
    pub const fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height.max(1) as f32
    }

    /// Number of frame slots (K).
    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    /// Per-slot states, for writing slot-owned descriptor sets.
    pub const fn ledger(&self) -> &SlotLedger {
        self.sync.ledger()
    }

    /// Number of frames submitted.
    pub const fn frames_submitted(&self) -> u64 {
        self.submitted
    }

    /// Delta time measured by the last [`AppContext::begin_frame`].
    pub const fn dt(&self) -> f32 {
        self.dt
    }

    /// Start timing a new frame and return the seconds since the last one.
    pub fn begin_frame(&mut self) -> f32 {
        let now = Instant::now();
        self.dt = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.dt
    }

    /// Color the swapchain image is cleared to before drawing.
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.recorder.set_clear_color(color);
    }

    /// Wait for the device and mark every slot reusable.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.gpu.wait_idle()?;
        self.sync.mark_idle();
        Ok(())
    }

    fn render_target(&self, image_index: u32) -> RenderTarget {
        let index = image_index as usize;
        RenderTarget {
            image: self.swapchain.images[index],
            view: self.swapchain.image_views[index],
            extent: self.swapchain.extent,
            format: self.swapchain.format.format,
        }
    }

    /// Tear down everything this context created, newest first.
    ///
    /// Safe to call more than once.
    pub(crate) fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if let Err(e) = self.wait_idle() {
            tracing::error!("Device idle-wait failed during cleanup: {e}");
        }

        let device = self.gpu.device();
        let loader = self.gpu.swapchain_loader();
        unsafe {
            self.recorder.destroy(device);
            self.sync.destroy(device);
            self.retired.flush(|old| old.destroy(device, loader));
            self.swapchain.destroy(device, loader);
        }
        tracing::info!("Frame resources destroyed after {} frames", self.submitted);
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl FrameBackend for AppContext {
    type Scope<'a> = FrameContext<'a>;

    fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        unsafe { self.sync.wait_for_slot(self.gpu.device(), slot)? };

        let device = self.gpu.device();
        let loader = self.gpu.swapchain_loader();
        let released = self
            .retired
            .process(self.submitted, |old| unsafe { old.destroy(device, loader) });
        if released > 0 {
            tracing::debug!("Destroyed {} retired swapchain(s)", released);
        }
        Ok(())
    }

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        unsafe {
            self.sync
                .acquire_next_image(self.gpu.swapchain_loader(), &self.swapchain, slot)
        }
    }

    fn record<F>(&mut self, slot: usize, image: AcquiredImage, draw: F) -> Result<()>
    where
        F: for<'s> FnOnce(&Self::Scope<'s>) -> Result<()>,
    {
        image.check_generation(self.swapchain.generation)?;
        let target = self.render_target(image.index);

        let gpu = &self.gpu;
        let ledger = self.sync.ledger();
        let dt = self.dt;
        let frame_number = self.submitted;

        unsafe {
            self.recorder
                .record(gpu.device(), ledger, slot, image.index, target, |scope| {
                    draw(&FrameContext {
                        scope,
                        gpu,
                        ledger,
                        dt,
                        frame_number,
                    })
                })?;
        }
        Ok(())
    }

    fn reset_and_arm_fence(&mut self, slot: usize) -> Result<()> {
        unsafe { self.sync.reset_and_arm_fence(self.gpu.device(), slot) }
    }

    fn submit(&mut self, slot: usize, image: AcquiredImage) -> Result<()> {
        let frame = self.sync.slot(slot);
        unsafe {
            submit_frame(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                self.recorder.buffer(slot),
                frame.image_acquired,
                self.sync.render_finished(image.index),
                frame.reusable,
            )?;
        }
        self.sync.mark_submitted(slot);
        self.submitted += 1;
        tracing::trace!("Submitted frame {} on slot {}", self.submitted, slot);
        Ok(())
    }

    fn present(&mut self, image: AcquiredImage) -> Result<PresentOutcome> {
        unsafe {
            self.swapchain.present(
                self.gpu.swapchain_loader(),
                self.gpu.present_queue(),
                image,
                self.sync.render_finished(image.index),
            )
        }
    }

    fn rebuild(&mut self, (width, height): (u32, u32)) -> Result<()> {
        self.wait_idle()?;

        let swapchain = unsafe {
            Swapchain::create(
                self.gpu.logical_device(),
                self.gpu.physical_device(),
                self.gpu.surface(),
                width,
                height,
                &self.gpu.config().swapchain,
                Some(&self.swapchain),
            )?
        };

        let device = self.gpu.device();
        let loader = self.gpu.swapchain_loader();
        let resources = unsafe { Self::create_frame_resources(&self.gpu, &swapchain) };
        let (mut sync, recorder) = match resources {
            Ok(resources) => resources,
            Err(e) => {
                unsafe { swapchain.destroy(device, loader) };
                return Err(e);
            }
        };

        let clear_color = self.recorder.clear_color();
        mem::swap(&mut self.sync, &mut sync);
        let old_recorder = mem::replace(&mut self.recorder, recorder);
        self.recorder.set_clear_color(clear_color);
        unsafe {
            sync.destroy(device);
            old_recorder.destroy(device);
        }

        let old = mem::replace(&mut self.swapchain, swapchain);
        self.retired.queue(old, self.submitted);
        Ok(())
    }
}

