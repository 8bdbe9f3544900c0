//! `App` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for Creation applications.
///
/// The framework owns the window, the GPU context, and the frame loop:
/// swapchain images are acquired, transitioned, cleared, submitted, and
/// presented for you.
pub trait App: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context and swapchain exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering, so per-frame settings such as
    /// the clear color can still change.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Record draws for the frame.
    ///
    /// Rendering into the swapchain image is already active. An error drops
    /// the frame and rebuilds the swapchain.
    fn render(&mut self, frame: &FrameContext<'_>) -> anyhow::Result<()>;

    /// Handle a swapchain rebuild.
    ///
    /// Recreate anything that referenced the old swapchain images.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
