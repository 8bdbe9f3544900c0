//! Window state consumed by the frame driver.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use winit::window::Window;

use crate::driver::WindowSource;

/// How long [`WinitWindow::wait_events`] sleeps between extent polls.
const POLL_INTERVAL: Duration = Duration::from_millis(16);

/// A winit window plus the flags the event loop raises for it.
pub struct WinitWindow {
    window: Arc<Window>,
    resized: bool,
    closed: bool,
}

impl WinitWindow {
    pub const fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            resized: false,
            closed: false,
        }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Record a `Resized` event.
    pub fn mark_resized(&mut self) {
        self.resized = true;
    }

    /// Record a `CloseRequested` event.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Whether the window currently has no drawable area.
    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.framebuffer_extent();
        width == 0 || height == 0
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl WindowSource for WinitWindow {
    fn framebuffer_extent(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    // The event loop is not re-entrant, so the size is polled directly.
    fn wait_events(&mut self) {
        thread::sleep(POLL_INTERVAL);
    }
}
