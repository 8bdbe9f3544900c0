//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use creation_rhi::vk;
use creation_rhi::{RendererConfig, RhiError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::App;
use crate::context::AppContext;
use crate::driver::{FrameDriver, TickOutcome};
use crate::frame::FrameContext;
use crate::window::WinitWindow;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Device, swapchain and frame loop settings.
    pub renderer: RendererConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Creation".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            renderer: RendererConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            renderer: RendererConfig::default().app_name(title.clone()),
            title,
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Present with FIFO when `vsync` is set, otherwise prefer MAILBOX.
    #[must_use]
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        let mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        };
        self.renderer = self.renderer.present_mode(mode);
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.renderer = self.renderer.validation(validation);
        self
    }

    /// Set the number of frame slots.
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.renderer = self.renderer.frames_in_flight(frames);
        self
    }

    /// Replace the renderer configuration.
    #[must_use]
    pub fn with_renderer(mut self, renderer: RendererConfig) -> Self {
        self.renderer = renderer;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. Does nothing if a
/// subscriber is already installed.
pub fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,creation_app=trace,creation_rhi=trace,creation_viewer=trace")
        });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .try_init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    }
}

/// Run an [`App`] with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the window closes or a frame fails unrecoverably.
pub fn run_app<A: App + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Min/max/average frame rate over a run.
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    frames: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            frames: 0,
        }
    }
}

impl FrameStats {
    /// Add a frame that took `dt` seconds. Zero-length frames are ignored.
    pub fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = self.min_fps.min(fps);
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.frames += 1;
    }

    pub const fn frames(&self) -> u64 {
        self.frames
    }

    pub fn min(&self) -> Option<f64> {
        (self.frames > 0).then_some(self.min_fps)
    }

    pub fn max(&self) -> Option<f64> {
        (self.frames > 0).then_some(self.max_fps)
    }

    pub fn average(&self) -> Option<f64> {
        (self.frames > 0).then(|| self.fps_sum / self.frames as f64)
    }

    fn log(&self) {
        if let (Some(min), Some(max), Some(avg)) = (self.min(), self.max(), self.average()) {
            info!("FPS Statistics:");
            info!("  Min: {:.1}", min);
            info!("  Max: {:.1}", max);
            info!("  Avg: {:.1}", avg);
            info!("  Total frames: {}", self.frames);
        }
    }
}

/// Event loop mode: redraw continuously unless the window has no area.
///
/// A minimized window sleeps until winit reports an event such as the
/// resize that restores it.
const fn control_flow(minimized: bool) -> ControlFlow {
    if minimized {
        ControlFlow::Wait
    } else {
        ControlFlow::Poll
    }
}

/// Implements winit's `ApplicationHandler` around an [`App`].
struct AppRunner<A: App> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: App> {
    app: A,
    ctx: AppContext,
    window: WinitWindow,
    driver: FrameDriver,
    target_frame_time: Option<Duration>,
    stats: FrameStats,
}

impl<A: App + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };
        if state.app.on_event(&event) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                state.window.mark_closed();
                self.shutdown(event_loop);
            }
            WindowEvent::Resized(_) => state.window.mark_resized(),
            WindowEvent::RedrawRequested => {
                let result = state.render_frame();
                match result {
                    Ok(true) if !state.window.is_minimized() => state.window.request_redraw(),
                    Ok(true) => {}
                    Ok(false) => self.shutdown(event_loop),
                    Err(e) => {
                        error!("Frame loop stopped: {e:#}");
                        self.failure = Some(e);
                        self.shutdown(event_loop);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            let minimized = state.window.is_minimized();
            event_loop.set_control_flow(control_flow(minimized));
            if !minimized {
                state.window.request_redraw();
            }
        }
    }
}

impl<A: App + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut ctx = AppContext::new(Arc::clone(&window), self.config.renderer.clone())?;
        info!("GPU: {}", ctx.gpu.adapter_summary());

        let app = A::init(&mut ctx)?;
        let driver = FrameDriver::new(ctx.frames_in_flight());

        Ok(AppState {
            app,
            ctx,
            window: WinitWindow::new(window),
            driver,
            target_frame_time: self.config.target_frame_time(),
            stats: FrameStats::default(),
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: App> AppState<A> {
    /// Run one frame. Returns `false` once the window has closed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<bool> {
        // Nothing can be presented to a zero-sized surface; the event loop
        // keeps running until the window is restored.
        if self.window.is_minimized() {
            return Ok(true);
        }

        let frame_start = Instant::now();
        let dt = self.ctx.begin_frame();
        self.stats.record(dt);

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            self.app.update(&mut self.ctx, dt);
        }

        let app = &mut self.app;
        let outcome = self
            .driver
            .tick(&mut self.ctx, &mut self.window, |frame: &FrameContext<'_>| {
                app.render(frame)
                    .map_err(|e| RhiError::Recording(format!("{e:#}")))
            })?;

        match outcome {
            TickOutcome::Closed => return Ok(false),
            TickOutcome::Rebuilt {
                extent: (width, height),
            } => self.app.on_resize(&mut self.ctx, width, height)?,
            TickOutcome::Presented { .. } => {}
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                #[cfg(feature = "profiling-tracy")]
                let _span = tracing::trace_span!("frame.pacing").entered();
                thread::sleep(target - elapsed);
            }
        }

        Ok(true)
    }

    fn cleanup(&mut self) {
        self.stats.log();

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);
        self.ctx.cleanup();

        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn stats_track_min_max_average() {
        let mut stats = FrameStats::default();
        assert_eq!(stats.average(), None);

        stats.record(0.01);
        stats.record(0.02);
        stats.record(0.0);

        assert_eq!(stats.frames(), 2);
        assert_relative_eq!(stats.max().unwrap(), 100.0, epsilon = 1e-3);
        assert_relative_eq!(stats.min().unwrap(), 50.0, epsilon = 1e-3);
        assert_relative_eq!(stats.average().unwrap(), 75.0, epsilon = 1e-3);
    }

    #[test]
    fn minimized_window_stops_polling() {
        assert_eq!(control_flow(true), ControlFlow::Wait);
        assert_eq!(control_flow(false), ControlFlow::Poll);
    }

    #[test]
    fn vsync_selects_fifo() {
        let config = AppConfig::new("test").with_vsync(true);
        assert_eq!(config.renderer.swapchain.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.renderer.app_name, "test");

        let config = config.with_vsync(false);
        assert_eq!(config.renderer.swapchain.present_mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn target_fps_becomes_frame_time() {
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
        assert_eq!(AppConfig::default().target_frame_time(), None);
    }
}
