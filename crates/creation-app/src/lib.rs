//! Application framework for the Creation engine.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and event handling
//! - GPU context and swapchain setup
//! - The frame driver: slot waits, image acquisition, recording, submission,
//!   presentation, and swapchain rebuilds
//!
//! # Example
//!
//! ```no_run
//! use creation_app::{run_app, App, AppConfig, AppContext, FrameContext};
//!
//! struct MyApp;
//!
//! impl App for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _frame: &FrameContext<'_>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::new("My App"))
//! }
//! ```

mod app;
mod context;
pub mod driver;
mod frame;
mod runner;
pub mod window;

pub use app::App;
pub use context::AppContext;
pub use driver::{FrameBackend, FrameDriver, FrameState, TickOutcome, WindowSource};
pub use frame::FrameContext;
pub use runner::{init_logging, run_app, AppConfig, FrameStats};
pub use window::WinitWindow;

// Re-export commonly used types for convenience
pub use creation_rhi::{GpuContext, RendererConfig};
pub use winit::event::WindowEvent;
