//! Creation Engine Demo Viewer
//!
//! Clears the window with an animated color while running the full frame
//! loop: slot waits, image acquisition, per-slot uniforms and descriptor
//! writes, submission, presentation and swapchain rebuilds on resize.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p creation-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vsync`: Present with FIFO instead of MAILBOX
//! - `--frames-in-flight <N>`: Number of frame slots (default: 2)
//! - `--target-fps <N>`: Sleep to hold this frame rate
//! - `--validation` / `--no-validation`: Toggle the Khronos validation layer
//! - `-h, --help`: Print help message
//!
//! Press Space to pause the animation.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use creation_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Command-line options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Options {
    help: bool,
    vsync: bool,
    frames_in_flight: Option<usize>,
    target_fps: Option<u32>,
    validation: Option<bool>,
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => options.help = true,
                "--vsync" => options.vsync = true,
                "--validation" => options.validation = Some(true),
                "--no-validation" => options.validation = Some(false),
                "--frames-in-flight" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--frames-in-flight needs a value"))?;
                    let frames: usize = value.parse()?;
                    anyhow::ensure!(frames > 0, "--frames-in-flight must be at least 1");
                    options.frames_in_flight = Some(frames);
                }
                "--target-fps" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--target-fps needs a value"))?;
                    options.target_fps = Some(value.parse()?);
                }
                other => anyhow::bail!("Unknown option '{other}' (see --help)"),
            }
        }

        Ok(options)
    }

    fn into_config(self) -> AppConfig {
        let mut config = AppConfig::new("Creation Engine - Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(self.vsync);
        if let Some(frames) = self.frames_in_flight {
            config = config.with_frames_in_flight(frames);
        }
        if let Some(fps) = self.target_fps {
            config = config.with_target_fps(fps);
        }
        if let Some(validation) = self.validation {
            config = config.with_validation(validation);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse(std::env::args().skip(1))?;
    if options.help {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(options.into_config())
}

fn print_help() {
    eprintln!(
        "Creation Engine Demo Viewer

USAGE:
    cargo run -p creation-viewer -- [OPTIONS]

OPTIONS:
    --vsync                 Present with FIFO instead of MAILBOX
    --frames-in-flight <N>  Number of frame slots (default: 2)
    --target-fps <N>        Sleep to hold this frame rate
    --validation            Enable the Khronos validation layer
    --no-validation         Disable the Khronos validation layer
    -h, --help              Print this help message

CONTROLS:
    Space                   Pause or resume the animation

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use creation_app::RendererConfig;

    fn parse(args: &[&str]) -> anyhow::Result<Options> {
        Options::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn no_arguments_keep_defaults() {
        let options = parse(&[]).unwrap();
        assert_eq!(options, Options::default());

        let config = options.into_config();
        assert_eq!(config.width, WIDTH);
        assert_eq!(
            config.renderer.frames_in_flight,
            RendererConfig::default().frames_in_flight
        );
    }

    #[test]
    fn options_reach_the_renderer_config() {
        let config = parse(&["--vsync", "--frames-in-flight", "3", "--no-validation"])
            .unwrap()
            .into_config();

        assert_eq!(config.renderer.frames_in_flight, 3);
        assert!(!config.renderer.validation);
        assert_eq!(
            config.renderer.swapchain.present_mode,
            creation_rhi::vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(parse(&["--frames-in-flight"]).is_err());
        assert!(parse(&["--frames-in-flight", "0"]).is_err());
        assert!(parse(&["--target-fps", "fast"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
