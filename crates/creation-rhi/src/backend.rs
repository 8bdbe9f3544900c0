//! Graphics API backend selection.
//!
//! The set of backends is closed. Only Vulkan is implemented; asking for
//! another backend fails with [`RhiError::Unsupported`].

use crate::context::{GpuContext, GpuContextBuilder, RendererConfig};
use crate::error::{Result, RhiError};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Graphics API a renderer can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    Vulkan,
    Direct3D12,
}

impl BackendKind {
    pub const ALL: [Self; 2] = [Self::Vulkan, Self::Direct3D12];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Vulkan => "Vulkan",
            Self::Direct3D12 => "Direct3D 12",
        }
    }

    /// Whether the backend is implemented and its runtime can be loaded.
    pub fn is_available(self) -> bool {
        match self {
            Self::Vulkan => unsafe { ash::Entry::load() }.is_ok(),
            Self::Direct3D12 => false,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Backends usable on this machine.
pub fn available_backends() -> Vec<BackendKind> {
    BackendKind::ALL
        .into_iter()
        .filter(|kind| kind.is_available())
        .collect()
}

/// A live renderer backend.
pub enum Backend {
    Vulkan(GpuContext),
}

impl Backend {
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Vulkan(_) => BackendKind::Vulkan,
        }
    }

    /// Unwrap the Vulkan context.
    pub fn into_vulkan(self) -> Result<GpuContext> {
        match self {
            Self::Vulkan(context) => Ok(context),
        }
    }
}

/// Create the backend named by `config.backend`.
pub fn create_backend<W>(config: RendererConfig, window: &W) -> Result<Backend>
where
    W: HasDisplayHandle + HasWindowHandle,
{
    match config.backend {
        BackendKind::Vulkan => {
            tracing::info!("Creating {} backend", config.backend);
            GpuContextBuilder::new(config).build(window).map(Backend::Vulkan)
        }
        BackendKind::Direct3D12 => Err(RhiError::Unsupported(BackendKind::Direct3D12.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{DisplayHandle, HandleError, WindowHandle};

    struct NoWindow;

    impl HasDisplayHandle for NoWindow {
        fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl HasWindowHandle for NoWindow {
        fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    #[test]
    fn direct3d12_is_unsupported() {
        let config = RendererConfig::default().backend(BackendKind::Direct3D12);
        let result = create_backend(config, &NoWindow);
        assert!(matches!(result, Err(RhiError::Unsupported(_))));
        assert!(!BackendKind::Direct3D12.is_available());
    }

    #[test]
    fn unavailable_backends_are_filtered() {
        assert!(!available_backends().contains(&BackendKind::Direct3D12));
    }

    #[test]
    fn backend_names() {
        assert_eq!(BackendKind::Vulkan.to_string(), "Vulkan");
        assert_eq!(BackendKind::default(), BackendKind::Vulkan);
    }
}
