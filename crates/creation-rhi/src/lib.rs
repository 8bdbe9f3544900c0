//! Rendering hardware interface for the Creation engine.
//!
//! This crate provides:
//! - Adapter capability negotiation and logical device creation
//! - Surface and swapchain lifecycle with deferred retirement
//! - The frame slot synchronization ring
//! - Per-frame command recording with dynamic rendering
//! - Descriptor pools, per-slot resources, and shared samplers
//! - Memory allocation via gpu-allocator

pub mod adapter;
pub mod backend;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod retire;
pub mod sampler;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use adapter::{
    negotiate, select_adapter, AdapterClass, AdapterDescriptor, AdapterFeatures,
    AdapterRequirements, GpuVendor, QueueFamilyRoles,
};
pub use backend::{available_backends, create_backend, Backend, BackendKind};
pub use command::{CommandPool, CommandRecorder, ImageTransition, RecordingScope, RenderTarget};
pub use context::{GpuContext, GpuContextBuilder, OverlayTargets, PipelineTargets, RendererConfig};
pub use descriptors::{
    BindingGroupLayout, BindingPool, DescriptorSetLayoutBuilder, PerSlot, PoolBudget,
    ResourceKind, ResourceRef,
};
pub use device::{feature_chain, DeviceBuilder, FeatureLevel, FeatureRequest, LogicalDevice};
pub use error::{Result, RhiError};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use retire::RetirementQueue;
pub use sampler::{SamplerCache, SamplerDesc, SamplerHandle};
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::{
    AcquireOutcome, AcquiredImage, PresentOutcome, Swapchain, SwapchainPlan,
    SwapchainPreferences,
};
pub use sync::{FrameSlot, FrameSyncRing, SlotLedger, SlotState};

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
