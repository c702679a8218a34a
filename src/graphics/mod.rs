//! Vulkan presentation backend
//!
//! - [`device`]: instance, surface, physical/logical device and queues
//! - [`swapchain`]: the swapchain and the resources sized to it
//! - [`pipeline`]: render pass and point-list pipeline for particles
//! - [`renderer`]: the [`PresentationSurface`](crate::gpu::PresentationSurface)
//!   that records, submits and presents frames

pub mod debug;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod renderer;
pub mod swapchain;

pub use device::VulkanContext;
pub use renderer::SwapchainRenderer;
