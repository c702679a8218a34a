//! Bouncing particles library
//!
//! A 2D particle simulation drawn through Vulkan, built around:
//! - [`frame_sync`]: per-frame-in-flight fences and semaphores
//! - [`upload`]: staging-buffer uploads of the particle snapshot
//! - [`orchestrator`]: the per-frame sequence and swapchain rebuilds
//!
//! These are generic over the [`gpu`] traits and run against Vulkan
//! (`ash` feature) or the in-process headless backend.

pub mod config;
pub mod error;
pub mod frame_sync;
pub mod gpu;
#[cfg(feature = "ash")]
pub mod graphics;
pub mod metrics;
pub mod orchestrator;
pub mod resources;
pub mod runners;
pub mod simulation;
pub mod upload;

pub use error::{CrateResult, ParticlesError};
pub use orchestrator::{FrameOrchestrator, FrameOutcome, FrameStats};
pub use simulation::ParticleSystem;
