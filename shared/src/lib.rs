//! Shared types for the particle renderer

pub mod particles;

pub use particles::{Bounds, Particle, ViewportPush};

/// Version string written into the metrics header
pub const APP_VERSION: &str = "1.0-frame-pacing";

// window / simulation constants

/// Initial window width in logical pixels
pub const WINDOW_WIDTH: u32 = 1920;
/// Initial window height in logical pixels
pub const WINDOW_HEIGHT: u32 = 1080;
/// Number of particles spawned at startup
pub const PARTICLE_COUNT: usize = 10_000;
/// Fixed particle radius in pixels
pub const PARTICLE_RADIUS: f32 = 2.0;
/// Speed every particle starts with, in pixels per second
pub const PARTICLE_SPEED: f32 = 50.0;
/// Upper bound applied to the frame delta before stepping the simulation
pub const MAX_DELTA_TIME: f32 = 0.1;

// frame pacing constants

/// Number of frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Color the render pass clears to
pub const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];
/// Depth the render pass clears to
pub const CLEAR_DEPTH: f32 = 1.0;
