//! Run configuration
//!
//! There is no command line or config file; everything comes from the
//! compiled-in constants in `shared`.

use crate::gpu::{Extent, Timeout};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub window_title: String,
    pub window_extent: Extent,
    pub particle_count: usize,
    pub frames_in_flight: usize,
    pub metrics_dir: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    /// Enable the Khronos validation layer and route its messages to tracing
    pub enable_validation: bool,
    pub fence_timeout: Timeout,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window_title: "Bouncing Particles".to_string(),
            window_extent: Extent::new(shared::WINDOW_WIDTH, shared::WINDOW_HEIGHT),
            particle_count: shared::PARTICLE_COUNT,
            frames_in_flight: shared::MAX_FRAMES_IN_FLIGHT,
            metrics_dir: PathBuf::from("metrics_output"),
            vertex_shader: PathBuf::from("shaders/particle.vert.spv"),
            fragment_shader: PathBuf::from("shaders/particle.frag.spv"),
            enable_validation: cfg!(debug_assertions),
            fence_timeout: Timeout::Infinite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_shared_constants() {
        let config = AppConfig::default();
        assert_eq!(config.window_extent, Extent::new(1920, 1080));
        assert_eq!(config.particle_count, 10_000);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.fence_timeout, Timeout::Infinite);
        assert_eq!(config.enable_validation, cfg!(debug_assertions));
    }
}
