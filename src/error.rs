//! Error types for the library

use thiserror::Error;

/// Error types for the particle renderer
#[derive(Error, Debug)]
pub enum ParticlesError {
    /// A GPU call failed. `code` is the raw API result code.
    #[error("{origin} failed: {detail} (code {code})")]
    Gpu {
        origin: String,
        code: i32,
        detail: String,
    },

    #[error("Timed out waiting for the fence of frame slot {slot}")]
    FenceTimeout { slot: usize },

    #[error("Fence of frame slot {slot} reset before its completion was observed")]
    FenceNotWaited { slot: usize },

    #[error("Frame slot {slot} out of range ({count} slots)")]
    SlotOutOfRange { slot: usize, count: usize },

    #[error("At least one frame in flight is required")]
    NoFrameSlots,

    #[error("Write of {len} bytes exceeds buffer size ({size})")]
    BufferOverflow { len: u64, size: u64 },

    #[error("Invalid simulation parameters: {0}")]
    InvalidSimulation(String),

    #[error("No suitable Vulkan device found among {0} devices")]
    NoVulkanDevice(usize),

    #[error("Failed to find suitable memory type")]
    NoSuitableMemoryType,

    #[cfg(feature = "ash")]
    #[error("Graphics error: {0}")]
    Graphics(#[from] crate::graphics::error::GraphicsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ParticlesError {
    /// Build a [`ParticlesError::Gpu`] from a call site description and a result code
    pub fn gpu(origin: impl Into<String>, code: i32, detail: impl Into<String>) -> Self {
        ParticlesError::Gpu {
            origin: origin.into(),
            code,
            detail: detail.into(),
        }
    }
}

/// Convenience type alias for Results with [`ParticlesError`]
pub type CrateResult<T> = std::result::Result<T, ParticlesError>;
