use crate::error::{CrateResult, ParticlesError};
use ash::{prelude::VkResult, vk};
use std::path::PathBuf;
use thiserror::Error;

/// Setup failures of the Vulkan backend
#[derive(Error, Debug)]
pub enum GraphicsError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("Window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("No physical device supports graphics, presentation and swapchains")]
    NoSuitableDevice,

    #[error("The surface offers no formats")]
    NoSurfaceFormat,

    #[error("No supported depth attachment format")]
    NoDepthFormat,

    #[error("Failed to read shader {path}: {source}")]
    Shader {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Attach the failing call to a raw Vulkan result
pub trait VkResultExt<T> {
    fn context(self, origin: &str) -> CrateResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn context(self, origin: &str) -> CrateResult<T> {
        self.map_err(|code: vk::Result| ParticlesError::gpu(origin, code.as_raw(), format!("{code:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_errors_keep_origin_and_code() {
        let result: VkResult<()> = Err(vk::Result::ERROR_DEVICE_LOST);
        match result.context("vkQueueSubmit") {
            Err(ParticlesError::Gpu { origin, code, detail }) => {
                assert_eq!(origin, "vkQueueSubmit");
                assert_eq!(code, -4);
                assert_eq!(detail, "ERROR_DEVICE_LOST");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
