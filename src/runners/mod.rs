//! Backend implementations of the GPU seam
#[cfg(feature = "ash")]
pub mod ash;
pub mod headless;

#[cfg(feature = "ash")]
pub use self::ash::AshDevice;
pub use self::headless::{HeadlessDevice, HeadlessSurface};
