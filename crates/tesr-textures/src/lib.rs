//! D3D9 render-target management for the plugin side of the bridge.
//!
//! [`TextureManager`] owns the render targets, resolves their Vulkan siblings
//! through a [`gpu_interop::InteropBackend`] and publishes them to the
//! registry.

pub mod config;
pub mod d3d9;
pub mod format;
pub mod manager;
#[cfg(target_os = "windows")]
pub mod win32;

pub use config::InteropEnv;
pub use d3d9::{D3d9Device, D3d9Surface, D3d9Texture, D3dFormat, RenderTarget, ResourceSlot, SurfaceDesc, TextureUsage};
pub use manager::{TextureManager, COLOR_TARGET_USAGE, DEPTH_TARGET_USAGE};
