//! D3D9-to-Vulkan interop backends.
//!
//! This crate defines the [`InteropBackend`] trait, a capability object that
//! answers "which Vulkan image backs this D3D9 texture" and can create new
//! Vulkan siblings for D3D9 render targets. The [`dxvk`] backend binds to the
//! optional interop extension shipped with the translation layer; the
//! [`UnavailableBackend`] stands in when interop is switched off.

pub mod backend;
pub use backend::{
    FrameSync, InteropBackend, NativePtr, SemaphorePoint, SurfaceCreateInfo, SurfaceInfo, UnavailableBackend,
};

pub mod dxvk;
