//! Common interface for D3D9-to-Vulkan interop backends.

use std::ffi::c_void;

/// Opaque pointer to a native D3D9 object (device, texture or surface).
///
/// Never owned: the pointee belongs to the D3D9 runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativePtr(pub *mut c_void);

impl NativePtr {
    pub const NULL: Self = Self(std::ptr::null_mut());

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Pointer value as published in interop handle lists.
    pub fn addr(self) -> u64 {
        self.0 as usize as u64
    }
}

/// Parameters for a Vulkan sibling of a D3D9 render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCreateInfo {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// `D3DFORMAT` of the D3D9 resource.
    pub format: u32,
    /// Bridge usage bits.
    pub usage_flags: u32,
    pub sample_count: u32,
}

/// Vulkan-side identity of an interop surface.
///
/// Only produced for results the backend marked valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceInfo {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: u32,
    pub usage_flags: u32,
    pub sample_count: u32,
    pub row_pitch: u32,
    pub depth_pitch: u32,
    pub image: u64,
    pub image_view: u64,
    pub memory: u64,
    pub allocation_size: u64,
    pub win32_handle: u64,
    pub opaque_fd: Option<i32>,
}

/// One side of a frame's semaphore pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphorePoint {
    pub semaphore: u64,
    pub value: u64,
    pub is_timeline: bool,
}

/// GPU synchronization primitives bracketing the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSync {
    pub acquire: Option<SemaphorePoint>,
    pub release: Option<SemaphorePoint>,
    pub completion_fence: Option<u64>,
}

/// Capability object for querying or creating Vulkan siblings of D3D9
/// resources.
///
/// Callers branch on [`InteropBackend::is_available`] once; every other method
/// fails closed (returns `false` / `None`) when the backend cannot serve it.
pub trait InteropBackend: Send + Sync {
    /// Hand the D3D9 device to the backend. Returns `false` if unavailable.
    fn initialize(&self, device: NativePtr) -> bool;

    fn is_available(&self) -> bool;

    /// Describe the Vulkan image backing an existing D3D9 texture.
    fn surface_info(&self, texture: NativePtr) -> Option<SurfaceInfo>;

    /// Create a Vulkan image sharing memory with a new D3D9 resource.
    fn create_sibling_surface(&self, device: NativePtr, info: &SurfaceCreateInfo) -> Option<SurfaceInfo>;

    fn frame_sync(&self, device: NativePtr) -> Option<FrameSync>;

    /// Copy a D3D9 surface into the sibling image. Used for validation.
    fn debug_upload(&self, surface: NativePtr, info: &SurfaceInfo) -> bool;

    /// Copy the sibling image back into a D3D9 surface. Used for validation.
    fn debug_download(&self, surface: NativePtr, info: &SurfaceInfo) -> bool;
}

/// Backend used when interop is disabled or no extension module exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl InteropBackend for UnavailableBackend {
    fn initialize(&self, _device: NativePtr) -> bool {
        false
    }

    fn is_available(&self) -> bool {
        false
    }

    fn surface_info(&self, _texture: NativePtr) -> Option<SurfaceInfo> {
        None
    }

    fn create_sibling_surface(&self, _device: NativePtr, _info: &SurfaceCreateInfo) -> Option<SurfaceInfo> {
        None
    }

    fn frame_sync(&self, _device: NativePtr) -> Option<FrameSync> {
        None
    }

    fn debug_upload(&self, _surface: NativePtr, _info: &SurfaceInfo) -> bool {
        false
    }

    fn debug_download(&self, _surface: NativePtr, _info: &SurfaceInfo) -> bool {
        false
    }
}
