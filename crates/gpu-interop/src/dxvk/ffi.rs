//! C-repr structs and entry point signatures of the DXVK interop extension.

#![allow(non_snake_case)]

use std::ffi::c_void;

use crate::backend::{FrameSync, SemaphorePoint, SurfaceCreateInfo, SurfaceInfo};

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct DxvkInteropSurfaceCreateInfo {
    pub width: u32,
    pub height: u32,
    pub mipLevels: u32,
    pub arrayLayers: u32,
    pub format: u32,
    pub usageFlags: u32,
    pub sampleCount: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DxvkInteropExternalMemory {
    pub win32Handle: u64,
    pub opaqueFd: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DxvkInteropSurfaceInfo {
    pub valid: bool,
    pub width: u32,
    pub height: u32,
    pub mipLevels: u32,
    pub arrayLayers: u32,
    pub format: u32,
    pub usageFlags: u32,
    pub sampleCount: u32,
    pub rowPitch: u32,
    pub depthPitch: u32,
    pub image: u64,
    pub imageView: u64,
    pub memory: u64,
    pub allocationSize: u64,
    pub externalMemory: DxvkInteropExternalMemory,
}

impl Default for DxvkInteropSurfaceInfo {
    /// Zeroed, with the fd set to -1 ("none").
    fn default() -> Self {
        Self {
            valid: false,
            width: 0,
            height: 0,
            mipLevels: 0,
            arrayLayers: 0,
            format: 0,
            usageFlags: 0,
            sampleCount: 0,
            rowPitch: 0,
            depthPitch: 0,
            image: 0,
            imageView: 0,
            memory: 0,
            allocationSize: 0,
            externalMemory: DxvkInteropExternalMemory {
                win32Handle: 0,
                opaqueFd: -1,
            },
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct DxvkInteropFrameSync {
    pub valid: bool,
    pub acquireSemaphore: u64,
    pub acquireValue: u64,
    pub acquireIsTimeline: bool,
    pub releaseSemaphore: u64,
    pub releaseValue: u64,
    pub releaseIsTimeline: bool,
    pub completionFence: u64,
}

pub type PFN_dxvk_interop_initialize = unsafe extern "C" fn(device: *mut c_void) -> bool;
pub type PFN_dxvk_interop_is_available = unsafe extern "C" fn() -> bool;
pub type PFN_dxvk_interop_get_surface_info =
    unsafe extern "C" fn(texture: *mut c_void, out: *mut DxvkInteropSurfaceInfo) -> bool;
pub type PFN_dxvk_interop_create_sibling_surface = unsafe extern "C" fn(
    device: *mut c_void,
    info: *const DxvkInteropSurfaceCreateInfo,
    out: *mut DxvkInteropSurfaceInfo,
) -> bool;
pub type PFN_dxvk_interop_get_frame_sync =
    unsafe extern "C" fn(device: *mut c_void, out: *mut DxvkInteropFrameSync) -> bool;
pub type PFN_dxvk_interop_debug_upload =
    unsafe extern "C" fn(surface: *mut c_void, info: *const DxvkInteropSurfaceInfo) -> bool;
pub type PFN_dxvk_interop_debug_download =
    unsafe extern "C" fn(surface: *mut c_void, info: *const DxvkInteropSurfaceInfo) -> bool;

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<&SurfaceCreateInfo> for DxvkInteropSurfaceCreateInfo {
    fn from(info: &SurfaceCreateInfo) -> Self {
        Self {
            width: info.width,
            height: info.height,
            mipLevels: info.mip_levels,
            arrayLayers: info.array_layers,
            format: info.format,
            usageFlags: info.usage_flags,
            sampleCount: info.sample_count,
        }
    }
}

impl DxvkInteropSurfaceInfo {
    /// `None` unless the backend flagged the result valid.
    pub fn to_surface_info(&self) -> Option<SurfaceInfo> {
        if !self.valid {
            return None;
        }
        Some(SurfaceInfo {
            width: self.width,
            height: self.height,
            mip_levels: self.mipLevels,
            array_layers: self.arrayLayers,
            format: self.format,
            usage_flags: self.usageFlags,
            sample_count: self.sampleCount,
            row_pitch: self.rowPitch,
            depth_pitch: self.depthPitch,
            image: self.image,
            image_view: self.imageView,
            memory: self.memory,
            allocation_size: self.allocationSize,
            win32_handle: self.externalMemory.win32Handle,
            opaque_fd: (self.externalMemory.opaqueFd >= 0).then_some(self.externalMemory.opaqueFd),
        })
    }

    pub fn from_surface_info(info: &SurfaceInfo) -> Self {
        Self {
            valid: true,
            width: info.width,
            height: info.height,
            mipLevels: info.mip_levels,
            arrayLayers: info.array_layers,
            format: info.format,
            usageFlags: info.usage_flags,
            sampleCount: info.sample_count,
            rowPitch: info.row_pitch,
            depthPitch: info.depth_pitch,
            image: info.image,
            imageView: info.image_view,
            memory: info.memory,
            allocationSize: info.allocation_size,
            externalMemory: DxvkInteropExternalMemory {
                win32Handle: info.win32_handle,
                opaqueFd: info.opaque_fd.unwrap_or(-1),
            },
        }
    }
}

impl DxvkInteropFrameSync {
    pub fn to_frame_sync(&self) -> Option<FrameSync> {
        if !self.valid {
            return None;
        }
        let point = |semaphore: u64, value: u64, is_timeline: bool| {
            (semaphore != 0).then_some(SemaphorePoint {
                semaphore,
                value,
                is_timeline,
            })
        };
        Some(FrameSync {
            acquire: point(self.acquireSemaphore, self.acquireValue, self.acquireIsTimeline),
            release: point(self.releaseSemaphore, self.releaseValue, self.releaseIsTimeline),
            completion_fence: (self.completionFence != 0).then_some(self.completionFence),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_surface_info_is_rejected() {
        let raw = DxvkInteropSurfaceInfo {
            image: 0x1234,
            ..Default::default()
        };
        assert!(raw.to_surface_info().is_none());
    }

    #[test]
    fn negative_fd_means_none() {
        let mut raw = DxvkInteropSurfaceInfo {
            valid: true,
            image: 7,
            ..Default::default()
        };
        assert_eq!(raw.to_surface_info().and_then(|i| i.opaque_fd), None);

        raw.externalMemory.opaqueFd = 12;
        let info = raw.to_surface_info();
        assert_eq!(info.and_then(|i| i.opaque_fd), Some(12));
        let back = DxvkInteropSurfaceInfo::from_surface_info(&info.unwrap_or_default());
        assert_eq!(back.externalMemory.opaqueFd, 12);
    }

    #[test]
    fn frame_sync_drops_null_semaphores() {
        let raw = DxvkInteropFrameSync {
            valid: true,
            releaseSemaphore: 9,
            releaseValue: 4,
            releaseIsTimeline: true,
            ..Default::default()
        };
        let sync = raw.to_frame_sync().unwrap_or_default();
        assert!(sync.acquire.is_none());
        assert_eq!(sync.release.map(|p| p.value), Some(4));
        assert!(sync.completion_fence.is_none());
    }
}
