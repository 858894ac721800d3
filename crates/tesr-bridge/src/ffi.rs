//! C-repr structs and constants of the `TRBridge_*` ABI.
//!
//! These layouts are shared by every module that talks to the registry: the
//! D3D9 plugin, the Vulkan layer and any third-party consumer. Field order and
//! widths are fixed; C enums travel as `u32`.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::ffi::{c_char, c_void};

// =====================================================================
// Configuration
// =====================================================================

pub const TR_BRIDGE_CONFIGURATION_VERSION: u32 = 1;
pub const TR_BRIDGE_FLAG_ENABLE_VULKAN_AO: u32 = 1 << 0;

// =====================================================================
// Render target usage flags
// =====================================================================

pub const TR_BRIDGE_RT_USAGE_COLOR_BIT: u32 = 1 << 0;
pub const TR_BRIDGE_RT_USAGE_DEPTH_BIT: u32 = 1 << 1;
pub const TR_BRIDGE_RT_USAGE_SAMPLED_BIT: u32 = 1 << 2;
pub const TR_BRIDGE_RT_USAGE_STORAGE_BIT: u32 = 1 << 3;

// =====================================================================
// Formats (values match VkFormat)
// =====================================================================

pub const TR_BRIDGE_FORMAT_UNDEFINED: u32 = 0;
pub const TR_BRIDGE_FORMAT_R8G8B8A8_UNORM: u32 = 37;
pub const TR_BRIDGE_FORMAT_R16G16B16A16_FLOAT: u32 = 97;
pub const TR_BRIDGE_FORMAT_R32_SFLOAT: u32 = 100;
pub const TR_BRIDGE_FORMAT_R32G32_SFLOAT: u32 = 103;
pub const TR_BRIDGE_FORMAT_R32G32B32A32_FLOAT: u32 = 109;
pub const TR_BRIDGE_FORMAT_D24_UNORM_S8_UINT: u32 = 129;

// =====================================================================
// Interop handle kinds
// =====================================================================

pub const TR_BRIDGE_INTEROP_HANDLE_NONE: u32 = 0;
pub const TR_BRIDGE_INTEROP_HANDLE_D3D9_TEXTURE_POINTER: u32 = 1;
pub const TR_BRIDGE_INTEROP_HANDLE_D3D9_SURFACE_POINTER: u32 = 2;
pub const TR_BRIDGE_INTEROP_HANDLE_WIN32_SHARED_HANDLE: u32 = 3;
pub const TR_BRIDGE_INTEROP_HANDLE_OPAQUE_FD: u32 = 4;
pub const TR_BRIDGE_INTEROP_HANDLE_VK_IMAGE: u32 = 5;
pub const TR_BRIDGE_INTEROP_HANDLE_VK_DEVICE_MEMORY: u32 = 6;
pub const TR_BRIDGE_INTEROP_HANDLE_VK_IMAGE_VIEW: u32 = 7;
pub const TR_BRIDGE_INTEROP_HANDLE_VK_SEMAPHORE: u32 = 8;
pub const TR_BRIDGE_INTEROP_HANDLE_VK_FENCE: u32 = 9;

/// Set in a semaphore handle's `auxValue` when the semaphore is a timeline.
pub const TR_BRIDGE_HANDLE_AUX_TIMELINE_BIT: u64 = 1 << 63;
pub const TR_BRIDGE_HANDLE_AUX_VALUE_MASK: u64 = !TR_BRIDGE_HANDLE_AUX_TIMELINE_BIT;

pub const TR_BRIDGE_MAX_INTEROP_HANDLES: usize = 4;

/// Size of the descriptor name buffer, terminator included.
pub const TR_BRIDGE_NAME_LENGTH: usize = 64;

// =====================================================================
// Structs
// =====================================================================

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TRBridgeInteropHandle {
    pub type_: u32,
    pub value: u64,
    pub auxValue: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TRBridgeConfiguration {
    pub version: u32,
    pub flags: u32,
    pub ambientOcclusionRadius: f32,
    pub ambientOcclusionIntensity: f32,
    pub ambientOcclusionPower: f32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TRBridgeRenderTargetDescriptor {
    pub name: [c_char; TR_BRIDGE_NAME_LENGTH],
    pub width: u32,
    pub height: u32,
    pub mipLevels: u32,
    pub arrayLayers: u32,
    pub format: u32,
    pub usageFlags: u32,
}

impl Default for TRBridgeRenderTargetDescriptor {
    fn default() -> Self {
        Self {
            name: [0; TR_BRIDGE_NAME_LENGTH],
            width: 0,
            height: 0,
            mipLevels: 0,
            arrayLayers: 0,
            format: TR_BRIDGE_FORMAT_UNDEFINED,
            usageFlags: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TRBridgePluginFrameInputs {
    pub frameId: u64,
    pub renderTargetCount: u32,
}

pub type TRBridgeLogCallback = Option<unsafe extern "C" fn(message: *const c_char, userData: *mut c_void)>;

pub type TRBridgeFrameNotification = Option<unsafe extern "C" fn(frameId: u64, userData: *mut c_void)>;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct TRBridgeLayerCallbacks {
    pub onFrameReady: TRBridgeFrameNotification,
    pub userData: *mut c_void,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TRBridgeInteropSurface {
    pub descriptor: TRBridgeRenderTargetDescriptor,
    pub handles: [TRBridgeInteropHandle; TR_BRIDGE_MAX_INTEROP_HANDLES],
    pub handleCount: u32,
    pub rowPitch: u32,
    pub depthPitch: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TRBridgeInteropSyncState {
    pub frameId: u64,
    pub waitHandles: [TRBridgeInteropHandle; TR_BRIDGE_MAX_INTEROP_HANDLES],
    pub waitHandleCount: u32,
    pub signalHandles: [TRBridgeInteropHandle; TR_BRIDGE_MAX_INTEROP_HANDLES],
    pub signalHandleCount: u32,
}

// =====================================================================
// Exported function signatures
// =====================================================================

pub type PFN_TRBridge_Initialize = unsafe extern "C" fn();
pub type PFN_TRBridge_Shutdown = unsafe extern "C" fn();
pub type PFN_TRBridge_SetConfiguration = unsafe extern "C" fn(*const TRBridgeConfiguration);
pub type PFN_TRBridge_GetConfiguration = unsafe extern "C" fn(*mut TRBridgeConfiguration);
pub type PFN_TRBridge_SetRenderTargets =
    unsafe extern "C" fn(*const TRBridgeRenderTargetDescriptor, usize);
pub type PFN_TRBridge_CopyRenderTargets =
    unsafe extern "C" fn(*mut TRBridgeRenderTargetDescriptor, usize) -> usize;
pub type PFN_TRBridge_RegisterLogCallback = unsafe extern "C" fn(TRBridgeLogCallback, *mut c_void);
pub type PFN_TRBridge_LogMessage = unsafe extern "C" fn(*const c_char);
pub type PFN_TRBridge_SignalPluginFrame = unsafe extern "C" fn(*const TRBridgePluginFrameInputs);
pub type PFN_TRBridge_ConsumePendingFrame =
    unsafe extern "C" fn(*mut TRBridgePluginFrameInputs) -> bool;
pub type PFN_TRBridge_PeekPendingFrameId = unsafe extern "C" fn() -> u64;
pub type PFN_TRBridge_SetInteropSurfaces = unsafe extern "C" fn(*const TRBridgeInteropSurface, usize);
pub type PFN_TRBridge_CopyInteropSurfaces =
    unsafe extern "C" fn(*mut TRBridgeInteropSurface, usize) -> usize;
pub type PFN_TRBridge_GetInteropSurfaceCount = unsafe extern "C" fn() -> usize;
pub type PFN_TRBridge_GetInteropSurface =
    unsafe extern "C" fn(*const c_char, *mut TRBridgeInteropSurface) -> bool;
pub type PFN_TRBridge_UpdateInteropSurface = unsafe extern "C" fn(*const TRBridgeInteropSurface);
pub type PFN_TRBridge_SetInteropSyncState = unsafe extern "C" fn(*const TRBridgeInteropSyncState);
pub type PFN_TRBridge_GetInteropSyncState = unsafe extern "C" fn(*mut TRBridgeInteropSyncState) -> bool;
pub type PFN_TRBridge_RegisterLayerCallbacks = unsafe extern "C" fn(*const TRBridgeLayerCallbacks);
pub type PFN_TRBridge_MarkLayerHeartbeat = unsafe extern "C" fn();
pub type PFN_TRBridge_GetLastLayerHeartbeat = unsafe extern "C" fn() -> u64;

// =====================================================================
// Helpers
// =====================================================================

/// Copy a string into a fixed C name buffer, truncating to leave room for the
/// terminator. The remainder of the buffer is zeroed.
pub fn write_name(dst: &mut [c_char; TR_BRIDGE_NAME_LENGTH], name: &str) {
    dst.fill(0);
    let bytes = name.as_bytes();
    let len = bytes.len().min(TR_BRIDGE_NAME_LENGTH - 1);
    for (d, &b) in dst.iter_mut().zip(&bytes[..len]) {
        *d = b as c_char;
    }
}

/// Read a fixed C name buffer up to its first NUL. The last byte is treated
/// as a terminator even if the writer forgot one.
pub fn read_name(src: &[c_char; TR_BRIDGE_NAME_LENGTH]) -> Vec<u8> {
    src[..TR_BRIDGE_NAME_LENGTH - 1]
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect()
}
