//! Domain types published through the registry.
//!
//! These are the Rust-side views of the ABI records in [`crate::ffi`]. Raw
//! integers only appear at the `to_ffi`/`from_ffi` conversions; everything
//! else works with typed handles, bounded names and flag sets.

use std::ffi::c_char;
use std::fmt;
use std::sync::Arc;

use arrayvec::{ArrayString, ArrayVec};
use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::ffi;

/// Maximum number of handles carried by a surface or sync-state list.
pub const MAX_INTEROP_HANDLES: usize = ffi::TR_BRIDGE_MAX_INTEROP_HANDLES;

/// Longest name that fits the ABI buffer with its terminator.
pub const MAX_NAME_LEN: usize = ffi::TR_BRIDGE_NAME_LENGTH - 1;

pub type HandleList = ArrayVec<InteropHandle, MAX_INTEROP_HANDLES>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConfigFlags: u32 {
        const ENABLE_VULKAN_AO = ffi::TR_BRIDGE_FLAG_ENABLE_VULKAN_AO;
    }
}

/// Global effect configuration. Replaced wholesale, never merged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Configuration {
    pub version: u32,
    pub flags: ConfigFlags,
    pub ao_radius: f32,
    pub ao_intensity: f32,
    pub ao_power: f32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            version: ffi::TR_BRIDGE_CONFIGURATION_VERSION,
            flags: ConfigFlags::empty(),
            ao_radius: 1.0,
            ao_intensity: 1.0,
            ao_power: 1.0,
        }
    }
}

impl Configuration {
    /// Whether the consumer should inject compute work.
    pub fn compute_enabled(&self) -> bool {
        self.flags.contains(ConfigFlags::ENABLE_VULKAN_AO)
    }

    pub fn to_ffi(&self) -> ffi::TRBridgeConfiguration {
        ffi::TRBridgeConfiguration {
            version: self.version,
            flags: self.flags.bits(),
            ambientOcclusionRadius: self.ao_radius,
            ambientOcclusionIntensity: self.ao_intensity,
            ambientOcclusionPower: self.ao_power,
        }
    }

    /// Unknown flag bits are retained so they survive a round trip.
    pub fn from_ffi(raw: &ffi::TRBridgeConfiguration) -> Self {
        Self {
            version: raw.version,
            flags: ConfigFlags::from_bits_retain(raw.flags),
            ao_radius: raw.ambientOcclusionRadius,
            ao_intensity: raw.ambientOcclusionIntensity,
            ao_power: raw.ambientOcclusionPower,
        }
    }
}

// ---------------------------------------------------------------------------
// Formats and usage
// ---------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UsageFlags: u32 {
        const COLOR = ffi::TR_BRIDGE_RT_USAGE_COLOR_BIT;
        const DEPTH = ffi::TR_BRIDGE_RT_USAGE_DEPTH_BIT;
        const SAMPLED = ffi::TR_BRIDGE_RT_USAGE_SAMPLED_BIT;
        const STORAGE = ffi::TR_BRIDGE_RT_USAGE_STORAGE_BIT;
    }
}

/// Pixel formats a render target may be published with. Values match the
/// corresponding `VkFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive)]
#[repr(u32)]
pub enum BridgeFormat {
    #[default]
    Undefined = ffi::TR_BRIDGE_FORMAT_UNDEFINED,
    R8G8B8A8Unorm = ffi::TR_BRIDGE_FORMAT_R8G8B8A8_UNORM,
    R16G16B16A16Float = ffi::TR_BRIDGE_FORMAT_R16G16B16A16_FLOAT,
    R32Sfloat = ffi::TR_BRIDGE_FORMAT_R32_SFLOAT,
    R32G32Sfloat = ffi::TR_BRIDGE_FORMAT_R32G32_SFLOAT,
    R32G32B32A32Float = ffi::TR_BRIDGE_FORMAT_R32G32B32A32_FLOAT,
    D24UnormS8Uint = ffi::TR_BRIDGE_FORMAT_D24_UNORM_S8_UINT,
}

impl BridgeFormat {
    /// Values outside the closed set decode as `Undefined`.
    pub fn from_raw(raw: u32) -> Self {
        Self::from_u32(raw).unwrap_or_default()
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint)
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// A render target name bounded to the ABI buffer size.
///
/// Longer inputs are cut at the last UTF-8 boundary that fits, so the stored
/// name is always valid and at most [`MAX_NAME_LEN`] bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BridgeName(ArrayString<MAX_NAME_LEN>);

impl BridgeName {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut inner = ArrayString::new();
        inner.push_str(&name[..end]);
        Self(inner)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_ffi(&self) -> [c_char; ffi::TR_BRIDGE_NAME_LENGTH] {
        let mut raw = [0; ffi::TR_BRIDGE_NAME_LENGTH];
        ffi::write_name(&mut raw, self.as_str());
        raw
    }

    pub fn from_ffi(raw: &[c_char; ffi::TR_BRIDGE_NAME_LENGTH]) -> Self {
        let bytes = ffi::read_name(raw);
        Self::new(&String::from_utf8_lossy(&bytes))
    }
}

impl From<&str> for BridgeName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Debug for BridgeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for BridgeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RenderTargetDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTargetDescriptor {
    pub name: BridgeName,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: BridgeFormat,
    pub usage: UsageFlags,
}

impl RenderTargetDescriptor {
    pub fn new(name: &str, width: u32, height: u32, format: BridgeFormat, usage: UsageFlags) -> Self {
        Self {
            name: BridgeName::new(name),
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }

    pub fn to_ffi(&self) -> ffi::TRBridgeRenderTargetDescriptor {
        ffi::TRBridgeRenderTargetDescriptor {
            name: self.name.to_ffi(),
            width: self.width,
            height: self.height,
            mipLevels: self.mip_levels,
            arrayLayers: self.array_layers,
            format: self.format.raw(),
            usageFlags: self.usage.bits(),
        }
    }

    pub fn from_ffi(raw: &ffi::TRBridgeRenderTargetDescriptor) -> Self {
        Self {
            name: BridgeName::from_ffi(&raw.name),
            width: raw.width,
            height: raw.height,
            mip_levels: raw.mipLevels,
            array_layers: raw.arrayLayers,
            format: BridgeFormat::from_raw(raw.format),
            usage: UsageFlags::from_bits_retain(raw.usageFlags),
        }
    }
}

// ---------------------------------------------------------------------------
// InteropHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum HandleKind {
    None = ffi::TR_BRIDGE_INTEROP_HANDLE_NONE,
    D3d9TexturePointer = ffi::TR_BRIDGE_INTEROP_HANDLE_D3D9_TEXTURE_POINTER,
    D3d9SurfacePointer = ffi::TR_BRIDGE_INTEROP_HANDLE_D3D9_SURFACE_POINTER,
    Win32SharedHandle = ffi::TR_BRIDGE_INTEROP_HANDLE_WIN32_SHARED_HANDLE,
    OpaqueFd = ffi::TR_BRIDGE_INTEROP_HANDLE_OPAQUE_FD,
    VkImage = ffi::TR_BRIDGE_INTEROP_HANDLE_VK_IMAGE,
    VkDeviceMemory = ffi::TR_BRIDGE_INTEROP_HANDLE_VK_DEVICE_MEMORY,
    VkImageView = ffi::TR_BRIDGE_INTEROP_HANDLE_VK_IMAGE_VIEW,
    VkSemaphore = ffi::TR_BRIDGE_INTEROP_HANDLE_VK_SEMAPHORE,
    VkFence = ffi::TR_BRIDGE_INTEROP_HANDLE_VK_FENCE,
}

/// Payload of a semaphore handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreValue {
    /// Binary semaphore. A non-zero producer value is carried through to the
    /// submit unchanged.
    Binary(u64),
    /// Wait for, or signal, this counter value.
    Timeline(u64),
}

impl Default for SemaphoreValue {
    fn default() -> Self {
        Self::Binary(0)
    }
}

impl SemaphoreValue {
    pub fn encode(self) -> u64 {
        match self {
            Self::Binary(value) => value & ffi::TR_BRIDGE_HANDLE_AUX_VALUE_MASK,
            Self::Timeline(value) => {
                (value & ffi::TR_BRIDGE_HANDLE_AUX_VALUE_MASK) | ffi::TR_BRIDGE_HANDLE_AUX_TIMELINE_BIT
            }
        }
    }

    pub fn decode(aux: u64) -> Self {
        if aux & ffi::TR_BRIDGE_HANDLE_AUX_TIMELINE_BIT != 0 {
            Self::Timeline(aux & ffi::TR_BRIDGE_HANDLE_AUX_VALUE_MASK)
        } else {
            Self::Binary(aux)
        }
    }

    pub fn is_timeline(self) -> bool {
        matches!(self, Self::Timeline(_))
    }

    /// Value to pass alongside the semaphore in a submit.
    pub fn counter(self) -> u64 {
        match self {
            Self::Binary(value) | Self::Timeline(value) => value,
        }
    }
}

/// Non-owning reference to a native resource living in another module.
///
/// The wrapped integer is the raw handle or pointer value. A value of zero
/// means "absent" and is never stored in a surface or sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteropHandle {
    D3d9Texture(u64),
    D3d9Surface(u64),
    Win32SharedHandle(u64),
    OpaqueFd(u64),
    VkImage(u64),
    VkDeviceMemory(u64),
    VkImageView(u64),
    VkSemaphore(u64, SemaphoreValue),
    VkFence(u64),
}

impl InteropHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            Self::D3d9Texture(_) => HandleKind::D3d9TexturePointer,
            Self::D3d9Surface(_) => HandleKind::D3d9SurfacePointer,
            Self::Win32SharedHandle(_) => HandleKind::Win32SharedHandle,
            Self::OpaqueFd(_) => HandleKind::OpaqueFd,
            Self::VkImage(_) => HandleKind::VkImage,
            Self::VkDeviceMemory(_) => HandleKind::VkDeviceMemory,
            Self::VkImageView(_) => HandleKind::VkImageView,
            Self::VkSemaphore(..) => HandleKind::VkSemaphore,
            Self::VkFence(_) => HandleKind::VkFence,
        }
    }

    pub fn value(&self) -> u64 {
        match *self {
            Self::D3d9Texture(v)
            | Self::D3d9Surface(v)
            | Self::Win32SharedHandle(v)
            | Self::OpaqueFd(v)
            | Self::VkImage(v)
            | Self::VkDeviceMemory(v)
            | Self::VkImageView(v)
            | Self::VkSemaphore(v, _)
            | Self::VkFence(v) => v,
        }
    }

    pub fn to_ffi(&self) -> ffi::TRBridgeInteropHandle {
        let aux = match self {
            Self::VkSemaphore(_, payload) => payload.encode(),
            _ => 0,
        };
        ffi::TRBridgeInteropHandle {
            type_: self.kind() as u32,
            value: self.value(),
            auxValue: aux,
        }
    }

    /// Returns `None` for kind NONE, unknown kinds and zero values.
    pub fn from_ffi(raw: &ffi::TRBridgeInteropHandle) -> Option<Self> {
        if raw.value == 0 {
            return None;
        }
        let v = raw.value;
        let handle = match HandleKind::from_u32(raw.type_)? {
            HandleKind::None => return None,
            HandleKind::D3d9TexturePointer => Self::D3d9Texture(v),
            HandleKind::D3d9SurfacePointer => Self::D3d9Surface(v),
            HandleKind::Win32SharedHandle => Self::Win32SharedHandle(v),
            HandleKind::OpaqueFd => Self::OpaqueFd(v),
            HandleKind::VkImage => Self::VkImage(v),
            HandleKind::VkDeviceMemory => Self::VkDeviceMemory(v),
            HandleKind::VkImageView => Self::VkImageView(v),
            HandleKind::VkSemaphore => Self::VkSemaphore(v, SemaphoreValue::decode(raw.auxValue)),
            HandleKind::VkFence => Self::VkFence(v),
        };
        Some(handle)
    }
}

fn push_bounded(list: &mut HandleList, handle: InteropHandle) -> bool {
    if handle.value() == 0 {
        return false;
    }
    list.try_push(handle).is_ok()
}

fn handles_to_ffi(
    list: &HandleList,
) -> ([ffi::TRBridgeInteropHandle; MAX_INTEROP_HANDLES], u32) {
    let mut raw = [ffi::TRBridgeInteropHandle::default(); MAX_INTEROP_HANDLES];
    for (dst, src) in raw.iter_mut().zip(list) {
        *dst = src.to_ffi();
    }
    (raw, list.len() as u32)
}

/// Decode at most [`MAX_INTEROP_HANDLES`] entries, whatever `count` claims.
fn handles_from_ffi(raw: &[ffi::TRBridgeInteropHandle; MAX_INTEROP_HANDLES], count: u32) -> HandleList {
    let count = (count as usize).min(MAX_INTEROP_HANDLES);
    raw[..count].iter().filter_map(InteropHandle::from_ffi).collect()
}

// ---------------------------------------------------------------------------
// InteropSurface
// ---------------------------------------------------------------------------

/// A published render target plus the native handles other APIs can use to
/// reach it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InteropSurface {
    pub descriptor: RenderTargetDescriptor,
    handles: HandleList,
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

impl InteropSurface {
    pub fn new(descriptor: RenderTargetDescriptor) -> Self {
        Self {
            descriptor,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name.as_str()
    }

    pub fn handles(&self) -> &[InteropHandle] {
        &self.handles
    }

    /// Append a handle. Fails when the list is full or the value is zero.
    pub fn push_handle(&mut self, handle: InteropHandle) -> bool {
        push_bounded(&mut self.handles, handle)
    }

    pub fn vk_image(&self) -> Option<u64> {
        self.handles.iter().find_map(|h| match h {
            InteropHandle::VkImage(v) => Some(*v),
            _ => None,
        })
    }

    pub fn vk_image_view(&self) -> Option<u64> {
        self.handles.iter().find_map(|h| match h {
            InteropHandle::VkImageView(v) => Some(*v),
            _ => None,
        })
    }

    pub fn to_ffi(&self) -> ffi::TRBridgeInteropSurface {
        let (handles, count) = handles_to_ffi(&self.handles);
        ffi::TRBridgeInteropSurface {
            descriptor: self.descriptor.to_ffi(),
            handles,
            handleCount: count,
            rowPitch: self.row_pitch,
            depthPitch: self.depth_pitch,
        }
    }

    pub fn from_ffi(raw: &ffi::TRBridgeInteropSurface) -> Self {
        Self {
            descriptor: RenderTargetDescriptor::from_ffi(&raw.descriptor),
            handles: handles_from_ffi(&raw.handles, raw.handleCount),
            row_pitch: raw.rowPitch,
            depth_pitch: raw.depthPitch,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames and sync state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginFrameInputs {
    pub frame_id: u64,
    pub render_target_count: u32,
}

impl PluginFrameInputs {
    pub fn to_ffi(&self) -> ffi::TRBridgePluginFrameInputs {
        ffi::TRBridgePluginFrameInputs {
            frameId: self.frame_id,
            renderTargetCount: self.render_target_count,
        }
    }

    pub fn from_ffi(raw: &ffi::TRBridgePluginFrameInputs) -> Self {
        Self {
            frame_id: raw.frameId,
            render_target_count: raw.renderTargetCount,
        }
    }
}

/// Semaphores and fences bracketing the GPU work of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InteropSyncState {
    pub frame_id: u64,
    wait: HandleList,
    signal: HandleList,
}

impl InteropSyncState {
    pub fn new(frame_id: u64) -> Self {
        Self {
            frame_id,
            ..Default::default()
        }
    }

    pub fn wait_handles(&self) -> &[InteropHandle] {
        &self.wait
    }

    pub fn signal_handles(&self) -> &[InteropHandle] {
        &self.signal
    }

    pub fn push_wait(&mut self, handle: InteropHandle) -> bool {
        push_bounded(&mut self.wait, handle)
    }

    pub fn push_signal(&mut self, handle: InteropHandle) -> bool {
        push_bounded(&mut self.signal, handle)
    }

    pub fn to_ffi(&self) -> ffi::TRBridgeInteropSyncState {
        let (wait, wait_count) = handles_to_ffi(&self.wait);
        let (signal, signal_count) = handles_to_ffi(&self.signal);
        ffi::TRBridgeInteropSyncState {
            frameId: self.frame_id,
            waitHandles: wait,
            waitHandleCount: wait_count,
            signalHandles: signal,
            signalHandleCount: signal_count,
        }
    }

    pub fn from_ffi(raw: &ffi::TRBridgeInteropSyncState) -> Self {
        Self {
            frame_id: raw.frameId,
            wait: handles_from_ffi(&raw.waitHandles, raw.waitHandleCount),
            signal: handles_from_ffi(&raw.signalHandles, raw.signalHandleCount),
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Receives every message passed to `log_message`.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked with the frame id each time the producer signals a frame.
pub type FrameReadyFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct LayerCallbacks {
    pub on_frame_ready: Option<FrameReadyFn>,
}

impl fmt::Debug for LayerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerCallbacks")
            .field("on_frame_ready", &self.on_frame_ready.is_some())
            .finish()
    }
}
