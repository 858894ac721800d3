//! `TRBridge_*` C entry points over the process-wide registry.
//!
//! Every pointer argument is checked; a null input is a no-op and a null
//! output reports "nothing found". Descriptors, surfaces and sync state pass
//! through as raw records so a published struct reads back unchanged apart
//! from clamped handle counts and a forced name terminator.
//! `TRBridge_ConsumePendingFrame` also accepts a null output and just drains
//! the slot.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr, CString};
use std::slice;
use std::sync::Arc;

use crate::ffi::*;
use crate::logging;
use crate::registry::{global, Bridge};
use crate::types::{Configuration, LayerCallbacks, PluginFrameInputs};

/// Raw user pointer handed back to a C callback.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// SAFETY: the pointer is opaque to us and only passed back to the callback
// that registered it; thread-safety of the pointee is the caller's contract.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

unsafe fn input_slice<'a, T>(ptr: *const T, count: usize) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        slice::from_raw_parts(ptr, count)
    }
}

unsafe fn output_slice<'a, T>(ptr: *mut T, count: usize) -> &'a mut [T] {
    if ptr.is_null() || count == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(ptr, count)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle and configuration
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn TRBridge_Initialize() {
    logging::install_fallback();
    global().initialize();
}

#[no_mangle]
pub extern "C" fn TRBridge_Shutdown() {
    global().shutdown();
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_SetConfiguration(configuration: *const TRBridgeConfiguration) {
    if let Some(raw) = configuration.as_ref() {
        global().set_configuration(&Configuration::from_ffi(raw));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_GetConfiguration(out: *mut TRBridgeConfiguration) {
    if let Some(out) = out.as_mut() {
        *out = global().configuration().to_ffi();
    }
}

// ---------------------------------------------------------------------------
// Render targets
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn TRBridge_SetRenderTargets(
    descriptors: *const TRBridgeRenderTargetDescriptor,
    count: usize,
) {
    global().set_render_targets_raw(input_slice(descriptors, count));
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_CopyRenderTargets(
    out: *mut TRBridgeRenderTargetDescriptor,
    max_count: usize,
) -> usize {
    global().copy_render_targets_raw(output_slice(out, max_count))
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn TRBridge_RegisterLogCallback(callback: TRBridgeLogCallback, user_data: *mut c_void) {
    let Some(callback) = callback else {
        global().register_log_callback(None);
        return;
    };
    let user_data = UserData(user_data);
    global().register_log_callback(Some(Arc::new(move |message: &str| {
        let user_data = user_data;
        let message = CString::new(message.replace('\0', "")).unwrap_or_default();
        callback(message.as_ptr(), user_data.0);
    })));
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_LogMessage(message: *const c_char) {
    let message = if message.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(message).to_string_lossy()
    };
    global().log_message(&message);
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn TRBridge_SignalPluginFrame(inputs: *const TRBridgePluginFrameInputs) {
    if let Some(raw) = inputs.as_ref() {
        global().signal_plugin_frame(PluginFrameInputs::from_ffi(raw));
    }
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_ConsumePendingFrame(out: *mut TRBridgePluginFrameInputs) -> bool {
    let Some(frame) = global().consume_pending_frame() else {
        return false;
    };
    if let Some(out) = out.as_mut() {
        *out = frame.to_ffi();
    }
    true
}

#[no_mangle]
pub extern "C" fn TRBridge_PeekPendingFrameId() -> u64 {
    global().peek_pending_frame_id()
}

// ---------------------------------------------------------------------------
// Interop surfaces
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn TRBridge_SetInteropSurfaces(surfaces: *const TRBridgeInteropSurface, count: usize) {
    global().set_interop_surfaces_raw(input_slice(surfaces, count));
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_CopyInteropSurfaces(out: *mut TRBridgeInteropSurface, max_count: usize) -> usize {
    global().copy_interop_surfaces_raw(output_slice(out, max_count))
}

#[no_mangle]
pub extern "C" fn TRBridge_GetInteropSurfaceCount() -> usize {
    global().interop_surface_count()
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_GetInteropSurface(name: *const c_char, out: *mut TRBridgeInteropSurface) -> bool {
    if name.is_null() {
        return false;
    }
    let Some(out) = out.as_mut() else {
        return false;
    };
    match global().interop_surface_raw(CStr::from_ptr(name).to_bytes()) {
        Some(surface) => {
            *out = surface;
            true
        }
        None => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_UpdateInteropSurface(surface: *const TRBridgeInteropSurface) {
    if let Some(raw) = surface.as_ref() {
        global().update_interop_surface_raw(raw);
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn TRBridge_SetInteropSyncState(state: *const TRBridgeInteropSyncState) {
    if let Some(raw) = state.as_ref() {
        global().set_interop_sync_state_raw(raw);
    }
}

#[no_mangle]
pub unsafe extern "C" fn TRBridge_GetInteropSyncState(out: *mut TRBridgeInteropSyncState) -> bool {
    let Some(out) = out.as_mut() else {
        return false;
    };
    match global().interop_sync_state_raw() {
        Some(state) => {
            *out = state;
            true
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Layer liveness
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn TRBridge_RegisterLayerCallbacks(callbacks: *const TRBridgeLayerCallbacks) {
    let on_frame_ready = callbacks.as_ref().and_then(|raw| {
        let notify = raw.onFrameReady?;
        let user_data = UserData(raw.userData);
        Some(Arc::new(move |frame_id: u64| {
            let user_data = user_data;
            notify(frame_id, user_data.0);
        }) as crate::types::FrameReadyFn)
    });
    global().register_layer_callbacks(LayerCallbacks { on_frame_ready });
}

#[no_mangle]
pub extern "C" fn TRBridge_MarkLayerHeartbeat() {
    global().mark_layer_heartbeat();
}

#[no_mangle]
pub extern "C" fn TRBridge_GetLastLayerHeartbeat() -> u64 {
    global().last_layer_heartbeat()
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::Mutex;

    use super::*;
    use crate::types::{BridgeFormat, InteropHandle, InteropSurface, RenderTargetDescriptor, UsageFlags};

    static LOGGED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record_line(message: *const c_char, _user_data: *mut c_void) {
        let line = CStr::from_ptr(message).to_string_lossy().into_owned();
        LOGGED.lock().unwrap().push(line);
    }

    // The exports share one process-wide registry, so everything that touches
    // it lives in a single test.
    #[test]
    fn exports_clamp_and_guard_inputs() {
        TRBridge_Initialize();
        unsafe {
            assert!(!TRBridge_ConsumePendingFrame(ptr::null_mut()));
            assert!(!TRBridge_GetInteropSurface(ptr::null(), ptr::null_mut()));
            TRBridge_SetRenderTargets(ptr::null(), 3);
            assert_eq!(TRBridge_CopyRenderTargets(ptr::null_mut(), 0), 0);

            let mut raw = InteropSurface::new(RenderTargetDescriptor::new(
                "TESR_RenderedTexture",
                8,
                8,
                BridgeFormat::R8G8B8A8Unorm,
                UsageFlags::COLOR,
            ))
            .to_ffi();
            for (i, h) in raw.handles.iter_mut().enumerate() {
                *h = InteropHandle::VkImage(i as u64 + 1).to_ffi();
            }
            raw.handleCount = 1000;
            TRBridge_UpdateInteropSurface(&raw);

            let mut out = TRBridgeInteropSurface::default();
            assert!(TRBridge_GetInteropSurface(c"TESR_RenderedTexture".as_ptr(), &mut out));
            assert_eq!(out.handleCount as usize, TR_BRIDGE_MAX_INTEROP_HANDLES);
            assert_eq!(TRBridge_GetInteropSurfaceCount(), 1);

            let inputs = TRBridgePluginFrameInputs {
                frameId: 42,
                renderTargetCount: 1,
            };
            TRBridge_SignalPluginFrame(&inputs);
            assert_eq!(TRBridge_PeekPendingFrameId(), 42);
            let mut consumed = TRBridgePluginFrameInputs::default();
            assert!(TRBridge_ConsumePendingFrame(&mut consumed));
            assert_eq!(consumed, inputs);
            assert_eq!(TRBridge_PeekPendingFrameId(), 0);

            // A null output still drains the slot.
            TRBridge_SignalPluginFrame(&inputs);
            assert!(TRBridge_ConsumePendingFrame(ptr::null_mut()));
            assert_eq!(TRBridge_PeekPendingFrameId(), 0);
            assert!(!TRBridge_ConsumePendingFrame(&mut consumed));

            // Set then Copy hands back the exact records, odd entries included.
            let mut odd = raw;
            odd.descriptor.format = 9999;
            odd.descriptor.name[0] = 0xC3_u8 as c_char;
            odd.handles[0] = TRBridgeInteropHandle {
                type_: TR_BRIDGE_INTEROP_HANDLE_WIN32_SHARED_HANDLE,
                value: 0,
                auxValue: 0,
            };
            odd.handles[1] = TRBridgeInteropHandle {
                type_: TR_BRIDGE_INTEROP_HANDLE_WIN32_SHARED_HANDLE,
                value: 0x1234,
                auxValue: 77,
            };
            odd.handleCount = 2;
            TRBridge_SetInteropSurfaces(&odd, 1);
            let mut copied = [TRBridgeInteropSurface::default(); 2];
            assert_eq!(TRBridge_CopyInteropSurfaces(copied.as_mut_ptr(), copied.len()), 1);
            assert_eq!(copied[0], odd);

            let mut target = odd.descriptor;
            target.usageFlags = 0x8000_0001;
            TRBridge_SetRenderTargets(&target, 1);
            let mut copied_target = TRBridgeRenderTargetDescriptor::default();
            assert_eq!(TRBridge_CopyRenderTargets(&mut copied_target, 1), 1);
            assert_eq!(copied_target, target);

            let sync = TRBridgeInteropSyncState {
                frameId: 5,
                waitHandles: [odd.handles[1]; TR_BRIDGE_MAX_INTEROP_HANDLES],
                waitHandleCount: 1,
                ..Default::default()
            };
            TRBridge_SetInteropSyncState(&sync);
            let mut copied_sync = TRBridgeInteropSyncState::default();
            assert!(TRBridge_GetInteropSyncState(&mut copied_sync));
            assert_eq!(copied_sync, sync);

            // A null message still reaches the callback, as an empty line.
            TRBridge_RegisterLogCallback(Some(record_line), ptr::null_mut());
            TRBridge_LogMessage(c"first".as_ptr());
            TRBridge_LogMessage(ptr::null());
            TRBridge_RegisterLogCallback(None, ptr::null_mut());
        }
        assert_eq!(*LOGGED.lock().unwrap(), vec!["first".to_owned(), String::new()]);
        TRBridge_Shutdown();
        assert_eq!(TRBridge_GetInteropSurfaceCount(), 0);
    }
}
