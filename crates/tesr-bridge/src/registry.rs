//! The shared bridge registry.
//!
//! [`Bridge`] is the narrow interface both sides program against. The D3D9
//! plugin publishes render targets, interop surfaces, frames and sync state;
//! the Vulkan layer polls them. [`SharedRegistry`] is the in-process
//! implementation; [`crate::module::ModuleBridge`] forwards to a registry that
//! lives in another loaded module.
//!
//! All state sits behind one mutex. The lock is only held while copying plain
//! data in or out; callbacks run after it is released.
//!
//! Descriptors, surfaces and sync state are kept as the ABI records they
//! arrived as. Storing only clamps handle counts and terminates names, so a
//! C caller reads back exactly what it published; the typed [`Bridge`] view
//! decodes on the way out.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::info;

use crate::ffi::{
    self, TRBridgeInteropSurface, TRBridgeInteropSyncState, TRBridgeRenderTargetDescriptor,
    TR_BRIDGE_MAX_INTEROP_HANDLES, TR_BRIDGE_NAME_LENGTH,
};
use crate::logging::FALLBACK_TARGET;
use crate::types::{
    Configuration, InteropSurface, InteropSyncState, LayerCallbacks, LogSink, PluginFrameInputs,
    RenderTargetDescriptor,
};

/// Operations exposed by the registry across module boundaries.
///
/// Every method implicitly initializes default state if nothing has called
/// [`Bridge::initialize`] yet, so callers never observe an "uninitialized"
/// error.
pub trait Bridge: Send + Sync {
    /// Take a reference. The first reference resets all state to defaults.
    fn initialize(&self);

    /// Drop a reference. The last one clears every collection and callback.
    fn shutdown(&self);

    fn set_configuration(&self, configuration: &Configuration);
    fn configuration(&self) -> Configuration;

    /// Replace the published render targets wholesale.
    fn set_render_targets(&self, descriptors: &[RenderTargetDescriptor]);

    /// Copy up to `out.len()` descriptors and return the total count.
    fn copy_render_targets(&self, out: &mut [RenderTargetDescriptor]) -> usize;

    fn register_log_callback(&self, sink: Option<LogSink>);

    /// Deliver a message to the log sink, or to `tracing` if none is
    /// registered.
    fn log_message(&self, message: &str);

    /// Overwrite the pending-frame slot and notify the frame-ready callback.
    fn signal_plugin_frame(&self, inputs: PluginFrameInputs);

    /// Take the pending frame, leaving the slot empty.
    fn consume_pending_frame(&self) -> Option<PluginFrameInputs>;

    /// Pending frame id, or 0 when the slot is empty.
    fn peek_pending_frame_id(&self) -> u64;

    fn set_interop_surfaces(&self, surfaces: &[InteropSurface]);

    /// Copy up to `out.len()` surfaces and return the total count.
    fn copy_interop_surfaces(&self, out: &mut [InteropSurface]) -> usize;
    fn interop_surface_count(&self) -> usize;
    fn interop_surface(&self, name: &str) -> Option<InteropSurface>;

    /// Replace the surface with the same name, or append it.
    fn update_interop_surface(&self, surface: &InteropSurface);

    fn set_interop_sync_state(&self, state: &InteropSyncState);

    /// Last stored sync state. Callers correlate its frame id themselves.
    fn interop_sync_state(&self) -> Option<InteropSyncState>;

    fn register_layer_callbacks(&self, callbacks: LayerCallbacks);
    fn mark_layer_heartbeat(&self);

    /// Microsecond timestamp of the last heartbeat, 0 if never marked.
    fn last_layer_heartbeat(&self) -> u64;

    /// Snapshot of every published render target.
    fn render_targets(&self) -> Vec<RenderTargetDescriptor> {
        loop {
            let count = self.copy_render_targets(&mut []);
            let mut out = vec![RenderTargetDescriptor::default(); count];
            let total = self.copy_render_targets(&mut out);
            if total <= count {
                out.truncate(total);
                return out;
            }
        }
    }

    /// Snapshot of every published interop surface.
    fn interop_surfaces(&self) -> Vec<InteropSurface> {
        loop {
            let count = self.copy_interop_surfaces(&mut []);
            let mut out = vec![InteropSurface::default(); count];
            let total = self.copy_interop_surfaces(&mut out);
            if total <= count {
                out.truncate(total);
                return out;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SharedRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryState {
    initialized: bool,
    ref_count: u32,
    configuration: Configuration,
    render_targets: Vec<TRBridgeRenderTargetDescriptor>,
    interop_surfaces: Vec<TRBridgeInteropSurface>,
    pending_frame: Option<PluginFrameInputs>,
    sync_state: Option<TRBridgeInteropSyncState>,
    log_sink: Option<LogSink>,
    layer_callbacks: LayerCallbacks,
    last_layer_heartbeat: u64,
}

impl RegistryState {
    fn ensure_initialized(&mut self) {
        if !self.initialized {
            let ref_count = self.ref_count;
            *self = Self {
                initialized: true,
                ref_count,
                ..Default::default()
            };
        }
    }
}

fn terminated(raw: &TRBridgeRenderTargetDescriptor) -> TRBridgeRenderTargetDescriptor {
    let mut stored = *raw;
    stored.name[TR_BRIDGE_NAME_LENGTH - 1] = 0;
    stored
}

fn clamp_count(count: u32) -> u32 {
    count.min(TR_BRIDGE_MAX_INTEROP_HANDLES as u32)
}

fn stored_surface(raw: &TRBridgeInteropSurface) -> TRBridgeInteropSurface {
    TRBridgeInteropSurface {
        descriptor: terminated(&raw.descriptor),
        handleCount: clamp_count(raw.handleCount),
        ..*raw
    }
}

fn stored_sync(raw: &TRBridgeInteropSyncState) -> TRBridgeInteropSyncState {
    TRBridgeInteropSyncState {
        waitHandleCount: clamp_count(raw.waitHandleCount),
        signalHandleCount: clamp_count(raw.signalHandleCount),
        ..*raw
    }
}

fn same_name(surface: &TRBridgeInteropSurface, name: &[u8]) -> bool {
    ffi::read_name(&surface.descriptor.name) == name
}

fn copy_prefix<T: Copy>(out: &mut [T], stored: &[T]) -> usize {
    for (dst, src) in out.iter_mut().zip(stored) {
        *dst = *src;
    }
    stored.len()
}

/// In-process registry guarded by a single mutex.
#[derive(Default)]
pub struct SharedRegistry {
    state: Mutex<RegistryState>,
}

static GLOBAL: Lazy<SharedRegistry> = Lazy::new(SharedRegistry::new);

/// The process-wide registry backing the exported C ABI.
pub fn global() -> &'static SharedRegistry {
    &GLOBAL
}

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microseconds, never 0.
fn timestamp_us() -> u64 {
    (CLOCK_ANCHOR.elapsed().as_micros() as u64).max(1)
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ensure_initialized();
        state
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.lock().ref_count
    }

    pub fn set_render_targets_raw(&self, descriptors: &[TRBridgeRenderTargetDescriptor]) {
        let mut state = self.lock();
        state.render_targets.clear();
        state.render_targets.extend(descriptors.iter().map(terminated));
    }

    /// Copy up to `out.len()` stored records and return the total count.
    pub fn copy_render_targets_raw(&self, out: &mut [TRBridgeRenderTargetDescriptor]) -> usize {
        copy_prefix(out, &self.lock().render_targets)
    }

    pub fn set_interop_surfaces_raw(&self, surfaces: &[TRBridgeInteropSurface]) {
        let mut state = self.lock();
        state.interop_surfaces.clear();
        state.interop_surfaces.extend(surfaces.iter().map(stored_surface));
    }

    pub fn copy_interop_surfaces_raw(&self, out: &mut [TRBridgeInteropSurface]) -> usize {
        copy_prefix(out, &self.lock().interop_surfaces)
    }

    /// First surface whose name bytes equal `name` exactly.
    pub fn interop_surface_raw(&self, name: &[u8]) -> Option<TRBridgeInteropSurface> {
        self.lock()
            .interop_surfaces
            .iter()
            .find(|s| same_name(s, name))
            .copied()
    }

    pub fn update_interop_surface_raw(&self, surface: &TRBridgeInteropSurface) {
        let stored = stored_surface(surface);
        let name = ffi::read_name(&stored.descriptor.name);
        let mut state = self.lock();
        match state.interop_surfaces.iter_mut().find(|s| same_name(s, &name)) {
            Some(existing) => *existing = stored,
            None => state.interop_surfaces.push(stored),
        }
    }

    pub fn set_interop_sync_state_raw(&self, sync: &TRBridgeInteropSyncState) {
        self.lock().sync_state = Some(stored_sync(sync));
    }

    pub fn interop_sync_state_raw(&self) -> Option<TRBridgeInteropSyncState> {
        self.lock().sync_state
    }
}

impl Bridge for SharedRegistry {
    fn initialize(&self) {
        let mut state = self.lock();
        state.ref_count += 1;
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if state.ref_count == 0 {
            return;
        }
        state.ref_count -= 1;
        if state.ref_count == 0 {
            *state = RegistryState::default();
        }
    }

    fn set_configuration(&self, configuration: &Configuration) {
        self.lock().configuration = *configuration;
    }

    fn configuration(&self) -> Configuration {
        self.lock().configuration
    }

    fn set_render_targets(&self, descriptors: &[RenderTargetDescriptor]) {
        let raw: Vec<_> = descriptors.iter().map(RenderTargetDescriptor::to_ffi).collect();
        self.set_render_targets_raw(&raw);
    }

    fn copy_render_targets(&self, out: &mut [RenderTargetDescriptor]) -> usize {
        let state = self.lock();
        for (dst, src) in out.iter_mut().zip(&state.render_targets) {
            *dst = RenderTargetDescriptor::from_ffi(src);
        }
        state.render_targets.len()
    }

    fn register_log_callback(&self, sink: Option<LogSink>) {
        self.lock().log_sink = sink;
    }

    fn log_message(&self, message: &str) {
        let sink = self.lock().log_sink.clone();
        match sink {
            Some(sink) => sink(message),
            None => info!(target: FALLBACK_TARGET, "{message}"),
        }
    }

    fn signal_plugin_frame(&self, inputs: PluginFrameInputs) {
        let callback = {
            let mut state = self.lock();
            state.pending_frame = Some(inputs);
            state.layer_callbacks.on_frame_ready.clone()
        };
        if let Some(callback) = callback {
            callback(inputs.frame_id);
        }
    }

    fn consume_pending_frame(&self) -> Option<PluginFrameInputs> {
        self.lock().pending_frame.take()
    }

    fn peek_pending_frame_id(&self) -> u64 {
        self.lock().pending_frame.map_or(0, |f| f.frame_id)
    }

    fn set_interop_surfaces(&self, surfaces: &[InteropSurface]) {
        let raw: Vec<_> = surfaces.iter().map(InteropSurface::to_ffi).collect();
        self.set_interop_surfaces_raw(&raw);
    }

    fn copy_interop_surfaces(&self, out: &mut [InteropSurface]) -> usize {
        let state = self.lock();
        for (dst, src) in out.iter_mut().zip(&state.interop_surfaces) {
            *dst = InteropSurface::from_ffi(src);
        }
        state.interop_surfaces.len()
    }

    fn interop_surface_count(&self) -> usize {
        self.lock().interop_surfaces.len()
    }

    fn interop_surface(&self, name: &str) -> Option<InteropSurface> {
        let key = crate::types::BridgeName::new(name);
        self.interop_surface_raw(key.as_str().as_bytes())
            .map(|raw| InteropSurface::from_ffi(&raw))
    }

    fn update_interop_surface(&self, surface: &InteropSurface) {
        self.update_interop_surface_raw(&surface.to_ffi());
    }

    fn set_interop_sync_state(&self, sync: &InteropSyncState) {
        self.set_interop_sync_state_raw(&sync.to_ffi());
    }

    fn interop_sync_state(&self) -> Option<InteropSyncState> {
        self.interop_sync_state_raw().map(|raw| InteropSyncState::from_ffi(&raw))
    }

    fn register_layer_callbacks(&self, callbacks: LayerCallbacks) {
        self.lock().layer_callbacks = callbacks;
    }

    fn mark_layer_heartbeat(&self) {
        self.lock().last_layer_heartbeat = timestamp_us();
    }

    fn last_layer_heartbeat(&self) -> u64 {
        self.lock().last_layer_heartbeat
    }
}
