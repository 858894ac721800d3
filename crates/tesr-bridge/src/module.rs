//! A [`Bridge`] that forwards to the registry exported by another module.
//!
//! The D3D9 plugin and the Vulkan layer are separate shared objects. Both
//! must talk to one registry instance, so the layer loads the bridge library
//! and calls its `TRBridge_*` exports instead of linking its own copy.

use std::ffi::{c_char, c_void, CStr, CString, OsString};
use std::sync::Mutex;

use libloading::Library;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ffi::*;
use crate::registry::Bridge;
use crate::types::{
    Configuration, FrameReadyFn, InteropSurface, InteropSyncState, LayerCallbacks, LogSink,
    PluginFrameInputs, RenderTargetDescriptor,
};

/// Environment variable overriding the bridge library path.
pub const BRIDGE_MODULE_ENV: &str = "TESR_BRIDGE_MODULE";

#[derive(Debug, Error)]
pub enum ModuleLoadError {
    #[error("could not load bridge module {0:?}")]
    CouldNotLoad(OsString, #[source] libloading::Error),
    #[error("bridge module does not export {0}")]
    MissingSymbol(&'static str, #[source] libloading::Error),
}

/// Platform file name of the bridge library.
pub fn default_module_name() -> OsString {
    libloading::library_filename("tesr_bridge")
}

struct BridgeFunctions {
    initialize: PFN_TRBridge_Initialize,
    shutdown: PFN_TRBridge_Shutdown,
    set_configuration: PFN_TRBridge_SetConfiguration,
    get_configuration: PFN_TRBridge_GetConfiguration,
    set_render_targets: PFN_TRBridge_SetRenderTargets,
    copy_render_targets: PFN_TRBridge_CopyRenderTargets,
    register_log_callback: PFN_TRBridge_RegisterLogCallback,
    log_message: PFN_TRBridge_LogMessage,
    signal_plugin_frame: PFN_TRBridge_SignalPluginFrame,
    consume_pending_frame: PFN_TRBridge_ConsumePendingFrame,
    peek_pending_frame_id: PFN_TRBridge_PeekPendingFrameId,
    set_interop_surfaces: PFN_TRBridge_SetInteropSurfaces,
    copy_interop_surfaces: PFN_TRBridge_CopyInteropSurfaces,
    get_interop_surface_count: PFN_TRBridge_GetInteropSurfaceCount,
    get_interop_surface: PFN_TRBridge_GetInteropSurface,
    update_interop_surface: PFN_TRBridge_UpdateInteropSurface,
    set_interop_sync_state: PFN_TRBridge_SetInteropSyncState,
    get_interop_sync_state: PFN_TRBridge_GetInteropSyncState,
    register_layer_callbacks: PFN_TRBridge_RegisterLayerCallbacks,
    mark_layer_heartbeat: PFN_TRBridge_MarkLayerHeartbeat,
    get_last_layer_heartbeat: PFN_TRBridge_GetLastLayerHeartbeat,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {{
        let symbol = $lib
            .get(concat!($name, "\0").as_bytes())
            .map_err(|e| ModuleLoadError::MissingSymbol($name, e))?;
        *symbol
    }};
}

impl BridgeFunctions {
    unsafe fn load(lib: &Library) -> Result<Self, ModuleLoadError> {
        Ok(Self {
            initialize: resolve!(lib, "TRBridge_Initialize"),
            shutdown: resolve!(lib, "TRBridge_Shutdown"),
            set_configuration: resolve!(lib, "TRBridge_SetConfiguration"),
            get_configuration: resolve!(lib, "TRBridge_GetConfiguration"),
            set_render_targets: resolve!(lib, "TRBridge_SetRenderTargets"),
            copy_render_targets: resolve!(lib, "TRBridge_CopyRenderTargets"),
            register_log_callback: resolve!(lib, "TRBridge_RegisterLogCallback"),
            log_message: resolve!(lib, "TRBridge_LogMessage"),
            signal_plugin_frame: resolve!(lib, "TRBridge_SignalPluginFrame"),
            consume_pending_frame: resolve!(lib, "TRBridge_ConsumePendingFrame"),
            peek_pending_frame_id: resolve!(lib, "TRBridge_PeekPendingFrameId"),
            set_interop_surfaces: resolve!(lib, "TRBridge_SetInteropSurfaces"),
            copy_interop_surfaces: resolve!(lib, "TRBridge_CopyInteropSurfaces"),
            get_interop_surface_count: resolve!(lib, "TRBridge_GetInteropSurfaceCount"),
            get_interop_surface: resolve!(lib, "TRBridge_GetInteropSurface"),
            update_interop_surface: resolve!(lib, "TRBridge_UpdateInteropSurface"),
            set_interop_sync_state: resolve!(lib, "TRBridge_SetInteropSyncState"),
            get_interop_sync_state: resolve!(lib, "TRBridge_GetInteropSyncState"),
            register_layer_callbacks: resolve!(lib, "TRBridge_RegisterLayerCallbacks"),
            mark_layer_heartbeat: resolve!(lib, "TRBridge_MarkLayerHeartbeat"),
            get_last_layer_heartbeat: resolve!(lib, "TRBridge_GetLastLayerHeartbeat"),
        })
    }
}

/// Registry client backed by a loaded bridge library.
pub struct ModuleBridge {
    fns: BridgeFunctions,
    /// Closures handed to the foreign registry as user data. They are never
    /// freed while the library is loaded since the registry may still call
    /// an old one after a re-registration.
    retained_log_sinks: Mutex<Vec<Box<LogSink>>>,
    retained_frame_callbacks: Mutex<Vec<Box<FrameReadyFn>>>,
    _library: Library,
}

impl ModuleBridge {
    /// Load the bridge library from `TESR_BRIDGE_MODULE` or its default name.
    pub fn load_default() -> Result<Self, ModuleLoadError> {
        let path = std::env::var_os(BRIDGE_MODULE_ENV).unwrap_or_else(default_module_name);
        Self::load(path)
    }

    pub fn load(path: OsString) -> Result<Self, ModuleLoadError> {
        unsafe {
            let library = Library::new(&path).map_err(|e| ModuleLoadError::CouldNotLoad(path.clone(), e))?;
            let fns = BridgeFunctions::load(&library)?;
            debug!(module = ?path, "Resolved bridge exports");
            Ok(Self {
                fns,
                retained_log_sinks: Mutex::new(Vec::new()),
                retained_frame_callbacks: Mutex::new(Vec::new()),
                _library: library,
            })
        }
    }
}

unsafe extern "C" fn log_trampoline(message: *const c_char, user_data: *mut c_void) {
    if message.is_null() || user_data.is_null() {
        return;
    }
    let sink = &*(user_data as *const LogSink);
    sink(&CStr::from_ptr(message).to_string_lossy());
}

unsafe extern "C" fn frame_ready_trampoline(frame_id: u64, user_data: *mut c_void) {
    if let Some(callback) = (user_data as *const FrameReadyFn).as_ref() {
        callback(frame_id);
    }
}

impl Bridge for ModuleBridge {
    fn initialize(&self) {
        unsafe { (self.fns.initialize)() }
    }

    fn shutdown(&self) {
        unsafe { (self.fns.shutdown)() }
    }

    fn set_configuration(&self, configuration: &Configuration) {
        let raw = configuration.to_ffi();
        unsafe { (self.fns.set_configuration)(&raw) }
    }

    fn configuration(&self) -> Configuration {
        let mut raw = Configuration::default().to_ffi();
        unsafe { (self.fns.get_configuration)(&mut raw) };
        Configuration::from_ffi(&raw)
    }

    fn set_render_targets(&self, descriptors: &[RenderTargetDescriptor]) {
        let raw: Vec<_> = descriptors.iter().map(RenderTargetDescriptor::to_ffi).collect();
        unsafe { (self.fns.set_render_targets)(raw.as_ptr(), raw.len()) }
    }

    fn copy_render_targets(&self, out: &mut [RenderTargetDescriptor]) -> usize {
        let mut raw = vec![TRBridgeRenderTargetDescriptor::default(); out.len()];
        let total = unsafe { (self.fns.copy_render_targets)(raw.as_mut_ptr(), raw.len()) };
        for (dst, src) in out.iter_mut().zip(raw.iter().take(total)) {
            *dst = RenderTargetDescriptor::from_ffi(src);
        }
        total
    }

    fn register_log_callback(&self, sink: Option<LogSink>) {
        let Some(sink) = sink else {
            unsafe { (self.fns.register_log_callback)(None, std::ptr::null_mut()) };
            return;
        };
        let boxed = Box::new(sink);
        let user_data = &*boxed as *const LogSink as *mut c_void;
        let mut retained = self.retained_log_sinks.lock().unwrap_or_else(|e| e.into_inner());
        retained.push(boxed);
        unsafe { (self.fns.register_log_callback)(Some(log_trampoline), user_data) };
    }

    fn log_message(&self, message: &str) {
        let message = CString::new(message.replace('\0', "")).unwrap_or_default();
        unsafe { (self.fns.log_message)(message.as_ptr()) }
    }

    fn signal_plugin_frame(&self, inputs: PluginFrameInputs) {
        let raw = inputs.to_ffi();
        unsafe { (self.fns.signal_plugin_frame)(&raw) }
    }

    fn consume_pending_frame(&self) -> Option<PluginFrameInputs> {
        let mut raw = TRBridgePluginFrameInputs::default();
        let found = unsafe { (self.fns.consume_pending_frame)(&mut raw) };
        found.then(|| PluginFrameInputs::from_ffi(&raw))
    }

    fn peek_pending_frame_id(&self) -> u64 {
        unsafe { (self.fns.peek_pending_frame_id)() }
    }

    fn set_interop_surfaces(&self, surfaces: &[InteropSurface]) {
        let raw: Vec<_> = surfaces.iter().map(InteropSurface::to_ffi).collect();
        unsafe { (self.fns.set_interop_surfaces)(raw.as_ptr(), raw.len()) }
    }

    fn copy_interop_surfaces(&self, out: &mut [InteropSurface]) -> usize {
        let mut raw = vec![TRBridgeInteropSurface::default(); out.len()];
        let total = unsafe { (self.fns.copy_interop_surfaces)(raw.as_mut_ptr(), raw.len()) };
        for (dst, src) in out.iter_mut().zip(raw.iter().take(total)) {
            *dst = InteropSurface::from_ffi(src);
        }
        total
    }

    fn interop_surface_count(&self) -> usize {
        unsafe { (self.fns.get_interop_surface_count)() }
    }

    fn interop_surface(&self, name: &str) -> Option<InteropSurface> {
        let name = CString::new(name.replace('\0', "")).ok()?;
        let mut raw = TRBridgeInteropSurface::default();
        let found = unsafe { (self.fns.get_interop_surface)(name.as_ptr(), &mut raw) };
        found.then(|| InteropSurface::from_ffi(&raw))
    }

    fn update_interop_surface(&self, surface: &InteropSurface) {
        let raw = surface.to_ffi();
        unsafe { (self.fns.update_interop_surface)(&raw) }
    }

    fn set_interop_sync_state(&self, state: &InteropSyncState) {
        let raw = state.to_ffi();
        unsafe { (self.fns.set_interop_sync_state)(&raw) }
    }

    fn interop_sync_state(&self) -> Option<InteropSyncState> {
        let mut raw = TRBridgeInteropSyncState::default();
        let found = unsafe { (self.fns.get_interop_sync_state)(&mut raw) };
        found.then(|| InteropSyncState::from_ffi(&raw))
    }

    fn register_layer_callbacks(&self, callbacks: LayerCallbacks) {
        let raw = match callbacks.on_frame_ready {
            Some(callback) => {
                let boxed = Box::new(callback);
                let user_data = &*boxed as *const FrameReadyFn as *mut c_void;
                let mut retained = self.retained_frame_callbacks.lock().unwrap_or_else(|e| e.into_inner());
                retained.push(boxed);
                TRBridgeLayerCallbacks {
                    onFrameReady: Some(frame_ready_trampoline),
                    userData: user_data,
                }
            }
            None => TRBridgeLayerCallbacks {
                onFrameReady: None,
                userData: std::ptr::null_mut(),
            },
        };
        unsafe { (self.fns.register_layer_callbacks)(&raw) }
    }

    fn mark_layer_heartbeat(&self) {
        unsafe { (self.fns.mark_layer_heartbeat)() }
    }

    fn last_layer_heartbeat(&self) -> u64 {
        unsafe { (self.fns.get_last_layer_heartbeat)() }
    }
}

/// Connect to the shared bridge library, falling back to the in-process
/// registry when it cannot be loaded. Resolved once per process.
pub fn connect() -> &'static dyn Bridge {
    static SHARED: OnceCell<Option<ModuleBridge>> = OnceCell::new();
    let loaded = SHARED.get_or_init(|| match ModuleBridge::load_default() {
        Ok(bridge) => Some(bridge),
        Err(err) => {
            warn!(error = %err, "Bridge module unavailable, using in-process registry");
            None
        }
    });
    match loaded {
        Some(bridge) => bridge,
        None => crate::registry::global(),
    }
}
