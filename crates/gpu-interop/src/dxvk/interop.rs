//! Runtime binding to the optional DXVK interop extension module.
//!
//! The module is looked up once, by trying a fixed list of library names.
//! If it is missing, or lacks one of the two mandatory entry points, the
//! backend stays unavailable for the rest of the process.

use libloading::Library;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info, warn};

use super::ffi::*;
use crate::backend::{FrameSync, InteropBackend, NativePtr, SurfaceCreateInfo, SurfaceInfo};

/// Library names tried in order.
#[cfg(target_os = "windows")]
pub const MODULE_NAMES: &[&str] = &["dxvk_interop.dll", "TESReloaded_dxvk_interop.dll"];

/// Library names tried in order.
#[cfg(not(target_os = "windows"))]
pub const MODULE_NAMES: &[&str] = &["libdxvk_interop.so", "libtesreloaded_dxvk_interop.so"];

/// Resolved entry points. Mandatory ones are plain function pointers.
struct DxvkDispatch {
    initialize: Option<PFN_dxvk_interop_initialize>,
    is_available: PFN_dxvk_interop_is_available,
    get_surface_info: PFN_dxvk_interop_get_surface_info,
    create_sibling_surface: Option<PFN_dxvk_interop_create_sibling_surface>,
    get_frame_sync: Option<PFN_dxvk_interop_get_frame_sync>,
    debug_upload: Option<PFN_dxvk_interop_debug_upload>,
    debug_download: Option<PFN_dxvk_interop_debug_download>,
    _library: Library,
}

impl DxvkDispatch {
    fn resolve(module_names: &[&str]) -> Option<Self> {
        let (name, library) = module_names
            .iter()
            .find_map(|name| unsafe { Library::new(*name).ok().map(|lib| (*name, lib)) })?;

        unsafe {
            let optional = |symbol: &[u8]| library.get::<*const ()>(symbol).ok().map(|s| *s);
            let is_available = optional(b"dxvk_interop_is_available\0");
            let get_surface_info = optional(b"dxvk_interop_get_surface_info\0");
            let (Some(is_available), Some(get_surface_info)) = (is_available, get_surface_info) else {
                warn!(module = name, "Interop module lacks mandatory entry points");
                return None;
            };

            let initialize = optional(b"dxvk_interop_initialize\0");
            let create_sibling_surface = optional(b"dxvk_interop_create_sibling_surface\0");
            let get_frame_sync = optional(b"dxvk_interop_get_frame_sync\0");
            let debug_upload = optional(b"dxvk_interop_debug_upload\0");
            let debug_download = optional(b"dxvk_interop_debug_download\0");

            debug!(module = name, "Resolved interop module");
            Some(Self {
                initialize: initialize.map(|p| std::mem::transmute::<*const (), PFN_dxvk_interop_initialize>(p)),
                is_available: std::mem::transmute::<*const (), PFN_dxvk_interop_is_available>(is_available),
                get_surface_info: std::mem::transmute::<*const (), PFN_dxvk_interop_get_surface_info>(
                    get_surface_info,
                ),
                create_sibling_surface: create_sibling_surface
                    .map(|p| std::mem::transmute::<*const (), PFN_dxvk_interop_create_sibling_surface>(p)),
                get_frame_sync: get_frame_sync
                    .map(|p| std::mem::transmute::<*const (), PFN_dxvk_interop_get_frame_sync>(p)),
                debug_upload: debug_upload.map(|p| std::mem::transmute::<*const (), PFN_dxvk_interop_debug_upload>(p)),
                debug_download: debug_download
                    .map(|p| std::mem::transmute::<*const (), PFN_dxvk_interop_debug_download>(p)),
                _library: library,
            })
        }
    }
}

/// [`InteropBackend`] backed by the DXVK interop extension.
pub struct DxvkInterop {
    module_names: &'static [&'static str],
    dispatch: OnceCell<Option<DxvkDispatch>>,
}

static SHARED: Lazy<DxvkInterop> = Lazy::new(|| DxvkInterop::with_module_names(MODULE_NAMES));

impl DxvkInterop {
    /// The process-wide backend using the default module names.
    pub fn shared() -> &'static DxvkInterop {
        &SHARED
    }

    pub fn with_module_names(module_names: &'static [&'static str]) -> Self {
        Self {
            module_names,
            dispatch: OnceCell::new(),
        }
    }

    fn dispatch(&self) -> Option<&DxvkDispatch> {
        self.dispatch
            .get_or_init(|| {
                let dispatch = DxvkDispatch::resolve(self.module_names);
                if dispatch.is_none() {
                    info!("DXVK interop module not found, interop disabled");
                }
                dispatch
            })
            .as_ref()
    }
}

impl InteropBackend for DxvkInterop {
    fn initialize(&self, device: NativePtr) -> bool {
        let Some(dispatch) = self.dispatch() else {
            return false;
        };
        if device.is_null() {
            return false;
        }
        match dispatch.initialize {
            Some(initialize) => unsafe { initialize(device.0) },
            None => true,
        }
    }

    fn is_available(&self) -> bool {
        self.dispatch().is_some_and(|d| unsafe { (d.is_available)() })
    }

    fn surface_info(&self, texture: NativePtr) -> Option<SurfaceInfo> {
        let dispatch = self.dispatch()?;
        if texture.is_null() {
            return None;
        }
        let mut out = DxvkInteropSurfaceInfo::default();
        let ok = unsafe { (dispatch.get_surface_info)(texture.0, &mut out) };
        if !ok {
            return None;
        }
        out.to_surface_info()
    }

    fn create_sibling_surface(&self, device: NativePtr, info: &SurfaceCreateInfo) -> Option<SurfaceInfo> {
        let create = self.dispatch()?.create_sibling_surface?;
        if device.is_null() {
            return None;
        }
        let raw = DxvkInteropSurfaceCreateInfo::from(info);
        let mut out = DxvkInteropSurfaceInfo::default();
        let ok = unsafe { create(device.0, &raw, &mut out) };
        if !ok {
            return None;
        }
        out.to_surface_info()
    }

    fn frame_sync(&self, device: NativePtr) -> Option<FrameSync> {
        let get_frame_sync = self.dispatch()?.get_frame_sync?;
        if device.is_null() {
            return None;
        }
        let mut out = DxvkInteropFrameSync::default();
        let ok = unsafe { get_frame_sync(device.0, &mut out) };
        if !ok {
            return None;
        }
        out.to_frame_sync()
    }

    fn debug_upload(&self, surface: NativePtr, info: &SurfaceInfo) -> bool {
        let Some(upload) = self.dispatch().and_then(|d| d.debug_upload) else {
            return false;
        };
        if surface.is_null() {
            return false;
        }
        let raw = DxvkInteropSurfaceInfo::from_surface_info(info);
        unsafe { upload(surface.0, &raw) }
    }

    fn debug_download(&self, surface: NativePtr, info: &SurfaceInfo) -> bool {
        let Some(download) = self.dispatch().and_then(|d| d.debug_download) else {
            return false;
        };
        if surface.is_null() {
            return false;
        }
        let raw = DxvkInteropSurfaceInfo::from_surface_info(info);
        unsafe { download(surface.0, &raw) }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;

    use super::*;

    static MISSING: &[&str] = &["tesr_test_no_such_interop_module_a", "tesr_test_no_such_interop_module_b"];

    #[test]
    fn missing_module_fails_closed() {
        let backend = DxvkInterop::with_module_names(MISSING);
        let fake = NativePtr(0x1000 as *mut c_void);
        assert!(!backend.is_available());
        assert!(!backend.initialize(fake));
        assert!(backend.surface_info(fake).is_none());
        assert!(backend.frame_sync(fake).is_none());
        let create = SurfaceCreateInfo {
            width: 4,
            height: 4,
            mip_levels: 1,
            array_layers: 1,
            format: 37,
            usage_flags: 1,
            sample_count: 1,
        };
        assert!(backend.create_sibling_surface(fake, &create).is_none());
        assert!(!backend.debug_upload(fake, &SurfaceInfo::default()));
    }

    #[test]
    fn resolution_is_cached() {
        let backend = DxvkInterop::with_module_names(MISSING);
        assert!(!backend.is_available());
        assert!(backend.dispatch.get().is_some());
        assert!(!backend.is_available());
    }
}
