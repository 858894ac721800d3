//! Abstractions over the native D3D9 objects the texture manager owns.
//!
//! The manager is generic over these traits so it can run against the real
//! COM interfaces (see `win32`) or against in-memory fakes in tests.

use std::cell::RefCell;
use std::rc::Rc;

use gpu_interop::NativePtr;

/// A `D3DFORMAT` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct D3dFormat(pub u32);

/// Build a FOURCC format code the way `MAKEFOURCC` does.
pub const fn make_fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

impl D3dFormat {
    pub const A8R8G8B8: Self = Self(21);
    pub const D24S8: Self = Self(75);
    pub const D16: Self = Self(80);
    pub const A16B16G16R16F: Self = Self(113);
    pub const R32F: Self = Self(114);
    pub const G32R32F: Self = Self(115);
    pub const A32B32G32R32F: Self = Self(116);
    /// Depth format readable as a texture.
    pub const INTZ: Self = Self(make_fourcc(b"INTZ"));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: D3dFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    RenderTarget,
    DepthStencil,
}

pub trait D3d9Surface: Clone {
    fn as_ptr(&self) -> NativePtr;

    /// `None` when the native query fails.
    fn desc(&self) -> Option<SurfaceDesc>;
}

pub trait D3d9Texture: Clone {
    type Surface: D3d9Surface;

    fn as_ptr(&self) -> NativePtr;
    fn level_desc(&self, level: u32) -> Option<SurfaceDesc>;
    fn level_count(&self) -> u32;
    fn surface_level(&self, level: u32) -> Option<Self::Surface>;

    /// Row pitch of `level` from a read-only lock.
    fn locked_pitch(&self, level: u32) -> Option<u32>;
}

pub trait D3d9Device {
    type Texture: D3d9Texture;

    fn as_ptr(&self) -> NativePtr;

    /// Create a single-level texture in the default pool.
    fn create_texture(
        &self,
        width: u32,
        height: u32,
        usage: TextureUsage,
        format: D3dFormat,
    ) -> anyhow::Result<Self::Texture>;
}

pub type SurfaceOf<D> = <<D as D3d9Device>::Texture as D3d9Texture>::Surface;

/// Shared, late-bound reference to a resource.
///
/// Registration stores a clone of the slot; the resource is read through it
/// at publish time, so it may be created or replaced after registration.
#[derive(Debug)]
pub struct ResourceSlot<T>(Rc<RefCell<Option<T>>>);

impl<T> Clone for ResourceSlot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for ResourceSlot<T> {
    fn default() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }
}

impl<T: Clone> ResourceSlot<T> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, value: Option<T>) {
        *self.0.borrow_mut() = value;
    }

    pub fn get(&self) -> Option<T> {
        self.0.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_none()
    }
}

/// A texture and its level-0 surface, bound together as a render target.
pub struct RenderTarget<T: D3d9Texture> {
    pub texture: ResourceSlot<T>,
    pub surface: ResourceSlot<T::Surface>,
}

impl<T: D3d9Texture> Default for RenderTarget<T> {
    fn default() -> Self {
        Self {
            texture: ResourceSlot::default(),
            surface: ResourceSlot::default(),
        }
    }
}

impl<T: D3d9Texture> Clone for RenderTarget<T> {
    fn clone(&self) -> Self {
        Self {
            texture: self.texture.clone(),
            surface: self.surface.clone(),
        }
    }
}

impl<T: D3d9Texture> RenderTarget<T> {
    pub fn clear(&self) {
        self.surface.set(None);
        self.texture.set(None);
    }
}
