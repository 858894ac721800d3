//! The D3D9 traits over the real COM interfaces.

use std::ptr;

use anyhow::Context;
use gpu_interop::NativePtr;
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D9::*;

use crate::d3d9::{D3d9Device, D3d9Surface, D3d9Texture, D3dFormat, SurfaceDesc, TextureUsage};

fn surface_desc(raw: &D3DSURFACE_DESC) -> SurfaceDesc {
    SurfaceDesc {
        width: raw.Width,
        height: raw.Height,
        format: D3dFormat(raw.Format.0 as u32),
    }
}

/// Borrowed device handed to the texture manager by the hooked renderer.
#[derive(Clone)]
pub struct Win32Device(pub IDirect3DDevice9);

impl D3d9Surface for IDirect3DSurface9 {
    fn as_ptr(&self) -> NativePtr {
        NativePtr(self.as_raw())
    }

    fn desc(&self) -> Option<SurfaceDesc> {
        let mut raw = D3DSURFACE_DESC::default();
        unsafe { self.GetDesc(&mut raw) }.ok()?;
        Some(surface_desc(&raw))
    }
}

impl D3d9Texture for IDirect3DTexture9 {
    type Surface = IDirect3DSurface9;

    fn as_ptr(&self) -> NativePtr {
        NativePtr(self.as_raw())
    }

    fn level_desc(&self, level: u32) -> Option<SurfaceDesc> {
        let mut raw = D3DSURFACE_DESC::default();
        unsafe { self.GetLevelDesc(level, &mut raw) }.ok()?;
        Some(surface_desc(&raw))
    }

    fn level_count(&self) -> u32 {
        unsafe { self.GetLevelCount() }
    }

    fn surface_level(&self, level: u32) -> Option<IDirect3DSurface9> {
        unsafe { self.GetSurfaceLevel(level) }.ok()
    }

    fn locked_pitch(&self, level: u32) -> Option<u32> {
        let mut locked = D3DLOCKED_RECT::default();
        unsafe { self.LockRect(level, &mut locked, ptr::null(), D3DLOCK_READONLY as u32) }.ok()?;
        // Unlock failures leave nothing to recover.
        let _ = unsafe { self.UnlockRect(level) };
        u32::try_from(locked.Pitch).ok().filter(|&pitch| pitch > 0)
    }
}

impl D3d9Device for Win32Device {
    type Texture = IDirect3DTexture9;

    fn as_ptr(&self) -> NativePtr {
        NativePtr(self.0.as_raw())
    }

    fn create_texture(
        &self,
        width: u32,
        height: u32,
        usage: TextureUsage,
        format: D3dFormat,
    ) -> anyhow::Result<IDirect3DTexture9> {
        let usage = match usage {
            TextureUsage::RenderTarget => D3DUSAGE_RENDERTARGET as u32,
            TextureUsage::DepthStencil => D3DUSAGE_DEPTHSTENCIL as u32,
        };
        let mut texture = None;
        unsafe {
            self.0.CreateTexture(
                width,
                height,
                1,
                usage,
                D3DFORMAT(format.0 as _),
                D3DPOOL_DEFAULT,
                &mut texture,
                ptr::null_mut(),
            )
        }
        .with_context(|| format!("CreateTexture {width}x{height} format {:#x}", format.0))?;
        texture.context("CreateTexture returned no texture")
    }
}
