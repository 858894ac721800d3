//! DXVK interop extension backend.

pub mod ffi;
mod interop;

pub use interop::{DxvkInterop, MODULE_NAMES};
