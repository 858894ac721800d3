//! Shared state registry between the D3D9 plugin and the Vulkan layer.
//!
//! This crate builds both as a Rust library and as the `tesr_bridge` shared
//! library exporting the `TRBridge_*` C ABI. In-process users program against
//! the [`Bridge`] trait; other modules either link the exports or go through
//! [`module::connect`].

pub mod exports;
pub mod ffi;
pub mod logging;
pub mod module;
pub mod registry;
pub mod types;

pub use registry::{global, Bridge, SharedRegistry};
pub use types::{
    BridgeFormat, BridgeName, ConfigFlags, Configuration, HandleKind, InteropHandle, InteropSurface,
    InteropSyncState, LayerCallbacks, LogSink, PluginFrameInputs, RenderTargetDescriptor,
    SemaphoreValue, UsageFlags, MAX_INTEROP_HANDLES,
};

/// Names the producer reserves for well-known render targets.
pub mod names {
    pub const SOURCE_TEXTURE: &str = "TESR_SourceTexture";
    /// The surface compute work writes into.
    pub const RENDERED_TEXTURE: &str = "TESR_RenderedTexture";
    pub const DEPTH_TEXTURE: &str = "TESR_DepthTexture";
    /// Consulted when no `TESR_DepthTexture` surface is published.
    pub const MAIN_DEPTH_STENCIL: &str = "TESR_MainDepthStencil";
    pub const NORMALS_BUFFER: &str = "TESR_NormalsBuffer";
}
