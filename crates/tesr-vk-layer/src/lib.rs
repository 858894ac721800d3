//! Implicit Vulkan layer that runs a compute pass over the frames the D3D9
//! plugin publishes through the bridge registry.
//!
//! The loader talks to [`hooks`]. Each `vkQueueSubmit` and
//! `vkQueuePresentKHR` stages the newest pending frame from the registry and,
//! when compute is enabled, records and submits a dispatch against the
//! frame's rendered and depth images on the same queue. Injection is best
//! effort: a failure is logged and the application's call proceeds.

pub mod config;
pub mod dispatch;
pub mod frame;
pub mod hooks;
pub mod inject;
pub mod loader;
pub mod pipeline;
pub mod shader;
pub mod state;

pub use config::LayerEnv;
pub use frame::{FrameStage, StagedFrame, SubmitSync};
