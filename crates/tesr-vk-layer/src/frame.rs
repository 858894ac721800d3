//! Frames staged out of the registry and the per-frame inputs derived from
//! them.
//!
//! Everything the injection needs is copied out of the registry while
//! polling, so no registry call happens during GPU work.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail};
use ash::vk::{self, Handle};
use tesr_bridge::{names, Bridge, BridgeFormat, InteropHandle, InteropSurface, InteropSyncState, PluginFrameInputs};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct StagedFrame {
    pub inputs: PluginFrameInputs,
    pub surfaces: Vec<InteropSurface>,
    /// Present only when the registry's sync state belongs to this frame.
    pub sync: Option<InteropSyncState>,
}

impl StagedFrame {
    /// Consume the pending frame and snapshot what goes with it.
    pub fn capture(bridge: &dyn Bridge) -> Option<Self> {
        let inputs = bridge.consume_pending_frame()?;
        let surfaces = bridge.interop_surfaces();
        let sync = match bridge.interop_sync_state() {
            Some(state) if state.frame_id == inputs.frame_id => Some(state),
            Some(state) => {
                debug!(
                    frame_id = inputs.frame_id,
                    sync_frame_id = state.frame_id,
                    "Ignoring sync state of another frame"
                );
                None
            }
            None => None,
        };

        debug!(
            frame_id = inputs.frame_id,
            surfaces = surfaces.len(),
            "Staged frame from bridge"
        );
        for surface in &surfaces {
            debug!(
                name = %surface.descriptor.name,
                width = surface.descriptor.width,
                height = surface.descriptor.height,
                format = ?surface.descriptor.format,
                handles = surface.handles().len(),
                "Staged surface"
            );
            for handle in surface.handles() {
                debug!(name = %surface.descriptor.name, ?handle, "Staged handle");
            }
        }
        if let Some(sync) = &sync {
            debug!(
                frame_id = sync.frame_id,
                waits = sync.wait_handles().len(),
                signals = sync.signal_handles().len(),
                "Staged sync state"
            );
        }

        Some(Self { inputs, surfaces, sync })
    }

    pub fn frame_id(&self) -> u64 {
        self.inputs.frame_id
    }

    pub fn surface(&self, name: &str) -> Option<&InteropSurface> {
        self.surfaces.iter().find(|surface| surface.name() == name)
    }
}

/// Holds at most one frame between polling and injection.
#[derive(Debug, Default)]
pub struct FrameStage {
    staged: Mutex<Option<StagedFrame>>,
}

impl FrameStage {
    pub const fn new() -> Self {
        Self {
            staged: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<StagedFrame>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pull a frame from `bridge` unless one is already staged. Returns
    /// whether a frame is staged afterwards.
    pub fn poll(&self, bridge: &dyn Bridge) -> bool {
        let mut staged = self.lock();
        if staged.is_none() {
            *staged = StagedFrame::capture(bridge);
        }
        staged.is_some()
    }

    pub fn take(&self) -> Option<StagedFrame> {
        self.lock().take()
    }

    pub fn staged_frame_id(&self) -> Option<u64> {
        self.lock().as_ref().map(StagedFrame::frame_id)
    }
}

/// A published image the compute pass binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub width: u32,
    pub height: u32,
    pub format: BridgeFormat,
}

impl ImageTarget {
    fn from_surface(surface: &InteropSurface) -> Option<Self> {
        Some(Self {
            image: vk::Image::from_raw(surface.vk_image()?),
            view: vk::ImageView::from_raw(surface.vk_image_view()?),
            width: surface.descriptor.width,
            height: surface.descriptor.height,
            format: surface.descriptor.format,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionTargets {
    pub output: ImageTarget,
    pub depth: ImageTarget,
    pub depth_aspect: vk::ImageAspectFlags,
}

pub fn depth_aspect(format: BridgeFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Find the output and depth images among the frame's surfaces.
pub fn resolve_targets(frame: &StagedFrame) -> anyhow::Result<InjectionTargets> {
    let frame_id = frame.frame_id();
    let output_surface = frame
        .surface(names::RENDERED_TEXTURE)
        .ok_or_else(|| anyhow!("no rendered texture surface for frame {frame_id}"))?;
    let output = ImageTarget::from_surface(output_surface)
        .ok_or_else(|| anyhow!("missing Vulkan handles for rendered texture in frame {frame_id}"))?;

    let depth_surface = frame
        .surface(names::DEPTH_TEXTURE)
        .or_else(|| frame.surface(names::MAIN_DEPTH_STENCIL))
        .ok_or_else(|| anyhow!("no depth surface for frame {frame_id}"))?;
    let depth = ImageTarget::from_surface(depth_surface)
        .ok_or_else(|| anyhow!("missing Vulkan handles for depth texture in frame {frame_id}"))?;

    if output.width == 0 || output.height == 0 {
        bail!(
            "rendered texture has invalid dimensions ({}x{}) for frame {frame_id}",
            output.width,
            output.height
        );
    }

    Ok(InjectionTargets {
        output,
        depth,
        depth_aspect: depth_aspect(depth.format),
    })
}

/// Semaphores and fence decoded from a frame's sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSync {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_values: Vec<u64>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    /// Fences the producer listed as waits. A submit cannot wait on a fence,
    /// so these are waited on from the host first.
    pub wait_fences: Vec<vk::Fence>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub signal_values: Vec<u64>,
    pub has_timeline: bool,
    pub external_fence: Option<vk::Fence>,
}

impl SubmitSync {
    pub fn from_state(state: Option<&InteropSyncState>) -> Self {
        let mut sync = Self::default();
        let Some(state) = state else {
            return sync;
        };

        for handle in state.wait_handles() {
            match *handle {
                InteropHandle::VkSemaphore(raw, value) => {
                    sync.wait_semaphores.push(vk::Semaphore::from_raw(raw));
                    sync.wait_values.push(value.counter());
                    sync.wait_stages.push(vk::PipelineStageFlags::COMPUTE_SHADER);
                    sync.has_timeline |= value.is_timeline();
                }
                InteropHandle::VkFence(raw) => sync.wait_fences.push(vk::Fence::from_raw(raw)),
                _ => {}
            }
        }
        for handle in state.signal_handles() {
            match *handle {
                InteropHandle::VkSemaphore(raw, value) => {
                    sync.signal_semaphores.push(vk::Semaphore::from_raw(raw));
                    sync.signal_values.push(value.counter());
                    sync.has_timeline |= value.is_timeline();
                }
                InteropHandle::VkFence(raw) => sync.external_fence = Some(vk::Fence::from_raw(raw)),
                _ => {}
            }
        }
        sync
    }

    pub fn is_empty(&self) -> bool {
        self.wait_semaphores.is_empty()
            && self.wait_fences.is_empty()
            && self.signal_semaphores.is_empty()
            && self.external_fence.is_none()
    }
}

#[cfg(test)]
mod tests {
    use tesr_bridge::{RenderTargetDescriptor, SemaphoreValue, SharedRegistry, UsageFlags};

    use super::*;

    fn surface(name: &str, format: BridgeFormat, image: u64, view: u64) -> InteropSurface {
        let mut surface = InteropSurface::new(RenderTargetDescriptor::new(name, 1920, 1080, format, UsageFlags::SAMPLED));
        surface.push_handle(InteropHandle::VkImage(image));
        surface.push_handle(InteropHandle::VkImageView(view));
        surface
    }

    fn frame(frame_id: u64, surfaces: Vec<InteropSurface>) -> StagedFrame {
        StagedFrame {
            inputs: PluginFrameInputs {
                frame_id,
                render_target_count: surfaces.len() as u32,
            },
            surfaces,
            sync: None,
        }
    }

    fn publish_frame(registry: &SharedRegistry, frame_id: u64, sync_frame_id: u64) {
        registry.initialize();
        registry.set_interop_surfaces(&[surface(
            names::RENDERED_TEXTURE,
            BridgeFormat::R16G16B16A16Float,
            0x10,
            0x11,
        )]);
        let mut sync = InteropSyncState::new(sync_frame_id);
        sync.push_wait(InteropHandle::VkSemaphore(0x20, SemaphoreValue::Timeline(5)));
        registry.set_interop_sync_state(&sync);
        registry.signal_plugin_frame(PluginFrameInputs {
            frame_id,
            render_target_count: 1,
        });
    }

    #[test]
    fn capture_keeps_sync_of_same_frame() {
        let registry = SharedRegistry::new();
        publish_frame(&registry, 7, 7);

        let staged = StagedFrame::capture(&registry).unwrap();
        assert_eq!(staged.frame_id(), 7);
        assert_eq!(staged.surfaces.len(), 1);
        assert_eq!(staged.sync.as_ref().map(|s| s.frame_id), Some(7));
    }

    #[test]
    fn mismatched_sync_frame_skips_semaphores() {
        let registry = SharedRegistry::new();
        publish_frame(&registry, 8, 7);

        let staged = StagedFrame::capture(&registry).unwrap();
        assert!(staged.sync.is_none());
        let sync = SubmitSync::from_state(staged.sync.as_ref());
        assert!(sync.is_empty());
        assert!(!sync.has_timeline);
    }

    #[test]
    fn stage_polls_only_when_empty() {
        let registry = SharedRegistry::new();
        let stage = FrameStage::new();
        assert!(!stage.poll(&registry));

        publish_frame(&registry, 1, 1);
        assert!(stage.poll(&registry));
        registry.signal_plugin_frame(PluginFrameInputs {
            frame_id: 2,
            render_target_count: 1,
        });
        assert!(stage.poll(&registry));
        assert_eq!(stage.staged_frame_id(), Some(1));
        assert_eq!(registry.peek_pending_frame_id(), 2);

        assert_eq!(stage.take().map(|f| f.frame_id()), Some(1));
        assert!(stage.take().is_none());
        assert!(stage.poll(&registry));
        assert_eq!(stage.staged_frame_id(), Some(2));
    }

    #[test]
    fn depth_falls_back_to_main_depth_stencil() {
        let staged = frame(
            3,
            vec![
                surface(names::RENDERED_TEXTURE, BridgeFormat::R16G16B16A16Float, 1, 2),
                surface(names::MAIN_DEPTH_STENCIL, BridgeFormat::D24UnormS8Uint, 3, 4),
            ],
        );
        let targets = resolve_targets(&staged).unwrap();
        assert_eq!(targets.output.image, vk::Image::from_raw(1));
        assert_eq!(targets.depth.view, vk::ImageView::from_raw(4));
        assert_eq!(
            targets.depth_aspect,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn primary_depth_name_wins() {
        let staged = frame(
            3,
            vec![
                surface(names::MAIN_DEPTH_STENCIL, BridgeFormat::D24UnormS8Uint, 3, 4),
                surface(names::DEPTH_TEXTURE, BridgeFormat::R32Sfloat, 5, 6),
                surface(names::RENDERED_TEXTURE, BridgeFormat::R16G16B16A16Float, 1, 2),
            ],
        );
        let targets = resolve_targets(&staged).unwrap();
        assert_eq!(targets.depth.image, vk::Image::from_raw(5));
        assert_eq!(targets.depth_aspect, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn missing_views_abort_resolution() {
        let mut output = InteropSurface::new(RenderTargetDescriptor::new(
            names::RENDERED_TEXTURE,
            64,
            64,
            BridgeFormat::R8G8B8A8Unorm,
            UsageFlags::COLOR,
        ));
        output.push_handle(InteropHandle::VkImage(1));
        let staged = frame(4, vec![output, surface(names::DEPTH_TEXTURE, BridgeFormat::D24UnormS8Uint, 3, 4)]);
        assert!(resolve_targets(&staged).is_err());

        let staged = frame(5, vec![surface(names::RENDERED_TEXTURE, BridgeFormat::R8G8B8A8Unorm, 1, 2)]);
        let err = resolve_targets(&staged).unwrap_err();
        assert!(err.to_string().contains("no depth surface"));
    }

    #[test]
    fn zero_sized_output_is_rejected() {
        let mut output = surface(names::RENDERED_TEXTURE, BridgeFormat::R8G8B8A8Unorm, 1, 2);
        output.descriptor.height = 0;
        let staged = frame(6, vec![output, surface(names::DEPTH_TEXTURE, BridgeFormat::D24UnormS8Uint, 3, 4)]);
        assert!(resolve_targets(&staged).is_err());
    }

    #[test]
    fn sync_decodes_timelines_and_external_fence() {
        let mut state = InteropSyncState::new(9);
        state.push_wait(InteropHandle::VkSemaphore(0x1, SemaphoreValue::Binary(0)));
        state.push_wait(InteropHandle::VkFence(0x9));
        state.push_signal(InteropHandle::VkSemaphore(0x2, SemaphoreValue::Timeline(12)));
        state.push_signal(InteropHandle::VkFence(0x3));
        state.push_signal(InteropHandle::VkFence(0x4));

        let sync = SubmitSync::from_state(Some(&state));
        assert_eq!(sync.wait_semaphores, vec![vk::Semaphore::from_raw(1)]);
        assert_eq!(sync.wait_values, vec![0]);
        assert_eq!(sync.wait_stages, vec![vk::PipelineStageFlags::COMPUTE_SHADER]);
        assert_eq!(sync.wait_fences, vec![vk::Fence::from_raw(9)]);
        assert_eq!(sync.signal_values, vec![12]);
        assert!(sync.has_timeline);
        assert_eq!(sync.external_fence, Some(vk::Fence::from_raw(4)));
    }

    #[test]
    fn binary_only_sync_has_no_timeline() {
        let mut state = InteropSyncState::new(1);
        state.push_signal(InteropHandle::VkSemaphore(0x2, SemaphoreValue::Binary(0)));
        let sync = SubmitSync::from_state(Some(&state));
        assert!(!sync.has_timeline);
        assert_eq!(sync.external_fence, None);
    }

    #[test]
    fn aux_values_reach_the_submit() {
        let mut raw = InteropSyncState::new(4).to_ffi();
        let handle = |type_: u32, value: u64, aux: u64| tesr_bridge::ffi::TRBridgeInteropHandle {
            type_,
            value,
            auxValue: aux,
        };
        raw.waitHandles[0] = handle(tesr_bridge::ffi::TR_BRIDGE_INTEROP_HANDLE_VK_SEMAPHORE, 0x1, 3);
        raw.waitHandles[1] = handle(
            tesr_bridge::ffi::TR_BRIDGE_INTEROP_HANDLE_VK_SEMAPHORE,
            0x2,
            tesr_bridge::ffi::TR_BRIDGE_HANDLE_AUX_TIMELINE_BIT | 40,
        );
        raw.waitHandles[2] = handle(tesr_bridge::ffi::TR_BRIDGE_INTEROP_HANDLE_VK_FENCE, 0x3, 0);
        raw.waitHandleCount = 3;
        raw.signalHandles[0] = handle(tesr_bridge::ffi::TR_BRIDGE_INTEROP_HANDLE_VK_SEMAPHORE, 0x4, 8);
        raw.signalHandleCount = 1;

        let sync = SubmitSync::from_state(Some(&InteropSyncState::from_ffi(&raw)));
        assert_eq!(
            sync.wait_semaphores,
            vec![vk::Semaphore::from_raw(1), vk::Semaphore::from_raw(2)]
        );
        assert_eq!(sync.wait_values, vec![3, 40]);
        assert_eq!(sync.wait_fences, vec![vk::Fence::from_raw(3)]);
        assert_eq!(sync.signal_values, vec![8]);
        assert!(sync.has_timeline);
        assert!(!sync.is_empty());
    }

    #[test]
    fn wait_fence_alone_is_not_empty() {
        let mut state = InteropSyncState::new(2);
        state.push_wait(InteropHandle::VkFence(0x7));
        let sync = SubmitSync::from_state(Some(&state));
        assert!(sync.wait_semaphores.is_empty());
        assert!(!sync.is_empty());
    }
}
