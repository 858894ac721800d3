//! Render-target ownership and bridge publishing.
//!
//! The manager creates the D3D9 render targets the pipeline needs, asks the
//! interop backend for Vulkan siblings, and mirrors the whole set into the
//! registry in one [`TextureManager::publish_bridge_state`] call whenever it
//! changes.

use std::collections::BTreeMap;

use gpu_interop::{InteropBackend, SurfaceCreateInfo, SurfaceInfo};
use tesr_bridge::names::{
    DEPTH_TEXTURE, MAIN_DEPTH_STENCIL, RENDERED_TEXTURE, SOURCE_TEXTURE,
};
use tesr_bridge::{
    Bridge, BridgeName, Configuration, InteropHandle, InteropSurface, InteropSyncState,
    PluginFrameInputs, RenderTargetDescriptor, SemaphoreValue, UsageFlags,
};
use tracing::{debug, error, info, warn};

use crate::config::InteropEnv;
use crate::d3d9::{
    D3d9Device, D3d9Surface, D3d9Texture, D3dFormat, RenderTarget, ResourceSlot, SurfaceDesc,
    SurfaceOf, TextureUsage,
};
use crate::format::descriptor_format;

/// Indirect references to a published target's resources.
struct BridgeTarget<T: D3d9Texture> {
    texture: Option<ResourceSlot<T>>,
    surface: Option<ResourceSlot<T::Surface>>,
    usage: UsageFlags,
}

pub const COLOR_TARGET_USAGE: UsageFlags = UsageFlags::COLOR.union(UsageFlags::SAMPLED);
pub const DEPTH_TARGET_USAGE: UsageFlags = UsageFlags::DEPTH.union(UsageFlags::SAMPLED);

/// Owner of the render targets shared with the Vulkan side.
pub struct TextureManager<'a, D: D3d9Device> {
    device: D,
    bridge: &'a dyn Bridge,
    backend: &'a dyn InteropBackend,
    env: InteropEnv,
    interop_available: bool,
    /// Keyed by name so publishing iterates in sorted order.
    targets: BTreeMap<BridgeName, BridgeTarget<D::Texture>>,
    siblings: BTreeMap<BridgeName, SurfaceInfo>,
    published_count: u32,
    pub source: RenderTarget<D::Texture>,
    pub rendered: RenderTarget<D::Texture>,
    pub depth: RenderTarget<D::Texture>,
    effect_targets: BTreeMap<BridgeName, RenderTarget<D::Texture>>,
}

impl<'a, D: D3d9Device> TextureManager<'a, D> {
    pub fn new(device: D, bridge: &'a dyn Bridge, backend: &'a dyn InteropBackend, env: InteropEnv) -> Self {
        Self {
            device,
            bridge,
            backend,
            env,
            interop_available: false,
            targets: BTreeMap::new(),
            siblings: BTreeMap::new(),
            published_count: 0,
            source: RenderTarget::default(),
            rendered: RenderTarget::default(),
            depth: RenderTarget::default(),
            effect_targets: BTreeMap::new(),
        }
    }

    pub fn interop_available(&self) -> bool {
        self.interop_available
    }

    /// Create the core render targets and publish them.
    pub fn initialize(&mut self, width: u32, height: u32) {
        info!(width, height, "Starting the texture manager");
        self.bridge.initialize();

        self.siblings.clear();
        self.targets.clear();
        self.interop_available = self.probe_interop();

        let format = D3dFormat::A16B16G16R16F;
        self.init_texture("TESR_SourceBuffer", &self.source.clone(), width, height, format);
        self.init_texture("TESR_RenderedBuffer", &self.rendered.clone(), width, height, format);
        self.init_depth_texture(width, height);

        let (source, rendered, depth) = (self.source.clone(), self.rendered.clone(), self.depth.clone());
        self.register_bridge_render_target(
            SOURCE_TEXTURE,
            Some(source.texture.clone()),
            Some(source.surface.clone()),
            COLOR_TARGET_USAGE,
        );
        self.register_bridge_render_target(
            RENDERED_TEXTURE,
            Some(rendered.texture.clone()),
            Some(rendered.surface.clone()),
            COLOR_TARGET_USAGE,
        );
        self.register_bridge_render_target(
            DEPTH_TEXTURE,
            Some(depth.texture.clone()),
            Some(depth.surface.clone()),
            DEPTH_TARGET_USAGE,
        );
        self.register_bridge_render_target(MAIN_DEPTH_STENCIL, None, Some(depth.surface.clone()), DEPTH_TARGET_USAGE);

        if self.interop_available {
            self.register_texture_interop(SOURCE_TEXTURE, source.texture.get(), COLOR_TARGET_USAGE);
            self.register_texture_interop(RENDERED_TEXTURE, rendered.texture.get(), COLOR_TARGET_USAGE);
            self.register_texture_interop(DEPTH_TEXTURE, depth.texture.get(), DEPTH_TARGET_USAGE);

            if let Some(info) = self.sibling(DEPTH_TEXTURE).copied() {
                self.siblings.insert(BridgeName::new(MAIN_DEPTH_STENCIL), info);
            }

            self.validate_surface(SOURCE_TEXTURE, source.surface.get());
            self.validate_surface(RENDERED_TEXTURE, rendered.surface.get());
            self.validate_surface(DEPTH_TEXTURE, depth.surface.get());
        }

        self.publish_bridge_state();
    }

    fn probe_interop(&self) -> bool {
        if !self.env.enable_interop {
            info!("Vulkan interop disabled (TESR_ENABLE_VK_INTEROP not set)");
            return false;
        }
        let initialized = self.backend.initialize(self.device.as_ptr());
        if initialized && self.backend.is_available() {
            let suffix = if self.env.validate_interop { " with validation" } else { "" };
            info!("Vulkan interop enabled{suffix}");
            true
        } else {
            warn!(initialized, "Vulkan interop requested but unavailable");
            false
        }
    }

    /// Create a render-target texture and bind its level-0 surface into `target`.
    pub fn init_texture(
        &self,
        name: &str,
        target: &RenderTarget<D::Texture>,
        width: u32,
        height: u32,
        format: D3dFormat,
    ) -> bool {
        self.create_into(name, target, width, height, TextureUsage::RenderTarget, format)
    }

    fn init_depth_texture(&self, width: u32, height: u32) -> bool {
        let depth = self.depth.clone();
        self.create_into("TESR_DepthBufferWorld", &depth, width, height, TextureUsage::DepthStencil, D3dFormat::INTZ)
    }

    fn create_into(
        &self,
        name: &str,
        target: &RenderTarget<D::Texture>,
        width: u32,
        height: u32,
        usage: TextureUsage,
        format: D3dFormat,
    ) -> bool {
        match self.device.create_texture(width, height, usage, format) {
            Ok(texture) => {
                target.surface.set(texture.surface_level(0));
                target.texture.set(Some(texture));
                debug!(name, width, height, ?format, "Created texture");
                true
            }
            Err(err) => {
                error!(name, error = %err, "Failed to init texture");
                target.clear();
                false
            }
        }
    }

    /// Record indirect references to a target's resources under `name`.
    ///
    /// The slots are read at publish time, so they may still be empty.
    /// Registering an existing name replaces it.
    pub fn register_bridge_render_target(
        &mut self,
        name: &str,
        texture: Option<ResourceSlot<D::Texture>>,
        surface: Option<ResourceSlot<SurfaceOf<D>>>,
        usage: UsageFlags,
    ) -> bool {
        let name = BridgeName::new(name);
        if name.is_empty() {
            return false;
        }
        self.targets.insert(name, BridgeTarget { texture, surface, usage });
        true
    }

    /// Create, register and publish a render target owned by an effect.
    pub fn create_effect_target(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        format: D3dFormat,
        usage: UsageFlags,
    ) -> RenderTarget<D::Texture> {
        let target = self
            .effect_targets
            .entry(BridgeName::new(name))
            .or_default()
            .clone();
        self.init_texture(name, &target, width, height, format);
        self.register_bridge_render_target(name, Some(target.texture.clone()), Some(target.surface.clone()), usage);
        self.publish_bridge_state();
        target
    }

    fn sibling(&self, name: &str) -> Option<&SurfaceInfo> {
        self.siblings.get(&BridgeName::new(name))
    }

    /// Find or create the Vulkan sibling of `texture` and cache it by name.
    fn register_texture_interop(&mut self, name: &str, texture: Option<D::Texture>, usage: UsageFlags) {
        if !self.interop_available {
            return;
        }
        let Some(texture) = texture else {
            return;
        };

        let info = match self.backend.surface_info(texture.as_ptr()) {
            Some(info) => info,
            None => {
                let Some(desc) = texture.level_desc(0) else {
                    return;
                };
                let create_info = SurfaceCreateInfo {
                    width: desc.width,
                    height: desc.height,
                    mip_levels: texture.level_count().max(1),
                    array_layers: 1,
                    format: desc.format.0,
                    usage_flags: usage.bits(),
                    sample_count: 1,
                };
                match self.backend.create_sibling_surface(self.device.as_ptr(), &create_info) {
                    Some(info) => info,
                    None => {
                        warn!(name, "Failed to create Vulkan sibling surface");
                        return;
                    }
                }
            }
        };

        let mut info = info;
        if info.row_pitch == 0 {
            if let Some(pitch) = texture.locked_pitch(0) {
                info.row_pitch = pitch;
            }
        }
        debug!(name, image = info.image, "Registered interop surface");
        self.siblings.insert(BridgeName::new(name), info);
    }

    /// CPU readback of a freshly created sibling, when enabled.
    fn validate_surface(&self, name: &str, surface: Option<SurfaceOf<D>>) {
        if !self.env.validate_interop {
            return;
        }
        let (Some(surface), Some(info)) = (surface, self.sibling(name)) else {
            return;
        };
        if self.backend.debug_download(surface.as_ptr(), info) {
            info!(name, "Validated Vulkan surface via CPU readback");
        } else {
            warn!(name, "Failed to validate Vulkan surface via CPU readback");
        }
    }

    /// Publish every registered target as one consistent snapshot.
    ///
    /// Targets whose resources are missing or cannot be described are
    /// skipped for this cycle. Returns the number of targets published.
    pub fn publish_bridge_state(&mut self) -> usize {
        let mut descriptors = Vec::with_capacity(self.targets.len());
        let mut surfaces = Vec::with_capacity(self.targets.len());

        let names: Vec<BridgeName> = self.targets.keys().copied().collect();
        for name in names {
            let Some(entry) = self.targets.get(&name) else {
                continue;
            };
            let usage = entry.usage;
            let texture = entry.texture.as_ref().and_then(ResourceSlot::get);
            let surface = entry.surface.as_ref().and_then(ResourceSlot::get);

            let desc: Option<SurfaceDesc> = texture
                .as_ref()
                .and_then(|t| t.level_desc(0))
                .or_else(|| surface.as_ref().and_then(D3d9Surface::desc));
            let Some(desc) = desc else {
                continue;
            };

            let descriptor = RenderTargetDescriptor {
                name,
                width: desc.width,
                height: desc.height,
                mip_levels: texture.as_ref().map_or(1, |t| t.level_count().max(1)),
                array_layers: 1,
                format: descriptor_format(desc.format, usage),
                usage,
            };

            let mut interop = InteropSurface::new(descriptor);
            if let Some(texture) = &texture {
                interop.push_handle(InteropHandle::D3d9Texture(texture.as_ptr().addr()));
            }
            if let Some(surface) = &surface {
                interop.push_handle(InteropHandle::D3d9Surface(surface.as_ptr().addr()));
            }

            if self.interop_available
                && texture.is_some()
                && !self.siblings.contains_key(&name)
                && !self.device.as_ptr().is_null()
            {
                self.register_texture_interop(name.as_str(), texture.clone(), usage);
            }

            if let Some(info) = self.siblings.get(&name) {
                append_sibling_handles(&mut interop, info);
            }

            descriptors.push(descriptor);
            surfaces.push(interop);
        }

        self.bridge.set_render_targets(&descriptors);
        self.bridge.set_interop_surfaces(&surfaces);
        self.published_count = descriptors.len() as u32;
        debug!(count = descriptors.len(), "Published bridge state");
        descriptors.len()
    }

    pub fn apply_configuration(&self, configuration: &Configuration) {
        self.bridge.set_configuration(configuration);
    }

    /// Publish this frame's sync state, if the backend has one, then signal
    /// the frame.
    pub fn signal_frame(&self, frame_id: u64) {
        if self.interop_available {
            if let Some(sync) = self.backend.frame_sync(self.device.as_ptr()) {
                let mut state = InteropSyncState::new(frame_id);
                if let Some(acquire) = sync.acquire {
                    state.push_wait(InteropHandle::VkSemaphore(acquire.semaphore, semaphore_value(acquire)));
                }
                if let Some(release) = sync.release {
                    state.push_signal(InteropHandle::VkSemaphore(release.semaphore, semaphore_value(release)));
                }
                if let Some(fence) = sync.completion_fence {
                    state.push_signal(InteropHandle::VkFence(fence));
                }
                self.bridge.set_interop_sync_state(&state);
            }
        }

        self.bridge.signal_plugin_frame(PluginFrameInputs {
            frame_id,
            render_target_count: self.published_count,
        });
    }

    /// Release every owned resource and drop the registry reference.
    pub fn shutdown(&mut self) {
        self.source.clear();
        self.rendered.clear();
        self.depth.clear();
        for target in self.effect_targets.values() {
            target.clear();
        }
        self.effect_targets.clear();
        self.targets.clear();
        self.siblings.clear();
        self.published_count = 0;
        self.bridge.shutdown();
    }
}

fn semaphore_value(point: gpu_interop::SemaphorePoint) -> SemaphoreValue {
    if point.is_timeline {
        SemaphoreValue::Timeline(point.value)
    } else {
        SemaphoreValue::Binary(point.value)
    }
}

/// Append Vulkan handles in priority order; the list silently stops at its
/// capacity.
fn append_sibling_handles(interop: &mut InteropSurface, info: &SurfaceInfo) {
    let candidates = [
        InteropHandle::VkImage(info.image),
        InteropHandle::VkImageView(info.image_view),
        InteropHandle::VkDeviceMemory(info.memory),
        InteropHandle::Win32SharedHandle(info.win32_handle),
    ];
    for handle in candidates {
        interop.push_handle(handle);
    }
    if let Some(fd) = info.opaque_fd {
        interop.push_handle(InteropHandle::OpaqueFd(fd as u64));
    }
    if info.row_pitch != 0 {
        interop.row_pitch = info.row_pitch;
    }
    if info.depth_pitch != 0 {
        interop.depth_pitch = info.depth_pitch;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::ffi::c_void;
    use std::sync::Mutex;

    use gpu_interop::{FrameSync, NativePtr, SemaphorePoint, UnavailableBackend};
    use tesr_bridge::names::NORMALS_BUFFER;
    use tesr_bridge::{BridgeFormat, HandleKind, SharedRegistry};

    use super::*;

    fn ptr(id: usize) -> NativePtr {
        NativePtr(id as *mut c_void)
    }

    #[derive(Clone)]
    struct FakeSurface {
        id: usize,
        desc: Option<SurfaceDesc>,
    }

    impl D3d9Surface for FakeSurface {
        fn as_ptr(&self) -> NativePtr {
            ptr(self.id)
        }

        fn desc(&self) -> Option<SurfaceDesc> {
            self.desc
        }
    }

    #[derive(Clone)]
    struct FakeTexture {
        id: usize,
        desc: SurfaceDesc,
        pitch: u32,
    }

    impl D3d9Texture for FakeTexture {
        type Surface = FakeSurface;

        fn as_ptr(&self) -> NativePtr {
            ptr(self.id)
        }

        fn level_desc(&self, level: u32) -> Option<SurfaceDesc> {
            (level == 0).then_some(self.desc)
        }

        fn level_count(&self) -> u32 {
            1
        }

        fn surface_level(&self, level: u32) -> Option<FakeSurface> {
            (level == 0).then(|| FakeSurface {
                id: self.id + 1,
                desc: Some(self.desc),
            })
        }

        fn locked_pitch(&self, _level: u32) -> Option<u32> {
            Some(self.pitch)
        }
    }

    struct FakeDevice {
        next_id: Cell<usize>,
        fail_format: Option<D3dFormat>,
    }

    impl FakeDevice {
        fn new() -> Self {
            Self {
                next_id: Cell::new(0x1000),
                fail_format: None,
            }
        }
    }

    impl D3d9Device for FakeDevice {
        type Texture = FakeTexture;

        fn as_ptr(&self) -> NativePtr {
            ptr(0xD3D9)
        }

        fn create_texture(
            &self,
            width: u32,
            height: u32,
            _usage: TextureUsage,
            format: D3dFormat,
        ) -> anyhow::Result<FakeTexture> {
            if self.fail_format == Some(format) {
                anyhow::bail!("CreateTexture failed");
            }
            let id = self.next_id.get();
            self.next_id.set(id + 0x10);
            Ok(FakeTexture {
                id,
                desc: SurfaceDesc { width, height, format },
                pitch: width * 8,
            })
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        available: bool,
        existing: bool,
        sync: Option<FrameSync>,
        created: Mutex<Vec<SurfaceCreateInfo>>,
        downloads: Mutex<u32>,
    }

    impl FakeBackend {
        fn available() -> Self {
            Self {
                available: true,
                ..Default::default()
            }
        }

        fn info_for(seed: u64, width: u32, height: u32) -> SurfaceInfo {
            SurfaceInfo {
                width,
                height,
                mip_levels: 1,
                array_layers: 1,
                image: seed,
                image_view: seed + 1,
                memory: seed + 2,
                win32_handle: seed + 3,
                opaque_fd: Some(9),
                ..Default::default()
            }
        }
    }

    impl InteropBackend for FakeBackend {
        fn initialize(&self, device: NativePtr) -> bool {
            self.available && !device.is_null()
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn surface_info(&self, texture: NativePtr) -> Option<SurfaceInfo> {
            self.existing
                .then(|| Self::info_for(texture.addr() << 8, 0, 0))
                .map(|info| SurfaceInfo { row_pitch: 64, ..info })
        }

        fn create_sibling_surface(&self, _device: NativePtr, info: &SurfaceCreateInfo) -> Option<SurfaceInfo> {
            let mut created = self.created.lock().unwrap();
            created.push(*info);
            Some(Self::info_for(0x100 * created.len() as u64, info.width, info.height))
        }

        fn frame_sync(&self, _device: NativePtr) -> Option<FrameSync> {
            self.sync
        }

        fn debug_upload(&self, _surface: NativePtr, _info: &SurfaceInfo) -> bool {
            true
        }

        fn debug_download(&self, _surface: NativePtr, _info: &SurfaceInfo) -> bool {
            *self.downloads.lock().unwrap() += 1;
            true
        }
    }

    fn env(enable: bool, validate: bool) -> InteropEnv {
        InteropEnv {
            enable_interop: enable,
            validate_interop: validate,
        }
    }

    #[test]
    fn initialize_publishes_core_targets_in_name_order() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(false, false));
        manager.initialize(1280, 720);

        assert!(!manager.interop_available());
        let targets = registry.render_targets();
        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            [DEPTH_TEXTURE, MAIN_DEPTH_STENCIL, RENDERED_TEXTURE, SOURCE_TEXTURE]
        );
        assert!(targets.iter().all(|t| t.width == 1280 && t.height == 720));
        assert_eq!(targets[0].format, BridgeFormat::D24UnormS8Uint);
        assert_eq!(targets[2].format, BridgeFormat::R16G16B16A16Float);
        assert_eq!(targets[2].usage, COLOR_TARGET_USAGE);
    }

    #[test]
    fn surface_only_target_publishes_just_the_surface_handle() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(false, false));
        manager.initialize(64, 64);

        let main = registry.interop_surface(MAIN_DEPTH_STENCIL).unwrap();
        let kinds: Vec<_> = main.handles().iter().map(InteropHandle::kind).collect();
        assert_eq!(kinds, [HandleKind::D3d9SurfacePointer]);

        let depth = registry.interop_surface(DEPTH_TEXTURE).unwrap();
        let kinds: Vec<_> = depth.handles().iter().map(InteropHandle::kind).collect();
        assert_eq!(kinds, [HandleKind::D3d9TexturePointer, HandleKind::D3d9SurfacePointer]);
        assert_eq!(main.handles()[0], depth.handles()[1]);
    }

    #[test]
    fn failed_texture_is_skipped_without_aborting_publish() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let device = FakeDevice {
            fail_format: Some(D3dFormat::INTZ),
            ..FakeDevice::new()
        };
        let mut manager = TextureManager::new(device, &registry, &backend, env(false, false));
        manager.initialize(32, 32);

        let names: Vec<_> = registry.render_targets().iter().map(|t| t.name).collect();
        assert_eq!(names, [BridgeName::new(RENDERED_TEXTURE), BridgeName::new(SOURCE_TEXTURE)]);
    }

    #[test]
    fn empty_slot_registered_early_is_published_once_filled() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(false, false));

        let late = RenderTarget::<FakeTexture>::default();
        manager.register_bridge_render_target("TESR_Late", Some(late.texture.clone()), None, COLOR_TARGET_USAGE);
        assert_eq!(manager.publish_bridge_state(), 0);

        manager.init_texture("TESR_Late", &late, 16, 8, D3dFormat::A8R8G8B8);
        assert_eq!(manager.publish_bridge_state(), 1);
        let published = registry.interop_surface("TESR_Late").unwrap();
        assert_eq!(published.descriptor.format, BridgeFormat::R8G8B8A8Unorm);
        assert_eq!(published.descriptor.width, 16);
    }

    #[test]
    fn empty_name_is_rejected() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(false, false));
        assert!(!manager.register_bridge_render_target("", None, None, COLOR_TARGET_USAGE));
    }

    #[test]
    fn interop_appends_sibling_handles_up_to_capacity() {
        let registry = SharedRegistry::new();
        let backend = FakeBackend::available();
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(true, false));
        manager.initialize(256, 128);
        assert!(manager.interop_available());

        let created = backend.created.lock().unwrap().clone();
        assert_eq!(created.len(), 3);
        assert_eq!(created[0].format, D3dFormat::A16B16G16R16F.0);
        assert_eq!(created[0].usage_flags, COLOR_TARGET_USAGE.bits());
        assert_eq!(created[2].format, D3dFormat::INTZ.0);

        let source = registry.interop_surface(SOURCE_TEXTURE).unwrap();
        let kinds: Vec<_> = source.handles().iter().map(InteropHandle::kind).collect();
        assert_eq!(
            kinds,
            [
                HandleKind::D3d9TexturePointer,
                HandleKind::D3d9SurfacePointer,
                HandleKind::VkImage,
                HandleKind::VkImageView,
            ]
        );
        // Zero row pitch from the backend is filled from a lock.
        assert_eq!(source.row_pitch, 256 * 8);

        let main = registry.interop_surface(MAIN_DEPTH_STENCIL).unwrap();
        let depth = registry.interop_surface(DEPTH_TEXTURE).unwrap();
        assert_eq!(main.vk_image(), depth.vk_image());
        assert!(main.vk_image().is_some());
    }

    #[test]
    fn existing_sibling_is_reused() {
        let registry = SharedRegistry::new();
        let backend = FakeBackend {
            existing: true,
            ..FakeBackend::available()
        };
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(true, false));
        manager.initialize(8, 8);

        assert!(backend.created.lock().unwrap().is_empty());
        let source = registry.interop_surface(SOURCE_TEXTURE).unwrap();
        assert_eq!(source.row_pitch, 64);
    }

    #[test]
    fn validation_reads_back_each_core_surface() {
        let registry = SharedRegistry::new();
        let backend = FakeBackend::available();
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(true, true));
        manager.initialize(8, 8);
        assert_eq!(*backend.downloads.lock().unwrap(), 3);
    }

    #[test]
    fn interop_requested_but_unavailable_falls_back() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(true, true));
        manager.initialize(8, 8);
        assert!(!manager.interop_available());
        assert_eq!(registry.interop_surface_count(), 4);
    }

    #[test]
    fn effect_target_is_published_immediately() {
        let registry = SharedRegistry::new();
        let backend = FakeBackend::available();
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(true, false));
        manager.initialize(64, 32);

        let normals = manager.create_effect_target(
            NORMALS_BUFFER,
            64,
            32,
            D3dFormat::A16B16G16R16F,
            COLOR_TARGET_USAGE,
        );
        assert!(!normals.texture.is_empty());
        let published = registry.interop_surface(NORMALS_BUFFER).unwrap();
        assert!(published.vk_image().is_some());
        assert_eq!(registry.interop_surface_count(), 5);
    }

    #[test]
    fn signal_frame_publishes_sync_then_frame() {
        let registry = SharedRegistry::new();
        let backend = FakeBackend {
            sync: Some(FrameSync {
                acquire: Some(SemaphorePoint {
                    semaphore: 0xA,
                    value: 5,
                    is_timeline: true,
                }),
                release: Some(SemaphorePoint {
                    semaphore: 0xB,
                    value: 0,
                    is_timeline: false,
                }),
                completion_fence: Some(0xF),
            }),
            ..FakeBackend::available()
        };
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(true, false));
        manager.initialize(8, 8);
        manager.signal_frame(42);

        let sync = registry.interop_sync_state().unwrap();
        assert_eq!(sync.frame_id, 42);
        assert_eq!(
            sync.wait_handles(),
            [InteropHandle::VkSemaphore(0xA, SemaphoreValue::Timeline(5))]
        );
        assert_eq!(
            sync.signal_handles(),
            [
                InteropHandle::VkSemaphore(0xB, SemaphoreValue::Binary(0)),
                InteropHandle::VkFence(0xF),
            ]
        );
        let frame = registry.consume_pending_frame().unwrap();
        assert_eq!(frame.frame_id, 42);
        assert_eq!(frame.render_target_count, 4);
    }

    #[test]
    fn shutdown_releases_registry_reference() {
        let registry = SharedRegistry::new();
        let backend = UnavailableBackend;
        let mut manager = TextureManager::new(FakeDevice::new(), &registry, &backend, env(false, false));
        manager.initialize(8, 8);
        assert_eq!(registry.ref_count(), 1);

        manager.shutdown();
        assert_eq!(registry.ref_count(), 0);
        assert_eq!(registry.interop_surface_count(), 0);
        assert!(manager.source.texture.is_empty());
    }
}
