//! Vulkan objects owned by the layer: the per-device compute pipeline and
//! the per-queue command resources.

use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use tracing::{debug, warn};

use crate::shader::{ShaderBinary, ShaderStamp};

/// A device-level handle destroyed when dropped.
pub struct DeviceObject<T: Copy> {
    device: ash::Device,
    handle: T,
    destroy: fn(&ash::Device, T),
}

impl<T: Copy> DeviceObject<T> {
    pub fn new(device: &ash::Device, handle: T, destroy: fn(&ash::Device, T)) -> Self {
        Self {
            device: device.clone(),
            handle,
            destroy,
        }
    }

    pub fn handle(&self) -> T {
        self.handle
    }
}

impl<T: Copy> Drop for DeviceObject<T> {
    fn drop(&mut self) {
        (self.destroy)(&self.device, self.handle)
    }
}

pub const OUTPUT_BINDING: u32 = 0;
pub const DEPTH_BINDING: u32 = 1;
/// Separate sampler paired with the depth texture in the shader.
pub const DEPTH_SAMPLER_BINDING: u32 = 2;

const BINDING_TYPES: [(u32, vk::DescriptorType); 3] = [
    (OUTPUT_BINDING, vk::DescriptorType::STORAGE_IMAGE),
    (DEPTH_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
    (DEPTH_SAMPLER_BINDING, vk::DescriptorType::SAMPLER),
];

pub fn descriptor_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 3] {
    BINDING_TYPES.map(|(binding, ty)| {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
    })
}

pub fn descriptor_pool_sizes() -> [vk::DescriptorPoolSize; 3] {
    BINDING_TYPES.map(|(_, ty)| vk::DescriptorPoolSize {
        ty,
        descriptor_count: 1,
    })
}

/// Linear clamp-to-edge sampler for the depth input.
pub fn depth_sampler_info() -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_anisotropy(1.0)
        .compare_op(vk::CompareOp::ALWAYS)
        .min_lod(0.0)
        .max_lod(0.0)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
}

/// Compute pipeline shared by every queue of a device.
///
/// Queues hold it through an [`Arc`], so a rebuild after a shader change
/// leaves in-flight work on the old pipeline intact. Fields drop in
/// declaration order, the shader module last.
pub struct DevicePipeline {
    pipeline: DeviceObject<vk::Pipeline>,
    sampler: DeviceObject<vk::Sampler>,
    pipeline_layout: DeviceObject<vk::PipelineLayout>,
    set_layout: DeviceObject<vk::DescriptorSetLayout>,
    shader_module: DeviceObject<vk::ShaderModule>,
    stamp: ShaderStamp,
}

impl DevicePipeline {
    pub fn new(device: &ash::Device, shader: &ShaderBinary) -> anyhow::Result<Self> {
        let shader_module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&shader.code), None)
        }
        .context("vkCreateShaderModule")?;
        let shader_module = DeviceObject::new(device, shader_module, |device, module| unsafe {
            device.destroy_shader_module(module, None)
        });

        let bindings = descriptor_bindings();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
        }
        .context("vkCreateDescriptorSetLayout")?;
        let set_layout = DeviceObject::new(device, set_layout, |device, layout| unsafe {
            device.destroy_descriptor_set_layout(layout, None)
        });

        let set_layouts = [set_layout.handle()];
        let pipeline_layout = unsafe {
            device.create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts), None)
        }
        .context("vkCreatePipelineLayout")?;
        let pipeline_layout = DeviceObject::new(device, pipeline_layout, |device, layout| unsafe {
            device.destroy_pipeline_layout(layout, None)
        });

        let sampler = unsafe { device.create_sampler(&depth_sampler_info(), None) }.context("vkCreateSampler")?;
        let sampler = DeviceObject::new(device, sampler, |device, sampler| unsafe {
            device.destroy_sampler(sampler, None)
        });

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module.handle())
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout.handle());
        let pipeline = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) }
            .map_err(|(_, err)| err)
            .context("vkCreateComputePipelines")?
            .into_iter()
            .next()
            .context("vkCreateComputePipelines returned no pipeline")?;
        let pipeline = DeviceObject::new(device, pipeline, |device, pipeline| unsafe {
            device.destroy_pipeline(pipeline, None)
        });

        debug!(words = shader.code.len(), "Created compute pipeline");
        Ok(Self {
            pipeline,
            sampler,
            pipeline_layout,
            set_layout,
            shader_module,
            stamp: shader.stamp(),
        })
    }

    pub fn stamp(&self) -> ShaderStamp {
        self.stamp
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline.handle()
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout.handle()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout.handle()
    }

    pub fn shader_module(&self) -> vk::ShaderModule {
        self.shader_module.handle()
    }
}

/// Return the value in `slot` if `current` accepts it, otherwise store and
/// return a fresh one from `build`. A replaced value lives on for as long as
/// other holders keep their clones.
pub fn ensure_shared<P>(
    slot: &mut Option<Arc<P>>,
    current: impl FnOnce(&P) -> bool,
    build: impl FnOnce() -> anyhow::Result<P>,
) -> anyhow::Result<Arc<P>> {
    if let Some(existing) = slot.as_ref().filter(|p| current(p)) {
        return Ok(Arc::clone(existing));
    }
    if slot.is_some() {
        debug!("Compute shader changed, rebuilding pipeline");
    }
    *slot = None;
    let fresh = Arc::new(build()?);
    *slot = Some(Arc::clone(&fresh));
    Ok(fresh)
}

/// Make sure `slot` holds a pipeline built from `shader` and hand out a
/// reference the caller can keep after releasing the slot's lock.
pub fn ensure_pipeline(
    slot: &mut Option<Arc<DevicePipeline>>,
    device: &ash::Device,
    shader: &ShaderBinary,
) -> anyhow::Result<Arc<DevicePipeline>> {
    ensure_shared(
        slot,
        |p| p.stamp() == shader.stamp(),
        || DevicePipeline::new(device, shader),
    )
}

/// Descriptor set one queue binds its targets through, tied to the pipeline
/// it was allocated for. The pool drops before the pipeline reference.
struct QueueDescriptors {
    _pool: DeviceObject<vk::DescriptorPool>,
    set: vk::DescriptorSet,
    pipeline: Arc<DevicePipeline>,
}

impl QueueDescriptors {
    fn new(device: &ash::Device, pipeline: &Arc<DevicePipeline>) -> anyhow::Result<Self> {
        let pool_sizes = descriptor_pool_sizes();
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1)
                    .pool_sizes(&pool_sizes),
                None,
            )
        }
        .context("vkCreateDescriptorPool")?;
        let pool = DeviceObject::new(device, pool, |device, pool| unsafe {
            device.destroy_descriptor_pool(pool, None)
        });

        let set_layouts = [pipeline.set_layout()];
        let set = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool.handle())
                    .set_layouts(&set_layouts),
            )
        }
        .context("vkAllocateDescriptorSets")?
        .into_iter()
        .next()
        .context("vkAllocateDescriptorSets returned no set")?;

        Ok(Self {
            _pool: pool,
            set,
            pipeline: Arc::clone(pipeline),
        })
    }
}

/// Command resources for compute work on one queue.
pub struct QueueCompute {
    device: ash::Device,
    fence: DeviceObject<vk::Fence>,
    command_pool: DeviceObject<vk::CommandPool>,
    command_buffer: vk::CommandBuffer,
    descriptors: Option<QueueDescriptors>,
    /// Fence of a submission whose completion has not been observed yet.
    pending: Option<vk::Fence>,
    pub last_submitted_frame: u64,
}

impl QueueCompute {
    pub fn new(device: &ash::Device, queue_family_index: u32) -> anyhow::Result<Self> {
        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }
        .context("vkCreateCommandPool")?;
        let command_pool = DeviceObject::new(device, command_pool, |device, pool| unsafe {
            device.destroy_command_pool(pool, None)
        });

        let command_buffer = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(command_pool.handle())
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }
        .context("vkAllocateCommandBuffers")?
        .into_iter()
        .next()
        .context("vkAllocateCommandBuffers returned no buffer")?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }.context("vkCreateFence")?;
        let fence = DeviceObject::new(device, fence, |device, fence| unsafe { device.destroy_fence(fence, None) });

        debug!(queue_family_index, "Created queue compute state");
        Ok(Self {
            device: device.clone(),
            fence,
            command_pool,
            command_buffer,
            descriptors: None,
            pending: None,
            last_submitted_frame: 0,
        })
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool.handle()
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// This queue's descriptor set for `pipeline`, reallocated when the
    /// device pipeline was rebuilt. Only call once the queue is idle.
    pub fn descriptor_set_for(&mut self, pipeline: &Arc<DevicePipeline>) -> anyhow::Result<vk::DescriptorSet> {
        let descriptors = match self.descriptors.take() {
            Some(current) if Arc::ptr_eq(&current.pipeline, pipeline) => current,
            stale => {
                drop(stale);
                QueueDescriptors::new(&self.device, pipeline)?
            }
        };
        Ok(self.descriptors.insert(descriptors).set)
    }

    pub fn own_fence(&self) -> vk::Fence {
        self.fence.handle()
    }

    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    pub fn mark_submitted(&mut self, fence: vk::Fence, frame_id: u64) {
        self.pending = Some(fence);
        self.last_submitted_frame = frame_id;
    }

    /// Block until the last submission completes. The queue's own fence is
    /// reset afterwards; an external fence is left signaled for its owner.
    pub fn wait_idle(&mut self) -> anyhow::Result<()> {
        let Some(fence) = self.pending else {
            return Ok(());
        };
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }.context("vkWaitForFences")?;
        self.pending = None;
        if fence == self.own_fence() {
            unsafe { self.device.reset_fences(&[fence]) }.context("vkResetFences")?;
        }
        Ok(())
    }
}

impl Drop for QueueCompute {
    fn drop(&mut self) {
        if let Some(fence) = self.pending.take() {
            if let Err(err) = unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) } {
                warn!(error = %err, "Fence wait failed while releasing queue compute state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_match_shader_interface() {
        let bindings = descriptor_bindings();
        assert_eq!(bindings[0].binding, OUTPUT_BINDING);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(bindings[1].binding, DEPTH_BINDING);
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::SAMPLED_IMAGE);
        assert_eq!(bindings[2].binding, DEPTH_SAMPLER_BINDING);
        assert_eq!(bindings[2].descriptor_type, vk::DescriptorType::SAMPLER);
        assert!(bindings
            .iter()
            .all(|b| b.stage_flags == vk::ShaderStageFlags::COMPUTE && b.descriptor_count == 1));
    }

    #[test]
    fn pool_holds_one_descriptor_of_each_type() {
        let sizes = descriptor_pool_sizes();
        for binding in descriptor_bindings() {
            let size = sizes.iter().find(|s| s.ty == binding.descriptor_type).unwrap();
            assert_eq!(size.descriptor_count, 1);
        }
    }

    #[test]
    fn held_pipeline_outlives_rebuild() {
        let mut slot: Option<Arc<u32>> = None;
        let first = ensure_shared(&mut slot, |_| true, || Ok(1)).unwrap();
        let again = ensure_shared(&mut slot, |&v| v == 1, || Ok(99)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // Another queue rebuilds while `first` is still in flight.
        let rebuilt = ensure_shared(&mut slot, |&v| v == 2, || Ok(2)).unwrap();
        assert_eq!(*rebuilt, 2);
        assert_eq!(*first, 1);
        assert_eq!(Arc::strong_count(&first), 2);
        drop(again);
        assert_eq!(Arc::strong_count(&first), 1);
        assert!(Arc::ptr_eq(slot.as_ref().unwrap(), &rebuilt));
    }

    #[test]
    fn failed_rebuild_empties_slot() {
        let mut slot = Some(Arc::new(1u32));
        let result = ensure_shared(&mut slot, |_| false, || anyhow::bail!("no shader module"));
        assert!(result.is_err());
        assert!(slot.is_none());
    }

    #[test]
    fn sampler_clamps_without_mips() {
        let info = depth_sampler_info();
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.max_lod, 0.0);
        assert_eq!(info.compare_enable, vk::FALSE);
        assert_eq!(info.border_color, vk::BorderColor::FLOAT_OPAQUE_WHITE);
    }
}
