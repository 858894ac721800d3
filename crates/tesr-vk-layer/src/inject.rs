//! Recording and submitting the compute pass for one staged frame.

use anyhow::Context;
use ash::vk;
use tracing::{debug, info};

use crate::frame::{resolve_targets, InjectionTargets, StagedFrame, SubmitSync};
use crate::pipeline::{
    ensure_pipeline, DevicePipeline, QueueCompute, DEPTH_BINDING, DEPTH_SAMPLER_BINDING, OUTPUT_BINDING,
};
use crate::shader::load_compute_shader;
use crate::state::{lock_queue, DeviceEntry, QueueEntry};

/// Upper bound on the host wait for fences the producer listed as waits.
pub const WAIT_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Workgroup edge length declared by the shader.
pub const WORKGROUP_SIZE: u32 = 8;

/// Workgroups covering a `width` x `height` image, at least one per axis.
pub fn dispatch_size(width: u32, height: u32) -> [u32; 3] {
    [
        width.div_ceil(WORKGROUP_SIZE).max(1),
        height.div_ceil(WORKGROUP_SIZE).max(1),
        1,
    ]
}

/// One `vkCmdPipelineBarrier` call.
#[derive(Debug, Clone, Copy)]
pub struct BarrierPlan {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub barriers: [vk::ImageMemoryBarrier<'static>; 2],
}

fn single_level(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn image_barrier(
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    (src_access, old_layout): (vk::AccessFlags, vk::ImageLayout),
    (dst_access, new_layout): (vk::AccessFlags, vk::ImageLayout),
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(single_level(aspect_mask))
}

const OUTPUT_ATTACHMENT: (vk::AccessFlags, vk::ImageLayout) = (
    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
);
const OUTPUT_STORAGE: (vk::AccessFlags, vk::ImageLayout) = (vk::AccessFlags::SHADER_WRITE, vk::ImageLayout::GENERAL);
const DEPTH_ATTACHMENT: (vk::AccessFlags, vk::ImageLayout) = (
    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
);
const DEPTH_SAMPLED: (vk::AccessFlags, vk::ImageLayout) = (
    vk::AccessFlags::SHADER_READ,
    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
);

fn graphics_stages() -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
}

/// Move both images from their attachment layouts into the compute layouts.
pub fn acquire_barriers(targets: &InjectionTargets) -> BarrierPlan {
    BarrierPlan {
        src_stage: graphics_stages(),
        dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        barriers: [
            image_barrier(
                targets.output.image,
                vk::ImageAspectFlags::COLOR,
                OUTPUT_ATTACHMENT,
                OUTPUT_STORAGE,
            ),
            image_barrier(targets.depth.image, targets.depth_aspect, DEPTH_ATTACHMENT, DEPTH_SAMPLED),
        ],
    }
}

/// Return both images to the layouts the renderer left them in.
pub fn release_barriers(targets: &InjectionTargets) -> BarrierPlan {
    BarrierPlan {
        src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        dst_stage: graphics_stages(),
        barriers: [
            image_barrier(
                targets.output.image,
                vk::ImageAspectFlags::COLOR,
                OUTPUT_STORAGE,
                OUTPUT_ATTACHMENT,
            ),
            image_barrier(targets.depth.image, targets.depth_aspect, DEPTH_SAMPLED, DEPTH_ATTACHMENT),
        ],
    }
}

fn bind_targets(
    device: &ash::Device,
    pipeline: &DevicePipeline,
    descriptor_set: vk::DescriptorSet,
    targets: &InjectionTargets,
) {
    let output_info = [vk::DescriptorImageInfo::default()
        .image_view(targets.output.view)
        .image_layout(vk::ImageLayout::GENERAL)];
    let depth_info = [vk::DescriptorImageInfo::default()
        .image_view(targets.depth.view)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
    let sampler_info = [vk::DescriptorImageInfo::default().sampler(pipeline.sampler())];
    let writes = [
        vk::WriteDescriptorSet::default()
            .dst_set(descriptor_set)
            .dst_binding(OUTPUT_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&output_info),
        vk::WriteDescriptorSet::default()
            .dst_set(descriptor_set)
            .dst_binding(DEPTH_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&depth_info),
        vk::WriteDescriptorSet::default()
            .dst_set(descriptor_set)
            .dst_binding(DEPTH_SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(&sampler_info),
    ];
    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

fn record(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    pipeline: &DevicePipeline,
    descriptor_set: vk::DescriptorSet,
    targets: &InjectionTargets,
) -> anyhow::Result<()> {
    let acquire = acquire_barriers(targets);
    let release = release_barriers(targets);
    let [x, y, z] = dispatch_size(targets.output.width, targets.output.height);
    unsafe {
        device
            .begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
            .context("vkBeginCommandBuffer")?;
        device.cmd_pipeline_barrier(
            command_buffer,
            acquire.src_stage,
            acquire.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &acquire.barriers,
        );
        device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline());
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.pipeline_layout(),
            0,
            &[descriptor_set],
            &[],
        );
        device.cmd_dispatch(command_buffer, x, y, z);
        device.cmd_pipeline_barrier(
            command_buffer,
            release.src_stage,
            release.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &release.barriers,
        );
        device.end_command_buffer(command_buffer).context("vkEndCommandBuffer")?;
    }
    Ok(())
}

fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    compute: &mut QueueCompute,
    sync: &SubmitSync,
    frame_id: u64,
) -> anyhow::Result<()> {
    let command_buffers = [compute.command_buffer()];
    let mut timeline = vk::TimelineSemaphoreSubmitInfo::default()
        .wait_semaphore_values(&sync.wait_values)
        .signal_semaphore_values(&sync.signal_values);
    let mut submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&sync.wait_semaphores)
        .wait_dst_stage_mask(&sync.wait_stages)
        .command_buffers(&command_buffers)
        .signal_semaphores(&sync.signal_semaphores);
    if sync.has_timeline {
        submit_info = submit_info.push_next(&mut timeline);
    }

    let fence = sync.external_fence.unwrap_or_else(|| compute.own_fence());
    unsafe { device.queue_submit(queue, &[submit_info], fence) }.context("vkQueueSubmit")?;
    compute.mark_submitted(fence, frame_id);
    compute.wait_idle()
}

/// Run the compute pass for `frame` on `queue` and wait for it to finish.
pub fn inject(queue: vk::Queue, device: &DeviceEntry, owner: &QueueEntry, frame: &StagedFrame) -> anyhow::Result<()> {
    let frame_id = frame.frame_id();
    let shader = load_compute_shader().context("compute shader unavailable")?;
    let targets = resolve_targets(frame)?;
    let sync = SubmitSync::from_state(frame.sync.as_ref());
    let vk_device = &device.dispatch.device;

    // The device lock only covers fetching the pipeline. Other queues of this
    // device may submit while ours waits below.
    let pipeline = ensure_pipeline(&mut device.lock_pipeline(), vk_device, &shader)
        .context("preparing compute pipeline")?;

    let mut queue_slot = lock_queue(&owner.compute);
    let compute = match queue_slot.take() {
        Some(compute) => compute,
        None => QueueCompute::new(vk_device, owner.queue_family_index).context("preparing queue compute state")?,
    };
    let compute = queue_slot.insert(compute);
    compute.wait_idle()?;

    unsafe { vk_device.reset_command_pool(compute.command_pool(), vk::CommandPoolResetFlags::empty()) }
        .context("vkResetCommandPool")?;
    if !sync.wait_fences.is_empty() {
        unsafe { vk_device.wait_for_fences(&sync.wait_fences, true, WAIT_FENCE_TIMEOUT_NS) }
            .context("waiting for producer fences")?;
    }
    let descriptor_set = compute.descriptor_set_for(&pipeline)?;
    bind_targets(vk_device, &pipeline, descriptor_set, &targets);
    record(vk_device, compute.command_buffer(), &pipeline, descriptor_set, &targets)?;
    debug!(
        frame_id,
        waits = sync.wait_semaphores.len(),
        wait_fences = sync.wait_fences.len(),
        signals = sync.signal_semaphores.len(),
        timeline = sync.has_timeline,
        external_fence = sync.external_fence.is_some(),
        "Submitting compute workload"
    );
    submit(vk_device, queue, compute, &sync, frame_id)?;

    info!(frame_id, "Enqueued compute workload");
    Ok(())
}
