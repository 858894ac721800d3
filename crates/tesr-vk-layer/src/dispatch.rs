//! Per-instance and per-device tables of next-layer entry points.

use std::ffi::{c_void, CStr};
use std::mem;

use ash::vk;
use tracing::warn;

/// Device commands the compute injection calls.
pub const REQUIRED_COMPUTE_COMMANDS: &[&CStr] = &[
    c"vkCreateCommandPool",
    c"vkDestroyCommandPool",
    c"vkResetCommandPool",
    c"vkAllocateCommandBuffers",
    c"vkFreeCommandBuffers",
    c"vkBeginCommandBuffer",
    c"vkEndCommandBuffer",
    c"vkCreateFence",
    c"vkDestroyFence",
    c"vkWaitForFences",
    c"vkResetFences",
    c"vkCreateShaderModule",
    c"vkDestroyShaderModule",
    c"vkCreateDescriptorSetLayout",
    c"vkDestroyDescriptorSetLayout",
    c"vkCreatePipelineLayout",
    c"vkDestroyPipelineLayout",
    c"vkCreateComputePipelines",
    c"vkDestroyPipeline",
    c"vkCreateDescriptorPool",
    c"vkDestroyDescriptorPool",
    c"vkAllocateDescriptorSets",
    c"vkUpdateDescriptorSets",
    c"vkCreateSampler",
    c"vkDestroySampler",
    c"vkCmdBindPipeline",
    c"vkCmdBindDescriptorSets",
    c"vkCmdDispatch",
    c"vkCmdPipelineBarrier",
];

/// Whether every command in `names` resolves through `resolve`.
pub fn resolves_all(names: &[&CStr], mut resolve: impl FnMut(&CStr) -> bool) -> bool {
    names.iter().all(|name| resolve(name))
}

pub type PfnCreateInstance = unsafe extern "system" fn(
    *const vk::InstanceCreateInfo<'_>,
    *const vk::AllocationCallbacks<'_>,
    *mut vk::Instance,
) -> vk::Result;

pub type PfnDestroyInstance = unsafe extern "system" fn(vk::Instance, *const vk::AllocationCallbacks<'_>);

pub type PfnCreateDevice = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *const vk::DeviceCreateInfo<'_>,
    *const vk::AllocationCallbacks<'_>,
    *mut vk::Device,
) -> vk::Result;

/// Reinterpret a resolved `PFN_vkVoidFunction` as a concrete signature.
///
/// # Safety
/// `F` must be the function-pointer type matching the resolved command.
pub unsafe fn cast_pfn<F: Copy>(pfn: vk::PFN_vkVoidFunction) -> Option<F> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<unsafe extern "system" fn()>());
    pfn.map(|f| mem::transmute_copy(&f))
}

pub struct InstanceDispatch {
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub destroy_instance: Option<PfnDestroyInstance>,
}

impl InstanceDispatch {
    /// # Safety
    /// `instance` must have just been created through `gipa`.
    pub unsafe fn load(instance: vk::Instance, gipa: vk::PFN_vkGetInstanceProcAddr) -> Self {
        Self {
            next_get_instance_proc_addr: gipa,
            destroy_instance: cast_pfn(gipa(instance, c"vkDestroyInstance".as_ptr())),
        }
    }
}

/// Next-layer device entry points.
///
/// Core commands go through the loaded [`ash::Device`]. The intercepted
/// commands are kept as raw pointers so calls can be forwarded verbatim.
pub struct DeviceDispatch {
    pub device: ash::Device,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub destroy_device: Option<vk::PFN_vkDestroyDevice>,
    pub get_device_queue: Option<vk::PFN_vkGetDeviceQueue>,
    pub get_device_queue2: Option<vk::PFN_vkGetDeviceQueue2>,
    pub queue_submit: Option<vk::PFN_vkQueueSubmit>,
    pub queue_present: Option<vk::PFN_vkQueuePresentKHR>,
    has_compute_support: bool,
}

impl DeviceDispatch {
    /// # Safety
    /// `device` must have just been created through the layer below whose
    /// `vkGetDeviceProcAddr` is `gdpa`.
    pub unsafe fn load(device: vk::Device, gdpa: vk::PFN_vkGetDeviceProcAddr) -> Self {
        let resolve = |name: &CStr| gdpa(device, name.as_ptr());
        let has_compute_support = resolves_all(REQUIRED_COMPUTE_COMMANDS, |name| resolve(name).is_some());
        if !has_compute_support {
            warn!("Compute injection disabled; required device functions are unavailable");
        }
        Self {
            device: ash::Device::load_with(
                |name| resolve(name).map_or(std::ptr::null(), |f| f as *const c_void),
                device,
            ),
            next_get_device_proc_addr: gdpa,
            destroy_device: cast_pfn(resolve(c"vkDestroyDevice")),
            get_device_queue: cast_pfn(resolve(c"vkGetDeviceQueue")),
            get_device_queue2: cast_pfn(resolve(c"vkGetDeviceQueue2")),
            queue_submit: cast_pfn(resolve(c"vkQueueSubmit")),
            queue_present: cast_pfn(resolve(c"vkQueuePresentKHR")),
            has_compute_support,
        }
    }

    pub fn handle(&self) -> vk::Device {
        self.device.handle()
    }

    pub fn has_compute_support(&self) -> bool {
        self.has_compute_support
    }
}
