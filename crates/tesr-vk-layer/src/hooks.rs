//! Entry points exported to the Vulkan loader.

#![allow(non_snake_case)]

use std::ffi::{c_char, CStr};
use std::sync::{Arc, Once};

use ash::vk::{self, Handle};
use tesr_bridge::{logging, module, Bridge};
use tracing::{debug, error, info, warn};

use crate::dispatch::{cast_pfn, DeviceDispatch, InstanceDispatch, PfnCreateDevice, PfnCreateInstance};
use crate::frame::StagedFrame;
use crate::inject::inject;
use crate::loader::{
    enumerate_into, layer_properties, take_device_chain, take_instance_chain, NegotiateLayerInterface,
    LOADER_INTERFACE_VERSION,
};
use crate::state::{dispatch_key, lock_queue, state, DeviceEntry, QueueEntry, STAGE};

/// The registry shared with the producer, with log forwarding installed on
/// first use.
fn bridge() -> &'static dyn Bridge {
    static LOGGING: Once = Once::new();
    let bridge = module::connect();
    LOGGING.call_once(|| logging::install(bridge));
    bridge
}

macro_rules! hook {
    ($f:expr) => {
        Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>($f as *const ()) })
    };
}

fn device_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    match name {
        b"vkGetDeviceProcAddr" => hook!(vkGetDeviceProcAddr),
        b"vkDestroyDevice" => hook!(destroy_device),
        b"vkGetDeviceQueue" => hook!(get_device_queue),
        b"vkGetDeviceQueue2" => hook!(get_device_queue2),
        b"vkQueueSubmit" => hook!(queue_submit),
        b"vkQueuePresentKHR" => hook!(queue_present),
        _ => None,
    }
}

fn instance_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    match name {
        b"vkGetInstanceProcAddr" => hook!(vkGetInstanceProcAddr),
        b"vkCreateInstance" => hook!(create_instance),
        b"vkDestroyInstance" => hook!(destroy_instance),
        b"vkCreateDevice" => hook!(create_device),
        _ => device_hook(name),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    interface: *mut NegotiateLayerInterface,
) -> vk::Result {
    let Some(interface) = interface.as_mut() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if interface.loader_layer_interface_version < LOADER_INTERFACE_VERSION {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    interface.loader_layer_interface_version = LOADER_INTERFACE_VERSION;
    interface.pfn_get_instance_proc_addr = Some(vkGetInstanceProcAddr);
    interface.pfn_get_device_proc_addr = Some(vkGetDeviceProcAddr);
    interface.pfn_get_physical_device_proc_addr = None;
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkGetInstanceProcAddr(
    instance: vk::Instance,
    name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if name.is_null() {
        return None;
    }
    if let Some(hooked) = instance_hook(CStr::from_ptr(name).to_bytes()) {
        return Some(hooked);
    }
    if instance == vk::Instance::null() {
        return None;
    }
    let next = state()
        .instances
        .get(&dispatch_key(instance.as_raw()))
        .map(|dispatch| dispatch.next_get_instance_proc_addr);
    next.and_then(|gipa| gipa(instance, name))
}

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(device: vk::Device, name: *const c_char) -> vk::PFN_vkVoidFunction {
    if name.is_null() {
        return None;
    }
    if let Some(hooked) = device_hook(CStr::from_ptr(name).to_bytes()) {
        return Some(hooked);
    }
    if device == vk::Device::null() {
        return None;
    }
    let next = state()
        .device(device)
        .map(|entry| entry.dispatch.next_get_device_proc_addr);
    next.and_then(|gdpa| gdpa(device, name))
}

// The enumeration entry points below are only reached through the exported
// symbols, when the loader asks about this layer by name. Proc-addr lookups
// for them fall through to the next layer so whole-chain queries see every
// extension below us.

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceLayerProperties(
    count: *mut u32,
    properties: *mut vk::LayerProperties,
) -> vk::Result {
    enumerate_into(&[layer_properties()], count, properties)
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceExtensionProperties(
    _layer_name: *const c_char,
    count: *mut u32,
    properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    enumerate_into::<vk::ExtensionProperties>(&[], count, properties)
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateDeviceLayerProperties(
    _physical_device: vk::PhysicalDevice,
    count: *mut u32,
    properties: *mut vk::LayerProperties,
) -> vk::Result {
    enumerate_into(&[layer_properties()], count, properties)
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateDeviceExtensionProperties(
    _physical_device: vk::PhysicalDevice,
    _layer_name: *const c_char,
    count: *mut u32,
    properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    enumerate_into::<vk::ExtensionProperties>(&[], count, properties)
}

unsafe extern "system" fn create_instance(
    create_info: *const vk::InstanceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    instance_out: *mut vk::Instance,
) -> vk::Result {
    debug!("vkCreateInstance intercept");
    let gipa = match create_next_instance(bridge(), create_info, allocator, instance_out) {
        Ok(gipa) => gipa,
        Err(err) => return err,
    };

    let instance = *instance_out;
    state().instances.insert(
        dispatch_key(instance.as_raw()),
        Arc::new(InstanceDispatch::load(instance, gipa)),
    );
    info!("Layer attached to instance");
    vk::Result::SUCCESS
}

/// Create the instance through the next layer. The registry reference is
/// taken before calling down and released again if creation fails.
unsafe fn create_next_instance(
    bridge: &dyn Bridge,
    create_info: *const vk::InstanceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    instance_out: *mut vk::Instance,
) -> Result<vk::PFN_vkGetInstanceProcAddr, vk::Result> {
    bridge.initialize();
    let created = call_next_create_instance(create_info, allocator, instance_out);
    if created.is_err() {
        bridge.shutdown();
    }
    created
}

unsafe fn call_next_create_instance(
    create_info: *const vk::InstanceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    instance_out: *mut vk::Instance,
) -> Result<vk::PFN_vkGetInstanceProcAddr, vk::Result> {
    let Some(chain) = take_instance_chain(create_info) else {
        error!("No loader link info in vkCreateInstance chain");
        return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
    };
    let gipa = chain.next_get_instance_proc_addr;
    let Some(create) = cast_pfn::<PfnCreateInstance>(gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr())) else {
        error!("Next layer does not provide vkCreateInstance");
        return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
    };
    match create(create_info, allocator, instance_out) {
        vk::Result::SUCCESS => Ok(gipa),
        err => Err(err),
    }
}

unsafe extern "system" fn destroy_instance(instance: vk::Instance, allocator: *const vk::AllocationCallbacks<'_>) {
    if instance == vk::Instance::null() {
        return;
    }
    debug!("vkDestroyInstance intercept");
    let dispatch = state().instances.remove(&dispatch_key(instance.as_raw()));
    let Some(dispatch) = dispatch else {
        warn!("vkDestroyInstance on an unknown instance");
        return;
    };
    if let Some(destroy) = dispatch.destroy_instance {
        destroy(instance, allocator);
    }
    bridge().shutdown();
}

unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    create_info: *const vk::DeviceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    device_out: *mut vk::Device,
) -> vk::Result {
    debug!("vkCreateDevice intercept");
    bridge().mark_layer_heartbeat();

    let Some(chain) = take_device_chain(create_info) else {
        error!("No loader link info in vkCreateDevice chain");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create = cast_pfn::<PfnCreateDevice>((chain.next_get_instance_proc_addr)(
        vk::Instance::null(),
        c"vkCreateDevice".as_ptr(),
    ));
    let Some(create) = create else {
        error!("Next layer does not provide vkCreateDevice");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let result = create(physical_device, create_info, allocator, device_out);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let device = *device_out;
    let dispatch = DeviceDispatch::load(device, chain.next_get_device_proc_addr);
    state()
        .devices
        .insert(dispatch_key(device.as_raw()), Arc::new(DeviceEntry::new(dispatch)));
    info!("Layer attached to device");
    vk::Result::SUCCESS
}

unsafe extern "system" fn destroy_device(device: vk::Device, allocator: *const vk::AllocationCallbacks<'_>) {
    if device == vk::Device::null() {
        return;
    }
    debug!("vkDestroyDevice intercept");
    let (entry, queues) = {
        let mut state = state();
        let entry = state.device(device);
        (entry, state.remove_queues_of(device))
    };

    // Queue state waits out its fence on drop, then the pipeline goes.
    for slot in queues {
        drop(lock_queue(&slot).take());
    }
    let Some(entry) = entry else {
        warn!("vkDestroyDevice on an unknown device");
        return;
    };
    drop(entry.lock_pipeline().take());

    if let Some(destroy) = entry.dispatch.destroy_device {
        destroy(device, allocator);
    }
    state().devices.remove(&dispatch_key(device.as_raw()));
}

unsafe fn register_queue(device: vk::Device, queue: *const vk::Queue, queue_family_index: u32) {
    let Some(&queue) = queue.as_ref() else {
        return;
    };
    if queue != vk::Queue::null() {
        state().register_queue(queue, device, queue_family_index);
    }
}

unsafe extern "system" fn get_device_queue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    queue: *mut vk::Queue,
) {
    let Some(entry) = state().device(device) else {
        return;
    };
    if let Some(get_queue) = entry.dispatch.get_device_queue {
        get_queue(device, queue_family_index, queue_index, queue);
        register_queue(device, queue, queue_family_index);
    }
}

unsafe extern "system" fn get_device_queue2(
    device: vk::Device,
    queue_info: *const vk::DeviceQueueInfo2<'_>,
    queue: *mut vk::Queue,
) {
    let (Some(entry), Some(info)) = (state().device(device), queue_info.as_ref()) else {
        return;
    };
    match (entry.dispatch.get_device_queue2, entry.dispatch.get_device_queue) {
        (Some(get_queue2), _) => get_queue2(device, queue_info, queue),
        (None, Some(get_queue)) => get_queue(device, info.queue_family_index, info.queue_index, queue),
        (None, None) => return,
    }
    register_queue(device, queue, info.queue_family_index);
}

/// Owner recorded for `queue`, plus its device entry.
fn queue_owner(queue: vk::Queue) -> (Option<QueueEntry>, Option<Arc<DeviceEntry>>) {
    let state = state();
    match state.queues.get(&queue.as_raw()) {
        Some(owner) => (Some(owner.clone()), state.device(owner.device)),
        None => (None, state.device_of_queue(queue)),
    }
}

/// Inject compute work for the staged frame, if any. Never fails the caller.
fn try_inject(queue: vk::Queue, entry: &DeviceEntry, owner: &QueueEntry) {
    let bridge = bridge();
    let Some(frame) = STAGE.take() else {
        return;
    };
    if !bridge.configuration().compute_enabled() {
        return;
    }
    if !entry.dispatch.has_compute_support() {
        return;
    }

    let frame_id = frame.frame_id();
    if let Err(err) = inject(queue, entry, owner, &frame) {
        warn!(frame_id, "Skipping compute injection: {err:#}");
        return;
    }
    check_sync_unchanged(bridge, &frame);
}

/// Report when the producer replaced the sync state while this frame's work
/// was in flight.
fn check_sync_unchanged(bridge: &dyn Bridge, frame: &StagedFrame) {
    let Some(used) = &frame.sync else {
        return;
    };
    match bridge.interop_sync_state() {
        Some(current) if current.frame_id != used.frame_id => debug!(
            frame_id = used.frame_id,
            current_frame_id = current.frame_id,
            "Sync state advanced during injection"
        ),
        _ => {}
    }
}

unsafe extern "system" fn queue_submit(
    queue: vk::Queue,
    submit_count: u32,
    submits: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    let bridge = bridge();
    bridge.mark_layer_heartbeat();
    STAGE.poll(bridge);

    let (owner, entry) = queue_owner(queue);
    let Some(entry) = entry else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let Some(submit) = entry.dispatch.queue_submit else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let result = submit(queue, submit_count, submits, fence);
    match owner {
        Some(owner) if result == vk::Result::SUCCESS => try_inject(queue, &entry, &owner),
        Some(_) => {}
        None => debug!("Queue submit without a recorded owner; forwarded only"),
    }
    result
}

unsafe extern "system" fn queue_present(
    queue: vk::Queue,
    present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let bridge = bridge();
    bridge.mark_layer_heartbeat();
    STAGE.poll(bridge);

    let (owner, entry) = queue_owner(queue);
    let Some(entry) = entry else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    match owner {
        Some(owner) => try_inject(queue, &entry, &owner),
        None => debug!("Queue present without a recorded owner; forwarded only"),
    }
    match entry.dispatch.queue_present {
        Some(present) => present(queue, present_info),
        None => vk::Result::ERROR_DEVICE_LOST,
    }
}
