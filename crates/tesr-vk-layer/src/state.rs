//! Process-wide layer state keyed by dispatchable handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};
use once_cell::sync::Lazy;

use crate::dispatch::{DeviceDispatch, InstanceDispatch};
use crate::frame::FrameStage;
use crate::pipeline::{DevicePipeline, QueueCompute};

/// Loader dispatch table pointer stored at the start of every dispatchable
/// object. All handles created from one device share it.
///
/// # Safety
/// `raw` must be a live dispatchable handle.
pub unsafe fn dispatch_key(raw: u64) -> usize {
    *(raw as usize as *const usize)
}

pub struct DeviceEntry {
    pub dispatch: DeviceDispatch,
    /// Held only while fetching or rebuilding the pipeline, never across a
    /// submission.
    pub pipeline: Mutex<Option<Arc<DevicePipeline>>>,
}

impl DeviceEntry {
    pub fn new(dispatch: DeviceDispatch) -> Self {
        Self {
            dispatch,
            pipeline: Mutex::new(None),
        }
    }

    pub fn lock_pipeline(&self) -> MutexGuard<'_, Option<Arc<DevicePipeline>>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub type QueueComputeSlot = Arc<Mutex<Option<QueueCompute>>>;

#[derive(Clone)]
pub struct QueueEntry {
    pub device: vk::Device,
    pub queue_family_index: u32,
    pub compute: QueueComputeSlot,
}

#[derive(Default)]
pub struct LayerState {
    pub instances: HashMap<usize, Arc<InstanceDispatch>>,
    pub devices: HashMap<usize, Arc<DeviceEntry>>,
    pub queues: HashMap<u64, QueueEntry>,
}

impl LayerState {
    pub fn device(&self, device: vk::Device) -> Option<Arc<DeviceEntry>> {
        let key = unsafe { dispatch_key(device.as_raw()) };
        self.devices.get(&key).cloned()
    }

    /// Device owning `queue`, found through the shared dispatch key.
    pub fn device_of_queue(&self, queue: vk::Queue) -> Option<Arc<DeviceEntry>> {
        let key = unsafe { dispatch_key(queue.as_raw()) };
        self.devices.get(&key).cloned()
    }

    /// Record `queue` as belonging to `device`. A queue seen again keeps its
    /// compute state.
    pub fn register_queue(&mut self, queue: vk::Queue, device: vk::Device, queue_family_index: u32) {
        let entry = self.queues.entry(queue.as_raw()).or_insert_with(|| QueueEntry {
            device,
            queue_family_index,
            compute: Arc::default(),
        });
        entry.device = device;
        entry.queue_family_index = queue_family_index;
    }

    /// Remove every queue of `device`, returning their compute slots.
    pub fn remove_queues_of(&mut self, device: vk::Device) -> Vec<QueueComputeSlot> {
        let mut removed = Vec::new();
        self.queues.retain(|_, entry| {
            if entry.device == device {
                removed.push(entry.compute.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

static STATE: Lazy<Mutex<LayerState>> = Lazy::new(Mutex::default);

/// The frame staged between polling and injection.
pub static STAGE: FrameStage = FrameStage::new();

pub fn state() -> MutexGuard<'static, LayerState> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn lock_queue(slot: &QueueComputeSlot) -> MutexGuard<'_, Option<QueueCompute>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_key_reads_first_word() {
        let table = 0xABCDusize;
        let object = [&table as *const usize as usize, 0];
        let key = unsafe { dispatch_key(object.as_ptr() as u64) };
        assert_eq!(key, &table as *const usize as usize);
    }

    #[test]
    fn queues_are_tracked_per_device() {
        let mut state = LayerState::default();
        let device_a = vk::Device::from_raw(0x100);
        let device_b = vk::Device::from_raw(0x200);
        state.register_queue(vk::Queue::from_raw(1), device_a, 0);
        state.register_queue(vk::Queue::from_raw(2), device_a, 2);
        state.register_queue(vk::Queue::from_raw(3), device_b, 0);

        let slot = state.queues[&1].compute.clone();
        state.register_queue(vk::Queue::from_raw(1), device_a, 1);
        assert!(Arc::ptr_eq(&slot, &state.queues[&1].compute));
        assert_eq!(state.queues[&1].queue_family_index, 1);

        assert_eq!(state.remove_queues_of(device_a).len(), 2);
        assert_eq!(state.queues.len(), 1);
        assert!(state.queues.contains_key(&3));
    }
}
