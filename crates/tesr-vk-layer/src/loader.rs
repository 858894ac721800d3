//! Loader/layer interface: chain-info records and discovery helpers.

use std::ffi::{c_char, c_void, CStr};

use ash::vk;

pub const LAYER_NAME: &CStr = c"VK_LAYER_TESRELOADED_implicit";
pub const LAYER_DESCRIPTION: &CStr = c"TESReloaded implicit Vulkan layer";
pub const LAYER_SPEC_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);
pub const LAYER_IMPLEMENTATION_VERSION: u32 = 1;

/// Loader/layer interface version this layer speaks.
pub const LOADER_INTERFACE_VERSION: u32 = 2;

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

/// `VkLayerFunction::VK_LAYER_LINK_INFO`.
pub const LAYER_LINK_INFO: u32 = 0;

#[repr(C)]
pub struct LayerInstanceLink {
    pub next: *mut LayerInstanceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_phys_dev_proc_addr: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub layer_info: *mut LayerInstanceLink,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub next: *mut LayerDeviceLink,
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub layer_info: *mut LayerDeviceLink,
}

#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<unsafe extern "system" fn()>,
}

/// Find the link-info record of `s_type` in a create-info `pNext` chain.
///
/// # Safety
/// `p_next` must be null or the head of a valid Vulkan structure chain.
unsafe fn find_link_info(mut p_next: *const c_void, s_type: vk::StructureType) -> Option<*mut c_void> {
    while !p_next.is_null() {
        let base = &*(p_next as *const vk::BaseInStructure);
        if base.s_type == s_type {
            // Both loader create-info records share this prefix.
            let info = &*(p_next as *const LayerInstanceCreateInfo);
            if info.function == LAYER_LINK_INFO && !info.layer_info.is_null() {
                return Some(p_next as *mut c_void);
            }
        }
        p_next = base.p_next as *const c_void;
    }
    None
}

/// Next-layer entry points for instance creation.
pub struct InstanceChain {
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
}

/// Next-layer entry points for device creation.
pub struct DeviceChain {
    pub next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

/// Read the next layer's entry points and advance the link for the layer
/// below us.
///
/// # Safety
/// `create_info` must point to a valid `VkInstanceCreateInfo` built by the
/// loader.
pub unsafe fn take_instance_chain(create_info: *const vk::InstanceCreateInfo<'_>) -> Option<InstanceChain> {
    let info = find_link_info((*create_info).p_next, LOADER_INSTANCE_CREATE_INFO)? as *mut LayerInstanceCreateInfo;
    let link = (*info).layer_info;
    let chain = InstanceChain {
        next_get_instance_proc_addr: (*link).next_get_instance_proc_addr,
    };
    (*info).layer_info = (*link).next;
    Some(chain)
}

/// Device counterpart of [`take_instance_chain`].
///
/// # Safety
/// `create_info` must point to a valid `VkDeviceCreateInfo` built by the
/// loader.
pub unsafe fn take_device_chain(create_info: *const vk::DeviceCreateInfo<'_>) -> Option<DeviceChain> {
    let info = find_link_info((*create_info).p_next, LOADER_DEVICE_CREATE_INFO)? as *mut LayerDeviceCreateInfo;
    let link = (*info).layer_info;
    let chain = DeviceChain {
        next_get_instance_proc_addr: (*link).next_get_instance_proc_addr,
        next_get_device_proc_addr: (*link).next_get_device_proc_addr,
    };
    (*info).layer_info = (*link).next;
    Some(chain)
}

fn copy_cstr(dst: &mut [c_char], src: &CStr) {
    let bytes = src.to_bytes();
    let len = bytes.len().min(dst.len().saturating_sub(1));
    for (d, s) in dst.iter_mut().zip(&bytes[..len]) {
        *d = *s as c_char;
    }
    if let Some(terminator) = dst.get_mut(len) {
        *terminator = 0;
    }
}

pub fn layer_properties() -> vk::LayerProperties {
    let mut props = vk::LayerProperties {
        spec_version: LAYER_SPEC_VERSION,
        implementation_version: LAYER_IMPLEMENTATION_VERSION,
        ..Default::default()
    };
    copy_cstr(&mut props.layer_name, LAYER_NAME);
    copy_cstr(&mut props.description, LAYER_DESCRIPTION);
    props
}

/// Standard two-call enumeration over `items`.
///
/// # Safety
/// `count` must be null or valid; `out`, when non-null, must have room for
/// `*count` elements.
pub unsafe fn enumerate_into<T: Copy>(items: &[T], count: *mut u32, out: *mut T) -> vk::Result {
    let Some(count) = count.as_mut() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if out.is_null() {
        *count = items.len() as u32;
        return vk::Result::SUCCESS;
    }
    let written = (*count as usize).min(items.len());
    std::ptr::copy_nonoverlapping(items.as_ptr(), out, written);
    *count = written as u32;
    if written < items.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;

    unsafe extern "system" fn fake_gipa(_instance: vk::Instance, _name: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn other_gipa(_instance: vk::Instance, _name: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    #[test]
    fn layer_properties_carry_identity() {
        let props = layer_properties();
        let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
        assert_eq!(name, LAYER_NAME);
        let description = unsafe { CStr::from_ptr(props.description.as_ptr()) };
        assert_eq!(description, LAYER_DESCRIPTION);
        assert_eq!(props.spec_version, vk::make_api_version(0, 1, 3, 0));
    }

    #[test]
    fn enumeration_follows_count_protocol() {
        let items = [layer_properties()];
        let mut count = 0u32;
        unsafe {
            assert_eq!(enumerate_into(&items, &mut count, ptr::null_mut()), vk::Result::SUCCESS);
            assert_eq!(count, 1);

            let mut out = [vk::LayerProperties::default(); 1];
            count = 0;
            assert_eq!(enumerate_into(&items, &mut count, out.as_mut_ptr()), vk::Result::INCOMPLETE);
            assert_eq!(count, 0);

            count = 1;
            assert_eq!(enumerate_into(&items, &mut count, out.as_mut_ptr()), vk::Result::SUCCESS);
            assert_eq!(out[0].spec_version, LAYER_SPEC_VERSION);
        }

        let none: [vk::ExtensionProperties; 0] = [];
        let mut count = 7u32;
        unsafe {
            assert_eq!(enumerate_into(&none, &mut count, ptr::null_mut()), vk::Result::SUCCESS);
        }
        assert_eq!(count, 0);
    }

    #[test]
    fn instance_chain_is_found_and_advanced() {
        let mut below = LayerInstanceLink {
            next: ptr::null_mut(),
            next_get_instance_proc_addr: other_gipa,
            next_get_phys_dev_proc_addr: None,
        };
        let mut ours = LayerInstanceLink {
            next: &mut below,
            next_get_instance_proc_addr: fake_gipa,
            next_get_phys_dev_proc_addr: None,
        };
        // A loader record with a different function precedes the link info.
        let mut link_info = LayerInstanceCreateInfo {
            s_type: LOADER_INSTANCE_CREATE_INFO,
            p_next: ptr::null(),
            function: LAYER_LINK_INFO,
            layer_info: &mut ours,
        };
        let other = LayerInstanceCreateInfo {
            s_type: LOADER_INSTANCE_CREATE_INFO,
            p_next: ptr::addr_of_mut!(link_info) as *const c_void,
            function: 1,
            layer_info: ptr::null_mut(),
        };
        let create_info = vk::InstanceCreateInfo {
            p_next: &other as *const _ as *const c_void,
            ..Default::default()
        };

        let chain = unsafe { take_instance_chain(&create_info) }.unwrap();
        assert_eq!(chain.next_get_instance_proc_addr as usize, fake_gipa as usize);
        assert_eq!(link_info.layer_info, ptr::addr_of_mut!(below));
    }

    #[test]
    fn missing_chain_is_reported() {
        let create_info = vk::DeviceCreateInfo::default();
        assert!(unsafe { take_device_chain(&create_info) }.is_none());
    }
}
