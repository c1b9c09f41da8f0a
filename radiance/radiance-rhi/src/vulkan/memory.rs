//! Device memory allocation. One `VkDeviceMemory` per resource.

use super::{map_vk, RawDevice};
use crate::RhiError;
use ash::vk;

/// First memory type allowed by `type_bits` that has all of `required`.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|i| {
        let suitable = (type_bits & (1 << i)) != 0;
        suitable && props.memory_types[*i as usize].property_flags.contains(required)
    })
}

/// Allocate memory for `requirements`, optionally addressable through
/// `vkGetBufferDeviceAddress`.
pub(crate) fn allocate(
    raw: &RawDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    device_address: bool,
    what: &'static str,
) -> Result<vk::DeviceMemory, RhiError> {
    let memory_type_index = find_memory_type(&raw.memory_properties, requirements.memory_type_bits, properties)
        .ok_or(RhiError::OutOfMemory { what })?;
    let mut flags_info = vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if device_address {
        allocate_info = allocate_info.push_next(&mut flags_info);
    }
    unsafe { raw.allocate_memory(&allocate_info, None).map_err(|e| map_vk(what, e)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn picks_first_type_with_required_flags() {
        let props = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b11, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b01, host), None);
        assert_eq!(find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
    }
}
