//! Vulkan Buffer implementation.

use super::{map_vk, memory, RawDevice};
use crate::{Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, ResourceId, RhiError};
use ash::vk;
use std::sync::Arc;

pub struct VulkanBuffer {
    raw: Arc<RawDevice>,
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) address: vk::DeviceAddress,
    pub(crate) size: u64,
    pub(crate) id: ResourceId,
    pub(crate) host_visible: bool,
}

pub(crate) fn buffer_usage_to_vk(usage: BufferUsage) -> vk::BufferUsageFlags {
    // Every buffer is addressable; instance descriptors and SBT records need it.
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::UNIFORM) {
        // Constants are read through the bindless storage-buffer array.
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.intersects(BufferUsage::STORAGE | BufferUsage::SCRATCH) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

pub(crate) fn downcast(buffer: &dyn Buffer) -> Result<&VulkanBuffer, RhiError> {
    buffer
        .as_any()
        .downcast_ref::<VulkanBuffer>()
        .ok_or(RhiError::InvalidResource("buffer is not a Vulkan buffer"))
}

impl VulkanBuffer {
    pub(crate) fn create(raw: &Arc<RawDevice>, desc: &BufferDescriptor, id: ResourceId) -> Result<Self, RhiError> {
        let size = desc.size.max(1);
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(buffer_usage_to_vk(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { raw.create_buffer(&create_info, None).map_err(|e| map_vk("create buffer", e))? };
        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let host_visible = desc.memory == BufferMemoryPreference::HostVisible;
        let properties = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let memory = match memory::allocate(raw, requirements, properties, true, "buffer memory") {
            Ok(m) => m,
            Err(e) => {
                unsafe { raw.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        unsafe {
            raw.bind_buffer_memory(buffer, memory, 0)
                .map_err(|e| map_vk("bind buffer memory", e))?;
        }
        let address =
            unsafe { raw.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer)) };
        Ok(Self {
            raw: Arc::clone(raw),
            buffer,
            memory,
            address,
            size: desc.size,
            id,
            host_visible,
        })
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_buffer(self.buffer, None);
            self.raw.free_memory(self.memory, None);
        }
    }
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

impl Buffer for VulkanBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn host_visible(&self) -> bool {
        self.host_visible
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_buffer_is_addressable() {
        for usage in [BufferUsage::COPY_SRC, BufferUsage::SCRATCH, BufferUsage::ACCELERATION_STRUCTURE_INPUT] {
            assert!(buffer_usage_to_vk(usage).contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
    }

    #[test]
    fn uniform_buffers_are_bindable_as_storage() {
        let flags = buffer_usage_to_vk(BufferUsage::UNIFORM);
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
