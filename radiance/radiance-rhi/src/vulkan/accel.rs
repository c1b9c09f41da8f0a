//! KHR acceleration structures: size queries, objects and build-info assembly.

use super::{buffer, map_vk, RawDevice};
use crate::{
    AccelerationStructure, AccelerationStructureDescriptor, AccelerationStructureInputs,
    AccelerationStructureLevel, AccelerationStructureSizes, Buffer, BufferDescriptor,
    BufferMemoryPreference, BufferUsage, ResourceId, RhiError,
};
use ash::vk;
use std::sync::Arc;

pub struct VulkanAccelerationStructure {
    raw: Arc<RawDevice>,
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) address: vk::DeviceAddress,
    /// Backing storage; must outlive `handle`.
    _storage: buffer::VulkanBuffer,
    level: AccelerationStructureLevel,
    size: u64,
    id: ResourceId,
}

pub(crate) fn downcast(structure: &dyn AccelerationStructure) -> Result<&VulkanAccelerationStructure, RhiError> {
    structure
        .as_any()
        .downcast_ref::<VulkanAccelerationStructure>()
        .ok_or(RhiError::InvalidResource("acceleration structure is not a Vulkan acceleration structure"))
}

fn structure_type(level: AccelerationStructureLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelerationStructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn build_flags(level: AccelerationStructureLevel) -> vk::BuildAccelerationStructureFlagsKHR {
    match level {
        AccelerationStructureLevel::Bottom => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        AccelerationStructureLevel::Top => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
    }
}

fn address_of(buffer: &dyn Buffer) -> vk::DeviceAddress {
    buffer::downcast(buffer).map(|b| b.address).unwrap_or(0)
}

/// Geometry description for `inputs`. Input buffers must be Vulkan buffers; their
/// addresses are only read for builds, not size queries.
pub(crate) fn geometry<'a>(inputs: &AccelerationStructureInputs<'_>) -> vk::AccelerationStructureGeometryKHR<'a> {
    match inputs {
        AccelerationStructureInputs::Triangles(g) => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: address_of(g.vertices) })
                .vertex_stride(g.vertex_stride)
                .max_vertex(g.vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR { device_address: address_of(g.indices) });
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
        AccelerationStructureInputs::Instances { instances, .. } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: address_of(*instances) });
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
    }
}

/// Build info for `inputs` over `geometries`; destination and scratch are filled in by the caller.
pub(crate) fn build_info<'a>(
    inputs: &AccelerationStructureInputs<'_>,
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure_type(inputs.level()))
        .flags(build_flags(inputs.level()))
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
}

pub(crate) fn build_sizes(
    raw: &RawDevice,
    inputs: &AccelerationStructureInputs<'_>,
) -> Result<AccelerationStructureSizes, RhiError> {
    let primitive_count = inputs.primitive_count();
    if primitive_count == 0 {
        return Ok(AccelerationStructureSizes::default());
    }
    let geometries = [geometry(inputs)];
    let info = build_info(inputs, &geometries);
    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        raw.accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &info,
            &[primitive_count],
            &mut sizes,
        );
    }
    Ok(AccelerationStructureSizes {
        structure_size: sizes.acceleration_structure_size,
        // Slack so the scratch address can be aligned inside the buffer.
        scratch_size: sizes.build_scratch_size + raw.rt_properties.scratch_alignment as u64,
    })
}

impl VulkanAccelerationStructure {
    pub(crate) fn create(
        raw: &Arc<RawDevice>,
        desc: &AccelerationStructureDescriptor,
        id: ResourceId,
        storage_id: ResourceId,
    ) -> Result<Self, RhiError> {
        let storage = buffer::VulkanBuffer::create(
            raw,
            &BufferDescriptor {
                label: desc.label,
                size: desc.size,
                usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
                memory: BufferMemoryPreference::DeviceLocal,
            },
            storage_id,
        )?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.buffer)
            .offset(0)
            .size(desc.size)
            .ty(structure_type(desc.level));
        let handle = unsafe {
            raw.accel
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| map_vk("create acceleration structure", e))?
        };
        let address = unsafe {
            raw.accel.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle),
            )
        };
        Ok(Self {
            raw: Arc::clone(raw),
            handle,
            address,
            _storage: storage,
            level: desc.level,
            size: desc.size,
            id,
        })
    }
}

impl Drop for VulkanAccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.raw.accel.destroy_acceleration_structure(self.handle, None);
        }
    }
}

impl std::fmt::Debug for VulkanAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanAccelerationStructure")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("size", &self.size)
            .finish()
    }
}

impl AccelerationStructure for VulkanAccelerationStructure {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn level(&self) -> AccelerationStructureLevel {
        self.level
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn device_address(&self) -> u64 {
        self.address
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
