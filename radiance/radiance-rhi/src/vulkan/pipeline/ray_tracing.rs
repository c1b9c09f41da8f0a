//! Ray tracing kernels: one raygen, one miss and one triangle hit group per pipeline,
//! with the shader binding table owned by the kernel.

use super::super::buffer::VulkanBuffer;
use super::super::descriptor::BindlessTable;
use super::super::{map_vk, RawDevice, RayTracingProperties};
use crate::{
    BufferDescriptor, BufferMemoryPreference, BufferUsage, RayTracingKernel, RayTracingKernelDescriptor,
    ResourceId, RhiError,
};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Byte layout of a three-region shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SbtLayout {
    handle_stride: u64,
    raygen_size: u64,
    miss_offset: u64,
    miss_size: u64,
    hit_offset: u64,
    hit_size: u64,
}

impl SbtLayout {
    fn new(props: &RayTracingProperties) -> Self {
        let base = props.base_alignment as u64;
        let handle_stride = align_up(props.handle_size as u64, props.handle_alignment as u64);
        // Each region starts on a base-aligned boundary; raygen stride must equal its size.
        let raygen_size = align_up(handle_stride, base);
        let miss_size = align_up(handle_stride, base);
        let hit_size = align_up(handle_stride, base);
        Self {
            handle_stride,
            raygen_size,
            miss_offset: raygen_size,
            miss_size,
            hit_offset: raygen_size + miss_size,
            hit_size,
        }
    }

    fn total_size(&self) -> u64 {
        self.hit_offset + self.hit_size
    }
}

pub struct VulkanRayTracingKernel {
    raw: Arc<RawDevice>,
    bindless: Arc<BindlessTable>,
    pub(crate) pipeline: vk::Pipeline,
    _sbt: VulkanBuffer,
    pub(crate) raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub(crate) miss_region: vk::StridedDeviceAddressRegionKHR,
    pub(crate) hit_region: vk::StridedDeviceAddressRegionKHR,
    label: Option<&'static str>,
}

impl VulkanRayTracingKernel {
    pub(crate) fn create(
        raw: &Arc<RawDevice>,
        bindless: &Arc<BindlessTable>,
        desc: &RayTracingKernelDescriptor<'_>,
        sbt_id: ResourceId,
    ) -> Result<Self, RhiError> {
        let module = super::shader_module(raw, desc.code)?;
        let result = Self::create_with_module(raw, bindless, desc, module, sbt_id);
        unsafe { raw.destroy_shader_module(module, None) };
        result
    }

    fn create_with_module(
        raw: &Arc<RawDevice>,
        bindless: &Arc<BindlessTable>,
        desc: &RayTracingKernelDescriptor<'_>,
        module: vk::ShaderModule,
        sbt_id: ResourceId,
    ) -> Result<Self, RhiError> {
        let raygen = CString::new(desc.raygen_entry).map_err(|e| RhiError::backend("raygen entry", e))?;
        let miss = CString::new(desc.miss_entry).map_err(|e| RhiError::backend("miss entry", e))?;
        let closest_hit = CString::new(desc.closest_hit_entry).map_err(|e| RhiError::backend("closest hit entry", e))?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::RAYGEN_KHR)
                .module(module)
                .name(&raygen),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::MISS_KHR)
                .module(module)
                .name(&miss),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .module(module)
                .name(&closest_hit),
        ];
        let groups = [
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(1)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth.max(1))
            .layout(bindless.pipeline_layout);
        let pipeline = unsafe {
            raw.ray_tracing
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[create_info],
                    None,
                )
                .map_err(|(_partial, res)| map_vk("create ray tracing pipeline", res))?[0]
        };

        let props = raw.rt_properties;
        let layout = SbtLayout::new(&props);
        let handle_size = props.handle_size as usize;
        let handles = unsafe {
            raw.ray_tracing
                .get_ray_tracing_shader_group_handles(pipeline, 0, groups.len() as u32, groups.len() * handle_size)
                .map_err(|e| {
                    raw.destroy_pipeline(pipeline, None);
                    map_vk("get shader group handles", e)
                })?
        };

        // Extra room so the table start can be aligned to the base alignment.
        let base = props.base_alignment as u64;
        let sbt = VulkanBuffer::create(
            raw,
            &BufferDescriptor {
                label: desc.label,
                size: layout.total_size() + base,
                usage: BufferUsage::SHADER_BINDING_TABLE,
                memory: BufferMemoryPreference::HostVisible,
            },
            sbt_id,
        )?;
        let start = align_up(sbt.address, base);
        let padding = (start - sbt.address) as usize;
        let mut table = vec![0u8; layout.total_size() as usize];
        for (group, offset) in [(0usize, 0u64), (1, layout.miss_offset), (2, layout.hit_offset)] {
            let src = &handles[group * handle_size..(group + 1) * handle_size];
            table[offset as usize..offset as usize + handle_size].copy_from_slice(src);
        }
        unsafe {
            let ptr = raw
                .map_memory(sbt.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|e| map_vk("map shader binding table", e))?;
            std::ptr::copy_nonoverlapping(table.as_ptr(), ptr.cast::<u8>().add(padding), table.len());
            raw.unmap_memory(sbt.memory);
        }

        let region = |offset: u64, stride: u64, size: u64| {
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(start + offset)
                .stride(stride)
                .size(size)
        };
        log::debug!("ray tracing kernel {:?} created ({} binding words)", desc.label, desc.binding_words);
        Ok(Self {
            raw: Arc::clone(raw),
            bindless: Arc::clone(bindless),
            pipeline,
            raygen_region: region(0, layout.raygen_size, layout.raygen_size),
            miss_region: region(layout.miss_offset, layout.handle_stride, layout.miss_size),
            hit_region: region(layout.hit_offset, layout.handle_stride, layout.hit_size),
            _sbt: sbt,
            label: desc.label,
        })
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.bindless.pipeline_layout
    }
}

impl Drop for VulkanRayTracingKernel {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_pipeline(self.pipeline, None);
        }
    }
}

impl std::fmt::Debug for VulkanRayTracingKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRayTracingKernel").field("label", &self.label).finish()
    }
}

impl RayTracingKernel for VulkanRayTracingKernel {
    fn label(&self) -> Option<&'static str> {
        self.label
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_start_on_base_alignment() {
        let layout = SbtLayout::new(&RayTracingProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
            scratch_alignment: 128,
        });
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.raygen_size, 64);
        assert_eq!(layout.miss_offset % 64, 0);
        assert_eq!(layout.hit_offset % 64, 0);
        assert_eq!(layout.total_size(), 192);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(64, 32), 64);
        assert_eq!(align_up(7, 0), 7);
    }
}
