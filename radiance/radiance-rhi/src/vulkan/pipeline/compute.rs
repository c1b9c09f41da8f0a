//! Vulkan compute kernels.

use super::super::descriptor::BindlessTable;
use super::super::{map_vk, RawDevice};
use crate::{ComputeKernel, ComputeKernelDescriptor, RhiError};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

pub struct VulkanComputeKernel {
    raw: Arc<RawDevice>,
    /// Keeps the shared pipeline layout alive.
    bindless: Arc<BindlessTable>,
    pub(crate) pipeline: vk::Pipeline,
    label: Option<&'static str>,
}

impl VulkanComputeKernel {
    pub(crate) fn create(
        raw: &Arc<RawDevice>,
        bindless: &Arc<BindlessTable>,
        desc: &ComputeKernelDescriptor<'_>,
    ) -> Result<Self, RhiError> {
        let shader_module = super::shader_module(raw, desc.code)?;
        let entry_name = CString::new(desc.entry_point).map_err(|e| RhiError::backend("entry point", e))?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(&entry_name);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(bindless.pipeline_layout);
        let pipelines = unsafe {
            raw.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_partial, res)| map_vk("create compute pipeline", res))
        };
        unsafe {
            raw.destroy_shader_module(shader_module, None);
        }
        let pipeline = pipelines?[0];
        log::debug!("compute kernel {:?} created ({} binding words)", desc.label, desc.binding_words);
        Ok(Self {
            raw: Arc::clone(raw),
            bindless: Arc::clone(bindless),
            pipeline,
            label: desc.label,
        })
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.bindless.pipeline_layout
    }
}

impl Drop for VulkanComputeKernel {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_pipeline(self.pipeline, None);
        }
    }
}

impl std::fmt::Debug for VulkanComputeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanComputeKernel").field("label", &self.label).finish()
    }
}

impl ComputeKernel for VulkanComputeKernel {
    fn label(&self) -> Option<&'static str> {
        self.label
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
