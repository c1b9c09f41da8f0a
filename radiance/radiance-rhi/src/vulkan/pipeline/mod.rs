mod compute;
mod ray_tracing;

pub use compute::VulkanComputeKernel;
pub use ray_tracing::VulkanRayTracingKernel;

use super::{map_vk, RawDevice};
use crate::RhiError;
use ash::vk;

/// Create a shader module from little-endian SPIR-V bytes.
pub(crate) fn shader_module(raw: &RawDevice, code: &[u8]) -> Result<vk::ShaderModule, RhiError> {
    if code.is_empty() || code.len() % 4 != 0 {
        return Err(RhiError::backend("create shader module", "SPIR-V must be non-empty and 4-byte aligned"));
    }
    let code_u32: Vec<u32> = code
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code_u32);
    unsafe { raw.create_shader_module(&create_info, None).map_err(|e| map_vk("create shader module", e)) }
}
