//! Command allocators (one `VkCommandPool` each) and command lists.

use super::accel;
use super::descriptor::BindlessTable;
use super::pipeline::{VulkanComputeKernel, VulkanRayTracingKernel};
use super::texture::{full_range, VulkanTexture};
use super::{buffer, map_vk, state_info, RawDevice};
use crate::{
    AccelerationStructure, AccelerationStructureInputs, Buffer, CommandAllocator, CommandList,
    ComputeKernel, KernelBindings, RayTracingKernel, ResourceId, ResourceRef, ResourceState, RhiError,
};
use ash::vk;
use std::sync::Arc;

pub struct VulkanCommandAllocator {
    raw: Arc<RawDevice>,
    bindless: Arc<BindlessTable>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    id: ResourceId,
}

impl VulkanCommandAllocator {
    pub(crate) fn new(
        raw: Arc<RawDevice>,
        bindless: Arc<BindlessTable>,
        queue_family_index: u32,
        id: ResourceId,
    ) -> Result<Self, RhiError> {
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family_index);
        let pool = unsafe { raw.create_command_pool(&pool_info, None).map_err(|e| map_vk("create command pool", e))? };
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { raw.allocate_command_buffers(&allocate_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { raw.destroy_command_pool(pool, None) };
                return Err(map_vk("allocate command buffer", e));
            }
        };
        Ok(Self { raw, bindless, pool, buffer, id })
    }
}

impl Drop for VulkanCommandAllocator {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_command_pool(self.pool, None);
        }
    }
}

impl std::fmt::Debug for VulkanCommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandAllocator").field("id", &self.id).finish()
    }
}

impl CommandAllocator for VulkanCommandAllocator {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn begin(&mut self) -> Result<Box<dyn CommandList>, RhiError> {
        unsafe {
            self.raw
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| map_vk("reset command pool", e))?;
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.raw
                .begin_command_buffer(self.buffer, &begin_info)
                .map_err(|e| map_vk("begin command buffer", e))?;
        }
        Ok(Box::new(VulkanCommandList {
            raw: Arc::clone(&self.raw),
            bindless: Arc::clone(&self.bindless),
            buffer: self.buffer,
            bound: None,
        }))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Clone, Copy)]
enum BoundKernel {
    Compute(vk::PipelineLayout),
    RayTracing {
        layout: vk::PipelineLayout,
        raygen: vk::StridedDeviceAddressRegionKHR,
        miss: vk::StridedDeviceAddressRegionKHR,
        hit: vk::StridedDeviceAddressRegionKHR,
    },
}

pub struct VulkanCommandList {
    raw: Arc<RawDevice>,
    bindless: Arc<BindlessTable>,
    buffer: vk::CommandBuffer,
    bound: Option<BoundKernel>,
}

impl std::fmt::Debug for VulkanCommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandList").finish_non_exhaustive()
    }
}

impl VulkanCommandList {
    /// Close the list; returns the command buffer ready for submission.
    pub(crate) fn finish(&self) -> Result<vk::CommandBuffer, RhiError> {
        unsafe {
            self.raw
                .end_command_buffer(self.buffer)
                .map_err(|e| map_vk("end command buffer", e))?;
        }
        Ok(self.buffer)
    }

    fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default().src_access_mask(src_access).dst_access_mask(dst_access);
        unsafe {
            self.raw.cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn push_bindings(&self, layout: vk::PipelineLayout, bindings: &KernelBindings) {
        unsafe {
            self.raw.cmd_push_constants(
                self.buffer,
                layout,
                super::descriptor::kernel_stages(),
                0,
                bindings.as_bytes(),
            );
        }
    }
}

impl CommandList for VulkanCommandList {
    fn transition(&mut self, resource: ResourceRef<'_>, before: ResourceState, after: ResourceState) {
        let (old_layout, src_access, src_stage) = state_info(before);
        let (new_layout, dst_access, dst_stage) = state_info(after);
        match resource {
            ResourceRef::Texture(t) => {
                let image = t
                    .as_any()
                    .downcast_ref::<VulkanTexture>()
                    .expect("texture must be VulkanTexture")
                    .image;
                let barrier = vk::ImageMemoryBarrier::default()
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(full_range());
                unsafe {
                    self.raw.cmd_pipeline_barrier(
                        self.buffer,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
            }
            ResourceRef::Buffer(b) => {
                let vk_buf = buffer::downcast(b).expect("buffer must be VulkanBuffer");
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(vk_buf.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                unsafe {
                    self.raw.cmd_pipeline_barrier(
                        self.buffer,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    );
                }
            }
            ResourceRef::AccelerationStructure(_) => {
                self.memory_barrier(
                    src_stage | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    src_access | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    dst_stage,
                    dst_access | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                );
            }
        }
    }

    fn uav_barrier(&mut self, _resource: ResourceRef<'_>) {
        let stages = vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
        self.memory_barrier(
            stages,
            vk::AccessFlags::SHADER_WRITE,
            stages,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
    }

    fn copy_buffer(&mut self, src: &dyn Buffer, src_offset: u64, dst: &dyn Buffer, dst_offset: u64, size: u64) {
        let src_buf = buffer::downcast(src).expect("src must be VulkanBuffer");
        let dst_buf = buffer::downcast(dst).expect("dst must be VulkanBuffer");
        // Earlier readers of `dst` finish before the copy overwrites it.
        self.memory_barrier(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        );
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.raw.cmd_copy_buffer(self.buffer, src_buf.buffer, dst_buf.buffer, &[region]);
        }
        self.memory_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ,
        );
    }

    fn build_acceleration_structure(
        &mut self,
        target: &dyn AccelerationStructure,
        inputs: &AccelerationStructureInputs<'_>,
        scratch: &dyn Buffer,
    ) {
        let target = accel::downcast(target).expect("target must be VulkanAccelerationStructure");
        let scratch = buffer::downcast(scratch).expect("scratch must be VulkanBuffer");
        let alignment = self.raw.rt_properties.scratch_alignment.max(1) as u64;
        let scratch_address = scratch.address.div_ceil(alignment) * alignment;

        // Inputs written by copies or the host, and earlier builds using the same scratch.
        self.memory_barrier(
            vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::HOST
                | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::TRANSFER_WRITE
                | vk::AccessFlags::HOST_WRITE
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                | vk::AccessFlags::SHADER_READ,
        );
        let geometries = [accel::geometry(inputs)];
        let info = accel::build_info(inputs, &geometries)
            .dst_acceleration_structure(target.handle)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(inputs.primitive_count());
        unsafe {
            self.raw
                .accel
                .cmd_build_acceleration_structures(self.buffer, &[info], &[std::slice::from_ref(&range)]);
        }
        self.memory_barrier(
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ,
        );
    }

    fn set_compute_kernel(&mut self, kernel: &dyn ComputeKernel) {
        let kernel = kernel
            .as_any()
            .downcast_ref::<VulkanComputeKernel>()
            .expect("kernel must be VulkanComputeKernel");
        unsafe {
            self.raw.cmd_bind_pipeline(self.buffer, vk::PipelineBindPoint::COMPUTE, kernel.pipeline);
            self.raw.cmd_bind_descriptor_sets(
                self.buffer,
                vk::PipelineBindPoint::COMPUTE,
                kernel.layout(),
                0,
                &[self.bindless.set],
                &[],
            );
        }
        self.bound = Some(BoundKernel::Compute(kernel.layout()));
    }

    fn set_ray_tracing_kernel(&mut self, kernel: &dyn RayTracingKernel) {
        let kernel = kernel
            .as_any()
            .downcast_ref::<VulkanRayTracingKernel>()
            .expect("kernel must be VulkanRayTracingKernel");
        unsafe {
            self.raw
                .cmd_bind_pipeline(self.buffer, vk::PipelineBindPoint::RAY_TRACING_KHR, kernel.pipeline);
            self.raw.cmd_bind_descriptor_sets(
                self.buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                kernel.layout(),
                0,
                &[self.bindless.set],
                &[],
            );
        }
        self.bound = Some(BoundKernel::RayTracing {
            layout: kernel.layout(),
            raygen: kernel.raygen_region,
            miss: kernel.miss_region,
            hit: kernel.hit_region,
        });
    }

    fn set_bindings(&mut self, bindings: &KernelBindings) {
        match self.bound {
            Some(BoundKernel::Compute(layout)) | Some(BoundKernel::RayTracing { layout, .. }) => {
                self.push_bindings(layout, bindings)
            }
            None => panic!("set_bindings called before a kernel was bound"),
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(matches!(self.bound, Some(BoundKernel::Compute(_))), "dispatch without a compute kernel");
        unsafe {
            self.raw.cmd_dispatch(self.buffer, x, y, z);
        }
    }

    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) {
        let Some(BoundKernel::RayTracing { raygen, miss, hit, .. }) = self.bound else {
            panic!("dispatch_rays without a ray tracing kernel");
        };
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            self.raw
                .ray_tracing
                .cmd_trace_rays(self.buffer, &raygen, &miss, &hit, &callable, width, height, depth);
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
