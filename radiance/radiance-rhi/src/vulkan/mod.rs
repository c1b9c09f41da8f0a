//! Vulkan backend for Radiance RHI.
//! Requires Vulkan 1.2 with KHR acceleration structures and ray tracing pipelines.
//! Submissions signal a timeline semaphore; the view table is one bindless descriptor set.

mod accel;
mod buffer;
mod command;
mod descriptor;
mod memory;
mod pipeline;
mod texture;

use crate::{
    AccelerationStructure, AccelerationStructureDescriptor, AccelerationStructureInputs,
    AccelerationStructureSizes, Buffer, BufferDescriptor, CommandAllocator, CommandList,
    ComputeKernel, ComputeKernelDescriptor, Device, DeviceCreateParams, RayTracingKernel,
    RayTracingKernelDescriptor, ResourceId, ResourceRef, ResourceState, RhiError, Texture,
    TextureDescriptor, ViewDescriptor,
};
use ash::vk;
use std::ffi::{c_void, CStr, CString};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use accel::VulkanAccelerationStructure;
pub use buffer::VulkanBuffer;
pub use command::{VulkanCommandAllocator, VulkanCommandList};
pub use pipeline::{VulkanComputeKernel, VulkanRayTracingKernel};
pub use texture::VulkanTexture;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance, logical device and extension loaders. Every Vulkan object holds an `Arc`
/// to this so the device outlives everything created from it.
pub(crate) struct RawDevice {
    #[allow(dead_code)]
    entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) accel: ash::khr::acceleration_structure::Device,
    pub(crate) ray_tracing: ash::khr::ray_tracing_pipeline::Device,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) rt_properties: RayTracingProperties,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RayTracingProperties {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
    pub scratch_alignment: u32,
}

impl Deref for RawDevice {
    type Target = ash::Device;

    fn deref(&self) -> &ash::Device {
        &self.device
    }
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

pub(crate) fn map_vk(context: &'static str, result: vk::Result) -> RhiError {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            RhiError::OutOfMemory { what: context }
        }
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
        other => RhiError::backend(context, format!("{:?}", other)),
    }
}

/// Image layout, access mask and pipeline stages associated with a resource state.
pub(crate) fn state_info(state: ResourceState) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    let shader_stages = vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
    match state {
        ResourceState::Common => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::ShaderRead => (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ, shader_stages),
        ResourceState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            shader_stages,
        ),
        ResourceState::CopySrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::CopyDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("vulkan: {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("vulkan: {}", message);
    } else {
        log::debug!("vulkan: {}", message);
    }
    vk::FALSE
}

fn required_device_extensions() -> [&'static CStr; 3] {
    [
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Vulkan 1.2 features the timeline and the bindless view table rely on.
fn required_features12<'a>() -> vk::PhysicalDeviceVulkan12Features<'a> {
    vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_update_unused_while_pending(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true)
        .scalar_block_layout(true)
}

fn supports_ray_tracing(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let available = match unsafe { instance.enumerate_device_extension_properties(physical_device) } {
        Ok(a) => a,
        Err(_) => return false,
    };
    required_device_extensions()
        .iter()
        .all(|required| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str().map_or(false, |name| name == *required))
        })
}

/// Whether slots of a bound view table may be rewritten while an earlier batch is pending.
fn supports_pending_view_updates(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    features12.descriptor_binding_update_unused_while_pending == vk::TRUE
        && features12.descriptor_binding_partially_bound == vk::TRUE
}

pub struct VulkanDevice {
    raw: Arc<RawDevice>,
    queue: Mutex<vk::Queue>,
    queue_family_index: u32,
    timeline: vk::Semaphore,
    /// Pool for one-shot work done at resource creation (initial image layouts).
    setup_pool: Mutex<vk::CommandPool>,
    bindless: Arc<descriptor::BindlessTable>,
    next_id: AtomicU64,
}

impl VulkanDevice {
    /// Create a Vulkan device on the first physical device with hardware ray tracing,
    /// preferring discrete GPUs.
    pub fn new(params: &DeviceCreateParams) -> Result<Arc<Self>, RhiError> {
        let entry = unsafe { ash::Entry::load().map_err(|e| RhiError::backend("load vulkan", e))? };
        let app_name = CString::new(params.application_name).map_err(|e| RhiError::backend("application name", e))?;
        let engine_name = c"Radiance";
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_2)
            .application_name(&app_name)
            .engine_name(engine_name);

        let mut layers = Vec::new();
        let mut instance_extensions = Vec::new();
        if params.validation {
            layers.push(VALIDATION_LAYER.as_ptr());
            instance_extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&instance_extensions);
        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| map_vk("create instance", e))?
        };

        let debug = if params.validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&info, None)
                    .map_err(|e| map_vk("create debug messenger", e))?
            };
            log::info!("vulkan validation enabled");
            Some((loader, messenger))
        } else {
            None
        };

        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|e| map_vk("enumerate physical devices", e))?
        };
        let mut candidates: Vec<vk::PhysicalDevice> = physical_devices
            .into_iter()
            .filter(|pd| supports_ray_tracing(&instance, *pd) && supports_pending_view_updates(&instance, *pd))
            .collect();
        candidates.sort_by_key(|pd| {
            let props = unsafe { instance.get_physical_device_properties(*pd) };
            if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU { 0 } else { 1 }
        });
        let physical_device = *candidates
            .first()
            .ok_or_else(|| RhiError::Unsupported("no Vulkan device with hardware ray tracing".to_string()))?;

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
        let device_name = props2
            .properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rt_properties = RayTracingProperties {
            handle_size: rt_props.shader_group_handle_size,
            handle_alignment: rt_props.shader_group_handle_alignment,
            base_alignment: rt_props.shader_group_base_alignment,
            scratch_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        };

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = queue_family_properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .ok_or_else(|| RhiError::Unsupported("no compute queue family".to_string()))? as u32;
        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);

        let mut features12 = required_features12();
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .descriptor_binding_acceleration_structure_update_after_bind(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let extension_names: Vec<*const std::os::raw::c_char> =
            required_device_extensions().iter().map(|n| n.as_ptr()).collect();
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_names)
            .push_next(&mut features12)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);
        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| map_vk("create device", e))?
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let accel = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let ray_tracing = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let raw = Arc::new(RawDevice {
            entry,
            instance,
            physical_device,
            device,
            accel,
            ray_tracing,
            memory_properties,
            rt_properties,
            debug,
        });

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info);
        let timeline = unsafe {
            raw.create_semaphore(&semaphore_info, None)
                .map_err(|e| map_vk("create timeline semaphore", e))?
        };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let setup_pool = unsafe {
            raw.create_command_pool(&pool_info, None)
                .map_err(|e| map_vk("create command pool", e))?
        };
        let bindless = Arc::new(descriptor::BindlessTable::new(Arc::clone(&raw), params.view_table_capacity)?);

        log::info!(
            "vulkan device '{}' (queue family {}, view table {} slots)",
            device_name,
            queue_family_index,
            params.view_table_capacity
        );
        Ok(Arc::new(Self {
            raw,
            queue: Mutex::new(queue),
            queue_family_index,
            timeline,
            setup_pool: Mutex::new(setup_pool),
            bindless,
            next_id: AtomicU64::new(1),
        }))
    }

    fn next_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record and run a command buffer synchronously on the queue.
    fn one_shot(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<(), RhiError> {
        let pool = self.setup_pool.lock().unwrap_or_else(PoisonError::into_inner);
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe {
            self.raw
                .allocate_command_buffers(&allocate_info)
                .map_err(|e| map_vk("allocate command buffer", e))?[0]
        };
        let result = unsafe {
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.raw
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| map_vk("begin command buffer", e))
                .and_then(|_| {
                    record(cmd);
                    self.raw.end_command_buffer(cmd).map_err(|e| map_vk("end command buffer", e))
                })
                .and_then(|_| {
                    let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                    let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                    self.raw
                        .queue_submit(*queue, &[submit_info], vk::Fence::null())
                        .and_then(|_| self.raw.queue_wait_idle(*queue))
                        .map_err(|e| map_vk("one-shot submit", e))
                })
        };
        unsafe { self.raw.free_command_buffers(*pool, &[cmd]) };
        result
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
            let pool = self.setup_pool.get_mut().unwrap_or_else(PoisonError::into_inner);
            self.raw.destroy_command_pool(*pool, None);
            self.raw.destroy_semaphore(self.timeline, None);
        }
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

impl Device for VulkanDevice {
    fn view_table_capacity(&self) -> u32 {
        self.bindless.capacity()
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Box<dyn Buffer>, RhiError> {
        let buffer = buffer::VulkanBuffer::create(&self.raw, desc, self.next_id())?;
        Ok(Box::new(buffer))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Box<dyn Texture>, RhiError> {
        let tex = texture::VulkanTexture::create(&self.raw, desc, self.next_id())?;
        let (layout, access, stages) = state_info(desc.initial_state);
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(layout)
            .dst_access_mask(access)
            .image(tex.image)
            .subresource_range(texture::full_range());
        self.one_shot(|cmd| unsafe {
            self.raw.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })?;
        Ok(Box::new(tex))
    }

    fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        let vk_buf = buffer::downcast(buffer)?;
        if !vk_buf.host_visible {
            return Err(RhiError::InvalidResource("write_buffer on a device-local buffer"));
        }
        if offset + data.len() as u64 > vk_buf.size {
            return Err(RhiError::InvalidResource("write_buffer out of bounds"));
        }
        unsafe {
            let ptr = self
                .raw
                .map_memory(vk_buf.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|e| map_vk("map buffer", e))?;
            let dst = ptr.cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            self.raw.unmap_memory(vk_buf.memory);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &dyn Buffer, offset: u64, out: &mut [u8]) -> Result<(), RhiError> {
        let vk_buf = buffer::downcast(buffer)?;
        if !vk_buf.host_visible {
            return Err(RhiError::InvalidResource("read_buffer on a device-local buffer"));
        }
        if offset + out.len() as u64 > vk_buf.size {
            return Err(RhiError::InvalidResource("read_buffer out of bounds"));
        }
        unsafe {
            let ptr = self
                .raw
                .map_memory(vk_buf.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|e| map_vk("map buffer", e))?;
            let src = ptr.cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
            self.raw.unmap_memory(vk_buf.memory);
        }
        Ok(())
    }

    fn write_view(&self, slot: u32, resource: ResourceRef<'_>, desc: &ViewDescriptor) -> Result<(), RhiError> {
        self.bindless.write(slot, resource, desc)
    }

    fn create_command_allocator(&self) -> Result<Box<dyn CommandAllocator>, RhiError> {
        let allocator = command::VulkanCommandAllocator::new(
            Arc::clone(&self.raw),
            Arc::clone(&self.bindless),
            self.queue_family_index,
            self.next_id(),
        )?;
        Ok(Box::new(allocator))
    }

    fn submit(&self, list: Box<dyn CommandList>, signal_value: u64) -> Result<(), RhiError> {
        let vk_list = list
            .as_any()
            .downcast_ref::<command::VulkanCommandList>()
            .ok_or(RhiError::InvalidResource("command list is not a Vulkan command list"))?;
        let cmd = vk_list.finish()?;
        let signal_values = [signal_value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(std::slice::from_ref(&cmd))
            .signal_semaphores(std::slice::from_ref(&self.timeline))
            .push_next(&mut timeline_info);
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.raw
                .queue_submit(*queue, &[submit_info], vk::Fence::null())
                .map_err(|e| map_vk("queue submit", e))
        }
    }

    fn completed_value(&self) -> Result<u64, RhiError> {
        unsafe {
            self.raw
                .get_semaphore_counter_value(self.timeline)
                .map_err(|e| map_vk("read timeline", e))
        }
    }

    fn wait_for_value(&self, value: u64) -> Result<(), RhiError> {
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe {
            self.raw
                .wait_semaphores(&wait_info, u64::MAX)
                .map_err(|e| map_vk("wait timeline", e))
        }
    }

    fn create_compute_kernel(&self, desc: &ComputeKernelDescriptor<'_>) -> Result<Box<dyn ComputeKernel>, RhiError> {
        let kernel = pipeline::VulkanComputeKernel::create(&self.raw, &self.bindless, desc)?;
        Ok(Box::new(kernel))
    }

    fn create_ray_tracing_kernel(
        &self,
        desc: &RayTracingKernelDescriptor<'_>,
    ) -> Result<Box<dyn RayTracingKernel>, RhiError> {
        let kernel = pipeline::VulkanRayTracingKernel::create(&self.raw, &self.bindless, desc, self.next_id())?;
        Ok(Box::new(kernel))
    }

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs<'_>,
    ) -> Result<AccelerationStructureSizes, RhiError> {
        accel::build_sizes(&self.raw, inputs)
    }

    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDescriptor,
    ) -> Result<Box<dyn AccelerationStructure>, RhiError> {
        let structure = accel::VulkanAccelerationStructure::create(&self.raw, desc, self.next_id(), self.next_id())?;
        Ok(Box::new(structure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_table_slots_can_be_rewritten_while_pending() {
        let features = required_features12();
        assert_eq!(features.descriptor_binding_update_unused_while_pending, vk::TRUE);
        assert_eq!(features.descriptor_binding_partially_bound, vk::TRUE);
        assert_eq!(features.timeline_semaphore, vk::TRUE);
        assert!(descriptor::binding_flags().contains(
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
        ));
    }
}
