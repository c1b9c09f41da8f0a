//! The view table as one bindless descriptor set.
//!
//! Binding 0: sampled images, 1: storage images, 2: storage buffers,
//! 3: acceleration structures. A view-table slot `n` lives at array element `n` of
//! whichever binding matches its kind, so kernels index every binding with the same
//! push-constant word. All bindings are update-after-bind, partially bound and
//! writable while a pending batch has the set bound; a kernel only ever reads slots
//! whose release has not yet been reclaimed.

use super::{accel, buffer, map_vk, RawDevice};
use crate::{ResourceRef, RhiError, ViewDescriptor, ViewKind, ViewRange, MAX_BINDING_WORDS};
use ash::vk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub(crate) const SAMPLED_IMAGE_BINDING: u32 = 0;
pub(crate) const STORAGE_IMAGE_BINDING: u32 = 1;
pub(crate) const STORAGE_BUFFER_BINDING: u32 = 2;
pub(crate) const ACCELERATION_STRUCTURE_BINDING: u32 = 3;

/// Stages that can read the view table and binding words.
pub(crate) fn kernel_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::COMPUTE
        | vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
}

/// Flags shared by all four bindings. Slots are rewritten between submissions while
/// earlier batches are still pending.
pub(crate) fn binding_flags() -> vk::DescriptorBindingFlags {
    vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
        | vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
}

fn binding_types() -> [(u32, vk::DescriptorType); 4] {
    [
        (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
        (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
        (STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER),
        (ACCELERATION_STRUCTURE_BINDING, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
    ]
}

pub(crate) struct BindlessTable {
    raw: Arc<RawDevice>,
    capacity: u32,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
    /// Shared by every kernel: the bindless set plus the binding words as push constants.
    pub(crate) pipeline_layout: vk::PipelineLayout,
    /// Image views created for sub-range views, destroyed when their slot is rewritten.
    owned_views: Mutex<HashMap<u32, vk::ImageView>>,
}

impl BindlessTable {
    pub(crate) fn new(raw: Arc<RawDevice>, capacity: u32) -> Result<Self, RhiError> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = binding_types()
            .iter()
            .map(|(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(*binding)
                    .descriptor_type(*ty)
                    .descriptor_count(capacity)
                    .stage_flags(kernel_stages())
            })
            .collect();
        let binding_flags = [binding_flags(); 4];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let set_layout = unsafe {
            raw.create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| map_vk("create bindless layout", e))?
        };

        let pool_sizes: Vec<vk::DescriptorPoolSize> = binding_types()
            .iter()
            .map(|(_, ty)| vk::DescriptorPoolSize::default().ty(*ty).descriptor_count(capacity))
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            raw.create_descriptor_pool(&pool_info, None)
                .map_err(|e| map_vk("create bindless pool", e))?
        };
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&set_layout));
        let set = unsafe {
            raw.allocate_descriptor_sets(&alloc_info)
                .map_err(|e| map_vk("allocate bindless set", e))?[0]
        };

        let push_range = vk::PushConstantRange::default()
            .stage_flags(kernel_stages())
            .offset(0)
            .size((MAX_BINDING_WORDS * 4) as u32);
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_range));
        let pipeline_layout = unsafe {
            raw.create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| map_vk("create pipeline layout", e))?
        };

        Ok(Self {
            raw,
            capacity,
            set_layout,
            pool,
            set,
            pipeline_layout,
            owned_views: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Point slot `slot` of the binding matching `desc.kind` at `resource`.
    pub(crate) fn write(&self, slot: u32, resource: ResourceRef<'_>, desc: &ViewDescriptor) -> Result<(), RhiError> {
        if slot >= self.capacity {
            return Err(RhiError::ViewTableFull { capacity: self.capacity });
        }
        let mut owned_view = None;
        match (resource, desc.kind) {
            (ResourceRef::Buffer(b), ViewKind::ReadOnly | ViewKind::ReadWrite) => {
                let vk_buf = buffer::downcast(b)?;
                let (offset, range) = match desc.range {
                    ViewRange::Elements { first, count, stride } => (first * stride as u64, count * stride as u64),
                    _ => (0, vk::WHOLE_SIZE),
                };
                let buffer_info = vk::DescriptorBufferInfo::default()
                    .buffer(vk_buf.buffer)
                    .offset(offset)
                    .range(range);
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(STORAGE_BUFFER_BINDING)
                    .dst_array_element(slot)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(&buffer_info));
                unsafe { self.raw.update_descriptor_sets(&[write], &[]) };
            }
            (ResourceRef::Texture(t), kind @ (ViewKind::ReadOnly | ViewKind::ReadWrite)) => {
                let tex = t
                    .as_any()
                    .downcast_ref::<super::texture::VulkanTexture>()
                    .ok_or(RhiError::InvalidResource("texture is not a Vulkan texture"))?;
                let image_view = match desc.range {
                    ViewRange::Layers { first, count } => {
                        let view = tex.layer_view(first, count)?;
                        owned_view = Some(view);
                        view
                    }
                    _ => tex.view,
                };
                let (binding, ty, layout) = if kind == ViewKind::ReadOnly {
                    (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                } else {
                    (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE, vk::ImageLayout::GENERAL)
                };
                let image_info = vk::DescriptorImageInfo::default().image_view(image_view).image_layout(layout);
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(binding)
                    .dst_array_element(slot)
                    .descriptor_type(ty)
                    .image_info(std::slice::from_ref(&image_info));
                unsafe { self.raw.update_descriptor_sets(&[write], &[]) };
            }
            (ResourceRef::AccelerationStructure(a), ViewKind::AccelerationStructure) => {
                let structure = accel::downcast(a)?;
                let handles = [structure.handle];
                let mut as_write =
                    vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&handles);
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(ACCELERATION_STRUCTURE_BINDING)
                    .dst_array_element(slot)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(1)
                    .push_next(&mut as_write);
                unsafe { self.raw.update_descriptor_sets(&[write], &[]) };
            }
            _ => return Err(RhiError::InvalidResource("view kind does not match resource type")),
        }

        let mut owned = self.owned_views.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = match owned_view {
            Some(view) => owned.insert(slot, view),
            None => owned.remove(&slot),
        };
        if let Some(previous) = previous {
            unsafe { self.raw.destroy_image_view(previous, None) };
        }
        Ok(())
    }
}

impl Drop for BindlessTable {
    fn drop(&mut self) {
        let owned = self.owned_views.get_mut().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            for (_, view) in owned.drain() {
                self.raw.destroy_image_view(view, None);
            }
            self.raw.destroy_pipeline_layout(self.pipeline_layout, None);
            self.raw.destroy_descriptor_pool(self.pool, None);
            self.raw.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

impl std::fmt::Debug for BindlessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindlessTable")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
