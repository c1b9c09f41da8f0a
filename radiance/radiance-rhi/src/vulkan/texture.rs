//! Vulkan Texture: image, memory and a view over the whole resource.

use super::{map_vk, memory, RawDevice};
use crate::{ResourceId, RhiError, Texture, TextureDescriptor, TextureDimension, TextureFormat, TextureUsage};
use ash::vk;
use std::sync::Arc;

/// Subresource range covering every mip and array layer.
pub(crate) fn full_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

pub struct VulkanTexture {
    raw: Arc<RawDevice>,
    pub(crate) image: vk::Image,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) view: vk::ImageView,
    pub(crate) format: TextureFormat,
    pub(crate) size: (u32, u32, u32),
    pub(crate) dimension: TextureDimension,
    pub(crate) id: ResourceId,
}

impl VulkanTexture {
    pub(crate) fn create(raw: &Arc<RawDevice>, descriptor: &TextureDescriptor, id: ResourceId) -> Result<Self, RhiError> {
        let (width, height, depth_or_layers) = descriptor.size;
        let (depth, array_layers) = match descriptor.dimension {
            TextureDimension::D2 => (1, 1),
            TextureDimension::D2Array => (1, depth_or_layers.max(1)),
            TextureDimension::D3 => (depth_or_layers.max(1), 1),
        };
        let extent = vk::Extent3D { width: width.max(1), height: height.max(1), depth };
        let vk_format = texture_format_to_vk(descriptor.format);

        let create_info = vk::ImageCreateInfo::default()
            .image_type(texture_dimension_to_image_type(descriptor.dimension))
            .format(vk_format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(texture_usage_to_vk(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { raw.create_image(&create_info, None).map_err(|e| map_vk("create image", e))? };

        let requirements = unsafe { raw.get_image_memory_requirements(image) };
        let memory = match memory::allocate(raw, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, false, "texture memory") {
            Ok(m) => m,
            Err(e) => {
                unsafe { raw.destroy_image(image, None) };
                return Err(e);
            }
        };
        unsafe {
            raw.bind_image_memory(image, memory, 0)
                .map_err(|e| map_vk("bind image memory", e))?;
        }
        let view = create_image_view(raw, image, vk_format, descriptor.dimension, 0, array_layers)?;

        Ok(Self {
            raw: Arc::clone(raw),
            image,
            memory,
            view,
            format: descriptor.format,
            size: descriptor.size,
            dimension: descriptor.dimension,
            id,
        })
    }

    /// View over `count` array layers starting at `first`. The caller owns the result.
    pub(crate) fn layer_view(&self, first: u32, count: u32) -> Result<vk::ImageView, RhiError> {
        create_image_view(&self.raw, self.image, texture_format_to_vk(self.format), self.dimension, first, count)
    }
}

fn create_image_view(
    raw: &RawDevice,
    image: vk::Image,
    format: vk::Format,
    dimension: TextureDimension,
    first_layer: u32,
    layer_count: u32,
) -> Result<vk::ImageView, RhiError> {
    let view_create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(texture_dimension_to_view_type(dimension))
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(first_layer)
                .layer_count(layer_count),
        );
    unsafe { raw.create_image_view(&view_create_info, None).map_err(|e| map_vk("create image view", e)) }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_image_view(self.view, None);
            self.raw.destroy_image(self.image, None);
            self.raw.free_memory(self.memory, None);
        }
    }
}

impl std::fmt::Debug for VulkanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTexture")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl Texture for VulkanTexture {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn format(&self) -> TextureFormat {
        self.format
    }
    fn size(&self) -> (u32, u32, u32) {
        self.size
    }
    fn dimension(&self) -> TextureDimension {
        self.dimension
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub fn texture_format_to_vk(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn texture_usage_to_vk(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    flags
}

pub fn texture_dimension_to_image_type(dim: TextureDimension) -> vk::ImageType {
    match dim {
        TextureDimension::D2 | TextureDimension::D2Array => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

/// 2D arrays always get an array view, even with a single layer, so kernels can
/// declare one image type per binding.
pub fn texture_dimension_to_view_type(dim: TextureDimension) -> vk::ImageViewType {
    match dim {
        TextureDimension::D2 => vk::ImageViewType::TYPE_2D,
        TextureDimension::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureDimension::D3 => vk::ImageViewType::TYPE_3D,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_format_maps_to_half_float() {
        assert_eq!(texture_format_to_vk(TextureFormat::Rgba16Float), vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn storage_usage_maps_to_storage_image() {
        let flags = texture_usage_to_vk(TextureUsage::STORAGE_BINDING | TextureUsage::TEXTURE_BINDING);
        assert!(flags.contains(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn array_textures_use_array_views() {
        assert_eq!(texture_dimension_to_view_type(TextureDimension::D2Array), vk::ImageViewType::TYPE_2D_ARRAY);
    }
}
