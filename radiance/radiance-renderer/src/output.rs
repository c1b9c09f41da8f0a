//! Output target written by the shading pass. Rests in `ShaderRead` between frames so the
//! host can sample or copy it.

use radiance_rhi::{
    GpuContext, ResourceRef, ResourceState, RhiError, Texture, TextureDescriptor, TextureDimension, TextureFormat,
    TextureUsage, ViewDescriptor, ViewHandle,
};

#[derive(Debug)]
pub struct OutputTarget {
    texture: Box<dyn Texture>,
    read_view: ViewHandle,
    write_view: ViewHandle,
    width: u32,
    height: u32,
}

fn create_texture(ctx: &GpuContext, width: u32, height: u32, format: TextureFormat) -> Result<Box<dyn Texture>, RhiError> {
    ctx.create_texture(&TextureDescriptor {
        label: Some("radiance output"),
        size: (width, height, 1),
        format,
        usage: TextureUsage::STORAGE_BINDING | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC,
        dimension: TextureDimension::D2,
        initial_state: ResourceState::ShaderRead,
    })
}

impl OutputTarget {
    pub fn new(ctx: &mut GpuContext, width: u32, height: u32, format: TextureFormat) -> Result<Self, RhiError> {
        let (width, height) = (width.max(1), height.max(1));
        let texture = create_texture(ctx, width, height, format)?;
        let read_view = ctx.create_view(ResourceRef::Texture(texture.as_ref()), &ViewDescriptor::read_only(), None)?;
        let write_view = ctx.create_view(ResourceRef::Texture(texture.as_ref()), &ViewDescriptor::read_write(), None)?;
        Ok(Self { texture, read_view, write_view, width, height })
    }

    /// Recreate the texture at a new size, keeping both view slots. Returns false when the size is unchanged.
    /// Waits for the GPU to go idle before replacing anything.
    pub fn ensure_size(&mut self, ctx: &mut GpuContext, width: u32, height: u32) -> Result<bool, RhiError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return Ok(false);
        }
        ctx.wait_idle()?;
        let texture = create_texture(ctx, width, height, self.texture.format())?;
        ctx.create_view(ResourceRef::Texture(texture.as_ref()), &ViewDescriptor::read_only(), Some(self.read_view))?;
        ctx.create_view(ResourceRef::Texture(texture.as_ref()), &ViewDescriptor::read_write(), Some(self.write_view))?;
        log::debug!("output resized {}x{} -> {}x{}", self.width, self.height, width, height);
        self.texture = texture;
        self.width = width;
        self.height = height;
        Ok(true)
    }

    pub fn texture(&self) -> &dyn Texture {
        self.texture.as_ref()
    }

    pub fn read_view(&self) -> ViewHandle {
        self.read_view
    }

    pub fn write_view(&self) -> ViewHandle {
        self.write_view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiance_rhi::headless::HeadlessDevice;
    use std::sync::Arc;

    #[test]
    fn resize_keeps_view_slots() {
        let device = Arc::new(HeadlessDevice::new());
        let mut ctx = GpuContext::new(device.clone());
        let mut output = OutputTarget::new(&mut ctx, 64, 32, TextureFormat::Rgba8Unorm).unwrap();
        let (read, write) = (output.read_view(), output.write_view());
        assert!(!output.ensure_size(&mut ctx, 64, 32).unwrap());
        assert!(output.ensure_size(&mut ctx, 128, 0).unwrap());
        assert_eq!(output.size(), (128, 1));
        assert_eq!((output.read_view(), output.write_view()), (read, write));
        assert_eq!(device.view(read.index()).map(|(id, _)| id), Some(output.texture().id()));
        assert_eq!(device.resource_state(output.texture().id()), Some(ResourceState::ShaderRead));
    }
}
