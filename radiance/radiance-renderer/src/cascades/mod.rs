//! Radiance cascade engine.
//!
//! Each level is an `Rgba16Float` 2D-array texture with one layer per probe slice.
//! Levels rest in `ShaderRead` between frames. `generate` traces every level (or only
//! level 0), then merges coarse into fine from level N-2 down to 0, leaving every level
//! readable again.

use bytemuck::{Pod, Zeroable};
use radiance_rhi::{
    BindingValue, Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, CommandBatch, ComputeKernel,
    GpuContext, RayTracingKernel, ResourceRef, ResourceState, Texture, TextureDescriptor, TextureDimension,
    TextureFormat, TextureUsage, ViewDescriptor, ViewHandle,
};

use crate::config::{CascadeConfig, TraceMode};
use crate::error::RendererError;
use crate::kernels::{KernelLibrary, KernelRole, MERGE_BINDINGS, TRACE_BINDINGS};

/// Merge kernel workgroup edge on every axis.
pub const MERGE_GROUP_SIZE: u32 = 4;
/// The constant buffer is padded to the largest uniform-offset alignment in use.
const CONSTANTS_BUFFER_SIZE: u64 = 256;

/// Constants shared by every level, read by trace, merge, shade and debug kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CascadeConstants {
    pub probe_count: [u32; 3],
    pub _pad0: u32,
    pub extents: [f32; 3],
    pub _pad1: f32,
    pub offset: [f32; 3],
    pub _pad2: f32,
    /// Level texture width and height.
    pub size: [u32; 2],
    pub level_count: u32,
    pub _pad3: u32,
}

impl CascadeConstants {
    pub fn from_config(config: &CascadeConfig) -> Self {
        let (width, height, _) = config.level_size(0);
        Self {
            probe_count: config.resolution,
            _pad0: 0,
            extents: config.extents,
            _pad1: 0.0,
            offset: config.offset,
            _pad2: 0.0,
            size: [width, height],
            level_count: config.level_count as u32,
            _pad3: 0,
        }
    }
}

#[derive(Debug)]
pub struct CascadeLevel {
    size: (u32, u32, u32),
    texture: Box<dyn Texture>,
    read_view: ViewHandle,
    write_view: ViewHandle,
}

impl CascadeLevel {
    /// (width, height, probe slices).
    pub fn size(&self) -> (u32, u32, u32) {
        self.size
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
}

pub struct RadianceCascades {
    config: CascadeConfig,
    levels: Vec<CascadeLevel>,
    constants: Box<dyn Buffer>,
    constants_view: ViewHandle,
    /// Contents of the constant buffer, `None` until first written.
    written: Option<CascadeConstants>,
    /// Last submission that read the constant buffer.
    constants_last_use: u64,
    trace_kernel: Box<dyn RayTracingKernel>,
    merge_kernel: Box<dyn ComputeKernel>,
    generations: u64,
}

impl std::fmt::Debug for RadianceCascades {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadianceCascades")
            .field("config", &self.config)
            .field("levels", &self.levels.len())
            .field("generations", &self.generations)
            .finish_non_exhaustive()
    }
}

impl RadianceCascades {
    pub fn new(ctx: &mut GpuContext, kernels: &KernelLibrary, config: CascadeConfig) -> Result<Self, RendererError> {
        config.validate()?;
        let trace_kernel = kernels.create_ray_tracing(ctx.device().as_ref(), KernelRole::Trace)?;
        let merge_kernel = kernels.create_compute(ctx.device().as_ref(), KernelRole::Merge)?;

        let mut levels = Vec::with_capacity(config.level_count);
        for index in 0..config.level_count {
            let size = config.level_size(index);
            let texture = ctx.create_texture(&TextureDescriptor {
                label: Some("cascade level"),
                size,
                format: TextureFormat::Rgba16Float,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::STORAGE_BINDING,
                dimension: TextureDimension::D2Array,
                initial_state: ResourceState::ShaderRead,
            })?;
            let read_view = ctx.create_view(ResourceRef::Texture(texture.as_ref()), &ViewDescriptor::read_only(), None)?;
            let write_view =
                ctx.create_view(ResourceRef::Texture(texture.as_ref()), &ViewDescriptor::read_write(), None)?;
            levels.push(CascadeLevel { size, texture, read_view, write_view });
        }

        let constants = ctx.create_buffer(&BufferDescriptor {
            label: Some("cascade constants"),
            size: CONSTANTS_BUFFER_SIZE,
            usage: BufferUsage::UNIFORM,
            memory: BufferMemoryPreference::HostVisible,
        })?;
        let constants_view =
            ctx.create_view(ResourceRef::Buffer(constants.as_ref()), &ViewDescriptor::read_only(), None)?;

        log::info!(
            "radiance cascades: {} levels, probes {:?}, level 0 texture {:?}",
            config.level_count,
            config.resolution,
            config.level_size(0)
        );
        Ok(Self {
            config,
            levels,
            constants,
            constants_view,
            written: None,
            constants_last_use: 0,
            trace_kernel,
            merge_kernel,
            generations: 0,
        })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[CascadeLevel] {
        &self.levels
    }

    /// Read views of levels 0..N, finest first.
    pub fn read_views(&self) -> Vec<ViewHandle> {
        self.levels.iter().map(|l| l.read_view).collect()
    }

    pub fn constants_view(&self) -> ViewHandle {
        self.constants_view
    }

    pub fn constants_buffer(&self) -> &dyn Buffer {
        self.constants.as_ref()
    }

    /// Number of `generate` calls recorded so far.
    pub fn generation_count(&self) -> u64 {
        self.generations
    }

    /// Move the probe volume. Takes effect at the next `generate`.
    pub fn set_volume(&mut self, extents: [f32; 3], offset: [f32; 3]) {
        self.config.extents = extents;
        self.config.offset = offset;
    }

    pub fn set_trace_mode(&mut self, mode: TraceMode) {
        self.config.trace_mode = mode;
    }

    /// Record trace and merge for every level into `batch`. Returns the per-level read views.
    pub fn generate(
        &mut self,
        ctx: &mut GpuContext,
        batch: &mut CommandBatch,
        scene_index: ViewHandle,
        instances: ViewHandle,
    ) -> Result<Vec<ViewHandle>, RendererError> {
        debug_assert!(self.levels.len() >= 2, "cascade set with fewer than 2 levels");
        self.write_constants(ctx)?;

        batch.set_ray_tracing_kernel(self.trace_kernel.as_ref());
        for (index, level) in self.levels.iter().enumerate() {
            batch.transition(
                ResourceRef::Texture(level.texture.as_ref()),
                ResourceState::ShaderRead,
                ResourceState::UnorderedAccess,
            );
            if index > 0 && self.config.trace_mode == TraceMode::FinestOnly {
                continue;
            }
            let bindings = ctx.encode_bindings(
                TRACE_BINDINGS,
                &[
                    BindingValue::Immediate(index as u32),
                    BindingValue::View(self.constants_view),
                    BindingValue::View(scene_index),
                    BindingValue::View(instances),
                    BindingValue::View(level.write_view),
                ],
            );
            batch.set_bindings(&bindings);
            let (width, height, depth) = level.size;
            batch.dispatch_rays(width, height, depth);
        }

        batch.set_compute_kernel(self.merge_kernel.as_ref());
        for index in (0..self.levels.len() - 1).rev() {
            let finer = &self.levels[index];
            let coarser = &self.levels[index + 1];
            batch.transition(
                ResourceRef::Texture(coarser.texture.as_ref()),
                ResourceState::UnorderedAccess,
                ResourceState::ShaderRead,
            );
            batch.uav_barrier(ResourceRef::Texture(finer.texture.as_ref()));
            let bindings = ctx.encode_bindings(
                MERGE_BINDINGS,
                &[
                    BindingValue::Immediate(index as u32),
                    BindingValue::View(self.constants_view),
                    BindingValue::View(coarser.read_view),
                    BindingValue::View(finer.write_view),
                ],
            );
            batch.set_bindings(&bindings);
            let (width, height, depth) = finer.size;
            batch.dispatch(
                width.div_ceil(MERGE_GROUP_SIZE),
                height.div_ceil(MERGE_GROUP_SIZE),
                depth.div_ceil(MERGE_GROUP_SIZE),
            );
        }
        batch.transition(
            ResourceRef::Texture(self.levels[0].texture.as_ref()),
            ResourceState::UnorderedAccess,
            ResourceState::ShaderRead,
        );

        self.constants_last_use = ctx.next_submission();
        self.generations += 1;
        Ok(self.read_views())
    }

    fn write_constants(&mut self, ctx: &mut GpuContext) -> Result<(), RendererError> {
        let constants = CascadeConstants::from_config(&self.config);
        if self.written == Some(constants) {
            return Ok(());
        }
        ctx.wait_for(self.constants_last_use)?;
        ctx.write_buffer(self.constants.as_ref(), 0, bytemuck::bytes_of(&constants))?;
        log::debug!("cascade constants rewritten: {:?}", constants);
        self.written = Some(constants);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_16_byte_padded() {
        assert_eq!(std::mem::size_of::<CascadeConstants>(), 64);
        assert!(std::mem::size_of::<CascadeConstants>() as u64 <= CONSTANTS_BUFFER_SIZE);
    }

    #[test]
    fn constants_follow_config() {
        let config = CascadeConfig::with_spacing([8, 4, 2], 3, 2.0);
        let constants = CascadeConstants::from_config(&config);
        assert_eq!(constants.probe_count, [8, 4, 2]);
        assert_eq!(constants.extents, [16.0, 8.0, 4.0]);
        assert_eq!(constants.size, [128, 32]);
        assert_eq!(constants.level_count, 3);
    }
}
