//! Acceleration structure builder.
//!
//! Bottom-level indices are built once per mesh in their own batch. The top-level index
//! is rebuilt into the frame's batch whenever instance transforms change; its scratch
//! buffer only ever grows.

use radiance_rhi::{
    AccelerationStructure, AccelerationStructureDescriptor, AccelerationStructureInputs,
    AccelerationStructureLevel, AccelerationStructureSizes, Buffer, BufferDescriptor, BufferMemoryPreference,
    BufferUsage, CommandBatch, GpuContext, RhiError, TriangleGeometry,
};

/// Static per-mesh acceleration structure.
#[derive(Debug)]
pub struct BottomLevelIndex {
    structure: Box<dyn AccelerationStructure>,
}

impl BottomLevelIndex {
    pub fn structure(&self) -> &dyn AccelerationStructure {
        self.structure.as_ref()
    }

    /// Address written into top-level instance descriptors.
    pub fn device_address(&self) -> u64 {
        self.structure.device_address()
    }
}

/// Acceleration structure over every scene instance.
#[derive(Debug)]
pub struct TopLevelIndex {
    structure: Box<dyn AccelerationStructure>,
    instance_count: u32,
}

impl TopLevelIndex {
    pub fn structure(&self) -> &dyn AccelerationStructure {
        self.structure.as_ref()
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
}

fn checked_sizes(
    ctx: &GpuContext,
    inputs: &AccelerationStructureInputs<'_>,
) -> Result<AccelerationStructureSizes, RhiError> {
    let sizes = ctx.device().acceleration_structure_sizes(inputs)?;
    if sizes.structure_size == 0 || sizes.scratch_size == 0 {
        return Err(RhiError::InvalidBuildInput(format!(
            "device reported zero build sizes for {:?} with {} primitives",
            inputs.level(),
            inputs.primitive_count()
        )));
    }
    Ok(sizes)
}

#[derive(Debug, Default)]
pub struct AccelerationStructureBuilder {
    scratch: Option<Box<dyn Buffer>>,
    dynamic_builds: u64,
}

impl AccelerationStructureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bottom-level index for `geometry`. Submits its own batch and waits for the GPU.
    pub fn build_static(ctx: &mut GpuContext, geometry: &TriangleGeometry<'_>) -> Result<BottomLevelIndex, RhiError> {
        let inputs = AccelerationStructureInputs::Triangles(*geometry);
        let sizes = checked_sizes(ctx, &inputs)?;
        let structure = ctx.device().create_acceleration_structure(&AccelerationStructureDescriptor {
            label: Some("bottom-level index"),
            level: AccelerationStructureLevel::Bottom,
            size: sizes.structure_size,
        })?;
        let scratch = ctx.create_buffer(&BufferDescriptor {
            label: Some("bottom-level scratch"),
            size: sizes.scratch_size,
            usage: BufferUsage::SCRATCH,
            memory: BufferMemoryPreference::DeviceLocal,
        })?;
        let mut batch = ctx.begin_commands()?;
        batch.build_acceleration_structure(structure.as_ref(), &inputs, scratch.as_ref());
        ctx.submit(batch)?;
        ctx.wait_idle()?;
        log::debug!(
            "built bottom-level index: {} triangles, {} bytes",
            inputs.primitive_count(),
            sizes.structure_size
        );
        Ok(BottomLevelIndex { structure })
    }

    /// Record a top-level build over `count` descriptors of `instances` into `batch`.
    pub fn build_dynamic(
        &mut self,
        ctx: &mut GpuContext,
        batch: &mut CommandBatch,
        instances: &dyn Buffer,
        count: u32,
    ) -> Result<TopLevelIndex, RhiError> {
        let inputs = AccelerationStructureInputs::Instances { instances, count };
        let sizes = checked_sizes(ctx, &inputs)?;
        self.ensure_scratch(ctx, sizes.scratch_size)?;
        let structure = ctx.device().create_acceleration_structure(&AccelerationStructureDescriptor {
            label: Some("top-level index"),
            level: AccelerationStructureLevel::Top,
            size: sizes.structure_size,
        })?;
        let scratch = self
            .scratch
            .as_deref()
            .ok_or(RhiError::InvalidResource("top-level scratch buffer missing"))?;
        batch.build_acceleration_structure(structure.as_ref(), &inputs, scratch);
        self.dynamic_builds += 1;
        Ok(TopLevelIndex { structure, instance_count: count })
    }

    /// Bytes of the current top-level scratch buffer (0 before the first build).
    pub fn scratch_capacity(&self) -> u64 {
        self.scratch.as_ref().map_or(0, |s| s.size())
    }

    pub fn dynamic_build_count(&self) -> u64 {
        self.dynamic_builds
    }

    fn ensure_scratch(&mut self, ctx: &mut GpuContext, required: u64) -> Result<(), RhiError> {
        if self.scratch_capacity() >= required {
            return Ok(());
        }
        let scratch = ctx.create_buffer(&BufferDescriptor {
            label: Some("top-level scratch"),
            size: required,
            usage: BufferUsage::SCRATCH,
            memory: BufferMemoryPreference::DeviceLocal,
        })?;
        log::debug!("top-level scratch grown {} -> {} bytes", self.scratch_capacity(), required);
        if let Some(old) = self.scratch.replace(scratch) {
            ctx.retire(old);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiance_rhi::headless::{HeadlessDevice, RecordedCommand};
    use radiance_rhi::AccelerationStructureInstance;
    use std::sync::Arc;

    fn instance_buffer(ctx: &GpuContext, count: u64) -> Box<dyn Buffer> {
        ctx.create_buffer(&BufferDescriptor {
            label: Some("descriptors"),
            size: count * std::mem::size_of::<AccelerationStructureInstance>() as u64,
            usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: BufferMemoryPreference::HostVisible,
        })
        .unwrap()
    }

    #[test]
    fn zero_sizes_are_a_build_input_error() {
        let mut ctx = GpuContext::new(Arc::new(HeadlessDevice::new()));
        let instances = instance_buffer(&ctx, 1);
        let mut builder = AccelerationStructureBuilder::new();
        let mut batch = ctx.begin_commands().unwrap();
        let result = builder.build_dynamic(&mut ctx, &mut batch, instances.as_ref(), 0);
        assert!(matches!(result, Err(RhiError::InvalidBuildInput(_))));
        assert_eq!(builder.dynamic_build_count(), 0);
    }

    #[test]
    fn static_build_waits_for_completion() {
        let device = Arc::new(HeadlessDevice::new());
        device.set_auto_complete(false);
        let mut ctx = GpuContext::new(device.clone());
        let vertices = ctx
            .create_buffer(&BufferDescriptor { size: 36, ..Default::default() })
            .unwrap();
        let indices = ctx
            .create_buffer(&BufferDescriptor { size: 12, ..Default::default() })
            .unwrap();
        let blas = AccelerationStructureBuilder::build_static(
            &mut ctx,
            &TriangleGeometry {
                vertices: vertices.as_ref(),
                vertex_count: 3,
                vertex_stride: 12,
                indices: indices.as_ref(),
                index_count: 3,
            },
        )
        .unwrap();
        assert_eq!(ctx.completed_submission(), 1);
        assert_ne!(blas.device_address(), 0);
        let submissions = device.submissions();
        assert!(matches!(
            submissions[0].commands[0],
            RecordedCommand::BuildAccelerationStructure { level: AccelerationStructureLevel::Bottom, primitive_count: 1, .. }
        ));
    }

    #[test]
    fn scratch_grows_and_never_shrinks() {
        let mut ctx = GpuContext::new(Arc::new(HeadlessDevice::new()));
        let instances = instance_buffer(&ctx, 64);
        let mut builder = AccelerationStructureBuilder::new();
        let mut capacities = Vec::new();
        for count in [4, 64, 2, 16] {
            let mut batch = ctx.begin_commands().unwrap();
            let tlas = builder.build_dynamic(&mut ctx, &mut batch, instances.as_ref(), count).unwrap();
            assert_eq!(tlas.instance_count(), count);
            ctx.submit(batch).unwrap();
            capacities.push(builder.scratch_capacity());
        }
        assert!(capacities.windows(2).all(|w| w[1] >= w[0]), "{:?}", capacities);
        assert_eq!(capacities[2], capacities[1]);
        assert_eq!(builder.dynamic_build_count(), 4);
    }
}
