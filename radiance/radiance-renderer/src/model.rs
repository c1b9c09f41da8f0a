//! Mesh model: device-local vertex streams plus the bottom-level index built from them.

use radiance_rhi::{Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, GpuContext, TriangleGeometry};
use render_api::MeshData;

use crate::accel::{AccelerationStructureBuilder, BottomLevelIndex};
use crate::error::RendererError;

const POSITION_STRIDE: u64 = 12;

#[derive(Debug)]
pub struct Model {
    positions: Box<dyn Buffer>,
    normals: Option<Box<dyn Buffer>>,
    indices: Box<dyn Buffer>,
    vertex_count: u32,
    index_count: u32,
    bottom_level: BottomLevelIndex,
}

fn upload_stream(ctx: &mut GpuContext, label: &'static str, bytes: &[u8]) -> Result<Box<dyn Buffer>, RendererError> {
    let buffer = ctx.create_buffer(&BufferDescriptor {
        label: Some(label),
        size: bytes.len() as u64,
        usage: BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::ACCELERATION_STRUCTURE_INPUT,
        memory: BufferMemoryPreference::DeviceLocal,
    })?;
    ctx.upload_buffer(buffer.as_ref(), 0, bytes)?;
    Ok(buffer)
}

impl Model {
    /// Validate `mesh`, upload its streams and build the bottom-level index. Blocks until the GPU is idle.
    pub fn from_mesh(ctx: &mut GpuContext, mesh: &MeshData) -> Result<Self, RendererError> {
        mesh.validate().map_err(RendererError::InvalidMesh)?;
        let positions = upload_stream(ctx, "model positions", bytemuck::cast_slice(&mesh.positions))?;
        let normals = if mesh.normals.is_empty() {
            None
        } else {
            Some(upload_stream(ctx, "model normals", bytemuck::cast_slice(&mesh.normals))?)
        };
        let indices = upload_stream(ctx, "model indices", bytemuck::cast_slice(&mesh.indices))?;
        let vertex_count = mesh.vertex_count() as u32;
        let index_count = mesh.indices.len() as u32;
        let bottom_level = AccelerationStructureBuilder::build_static(
            ctx,
            &TriangleGeometry {
                vertices: positions.as_ref(),
                vertex_count,
                vertex_stride: POSITION_STRIDE,
                indices: indices.as_ref(),
                index_count,
            },
        )?;
        log::info!("model loaded: {} vertices, {} triangles", vertex_count, index_count / 3);
        Ok(Self { positions, normals, indices, vertex_count, index_count, bottom_level })
    }

    pub fn bottom_level(&self) -> &BottomLevelIndex {
        &self.bottom_level
    }

    pub fn positions(&self) -> &dyn Buffer {
        self.positions.as_ref()
    }

    pub fn normals(&self) -> Option<&dyn Buffer> {
        self.normals.as_deref()
    }

    pub fn indices(&self) -> &dyn Buffer {
        self.indices.as_ref()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}
