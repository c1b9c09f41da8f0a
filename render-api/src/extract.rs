//! Data types extracted from the host each frame (camera) or at load time (meshes).

/// Column-major 4x4 identity.
pub const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
];

/// View/camera data for the current frame.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedView {
    /// Column-major view-projection matrix.
    pub view_proj: [f32; 16],
    /// Column-major world-to-view matrix.
    pub view: [f32; 16],
    pub viewport_size: (u32, u32),
}

impl Default for ExtractedView {
    fn default() -> Self {
        Self {
            view_proj: IDENTITY,
            view: IDENTITY,
            viewport_size: (1280, 720),
        }
    }
}

/// Mesh streams as produced by an importer: float3 positions and normals, u32 triangle indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    /// x, y, z per vertex.
    pub positions: Vec<f32>,
    /// x, y, z per vertex; may be empty.
    pub normals: Vec<f32>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Check stream lengths and index bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.positions.len() % 3 != 0 {
            return Err(format!("position stream length {} is not a multiple of 3", self.positions.len()));
        }
        if !self.normals.is_empty() && self.normals.len() != self.positions.len() {
            return Err(format!(
                "normal stream length {} does not match position stream length {}",
                self.normals.len(),
                self.positions.len()
            ));
        }
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(format!("index count {} is not a positive multiple of 3", self.indices.len()));
        }
        let vertex_count = self.vertex_count() as u32;
        if let Some(bad) = self.indices.iter().find(|&&i| i >= vertex_count) {
            return Err(format!("index {} out of range for {} vertices", bad, vertex_count));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> MeshData {
        MeshData {
            positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            normals: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn valid_triangle() {
        let mesh = triangle();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.triangle_count(), 1);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut mesh = triangle();
        mesh.indices[2] = 3;
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_normals() {
        let mut mesh = triangle();
        mesh.normals.pop();
        assert!(mesh.validate().is_err());
    }
}
