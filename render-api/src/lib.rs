//! Shared collaborator types for the Radiance renderer.
//! The host fills these from its own camera and mesh importer; the renderer
//! treats them as plain data.

mod extract;

pub use extract::{ExtractedView, MeshData, IDENTITY};
