//! Renderer error types. Everything here is fatal for the frame loop; binaries report and exit.

use std::path::PathBuf;

use radiance_rhi::RhiError;
use thiserror::Error;

use crate::kernels::KernelRole;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("instance capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("unknown instance {id}")]
    UnknownInstance { id: u32 },
}

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("a cascade set needs at least 2 levels, got {count}")]
    TooFewLevels { count: usize },

    #[error("cascade resolution {resolution:?} and probe footprint {probe_texels:?} must be non-zero")]
    EmptyLevel { resolution: [u32; 3], probe_texels: (u32, u32) },

    #[error("cascade resolution {resolution:?} with probe footprint {probe_texels:?} exceeds the texture size range")]
    TooLarge { resolution: [u32; 3], probe_texels: (u32, u32) },
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to read kernel {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{role:?} kernel is {len} bytes, not a whole number of 32-bit words")]
    Misaligned { role: KernelRole, len: usize },

    #[error("{role:?} kernel is {len} bytes, shorter than a SPIR-V header")]
    Truncated { role: KernelRole, len: usize },

    #[error("{role:?} kernel has magic {found:#010x}, expected SPIR-V")]
    BadMagic { role: KernelRole, found: u32 },

    #[error("no {0:?} kernel in the library")]
    Missing(KernelRole),

    #[error("{role:?} kernel cannot be created as a {requested} kernel")]
    WrongKind { role: KernelRole, requested: &'static str },
}

#[derive(Debug, Error)]
pub enum RendererError {
    #[error(transparent)]
    Rhi(#[from] RhiError),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Cascade(#[from] CascadeError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}
