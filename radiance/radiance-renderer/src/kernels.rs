//! Kernel library: SPIR-V blobs keyed by role, validated at load time, plus the binding
//! table each role is invoked with.
//!
//! Every kernel reads the bindless view table; the words listed in a binding table are
//! pushed as push constants in slot order.

use std::collections::HashMap;
use std::path::Path;

use radiance_rhi::{
    BindingSlot, ComputeKernel, ComputeKernelDescriptor, Device, RayTracingKernel, RayTracingKernelDescriptor,
    ViewKind,
};

use crate::error::{KernelError, RendererError};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;
/// Magic, version, generator, bound, schema.
const HEADER_WORDS: usize = 5;

pub const TRACE_BINDINGS: &[BindingSlot] = &[
    BindingSlot::immediate("level"),
    BindingSlot::view("constants", ViewKind::ReadOnly),
    BindingSlot::view("scene", ViewKind::AccelerationStructure),
    BindingSlot::view("instances", ViewKind::ReadOnly),
    BindingSlot::view("target", ViewKind::ReadWrite),
];

pub const MERGE_BINDINGS: &[BindingSlot] = &[
    BindingSlot::immediate("level"),
    BindingSlot::view("constants", ViewKind::ReadOnly),
    BindingSlot::view("coarser", ViewKind::ReadOnly),
    BindingSlot::view("finer", ViewKind::ReadWrite),
];

pub const SHADE_BINDINGS: &[BindingSlot] = &[
    BindingSlot::view("camera", ViewKind::ReadOnly),
    BindingSlot::view("scene", ViewKind::AccelerationStructure),
    BindingSlot::view("instances", ViewKind::ReadOnly),
    BindingSlot::view("radiance", ViewKind::ReadOnly),
    BindingSlot::view("cascade_constants", ViewKind::ReadOnly),
    BindingSlot::view("output", ViewKind::ReadWrite),
];

pub const DEBUG_VISUALIZE_BINDINGS: &[BindingSlot] = &[
    BindingSlot::immediate("level"),
    BindingSlot::view("camera", ViewKind::ReadOnly),
    BindingSlot::view("constants", ViewKind::ReadOnly),
    BindingSlot::view("cascade", ViewKind::ReadOnly),
    BindingSlot::view("output", ViewKind::ReadWrite),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelRole {
    /// Ray-traces one cascade level (raygen/miss/closest_hit).
    Trace,
    /// Folds a coarser level into the next finer one (compute).
    Merge,
    /// Shades the output target from the finest level (raygen/miss/closest_hit).
    Shade,
    /// Draws a chosen level over the output (compute).
    DebugVisualize,
}

impl KernelRole {
    pub const ALL: [KernelRole; 4] = [KernelRole::Trace, KernelRole::Merge, KernelRole::Shade, KernelRole::DebugVisualize];

    pub fn file_name(self) -> &'static str {
        match self {
            KernelRole::Trace => "trace.spv",
            KernelRole::Merge => "merge.spv",
            KernelRole::Shade => "shade.spv",
            KernelRole::DebugVisualize => "debug_visualize.spv",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            KernelRole::Trace => "cascade trace",
            KernelRole::Merge => "cascade merge",
            KernelRole::Shade => "shade",
            KernelRole::DebugVisualize => "debug visualize",
        }
    }

    pub fn is_ray_tracing(self) -> bool {
        matches!(self, KernelRole::Trace | KernelRole::Shade)
    }

    pub fn bindings(self) -> &'static [BindingSlot] {
        match self {
            KernelRole::Trace => TRACE_BINDINGS,
            KernelRole::Merge => MERGE_BINDINGS,
            KernelRole::Shade => SHADE_BINDINGS,
            KernelRole::DebugVisualize => DEBUG_VISUALIZE_BINDINGS,
        }
    }
}

/// A validated SPIR-V module.
#[derive(Debug, Clone)]
pub struct KernelBlob {
    role: KernelRole,
    code: Vec<u8>,
    version: (u32, u32),
}

impl KernelBlob {
    pub fn parse(role: KernelRole, code: Vec<u8>) -> Result<Self, KernelError> {
        if code.is_empty() || code.len() % 4 != 0 {
            return Err(KernelError::Misaligned { role, len: code.len() });
        }
        if code.len() < HEADER_WORDS * 4 {
            return Err(KernelError::Truncated { role, len: code.len() });
        }
        let word = |i: usize| u32::from_le_bytes([code[4 * i], code[4 * i + 1], code[4 * i + 2], code[4 * i + 3]]);
        let magic = word(0);
        if magic != SPIRV_MAGIC {
            return Err(KernelError::BadMagic { role, found: magic });
        }
        // Version word: 0x00MMmm00.
        let version_word = word(1);
        let version = ((version_word >> 16) & 0xff, (version_word >> 8) & 0xff);
        Ok(Self { role, code, version })
    }

    pub fn role(&self) -> KernelRole {
        self.role
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// SPIR-V (major, minor) from the module header.
    pub fn version(&self) -> (u32, u32) {
        self.version
    }
}

#[derive(Debug, Default)]
pub struct KernelLibrary {
    blobs: HashMap<KernelRole, KernelBlob>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `<dir>/<role file>` for every role.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, KernelError> {
        let dir = dir.as_ref();
        let mut library = Self::new();
        for role in KernelRole::ALL {
            let path = dir.join(role.file_name());
            let code = std::fs::read(&path).map_err(|source| KernelError::Io { path: path.clone(), source })?;
            let blob = KernelBlob::parse(role, code)?;
            log::info!(
                "loaded {} ({} bytes, SPIR-V {}.{})",
                path.display(),
                blob.code().len(),
                blob.version().0,
                blob.version().1
            );
            library.insert(blob);
        }
        Ok(library)
    }

    /// Add or replace the blob for its role.
    pub fn insert(&mut self, blob: KernelBlob) -> Option<KernelBlob> {
        self.blobs.insert(blob.role(), blob)
    }

    pub fn get(&self, role: KernelRole) -> Result<&KernelBlob, KernelError> {
        self.blobs.get(&role).ok_or(KernelError::Missing(role))
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn create_compute(&self, device: &dyn Device, role: KernelRole) -> Result<Box<dyn ComputeKernel>, RendererError> {
        if role.is_ray_tracing() {
            return Err(KernelError::WrongKind { role, requested: "compute" }.into());
        }
        let blob = self.get(role)?;
        let kernel = device.create_compute_kernel(&ComputeKernelDescriptor {
            label: Some(role.label()),
            code: blob.code(),
            entry_point: "main",
            binding_words: role.bindings().len() as u32,
        })?;
        Ok(kernel)
    }

    pub fn create_ray_tracing(
        &self,
        device: &dyn Device,
        role: KernelRole,
    ) -> Result<Box<dyn RayTracingKernel>, RendererError> {
        if !role.is_ray_tracing() {
            return Err(KernelError::WrongKind { role, requested: "ray tracing" }.into());
        }
        let blob = self.get(role)?;
        let kernel = device.create_ray_tracing_kernel(&RayTracingKernelDescriptor {
            label: Some(role.label()),
            code: blob.code(),
            raygen_entry: "raygen",
            miss_entry: "miss",
            closest_hit_entry: "closest_hit",
            binding_words: role.bindings().len() as u32,
            max_recursion_depth: 1,
        })?;
        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiance_rhi::headless::HeadlessDevice;
    use radiance_rhi::MAX_BINDING_WORDS;

    fn module(version: u32) -> Vec<u8> {
        [SPIRV_MAGIC, version, 0, 8, 0].iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn parses_header_version() {
        let blob = KernelBlob::parse(KernelRole::Merge, module(0x0001_0500)).unwrap();
        assert_eq!(blob.version(), (1, 5));
        assert_eq!(blob.code().len(), 20);
    }

    #[test]
    fn rejects_misaligned_and_foreign_blobs() {
        let mut odd = module(0x0001_0000);
        odd.push(0);
        assert!(matches!(KernelBlob::parse(KernelRole::Trace, odd), Err(KernelError::Misaligned { len: 21, .. })));
        assert!(matches!(
            KernelBlob::parse(KernelRole::Trace, vec![0; 8]),
            Err(KernelError::Truncated { len: 8, .. })
        ));
        let mut swapped = module(0x0001_0000);
        swapped[..4].copy_from_slice(&SPIRV_MAGIC.to_be_bytes());
        assert!(matches!(KernelBlob::parse(KernelRole::Trace, swapped), Err(KernelError::BadMagic { .. })));
    }

    #[test]
    fn loads_every_role_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        for role in KernelRole::ALL {
            std::fs::write(dir.path().join(role.file_name()), module(0x0001_0600)).unwrap();
        }
        let library = KernelLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 4);
        assert_eq!(library.get(KernelRole::DebugVisualize).unwrap().version(), (1, 6));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("trace.spv"), module(0x0001_0000)).unwrap();
        match KernelLibrary::load_dir(dir.path()) {
            Err(KernelError::Io { path, .. }) => assert!(path.ends_with("merge.spv")),
            other => panic!("expected an io error, got {:?}", other),
        }
    }

    #[test]
    fn kernel_kind_must_match_role() {
        let device = HeadlessDevice::new();
        let mut library = KernelLibrary::new();
        library.insert(KernelBlob::parse(KernelRole::Merge, module(0x0001_0000)).unwrap());
        assert!(library.create_compute(&device, KernelRole::Merge).is_ok());
        assert!(matches!(
            library.create_ray_tracing(&device, KernelRole::Merge),
            Err(RendererError::Kernel(KernelError::WrongKind { .. }))
        ));
        assert!(matches!(
            library.create_compute(&device, KernelRole::DebugVisualize),
            Err(RendererError::Kernel(KernelError::Missing(KernelRole::DebugVisualize)))
        ));
    }

    #[test]
    fn binding_tables_fit_push_constants() {
        for role in KernelRole::ALL {
            assert!(role.bindings().len() <= MAX_BINDING_WORDS, "{:?}", role);
        }
    }
}
