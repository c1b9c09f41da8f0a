//! Radiance RHI: backend-agnostic GPU interface for the radiance-cascade core.
//! This crate defines the device traits, the resource/command manager ([`GpuContext`])
//! and the bindless view-table arena. Backends: Vulkan (feature `vulkan`) and [`headless`].

use std::any::Any;
use std::fmt::Debug;

mod context;
mod error;
pub mod headless;
mod view_table;

pub use context::{CommandBatch, GpuContext};
pub use error::RhiError;
pub use view_table::ViewTable;

/// Unique identifier for a GPU resource.
pub type ResourceId = u64;

/// Default number of slots in the GPU-visible view table.
pub const DEFAULT_VIEW_TABLE_CAPACITY: u32 = 65536;

/// Maximum number of 32-bit binding words a kernel can receive per dispatch.
pub const MAX_BINDING_WORDS: usize = 16;

bitflags::bitflags! {
    /// Buffer usage flags; combine for buffers used in multiple ways (e.g. STORAGE | COPY_DST).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        /// Read by acceleration structure builds (vertices, indices, instance descriptors).
        const ACCELERATION_STRUCTURE_INPUT = 1 << 4;
        /// Backing storage of an acceleration structure.
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 5;
        /// Scratch memory for acceleration structure builds.
        const SCRATCH = 1 << 6;
        const SHADER_BINDING_TABLE = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    Rgba16Float,
    Rgba32Float,
}

impl TextureFormat {
    /// Size of one texel in bytes.
    pub fn texel_size(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Texture dimension / type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureDimension {
    #[default]
    D2,
    D2Array,
    D3,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
    }
}

/// Usage state of a memory object. Every operation expects its operands in a specific
/// state; moving between states is always an explicit [`CommandList::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    #[default]
    Common,
    /// Readable from any kernel (sampled / read-only storage).
    ShaderRead,
    /// Read-write target of a kernel.
    UnorderedAccess,
    CopySrc,
    CopyDst,
}

/// When true, buffer is mappable (host-visible) and write_buffer can be used. When false, device-local only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMemoryPreference {
    #[default]
    HostVisible,
    DeviceLocal,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<&'static str>,
    pub size: u64,
    pub usage: BufferUsage,
    /// HostVisible: mappable, write_buffer works. DeviceLocal: faster GPU access, write via staging copy.
    pub memory: BufferMemoryPreference,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: 0,
            usage: BufferUsage::STORAGE,
            memory: BufferMemoryPreference::HostVisible,
        }
    }
}

pub trait Buffer: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    fn size(&self) -> u64;
    /// If true, Device::write_buffer can be used. If false, buffer is device-local; upload via staging copy.
    fn host_visible(&self) -> bool {
        true
    }
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<&'static str>,
    /// (width, height, depth_or_layers). For 2D: depth=1. For 2DArray: depth=array_layers. For 3D: depth=depth.
    pub size: (u32, u32, u32),
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub dimension: TextureDimension,
    /// State the texture is in when creation returns.
    pub initial_state: ResourceState,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: (1, 1, 1),
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::empty(),
            dimension: TextureDimension::D2,
            initial_state: ResourceState::Common,
        }
    }
}

pub trait Texture: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    fn format(&self) -> TextureFormat;
    fn size(&self) -> (u32, u32, u32);
    fn dimension(&self) -> TextureDimension;
    fn as_any(&self) -> &dyn Any;
}

/// Borrowed reference to any memory object, used for views and state transitions.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Buffer(&'a dyn Buffer),
    Texture(&'a dyn Texture),
    AccelerationStructure(&'a dyn AccelerationStructure),
}

impl ResourceRef<'_> {
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceRef::Buffer(b) => b.id(),
            ResourceRef::Texture(t) => t.id(),
            ResourceRef::AccelerationStructure(a) => a.id(),
        }
    }
}

/// How a GPU program interprets the memory object behind a view-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ReadOnly,
    ReadWrite,
    AccelerationStructure,
}

/// Sub-range of a memory object covered by a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewRange {
    #[default]
    Whole,
    /// Array layers of a texture.
    Layers { first: u32, count: u32 },
    /// Structured elements of a buffer.
    Elements { first: u64, count: u64, stride: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDescriptor {
    pub kind: ViewKind,
    pub range: ViewRange,
}

impl ViewDescriptor {
    pub fn read_only() -> Self {
        Self { kind: ViewKind::ReadOnly, range: ViewRange::Whole }
    }

    pub fn read_write() -> Self {
        Self { kind: ViewKind::ReadWrite, range: ViewRange::Whole }
    }

    pub fn acceleration_structure() -> Self {
        Self { kind: ViewKind::AccelerationStructure, range: ViewRange::Whole }
    }

    /// Structured-buffer view over `count` elements of `stride` bytes.
    pub fn structured(kind: ViewKind, stride: u32, count: u64) -> Self {
        Self { kind, range: ViewRange::Elements { first: 0, count, stride } }
    }
}

/// Stable index of a slot in the GPU-visible view table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewHandle(u32);

impl ViewHandle {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Kind of value a kernel expects in one binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Plain 32-bit constant (e.g. a cascade level index).
    Immediate,
    /// Index of a view-table slot of the given kind.
    View(ViewKind),
}

/// One entry of a kernel's declarative binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    pub name: &'static str,
    pub kind: SlotKind,
}

impl BindingSlot {
    pub const fn immediate(name: &'static str) -> Self {
        Self { name, kind: SlotKind::Immediate }
    }

    pub const fn view(name: &'static str, kind: ViewKind) -> Self {
        Self { name, kind: SlotKind::View(kind) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingValue {
    View(ViewHandle),
    Immediate(u32),
}

/// Binding words pushed to a kernel before a dispatch. Word `i` corresponds to slot `i`
/// of the kernel's binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBindings {
    words: [u32; MAX_BINDING_WORDS],
    len: usize,
}

impl KernelBindings {
    /// Encode `values` against `layout`. Slot count and slot kinds must match the layout.
    pub fn encode(layout: &[BindingSlot], values: &[BindingValue]) -> Self {
        debug_assert!(layout.len() <= MAX_BINDING_WORDS, "binding table too large");
        debug_assert_eq!(layout.len(), values.len(), "binding count does not match kernel layout");
        let mut words = [0u32; MAX_BINDING_WORDS];
        for (i, (slot, value)) in layout.iter().zip(values).enumerate() {
            words[i] = match (slot.kind, value) {
                (SlotKind::Immediate, BindingValue::Immediate(v)) => *v,
                (SlotKind::View(_), BindingValue::View(h)) => h.index(),
                (_, BindingValue::Immediate(v)) => {
                    debug_assert!(false, "slot '{}' expects a view", slot.name);
                    *v
                }
                (_, BindingValue::View(h)) => {
                    debug_assert!(false, "slot '{}' expects an immediate", slot.name);
                    h.index()
                }
            };
        }
        Self { words, len: layout.len().min(values.len()) }
    }

    pub fn words(&self) -> &[u32] {
        &self.words[..self.len]
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.words())
    }
}

#[derive(Debug, Clone)]
pub struct ComputeKernelDescriptor<'a> {
    pub label: Option<&'static str>,
    /// SPIR-V binary (little-endian, 4-byte aligned).
    pub code: &'a [u8],
    pub entry_point: &'a str,
    pub binding_words: u32,
}

#[derive(Debug, Clone)]
pub struct RayTracingKernelDescriptor<'a> {
    pub label: Option<&'static str>,
    /// SPIR-V binary holding the ray generation, miss and closest-hit entry points.
    pub code: &'a [u8],
    pub raygen_entry: &'a str,
    pub miss_entry: &'a str,
    pub closest_hit_entry: &'a str,
    pub binding_words: u32,
    pub max_recursion_depth: u32,
}

pub trait ComputeKernel: Send + Sync + Debug {
    fn label(&self) -> Option<&'static str>;
    fn as_any(&self) -> &dyn Any;
}

pub trait RayTracingKernel: Send + Sync + Debug {
    fn label(&self) -> Option<&'static str>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

/// Triangle mesh input: float3 positions and u32 indices.
#[derive(Debug, Clone, Copy)]
pub struct TriangleGeometry<'a> {
    pub vertices: &'a dyn Buffer,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub indices: &'a dyn Buffer,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum AccelerationStructureInputs<'a> {
    Triangles(TriangleGeometry<'a>),
    /// Buffer of tightly packed [`AccelerationStructureInstance`]s.
    Instances { instances: &'a dyn Buffer, count: u32 },
}

impl AccelerationStructureInputs<'_> {
    pub fn level(&self) -> AccelerationStructureLevel {
        match self {
            AccelerationStructureInputs::Triangles(_) => AccelerationStructureLevel::Bottom,
            AccelerationStructureInputs::Instances { .. } => AccelerationStructureLevel::Top,
        }
    }

    /// Triangles for bottom-level inputs, instances for top-level inputs.
    pub fn primitive_count(&self) -> u32 {
        match self {
            AccelerationStructureInputs::Triangles(g) => g.index_count / 3,
            AccelerationStructureInputs::Instances { count, .. } => *count,
        }
    }
}

/// Device-reported memory requirements for one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    pub structure_size: u64,
    pub scratch_size: u64,
}

#[derive(Debug, Clone)]
pub struct AccelerationStructureDescriptor {
    pub label: Option<&'static str>,
    pub level: AccelerationStructureLevel,
    pub size: u64,
}

pub trait AccelerationStructure: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    fn level(&self) -> AccelerationStructureLevel;
    fn size(&self) -> u64;
    /// GPU address referenced by top-level instance descriptors.
    fn device_address(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

/// One top-level instance descriptor in the hardware layout (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AccelerationStructureInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Bits 0..24: custom index, bits 24..32: visibility mask.
    pub custom_index_and_mask: u32,
    /// Bits 0..24: hit-group offset, bits 24..32: instance flags.
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl AccelerationStructureInstance {
    pub const FLAG_TRIANGLE_CULL_DISABLE: u8 = 0x1;

    pub fn new(transform: [f32; 12], custom_index: u32, mask: u8, flags: u8, bottom_level_address: u64) -> Self {
        Self {
            transform,
            custom_index_and_mask: (custom_index & 0x00ff_ffff) | ((mask as u32) << 24),
            sbt_offset_and_flags: (flags as u32) << 24,
            acceleration_structure_reference: bottom_level_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn flags(&self) -> u8 {
        (self.sbt_offset_and_flags >> 24) as u8
    }
}

/// The core device trait that all backends must implement.
///
/// Submissions are ordered by a caller-supplied, strictly increasing signal value;
/// [`Device::completed_value`] reports the highest value the GPU has finished.
pub trait Device: Send + Sync + Debug {
    /// Number of slots in the bindless view table.
    fn view_table_capacity(&self) -> u32;

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Box<dyn Buffer>, RhiError>;
    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Box<dyn Texture>, RhiError>;

    /// Write data into a buffer (CPU to GPU). Buffer must be host-visible.
    fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> Result<(), RhiError>;
    /// Read data back from a host-visible buffer.
    fn read_buffer(&self, buffer: &dyn Buffer, offset: u64, out: &mut [u8]) -> Result<(), RhiError>;

    /// Point view-table slot `slot` at `resource`. The slot must not be read by in-flight work.
    fn write_view(&self, slot: u32, resource: ResourceRef<'_>, desc: &ViewDescriptor) -> Result<(), RhiError>;

    fn create_command_allocator(&self) -> Result<Box<dyn CommandAllocator>, RhiError>;

    /// Close `list` and enqueue it on the single queue; the GPU signals `signal_value` when done.
    fn submit(&self, list: Box<dyn CommandList>, signal_value: u64) -> Result<(), RhiError>;
    /// Highest signal value the GPU has certified complete.
    fn completed_value(&self) -> Result<u64, RhiError>;
    /// Block until `value` is complete. No timeout.
    fn wait_for_value(&self, value: u64) -> Result<(), RhiError>;

    fn create_compute_kernel(&self, desc: &ComputeKernelDescriptor<'_>) -> Result<Box<dyn ComputeKernel>, RhiError>;
    fn create_ray_tracing_kernel(
        &self,
        desc: &RayTracingKernelDescriptor<'_>,
    ) -> Result<Box<dyn RayTracingKernel>, RhiError>;

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs<'_>,
    ) -> Result<AccelerationStructureSizes, RhiError>;
    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDescriptor,
    ) -> Result<Box<dyn AccelerationStructure>, RhiError>;
}

/// Storage backing command recording. One allocator records one list at a time.
pub trait CommandAllocator: Send + Debug {
    fn id(&self) -> ResourceId;
    /// Reset the backing storage and open a new command list. Work previously recorded
    /// from this allocator must be complete.
    fn begin(&mut self) -> Result<Box<dyn CommandList>, RhiError>;
    fn as_any(&self) -> &dyn Any;
}

/// Open command list. All recording methods are infallible; passing resources created by
/// another backend is a programmer error.
pub trait CommandList: Send + Debug {
    fn transition(&mut self, resource: ResourceRef<'_>, before: ResourceState, after: ResourceState);
    /// Order read-write accesses to a resource that stays in [`ResourceState::UnorderedAccess`].
    fn uav_barrier(&mut self, resource: ResourceRef<'_>);
    fn copy_buffer(&mut self, src: &dyn Buffer, src_offset: u64, dst: &dyn Buffer, dst_offset: u64, size: u64);
    fn build_acceleration_structure(
        &mut self,
        target: &dyn AccelerationStructure,
        inputs: &AccelerationStructureInputs<'_>,
        scratch: &dyn Buffer,
    );
    fn set_compute_kernel(&mut self, kernel: &dyn ComputeKernel);
    fn set_ray_tracing_kernel(&mut self, kernel: &dyn RayTracingKernel);
    /// Push binding words for the currently bound kernel.
    fn set_bindings(&mut self, bindings: &KernelBindings);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32);
    fn as_any(&self) -> &dyn Any;
}

/// Parameters for [`create_device`].
#[derive(Debug, Clone)]
pub struct DeviceCreateParams {
    pub application_name: &'static str,
    /// Enable validation layers. Defaults to the `validation` feature or `RADIANCE_VALIDATION=1`.
    pub validation: bool,
    pub view_table_capacity: u32,
}

impl Default for DeviceCreateParams {
    fn default() -> Self {
        let env_validation = std::env::var("RADIANCE_VALIDATION").map(|v| v == "1").unwrap_or(false);
        Self {
            application_name: "Radiance",
            validation: cfg!(feature = "validation") || env_validation,
            view_table_capacity: DEFAULT_VIEW_TABLE_CAPACITY,
        }
    }
}

/// Create the default hardware device.
#[cfg(feature = "vulkan")]
pub fn create_device(params: DeviceCreateParams) -> Result<std::sync::Arc<dyn Device>, RhiError> {
    let device: std::sync::Arc<dyn Device> = VulkanDevice::new(&params)?;
    Ok(device)
}

#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(feature = "vulkan")]
pub use vulkan::VulkanDevice;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_descriptor_is_64_bytes() {
        assert_eq!(std::mem::size_of::<AccelerationStructureInstance>(), 64);
    }

    #[test]
    fn instance_descriptor_packs_index_mask_and_flags() {
        let inst = AccelerationStructureInstance::new(
            [0.0; 12],
            7,
            0xff,
            AccelerationStructureInstance::FLAG_TRIANGLE_CULL_DISABLE,
            0xdead_0000,
        );
        assert_eq!(inst.custom_index(), 7);
        assert_eq!(inst.mask(), 0xff);
        assert_eq!(inst.flags(), AccelerationStructureInstance::FLAG_TRIANGLE_CULL_DISABLE);
        assert_eq!(inst.acceleration_structure_reference, 0xdead_0000);
    }

    #[test]
    fn bindings_encode_in_slot_order() {
        const LAYOUT: &[BindingSlot] = &[
            BindingSlot::immediate("level"),
            BindingSlot::view("source", ViewKind::ReadOnly),
            BindingSlot::view("target", ViewKind::ReadWrite),
        ];
        let bindings = KernelBindings::encode(
            LAYOUT,
            &[
                BindingValue::Immediate(3),
                BindingValue::View(ViewHandle(10)),
                BindingValue::View(ViewHandle(11)),
            ],
        );
        assert_eq!(bindings.words(), &[3, 10, 11]);
        assert_eq!(bindings.as_bytes().len(), 12);
    }
}
