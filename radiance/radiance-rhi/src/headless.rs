//! Headless backend: records every command, simulates buffer contents and resource
//! states, and lets the caller decide when submissions complete.
//!
//! Used by tests and by the `headless_frames` debug binary. Sequencing mistakes that a
//! hardware backend would turn into undefined behaviour, such as a transition from the
//! wrong state, resetting an allocator whose work is still in flight, or freeing an
//! acceleration structure that a pending submission builds or references, are recorded in
//! [`HeadlessDevice::violations`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    AccelerationStructure, AccelerationStructureDescriptor, AccelerationStructureInputs,
    AccelerationStructureInstance, AccelerationStructureLevel, AccelerationStructureSizes, Buffer, BufferDescriptor,
    BufferMemoryPreference, CommandAllocator, CommandList, ComputeKernel, ComputeKernelDescriptor,
    Device, KernelBindings, RayTracingKernel, RayTracingKernelDescriptor, ResourceId, ResourceRef,
    ResourceState, RhiError, Texture, TextureDescriptor, TextureDimension, TextureFormat,
    ViewDescriptor, ViewKind, DEFAULT_VIEW_TABLE_CAPACITY,
};

/// One command as recorded by a [`HeadlessCommandList`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Transition { resource: ResourceId, before: ResourceState, after: ResourceState },
    UavBarrier { resource: ResourceId },
    CopyBuffer { src: ResourceId, dst: ResourceId, size: u64 },
    BuildAccelerationStructure {
        target: ResourceId,
        level: AccelerationStructureLevel,
        primitive_count: u32,
        scratch: ResourceId,
    },
    SetComputeKernel { label: Option<&'static str> },
    SetRayTracingKernel { label: Option<&'static str> },
    SetBindings(Vec<u32>),
    Dispatch([u32; 3]),
    DispatchRays([u32; 3]),
}

/// A submitted command list.
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub allocator: ResourceId,
    pub signal_value: u64,
    pub commands: Vec<RecordedCommand>,
}

type Storage = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
struct HeadlessState {
    submitted: u64,
    completed: u64,
    auto_complete: bool,
    states: HashMap<ResourceId, ResourceState>,
    views: HashMap<u32, (ResourceId, ViewKind)>,
    /// Allocator id -> signal value of the last submission recorded from it.
    allocator_stamps: HashMap<ResourceId, u64>,
    /// Device address of each live acceleration structure -> last submission that used it.
    structures: HashMap<u64, u64>,
    submissions: Vec<SubmittedBatch>,
    violations: Vec<String>,
}

impl HeadlessState {
    fn complete_through(&mut self, value: u64) {
        self.completed = self.completed.max(value.min(self.submitted));
    }
}

fn lock(state: &Mutex<HeadlessState>) -> MutexGuard<'_, HeadlessState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_storage(storage: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    storage.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HeadlessDevice {
    next_id: AtomicU64,
    view_table_capacity: u32,
    state: Arc<Mutex<HeadlessState>>,
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice").finish_non_exhaustive()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Device whose submissions complete as soon as they are made.
    pub fn new() -> Self {
        Self::with_view_table_capacity(DEFAULT_VIEW_TABLE_CAPACITY)
    }

    pub fn with_view_table_capacity(capacity: u32) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            view_table_capacity: capacity,
            state: Arc::new(Mutex::new(HeadlessState { auto_complete: true, ..Default::default() })),
        }
    }

    fn next_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// When false, submissions stay in flight until [`Self::complete_through`] or a wait.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        lock(&self.state).auto_complete = auto_complete;
    }

    /// Mark every submission up to `value` as finished.
    pub fn complete_through(&self, value: u64) {
        lock(&self.state).complete_through(value);
    }

    pub fn complete_all(&self) {
        let mut state = lock(&self.state);
        let submitted = state.submitted;
        state.complete_through(submitted);
    }

    pub fn submissions(&self) -> Vec<SubmittedBatch> {
        lock(&self.state).submissions.clone()
    }

    pub fn clear_submissions(&self) {
        lock(&self.state).submissions.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }

    /// State of a texture or buffer after all submitted transitions.
    pub fn resource_state(&self, id: ResourceId) -> Option<ResourceState> {
        lock(&self.state).states.get(&id).copied()
    }

    /// Resource and kind currently written into view slot `slot`.
    pub fn view(&self, slot: u32) -> Option<(ResourceId, ViewKind)> {
        lock(&self.state).views.get(&slot).copied()
    }

    /// Acceleration structures created and not yet dropped.
    pub fn live_acceleration_structures(&self) -> usize {
        lock(&self.state).structures.len()
    }

    /// Contents of any headless buffer, host-visible or not.
    pub fn buffer_contents(&self, buffer: &dyn Buffer) -> Option<Vec<u8>> {
        let buffer = buffer.as_any().downcast_ref::<HeadlessBuffer>()?;
        Some(lock_storage(&buffer.data).clone())
    }
}

fn headless_buffer(buffer: &dyn Buffer) -> Result<&HeadlessBuffer, RhiError> {
    buffer
        .as_any()
        .downcast_ref::<HeadlessBuffer>()
        .ok_or(RhiError::InvalidResource("buffer was not created by the headless backend"))
}

fn check_code(code: &[u8]) -> Result<(), RhiError> {
    if code.is_empty() || code.len() % 4 != 0 {
        return Err(RhiError::backend("create kernel", "SPIR-V must be non-empty and 4-byte aligned"));
    }
    Ok(())
}

impl Device for HeadlessDevice {
    fn view_table_capacity(&self) -> u32 {
        self.view_table_capacity
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Box<dyn Buffer>, RhiError> {
        Ok(Box::new(HeadlessBuffer {
            id: self.next_id(),
            size: desc.size,
            host_visible: desc.memory == BufferMemoryPreference::HostVisible,
            data: Arc::new(Mutex::new(vec![0; desc.size as usize])),
        }))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Box<dyn Texture>, RhiError> {
        let id = self.next_id();
        lock(&self.state).states.insert(id, desc.initial_state);
        Ok(Box::new(HeadlessTexture {
            id,
            format: desc.format,
            size: desc.size,
            dimension: desc.dimension,
        }))
    }

    fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        let buffer = headless_buffer(buffer)?;
        if !buffer.host_visible {
            return Err(RhiError::InvalidResource("write_buffer on a device-local buffer"));
        }
        let mut storage = lock_storage(&buffer.data);
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            return Err(RhiError::InvalidResource("write_buffer out of bounds"));
        }
        storage[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &dyn Buffer, offset: u64, out: &mut [u8]) -> Result<(), RhiError> {
        let buffer = headless_buffer(buffer)?;
        let storage = lock_storage(&buffer.data);
        let start = offset as usize;
        let end = start + out.len();
        if end > storage.len() {
            return Err(RhiError::InvalidResource("read_buffer out of bounds"));
        }
        out.copy_from_slice(&storage[start..end]);
        Ok(())
    }

    fn write_view(&self, slot: u32, resource: ResourceRef<'_>, desc: &ViewDescriptor) -> Result<(), RhiError> {
        if slot >= self.view_table_capacity {
            return Err(RhiError::ViewTableFull { capacity: self.view_table_capacity });
        }
        let valid = matches!(
            (resource, desc.kind),
            (ResourceRef::AccelerationStructure(_), ViewKind::AccelerationStructure)
                | (ResourceRef::Buffer(_), ViewKind::ReadOnly | ViewKind::ReadWrite)
                | (ResourceRef::Texture(_), ViewKind::ReadOnly | ViewKind::ReadWrite)
        );
        if !valid {
            return Err(RhiError::InvalidResource("view kind does not match resource type"));
        }
        lock(&self.state).views.insert(slot, (resource.id(), desc.kind));
        Ok(())
    }

    fn create_command_allocator(&self) -> Result<Box<dyn CommandAllocator>, RhiError> {
        Ok(Box::new(HeadlessCommandAllocator {
            id: self.next_id(),
            state: Arc::clone(&self.state),
        }))
    }

    fn submit(&self, list: Box<dyn CommandList>, signal_value: u64) -> Result<(), RhiError> {
        let list = list
            .as_any()
            .downcast_ref::<HeadlessCommandList>()
            .ok_or(RhiError::InvalidResource("command list was not created by the headless backend"))?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if signal_value <= state.submitted {
            state
                .violations
                .push(format!("signal value {} is not greater than {}", signal_value, state.submitted));
        }
        for command in &list.commands {
            if let RecordedCommand::Transition { resource, before, after } = command {
                let current = state.states.get(resource).copied().unwrap_or(*before);
                if current != *before {
                    state.violations.push(format!(
                        "resource {} transitioned from {:?} but is in {:?}",
                        resource, before, current
                    ));
                }
                state.states.insert(*resource, *after);
            }
        }
        for address in &list.structure_uses {
            match state.structures.get_mut(address) {
                Some(last_use) => *last_use = signal_value,
                None => state.violations.push(format!(
                    "submission {} uses freed acceleration structure {:#x}",
                    signal_value, address
                )),
            }
        }
        for copy in &list.copies {
            let data = lock_storage(&copy.src)[copy.src_offset..copy.src_offset + copy.size].to_vec();
            let mut dst = lock_storage(&copy.dst);
            dst[copy.dst_offset..copy.dst_offset + copy.size].copy_from_slice(&data);
        }
        state.submitted = signal_value;
        state.allocator_stamps.insert(list.allocator, signal_value);
        if state.auto_complete {
            state.completed = signal_value;
        }
        state.submissions.push(SubmittedBatch {
            allocator: list.allocator,
            signal_value,
            commands: list.commands.clone(),
        });
        Ok(())
    }

    fn completed_value(&self) -> Result<u64, RhiError> {
        Ok(lock(&self.state).completed)
    }

    fn wait_for_value(&self, value: u64) -> Result<(), RhiError> {
        let mut state = lock(&self.state);
        if value > state.submitted {
            // Nothing will ever signal this value.
            return Err(RhiError::DeviceLost);
        }
        state.complete_through(value);
        Ok(())
    }

    fn create_compute_kernel(&self, desc: &ComputeKernelDescriptor<'_>) -> Result<Box<dyn ComputeKernel>, RhiError> {
        check_code(desc.code)?;
        Ok(Box::new(HeadlessKernel { label: desc.label }))
    }

    fn create_ray_tracing_kernel(
        &self,
        desc: &RayTracingKernelDescriptor<'_>,
    ) -> Result<Box<dyn RayTracingKernel>, RhiError> {
        check_code(desc.code)?;
        Ok(Box::new(HeadlessKernel { label: desc.label }))
    }

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs<'_>,
    ) -> Result<AccelerationStructureSizes, RhiError> {
        let sizes = match inputs {
            AccelerationStructureInputs::Triangles(g) if g.vertex_count == 0 || g.index_count < 3 => {
                AccelerationStructureSizes::default()
            }
            AccelerationStructureInputs::Triangles(g) => {
                let triangles = (g.index_count / 3) as u64;
                AccelerationStructureSizes { structure_size: 256 + 64 * triangles, scratch_size: 128 + 32 * triangles }
            }
            AccelerationStructureInputs::Instances { count: 0, .. } => AccelerationStructureSizes::default(),
            AccelerationStructureInputs::Instances { count, .. } => {
                let count = *count as u64;
                AccelerationStructureSizes { structure_size: 256 + 128 * count, scratch_size: 256 + 64 * count }
            }
        };
        Ok(sizes)
    }

    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDescriptor,
    ) -> Result<Box<dyn AccelerationStructure>, RhiError> {
        let id = self.next_id();
        let address = 0x1000_0000 + id * 0x1_0000;
        lock(&self.state).structures.insert(address, 0);
        Ok(Box::new(HeadlessAccelerationStructure {
            id,
            level: desc.level,
            size: desc.size,
            address,
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct HeadlessBuffer {
    id: ResourceId,
    size: u64,
    host_visible: bool,
    data: Storage,
}

impl std::fmt::Debug for HeadlessBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

impl Buffer for HeadlessBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn host_visible(&self) -> bool {
        self.host_visible
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct HeadlessTexture {
    id: ResourceId,
    format: TextureFormat,
    size: (u32, u32, u32),
    dimension: TextureDimension,
}

impl Texture for HeadlessTexture {
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
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct HeadlessAccelerationStructure {
    id: ResourceId,
    level: AccelerationStructureLevel,
    size: u64,
    address: u64,
    state: Arc<Mutex<HeadlessState>>,
}

impl std::fmt::Debug for HeadlessAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessAccelerationStructure")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

impl Drop for HeadlessAccelerationStructure {
    fn drop(&mut self) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(last_use) = state.structures.remove(&self.address) {
            if last_use > state.completed {
                state.violations.push(format!(
                    "acceleration structure {:#x} freed while submission {} is in flight (completed {})",
                    self.address, last_use, state.completed
                ));
            }
        }
    }
}

impl AccelerationStructure for HeadlessAccelerationStructure {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn level(&self) -> AccelerationStructureLevel {
        self.level
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn device_address(&self) -> u64 {
        self.address
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct HeadlessKernel {
    label: Option<&'static str>,
}

impl ComputeKernel for HeadlessKernel {
    fn label(&self) -> Option<&'static str> {
        self.label
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RayTracingKernel for HeadlessKernel {
    fn label(&self) -> Option<&'static str> {
        self.label
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct HeadlessCommandAllocator {
    id: ResourceId,
    state: Arc<Mutex<HeadlessState>>,
}

impl std::fmt::Debug for HeadlessCommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessCommandAllocator").field("id", &self.id).finish()
    }
}

impl CommandAllocator for HeadlessCommandAllocator {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn begin(&mut self) -> Result<Box<dyn CommandList>, RhiError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(&stamp) = state.allocator_stamps.get(&self.id) {
            if stamp > state.completed {
                state.violations.push(format!(
                    "allocator {} reset while submission {} is in flight (completed {})",
                    self.id, stamp, state.completed
                ));
            }
        }
        Ok(Box::new(HeadlessCommandList {
            allocator: self.id,
            commands: Vec::new(),
            copies: Vec::new(),
            structure_uses: Vec::new(),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct PendingCopy {
    src: Storage,
    src_offset: usize,
    dst: Storage,
    dst_offset: usize,
    size: usize,
}

pub struct HeadlessCommandList {
    allocator: ResourceId,
    commands: Vec<RecordedCommand>,
    copies: Vec<PendingCopy>,
    /// Addresses of acceleration structures built or referenced by top-level builds.
    structure_uses: Vec<u64>,
}

impl std::fmt::Debug for HeadlessCommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessCommandList")
            .field("allocator", &self.allocator)
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl HeadlessCommandList {
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }
}

impl CommandList for HeadlessCommandList {
    fn transition(&mut self, resource: ResourceRef<'_>, before: ResourceState, after: ResourceState) {
        self.commands.push(RecordedCommand::Transition { resource: resource.id(), before, after });
    }

    fn uav_barrier(&mut self, resource: ResourceRef<'_>) {
        self.commands.push(RecordedCommand::UavBarrier { resource: resource.id() });
    }

    fn copy_buffer(&mut self, src: &dyn Buffer, src_offset: u64, dst: &dyn Buffer, dst_offset: u64, size: u64) {
        let (src_buf, dst_buf) = match (headless_buffer(src), headless_buffer(dst)) {
            (Ok(s), Ok(d)) => (s, d),
            _ => panic!("copy_buffer operands must be headless buffers"),
        };
        assert!(src_offset + size <= src.size() && dst_offset + size <= dst.size(), "copy_buffer out of bounds");
        self.copies.push(PendingCopy {
            src: Arc::clone(&src_buf.data),
            src_offset: src_offset as usize,
            dst: Arc::clone(&dst_buf.data),
            dst_offset: dst_offset as usize,
            size: size as usize,
        });
        self.commands.push(RecordedCommand::CopyBuffer { src: src.id(), dst: dst.id(), size });
    }

    fn build_acceleration_structure(
        &mut self,
        target: &dyn AccelerationStructure,
        inputs: &AccelerationStructureInputs<'_>,
        scratch: &dyn Buffer,
    ) {
        debug_assert_eq!(target.level(), inputs.level());
        self.structure_uses.push(target.device_address());
        if let AccelerationStructureInputs::Instances { instances, count } = inputs {
            // Descriptors are host-written before the build is recorded.
            if let Some(buffer) = instances.as_any().downcast_ref::<HeadlessBuffer>() {
                let data = lock_storage(&buffer.data);
                let descriptors: Vec<AccelerationStructureInstance> = data
                    .chunks_exact(std::mem::size_of::<AccelerationStructureInstance>())
                    .take(*count as usize)
                    .map(bytemuck::pod_read_unaligned)
                    .collect();
                // A null reference marks an inactive instance.
                self.structure_uses.extend(
                    descriptors
                        .iter()
                        .map(|d| d.acceleration_structure_reference)
                        .filter(|&address| address != 0),
                );
            }
        }
        self.commands.push(RecordedCommand::BuildAccelerationStructure {
            target: target.id(),
            level: inputs.level(),
            primitive_count: inputs.primitive_count(),
            scratch: scratch.id(),
        });
    }

    fn set_compute_kernel(&mut self, kernel: &dyn ComputeKernel) {
        self.commands.push(RecordedCommand::SetComputeKernel { label: kernel.label() });
    }

    fn set_ray_tracing_kernel(&mut self, kernel: &dyn RayTracingKernel) {
        self.commands.push(RecordedCommand::SetRayTracingKernel { label: kernel.label() });
    }

    fn set_bindings(&mut self, bindings: &KernelBindings) {
        self.commands.push(RecordedCommand::SetBindings(bindings.words().to_vec()));
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(RecordedCommand::Dispatch([x, y, z]));
    }

    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) {
        self.commands.push(RecordedCommand::DispatchRays([width, height, depth]));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
