//! GPU resource and command manager.
//!
//! [`GpuContext`] owns the device handle, the view-table bookkeeping, the submission
//! counter and the command-allocator pool. Allocators, released view slots and
//! retired resources are reclaimed only once the device reports that the submission
//! they were stamped with is complete.

use std::any::Any;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::{
    BindingSlot, BindingValue, Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage,
    CommandAllocator, CommandList, Device, KernelBindings, ResourceId, ResourceRef, RhiError,
    SlotKind, Texture, TextureDescriptor, ViewDescriptor, ViewHandle, ViewKind, ViewTable,
};

/// A command list being recorded, together with the allocator backing it.
/// Consumed by [`GpuContext::submit`]; dereferences to the list for recording.
#[derive(Debug)]
pub struct CommandBatch {
    list: Box<dyn CommandList>,
    allocator: Box<dyn CommandAllocator>,
}

impl CommandBatch {
    pub fn allocator_id(&self) -> ResourceId {
        self.allocator.id()
    }
}

impl Deref for CommandBatch {
    type Target = dyn CommandList;

    fn deref(&self) -> &Self::Target {
        self.list.as_ref()
    }
}

impl DerefMut for CommandBatch {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.list.as_mut()
    }
}

struct PendingAllocator {
    allocator: Box<dyn CommandAllocator>,
    submission: u64,
}

struct Retired {
    _resource: Box<dyn Any + Send>,
    submission: u64,
}

pub struct GpuContext {
    device: Arc<dyn Device>,
    views: ViewTable,
    free_allocators: Vec<Box<dyn CommandAllocator>>,
    pending_allocators: VecDeque<PendingAllocator>,
    retired: VecDeque<Retired>,
    /// Stamp of the most recent submission.
    submission: u64,
    /// Last completed value observed from the device.
    completed: u64,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("submission", &self.submission)
            .field("completed", &self.completed)
            .field("free_allocators", &self.free_allocators.len())
            .field("pending_allocators", &self.pending_allocators.len())
            .finish_non_exhaustive()
    }
}

impl GpuContext {
    pub fn new(device: Arc<dyn Device>) -> Self {
        let capacity = device.view_table_capacity();
        log::info!("gpu context created (view table capacity {})", capacity);
        Self {
            device,
            views: ViewTable::new(capacity),
            free_allocators: Vec::new(),
            pending_allocators: VecDeque::new(),
            retired: VecDeque::new(),
            submission: 0,
            completed: 0,
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn views(&self) -> &ViewTable {
        &self.views
    }

    /// Stamp of the most recent submission (0 before the first one).
    pub fn submission_counter(&self) -> u64 {
        self.submission
    }

    /// Stamp the batch currently being recorded will receive.
    pub fn next_submission(&self) -> u64 {
        self.submission + 1
    }

    /// Last completed submission observed by the manager.
    pub fn completed_submission(&self) -> u64 {
        self.completed
    }

    pub fn free_allocator_count(&self) -> usize {
        self.free_allocators.len()
    }

    pub fn pending_allocator_count(&self) -> usize {
        self.pending_allocators.len()
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Box<dyn Buffer>, RhiError> {
        log::debug!(
            "create buffer {:?}: {} bytes, {:?}, {:?}",
            desc.label,
            desc.size,
            desc.usage,
            desc.memory
        );
        self.device.create_buffer(desc)
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> Result<Box<dyn Texture>, RhiError> {
        log::debug!(
            "create texture {:?}: {:?} {:?} {:?}",
            desc.label,
            desc.size,
            desc.format,
            desc.dimension
        );
        self.device.create_texture(desc)
    }

    /// Describe `resource` in the view table. With `existing`, that slot is rewritten in
    /// place; otherwise a slot is taken from the free-list or bump-allocated.
    pub fn create_view(
        &mut self,
        resource: ResourceRef<'_>,
        desc: &ViewDescriptor,
        existing: Option<ViewHandle>,
    ) -> Result<ViewHandle, RhiError> {
        let handle = match existing {
            Some(handle) => {
                self.views.rewrite(handle, desc.kind);
                handle
            }
            None => self.views.allocate(desc.kind)?,
        };
        self.device.write_view(handle.index(), resource, desc)?;
        Ok(handle)
    }

    /// Return a view slot to the free-list once the batch being recorded has completed.
    pub fn release_view(&mut self, handle: ViewHandle) {
        let after = self.next_submission();
        log::debug!("view slot {} released until submission {}", handle.index(), after);
        self.views.release(handle, after);
    }

    /// Keep `resource` alive until the batch being recorded has completed.
    pub fn retire<T: Any + Send>(&mut self, resource: T) {
        self.retired.push_back(Retired {
            _resource: Box::new(resource),
            submission: self.next_submission(),
        });
    }

    /// Write into a host-visible buffer. The caller guarantees no in-flight work reads the range.
    pub fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        self.device.write_buffer(buffer, offset, data)
    }

    /// Upload into any buffer. Device-local buffers go through a staging copy; the call
    /// blocks until the GPU is idle so the staging buffer can be freed.
    pub fn upload_buffer(&mut self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        if buffer.host_visible() {
            return self.device.write_buffer(buffer, offset, data);
        }
        let staging = self.create_buffer(&BufferDescriptor {
            label: Some("upload staging"),
            size: data.len() as u64,
            usage: BufferUsage::COPY_SRC,
            memory: BufferMemoryPreference::HostVisible,
        })?;
        self.device.write_buffer(staging.as_ref(), 0, data)?;
        let mut batch = self.begin_commands()?;
        batch.copy_buffer(staging.as_ref(), 0, buffer, offset, data.len() as u64);
        self.submit(batch)?;
        self.wait_idle()
    }

    /// Acquire a free allocator (or create one) and open a command list on it.
    pub fn begin_commands(&mut self) -> Result<CommandBatch, RhiError> {
        let mut allocator = match self.free_allocators.pop() {
            Some(allocator) => allocator,
            None => {
                let allocator = self.device.create_command_allocator()?;
                log::debug!("created command allocator {}", allocator.id());
                allocator
            }
        };
        let list = allocator.begin()?;
        Ok(CommandBatch { list, allocator })
    }

    /// Close and submit `batch`. Returns the stamp it was submitted with, then reclaims
    /// everything the device already reports complete.
    pub fn submit(&mut self, batch: CommandBatch) -> Result<u64, RhiError> {
        let CommandBatch { list, allocator } = batch;
        let stamp = self.submission + 1;
        self.device.submit(list, stamp)?;
        self.submission = stamp;
        log::debug!("submitted batch {} on allocator {}", stamp, allocator.id());
        self.pending_allocators.push_back(PendingAllocator { allocator, submission: stamp });
        self.poll()?;
        Ok(stamp)
    }

    /// Query the device's completed value and reclaim everything up to it.
    pub fn poll(&mut self) -> Result<u64, RhiError> {
        let completed = self.device.completed_value()?;
        self.reclaim(completed);
        Ok(completed)
    }

    /// Block until submission `stamp` is complete. Stamps that were never submitted
    /// (including 0) return immediately.
    pub fn wait_for(&mut self, stamp: u64) -> Result<(), RhiError> {
        debug_assert!(stamp <= self.submission, "waiting on unsubmitted batch {}", stamp);
        if stamp == 0 || stamp <= self.completed {
            return Ok(());
        }
        self.device.wait_for_value(stamp.min(self.submission))?;
        self.poll()?;
        Ok(())
    }

    /// Block until the most recent submission is complete.
    pub fn wait_idle(&mut self) -> Result<(), RhiError> {
        self.wait_for(self.submission)
    }

    /// Check `values` against `layout` and the view table, and encode them for a dispatch.
    pub fn encode_bindings(&self, layout: &[BindingSlot], values: &[BindingValue]) -> KernelBindings {
        for (slot, value) in layout.iter().zip(values) {
            if let (SlotKind::View(expected), BindingValue::View(handle)) = (slot.kind, value) {
                debug_assert_eq!(
                    self.views.kind(*handle),
                    Some(expected),
                    "slot '{}' bound to view {} of the wrong kind",
                    slot.name,
                    handle.index()
                );
            }
        }
        KernelBindings::encode(layout, values)
    }

    pub fn view_kind(&self, handle: ViewHandle) -> Option<ViewKind> {
        self.views.kind(handle)
    }

    fn reclaim(&mut self, completed: u64) {
        debug_assert!(completed >= self.completed, "completed value went backwards");
        self.completed = self.completed.max(completed);
        while let Some(front) = self.pending_allocators.front() {
            if front.submission > self.completed {
                break;
            }
            if let Some(entry) = self.pending_allocators.pop_front() {
                self.free_allocators.push(entry.allocator);
            }
        }
        while let Some(front) = self.retired.front() {
            if front.submission > self.completed {
                break;
            }
            self.retired.pop_front();
        }
        let views = self.views.reclaim(self.completed);
        if views > 0 {
            log::debug!("reclaimed {} view slots at submission {}", views, self.completed);
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::warn!("gpu context dropped while work was pending: {}", e);
        }
    }
}
