//! Scene instance store.
//!
//! Instances live in a CPU array mirrored to a GPU-resident structured buffer through
//! host-visible staging buffers, next to a parallel array of top-level build descriptors.
//! Ids are dense and stable; instances cannot be removed.
//!
//! The scene holds a reference to every model its instances use, so a model's bottom-level
//! index lives at least as long as the scene. Hand a rendered scene back with
//! [`Scene::retire`] (or call `Renderer::finish` first) so its GPU objects outlive the
//! submissions that read them.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use radiance_rhi::{
    AccelerationStructureInstance, Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, CommandBatch,
    GpuContext, ResourceRef, RhiError, ViewDescriptor, ViewHandle, ViewKind,
};

use crate::accel::{AccelerationStructureBuilder, TopLevelIndex};
use crate::error::SceneError;
use crate::model::Model;

pub const MAX_INSTANCES: usize = 65536;

/// Upload slots of a scene created with [`Scene::new`].
pub const DEFAULT_UPLOAD_SLOTS: usize = 2;

/// Per-instance data read by the trace and shade kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    /// Column-major object-to-world matrix.
    pub transform: [f32; 16],
    pub albedo: [f32; 4],
    pub emission: [f32; 4],
}

const INSTANCE_STRIDE: u64 = std::mem::size_of::<InstanceData>() as u64;
const DESCRIPTOR_STRIDE: u64 = std::mem::size_of::<AccelerationStructureInstance>() as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// What `Scene::update` recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Instance data was copied to the GPU-resident array.
    pub copied: bool,
    /// The top-level index was rebuilt.
    pub rebuilt: bool,
}

/// Column-major 4x4 to the row-major 3x4 of a build descriptor.
fn descriptor_transform(m: &[f32; 16]) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        out[row * 4..row * 4 + 4].copy_from_slice(&[m[row], m[4 + row], m[8 + row], m[12 + row]]);
    }
    out
}

/// Host-visible buffers written by one dirty `update`. Reused only once the submission
/// that read them has completed.
struct UploadSlot {
    staging: Box<dyn Buffer>,
    descriptors: Box<dyn Buffer>,
    last_use: u64,
}

impl UploadSlot {
    fn new(ctx: &GpuContext) -> Result<Self, RhiError> {
        let staging = ctx.create_buffer(&BufferDescriptor {
            label: Some("instance staging"),
            size: MAX_INSTANCES as u64 * INSTANCE_STRIDE,
            usage: BufferUsage::COPY_SRC,
            memory: BufferMemoryPreference::HostVisible,
        })?;
        let descriptors = ctx.create_buffer(&BufferDescriptor {
            label: Some("instance descriptors"),
            size: MAX_INSTANCES as u64 * DESCRIPTOR_STRIDE,
            usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            memory: BufferMemoryPreference::HostVisible,
        })?;
        Ok(Self { staging, descriptors, last_use: 0 })
    }
}

pub struct Scene {
    instances: Vec<InstanceData>,
    descriptors: Vec<AccelerationStructureInstance>,
    /// Model of each instance, as an index into `models`.
    instance_models: Vec<u32>,
    models: Vec<Arc<Model>>,
    /// Bottom-level address -> index into `models`.
    model_slots: HashMap<u64, u32>,
    uploads: Vec<UploadSlot>,
    next_upload: usize,
    last_upload: Option<usize>,
    resident: Box<dyn Buffer>,
    instance_view: ViewHandle,
    top_level: Option<TopLevelIndex>,
    top_level_view: Option<ViewHandle>,
    builder: AccelerationStructureBuilder,
    instances_dirty: bool,
    transforms_dirty: bool,
    rebuilds: u64,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("instances", &self.instances.len())
            .field("models", &self.models.len())
            .field("instances_dirty", &self.instances_dirty)
            .field("transforms_dirty", &self.transforms_dirty)
            .field("rebuilds", &self.rebuilds)
            .finish_non_exhaustive()
    }
}

impl Scene {
    pub fn new(ctx: &mut GpuContext) -> Result<Self, RhiError> {
        Self::with_upload_slots(ctx, DEFAULT_UPLOAD_SLOTS)
    }

    /// Scene whose dirty updates rotate through `slots` staging/descriptor buffer pairs.
    /// With as many slots as frames in flight, an update never waits on the GPU.
    pub fn with_upload_slots(ctx: &mut GpuContext, slots: usize) -> Result<Self, RhiError> {
        let uploads = (0..slots.max(1)).map(|_| UploadSlot::new(ctx)).collect::<Result<Vec<_>, _>>()?;
        let resident = ctx.create_buffer(&BufferDescriptor {
            label: Some("instances"),
            size: MAX_INSTANCES as u64 * INSTANCE_STRIDE,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            memory: BufferMemoryPreference::DeviceLocal,
        })?;
        let instance_view = ctx.create_view(
            ResourceRef::Buffer(resident.as_ref()),
            &ViewDescriptor::structured(ViewKind::ReadOnly, INSTANCE_STRIDE as u32, MAX_INSTANCES as u64),
            None,
        )?;
        Ok(Self {
            instances: Vec::new(),
            descriptors: Vec::new(),
            instance_models: Vec::new(),
            models: Vec::new(),
            model_slots: HashMap::new(),
            uploads,
            next_upload: 0,
            last_upload: None,
            resident,
            instance_view,
            top_level: None,
            top_level_view: None,
            builder: AccelerationStructureBuilder::new(),
            instances_dirty: false,
            transforms_dirty: false,
            rebuilds: 0,
        })
    }

    /// Add an instance of `model`. The scene keeps the model alive from here on.
    pub fn add_instance(
        &mut self,
        model: &Arc<Model>,
        transform: [f32; 16],
        albedo: [f32; 4],
        emission: [f32; 4],
    ) -> Result<InstanceId, SceneError> {
        if self.instances.len() >= MAX_INSTANCES {
            return Err(SceneError::CapacityExceeded { capacity: MAX_INSTANCES });
        }
        let address = model.bottom_level().device_address();
        let model_index = match self.model_slots.get(&address) {
            Some(&index) => index,
            None => {
                let index = self.models.len() as u32;
                self.models.push(Arc::clone(model));
                self.model_slots.insert(address, index);
                index
            }
        };
        let id = InstanceId(self.instances.len() as u32);
        self.instances.push(InstanceData { transform, albedo, emission });
        self.instance_models.push(model_index);
        self.descriptors.push(AccelerationStructureInstance::new(
            descriptor_transform(&transform),
            id.0,
            0xff,
            AccelerationStructureInstance::FLAG_TRIANGLE_CULL_DISABLE,
            address,
        ));
        self.instances_dirty = true;
        self.transforms_dirty = true;
        Ok(id)
    }

    /// Model the instance was added with.
    pub fn model(&self, id: InstanceId) -> Result<&Arc<Model>, SceneError> {
        let index = self.checked_index(id)?;
        Ok(&self.models[self.instance_models[index] as usize])
    }

    /// Distinct models referenced by the scene's instances.
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn instance(&self, id: InstanceId) -> Result<&InstanceData, SceneError> {
        self.instances
            .get(id.0 as usize)
            .ok_or(SceneError::UnknownInstance { id: id.0 })
    }

    pub fn set_instance_transform(&mut self, id: InstanceId, transform: [f32; 16]) -> Result<(), SceneError> {
        let index = self.checked_index(id)?;
        self.instances[index].transform = transform;
        self.descriptors[index].transform = descriptor_transform(&transform);
        self.instances_dirty = true;
        self.transforms_dirty = true;
        Ok(())
    }

    pub fn set_instance_albedo(&mut self, id: InstanceId, albedo: [f32; 4]) -> Result<(), SceneError> {
        let index = self.checked_index(id)?;
        self.instances[index].albedo = albedo;
        self.instances_dirty = true;
        Ok(())
    }

    pub fn set_instance_emission(&mut self, id: InstanceId, emission: [f32; 4]) -> Result<(), SceneError> {
        let index = self.checked_index(id)?;
        self.instances[index].emission = emission;
        self.instances_dirty = true;
        Ok(())
    }

    /// Record pending uploads and the top-level rebuild into `batch`, then clear the dirty flags.
    /// Waits only when the next upload slot is still read by an earlier submission.
    pub fn update(&mut self, ctx: &mut GpuContext, batch: &mut CommandBatch) -> Result<UpdateOutcome, RhiError> {
        let mut outcome = UpdateOutcome::default();
        if self.instances.is_empty() || !self.is_dirty() {
            return Ok(outcome);
        }

        let slot_index = self.next_upload;
        self.next_upload = (slot_index + 1) % self.uploads.len();
        self.last_upload = Some(slot_index);
        let slot = &mut self.uploads[slot_index];
        ctx.wait_for(slot.last_use)?;
        slot.last_use = ctx.next_submission();

        if self.instances_dirty {
            let bytes: &[u8] = bytemuck::cast_slice(&self.instances);
            ctx.write_buffer(slot.staging.as_ref(), 0, bytes)?;
            batch.copy_buffer(slot.staging.as_ref(), 0, self.resident.as_ref(), 0, bytes.len() as u64);
            outcome.copied = true;
        }

        if self.transforms_dirty {
            ctx.write_buffer(slot.descriptors.as_ref(), 0, bytemuck::cast_slice(&self.descriptors))?;
            let top_level = self.builder.build_dynamic(
                ctx,
                batch,
                slot.descriptors.as_ref(),
                self.descriptors.len() as u32,
            )?;
            let view = ctx.create_view(
                ResourceRef::AccelerationStructure(top_level.structure()),
                &ViewDescriptor::acceleration_structure(),
                None,
            )?;
            if let Some(old) = self.top_level_view.replace(view) {
                ctx.release_view(old);
            }
            if let Some(old) = self.top_level.replace(top_level) {
                ctx.retire(old);
            }
            self.rebuilds += 1;
            outcome.rebuilt = true;
            log::debug!("top-level index rebuilt over {} instances (view {})", self.instances.len(), view.index());
        }

        self.instances_dirty = false;
        self.transforms_dirty = false;
        Ok(outcome)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Structured view over the GPU-resident instance array.
    pub fn instance_view(&self) -> ViewHandle {
        self.instance_view
    }

    /// View of the current top-level index; `None` until the first rebuild.
    pub fn acceleration_view(&self) -> Option<ViewHandle> {
        self.top_level_view
    }

    pub fn top_level(&self) -> Option<&TopLevelIndex> {
        self.top_level.as_ref()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn builder(&self) -> &AccelerationStructureBuilder {
        &self.builder
    }

    pub fn resident_buffer(&self) -> &dyn Buffer {
        self.resident.as_ref()
    }

    /// Host-visible top-level build descriptors written by the most recent dirty update.
    pub fn descriptor_buffer(&self) -> Option<&dyn Buffer> {
        self.last_upload.map(|i| self.uploads[i].descriptors.as_ref())
    }

    pub fn upload_slot_count(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.instances_dirty || self.transforms_dirty
    }

    /// Release the scene's view slots and hand its GPU objects, models included, to `ctx`.
    /// They are freed once every submission recorded so far has completed.
    pub fn retire(self, ctx: &mut GpuContext) {
        ctx.release_view(self.instance_view);
        if let Some(view) = self.top_level_view {
            ctx.release_view(view);
        }
        log::debug!("scene retired with {} instances over {} models", self.instances.len(), self.models.len());
        ctx.retire(self);
    }

    fn checked_index(&self, id: InstanceId) -> Result<usize, SceneError> {
        let index = id.0 as usize;
        if index < self.instances.len() {
            Ok(index)
        } else {
            Err(SceneError::UnknownInstance { id: id.0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_data_layout() {
        assert_eq!(INSTANCE_STRIDE, 96);
        assert_eq!(DESCRIPTOR_STRIDE, 64);
    }

    #[test]
    fn descriptor_transform_is_row_major_3x4() {
        let mut m = render_api::IDENTITY;
        m[12] = 5.0;
        m[13] = -2.0;
        m[14] = 7.5;
        m[1] = 0.25;
        let t = descriptor_transform(&m);
        assert_eq!(&t[0..4], &[1.0, 0.0, 0.0, 5.0]);
        assert_eq!(&t[4..8], &[0.25, 1.0, 0.0, -2.0]);
        assert_eq!(&t[8..12], &[0.0, 0.0, 1.0, 7.5]);
    }
}
