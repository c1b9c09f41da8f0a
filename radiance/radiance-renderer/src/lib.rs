//! Radiance Renderer: radiance-cascade global illumination over a hardware ray-tracing scene.
//!
//! One frame is one command batch: scene upload and top-level rebuild, cascade trace and
//! merge, shading into the output target, optional cascade visualisation.

pub mod accel;
pub mod cascades;
pub mod config;
pub mod error;
pub mod kernels;
pub mod model;
pub mod output;
pub mod scene;

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use radiance_rhi::{
    BindingValue, Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, CommandBatch, ComputeKernel, Device,
    GpuContext, RayTracingKernel, ResourceRef, ResourceState, RhiError, ViewDescriptor, ViewHandle,
};
use render_api::ExtractedView;

pub use accel::{AccelerationStructureBuilder, BottomLevelIndex, TopLevelIndex};
pub use cascades::{CascadeConstants, CascadeLevel, RadianceCascades};
pub use config::{CascadeConfig, RendererConfig, TraceMode};
pub use error::{CascadeError, KernelError, RendererError, SceneError};
pub use kernels::{KernelBlob, KernelLibrary, KernelRole};
pub use model::Model;
pub use output::OutputTarget;
pub use scene::{InstanceData, InstanceId, Scene, UpdateOutcome, DEFAULT_UPLOAD_SLOTS, MAX_INSTANCES};

use kernels::{DEBUG_VISUALIZE_BINDINGS, SHADE_BINDINGS};

/// Workgroup edge of the debug visualisation kernel.
const DEBUG_GROUP_SIZE: u32 = 8;
const CAMERA_BUFFER_SIZE: u64 = 256;

/// Per-frame camera constants read by the shade and debug kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub view_proj: [f32; 16],
    pub view: [f32; 16],
    pub viewport: [f32; 2],
    pub frame: u32,
    /// Visualised cascade level, -1 when off.
    pub debug_level: i32,
}

/// What one `Renderer::render` call submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStats {
    /// Zero-based frame number.
    pub frame: u64,
    /// Submission stamp of the frame's batch.
    pub submission: u64,
    pub rebuilt_scene_index: bool,
    /// False when the scene was empty and lighting was skipped.
    pub shaded: bool,
}

#[derive(Debug)]
struct CameraSlot {
    buffer: Box<dyn Buffer>,
    view: ViewHandle,
    last_use: u64,
}

impl CameraSlot {
    fn new(ctx: &mut GpuContext) -> Result<Self, RhiError> {
        let buffer = ctx.create_buffer(&BufferDescriptor {
            label: Some("camera constants"),
            size: CAMERA_BUFFER_SIZE,
            usage: BufferUsage::UNIFORM,
            memory: BufferMemoryPreference::HostVisible,
        })?;
        let view = ctx.create_view(ResourceRef::Buffer(buffer.as_ref()), &ViewDescriptor::read_only(), None)?;
        Ok(Self { buffer, view, last_use: 0 })
    }
}

pub struct Renderer {
    config: RendererConfig,
    cascades: RadianceCascades,
    shade_kernel: Box<dyn RayTracingKernel>,
    debug_kernel: Box<dyn ComputeKernel>,
    output: OutputTarget,
    camera_ring: Vec<CameraSlot>,
    debug_cascade: Option<usize>,
    frame: u64,
    warned_empty: bool,
    // Dropped after every resource above.
    ctx: GpuContext,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("frame", &self.frame)
            .field("output", &self.output.size())
            .field("debug_cascade", &self.debug_cascade)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    pub fn new(device: Arc<dyn Device>, kernels: &KernelLibrary, config: RendererConfig) -> Result<Self, RendererError> {
        let mut ctx = GpuContext::new(device);
        let cascades = RadianceCascades::new(&mut ctx, kernels, config.cascades.clone())?;
        let shade_kernel = kernels.create_ray_tracing(ctx.device().as_ref(), KernelRole::Shade)?;
        let debug_kernel = kernels.create_compute(ctx.device().as_ref(), KernelRole::DebugVisualize)?;
        let output = OutputTarget::new(&mut ctx, config.width, config.height, config.output_format)?;
        let camera_ring = (0..config.frames_in_flight.max(1))
            .map(|_| CameraSlot::new(&mut ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let max_level = cascades.level_count() - 1;
        let debug_cascade = config.debug_cascade.map(|level| level.min(max_level));
        log::info!(
            "renderer ready: {}x{} output, {} frames in flight",
            config.width,
            config.height,
            camera_ring.len()
        );
        Ok(Self {
            config,
            cascades,
            shade_kernel,
            debug_kernel,
            output,
            camera_ring,
            debug_cascade,
            frame: 0,
            warned_empty: false,
            ctx,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    /// For creating scenes and models on the renderer's device.
    pub fn context_mut(&mut self) -> &mut GpuContext {
        &mut self.ctx
    }

    /// Scene with one upload slot per frame in flight.
    pub fn create_scene(&mut self) -> Result<Scene, RhiError> {
        Scene::with_upload_slots(&mut self.ctx, self.config.frames_in_flight)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    pub fn cascades(&self) -> &RadianceCascades {
        &self.cascades
    }

    pub fn cascades_mut(&mut self) -> &mut RadianceCascades {
        &mut self.cascades
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn debug_cascade(&self) -> Option<usize> {
        self.debug_cascade
    }

    /// Draw `level` (clamped to the last level) over the output; `None` turns the pass off.
    pub fn visualize_cascade(&mut self, level: Option<usize>) {
        let max_level = self.cascades.level_count() - 1;
        self.debug_cascade = level.map(|l| l.min(max_level));
    }

    /// Record and submit one frame.
    pub fn render(&mut self, scene: &mut Scene, view: &ExtractedView) -> Result<FrameStats, RendererError> {
        let (width, height) = view.viewport_size;
        self.output.ensure_size(&mut self.ctx, width, height)?;
        self.throttle()?;

        let mut batch = self.ctx.begin_commands()?;
        let outcome = scene.update(&mut self.ctx, &mut batch)?;
        let shaded = match scene.acceleration_view() {
            Some(scene_index) if !scene.is_empty() => {
                self.record_lighting(&mut batch, scene, scene_index, view)?;
                true
            }
            _ => {
                if !self.warned_empty {
                    log::warn!("scene has no instances; skipping global illumination");
                    self.warned_empty = true;
                }
                false
            }
        };
        let submission = self.ctx.submit(batch)?;

        let stats = FrameStats {
            frame: self.frame,
            submission,
            rebuilt_scene_index: outcome.rebuilt,
            shaded,
        };
        log::debug!("frame {:?}", stats);
        self.frame += 1;
        Ok(stats)
    }

    /// Block until the GPU has finished every submitted frame.
    pub fn finish(&mut self) -> Result<(), RhiError> {
        self.ctx.wait_idle()
    }

    /// Keep at most `frames_in_flight` batches queued once the next one is submitted.
    fn throttle(&mut self) -> Result<(), RhiError> {
        let in_flight = self.camera_ring.len() as u64;
        let oldest = self.ctx.submission_counter().saturating_sub(in_flight - 1);
        self.ctx.wait_for(oldest)
    }

    fn write_camera(&mut self, view: &ExtractedView) -> Result<ViewHandle, RhiError> {
        let (width, height) = self.output.size();
        let constants = CameraConstants {
            view_proj: view.view_proj,
            view: view.view,
            viewport: [width as f32, height as f32],
            frame: self.frame as u32,
            debug_level: self.debug_cascade.map_or(-1, |level| level as i32),
        };
        let index = (self.frame % self.camera_ring.len() as u64) as usize;
        let slot = &mut self.camera_ring[index];
        self.ctx.wait_for(slot.last_use)?;
        self.ctx.write_buffer(slot.buffer.as_ref(), 0, bytemuck::bytes_of(&constants))?;
        slot.last_use = self.ctx.next_submission();
        Ok(slot.view)
    }

    fn record_lighting(
        &mut self,
        batch: &mut CommandBatch,
        scene: &Scene,
        scene_index: ViewHandle,
        view: &ExtractedView,
    ) -> Result<(), RendererError> {
        let radiance = self.cascades.generate(&mut self.ctx, batch, scene_index, scene.instance_view())?;
        let camera = self.write_camera(view)?;
        let (width, height) = self.output.size();
        let target = ResourceRef::Texture(self.output.texture());

        batch.transition(target, ResourceState::ShaderRead, ResourceState::UnorderedAccess);
        batch.set_ray_tracing_kernel(self.shade_kernel.as_ref());
        let bindings = self.ctx.encode_bindings(
            SHADE_BINDINGS,
            &[
                BindingValue::View(camera),
                BindingValue::View(scene_index),
                BindingValue::View(scene.instance_view()),
                BindingValue::View(radiance[0]),
                BindingValue::View(self.cascades.constants_view()),
                BindingValue::View(self.output.write_view()),
            ],
        );
        batch.set_bindings(&bindings);
        batch.dispatch_rays(width, height, 1);

        if let Some(level) = self.debug_cascade {
            batch.uav_barrier(target);
            batch.set_compute_kernel(self.debug_kernel.as_ref());
            let bindings = self.ctx.encode_bindings(
                DEBUG_VISUALIZE_BINDINGS,
                &[
                    BindingValue::Immediate(level as u32),
                    BindingValue::View(camera),
                    BindingValue::View(self.cascades.constants_view()),
                    BindingValue::View(radiance[level]),
                    BindingValue::View(self.output.write_view()),
                ],
            );
            batch.set_bindings(&bindings);
            batch.dispatch(width.div_ceil(DEBUG_GROUP_SIZE), height.div_ceil(DEBUG_GROUP_SIZE), 1);
        }

        batch.transition(target, ResourceState::UnorderedAccess, ResourceState::ShaderRead);
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            log::warn!("renderer dropped with work pending: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_constants_layout() {
        assert_eq!(std::mem::size_of::<CameraConstants>(), 144);
        assert!(std::mem::size_of::<CameraConstants>() as u64 <= CAMERA_BUFFER_SIZE);
    }

    #[test]
    fn default_config_matches_cascade_defaults() {
        let config = RendererConfig::default();
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.cascades.level_count, 4);
        assert!(config.debug_cascade.is_none());
    }
}
