#![allow(dead_code)]

use std::sync::Arc;

use radiance_renderer::{
    CascadeConfig, KernelBlob, KernelLibrary, KernelRole, Model, RendererConfig, Scene,
};
use radiance_rhi::headless::{HeadlessDevice, RecordedCommand, SubmittedBatch};
use radiance_rhi::GpuContext;
use render_api::{MeshData, IDENTITY};

/// Smallest blob that passes SPIR-V header validation.
pub fn spirv_module() -> Vec<u8> {
    [0x0723_0203u32, 0x0001_0500, 0, 16, 0]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

pub fn kernel_library() -> KernelLibrary {
    let mut library = KernelLibrary::new();
    for role in KernelRole::ALL {
        library.insert(KernelBlob::parse(role, spirv_module()).unwrap());
    }
    library
}

pub fn headless() -> Arc<HeadlessDevice> {
    Arc::new(HeadlessDevice::new())
}

pub fn small_config() -> RendererConfig {
    RendererConfig {
        width: 64,
        height: 32,
        cascades: CascadeConfig::with_spacing([8, 8, 8], 3, 0.5),
        ..Default::default()
    }
}

/// Unit cube, 8 vertices, 12 triangles.
pub fn cube_mesh() -> MeshData {
    let positions = vec![
        0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0,
    ];
    let indices = vec![
        0, 2, 1, 0, 3, 2, 4, 5, 6, 4, 6, 7, 0, 1, 5, 0, 5, 4, //
        3, 6, 2, 3, 7, 6, 0, 4, 7, 0, 7, 3, 1, 2, 6, 1, 6, 5,
    ];
    MeshData { positions, normals: Vec::new(), indices }
}

pub fn translation(x: f32, y: f32, z: f32) -> [f32; 16] {
    let mut m = IDENTITY;
    m[12] = x;
    m[13] = y;
    m[14] = z;
    m
}

/// Context, cube model and a scene holding `instances` cubes in a row.
pub fn cube_scene(ctx: &mut GpuContext, instances: usize) -> (Arc<Model>, Scene) {
    let model = Arc::new(Model::from_mesh(ctx, &cube_mesh()).unwrap());
    let mut scene = Scene::new(ctx).unwrap();
    for i in 0..instances {
        scene
            .add_instance(&model, translation(2.0 * i as f32, 0.0, 0.0), [0.8, 0.8, 0.8, 1.0], [0.0; 4])
            .unwrap();
    }
    (model, scene)
}

pub fn commands(batches: &[SubmittedBatch]) -> Vec<RecordedCommand> {
    batches.iter().flat_map(|b| b.commands.iter().cloned()).collect()
}

pub fn rays(commands: &[RecordedCommand]) -> Vec<[u32; 3]> {
    commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::DispatchRays(dims) => Some(*dims),
            _ => None,
        })
        .collect()
}

pub fn dispatches(commands: &[RecordedCommand]) -> Vec<[u32; 3]> {
    commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::Dispatch(dims) => Some(*dims),
            _ => None,
        })
        .collect()
}

/// Binding words pushed immediately before each dispatch of either kind.
pub fn dispatch_bindings(commands: &[RecordedCommand]) -> Vec<Vec<u32>> {
    let mut last = Vec::new();
    let mut out = Vec::new();
    for command in commands {
        match command {
            RecordedCommand::SetBindings(words) => last = words.clone(),
            RecordedCommand::Dispatch(_) | RecordedCommand::DispatchRays(_) => out.push(last.clone()),
            _ => {}
        }
    }
    out
}

pub fn assert_no_violations(device: &HeadlessDevice) {
    let violations = device.violations();
    assert!(violations.is_empty(), "{:#?}", violations);
}
