//! Headless frame loop: animated cubes through the full renderer on the recording backend.
//! Run from repo root: RUST_LOG=debug cargo run -p debug --bin headless_frames -- [frames] [instances]
//! Exits with an error if the backend observed any sequencing violation.

use std::sync::Arc;

use radiance_renderer::{
    CascadeConfig, InstanceId, KernelBlob, KernelLibrary, KernelRole, Model, Renderer, RendererConfig, Scene,
};
use radiance_rhi::headless::HeadlessDevice;
use render_api::{ExtractedView, MeshData, IDENTITY};

/// Header-only module; the recording backend never executes kernels.
fn stub_kernels() -> Result<KernelLibrary, String> {
    let module: Vec<u8> = [0x0723_0203u32, 0x0001_0500, 0, 1, 0].iter().flat_map(|w| w.to_le_bytes()).collect();
    let mut library = KernelLibrary::new();
    for role in KernelRole::ALL {
        library.insert(KernelBlob::parse(role, module.clone()).map_err(|e| e.to_string())?);
    }
    Ok(library)
}

fn cube() -> MeshData {
    MeshData {
        positions: vec![
            -0.5, -0.5, -0.5, 0.5, -0.5, -0.5, 0.5, 0.5, -0.5, -0.5, 0.5, -0.5, //
            -0.5, -0.5, 0.5, 0.5, -0.5, 0.5, 0.5, 0.5, 0.5, -0.5, 0.5, 0.5,
        ],
        normals: Vec::new(),
        indices: vec![
            0, 2, 1, 0, 3, 2, 4, 5, 6, 4, 6, 7, 0, 1, 5, 0, 5, 4, //
            3, 6, 2, 3, 7, 6, 0, 4, 7, 0, 7, 3, 1, 2, 6, 1, 6, 5,
        ],
    }
}

fn orbit(index: usize, count: usize, time: f32) -> [f32; 16] {
    let angle = time + index as f32 * std::f32::consts::TAU / count.max(1) as f32;
    let mut m = IDENTITY;
    m[12] = 16.0 + 8.0 * angle.cos();
    m[13] = 4.0;
    m[14] = 16.0 + 8.0 * angle.sin();
    m
}

fn parse_arg(index: usize, default: usize) -> Result<usize, String> {
    match std::env::args().nth(index) {
        Some(arg) => arg.parse().map_err(|e| format!("argument {}: {}", index, e)),
        None => Ok(default),
    }
}

fn main() -> Result<(), String> {
    env_logger::init();
    let frames = parse_arg(1, 8)?;
    let instances = parse_arg(2, 16)?;

    let device = Arc::new(HeadlessDevice::new());
    let config = RendererConfig {
        width: 320,
        height: 180,
        cascades: CascadeConfig::with_spacing([32, 32, 32], 4, 1.0),
        ..Default::default()
    };
    let mut renderer = Renderer::new(device.clone(), &stub_kernels()?, config).map_err(|e| e.to_string())?;
    let model = Arc::new(Model::from_mesh(renderer.context_mut(), &cube()).map_err(|e| e.to_string())?);
    let mut scene = renderer.create_scene().map_err(|e| e.to_string())?;
    let mut ids = Vec::with_capacity(instances);
    for i in 0..instances {
        let emission = if i == 0 { [8.0, 7.0, 6.0, 1.0] } else { [0.0; 4] };
        let id = scene
            .add_instance(&model, orbit(i, instances, 0.0), [0.7, 0.7, 0.7, 1.0], emission)
            .map_err(|e| e.to_string())?;
        ids.push(id);
    }

    let view = ExtractedView { viewport_size: (320, 180), ..Default::default() };
    let result = animate(&mut renderer, &mut scene, &ids, frames, &view);
    println!(
        "{} frames, {} top-level rebuilds, scratch {} bytes, {} submissions",
        frames,
        scene.rebuild_count(),
        scene.builder().scratch_capacity(),
        renderer.context().submission_counter()
    );
    scene.retire(renderer.context_mut());
    renderer.finish().map_err(|e| e.to_string())?;
    result?;

    let violations = device.violations();
    if !violations.is_empty() {
        for v in &violations {
            eprintln!("violation: {}", v);
        }
        return Err(format!("{} sequencing violations", violations.len()));
    }
    Ok(())
}

/// Every other frame moves the instances; the rest only change a material.
fn animate(
    renderer: &mut Renderer,
    scene: &mut Scene,
    ids: &[InstanceId],
    frames: usize,
    view: &ExtractedView,
) -> Result<(), String> {
    for frame in 0..frames {
        if frame % 2 == 0 {
            for (i, id) in ids.iter().enumerate() {
                scene
                    .set_instance_transform(*id, orbit(i, ids.len(), frame as f32 * 0.1))
                    .map_err(|e| e.to_string())?;
            }
        } else if let Some(first) = ids.first() {
            let glow = 4.0 + frame as f32;
            scene.set_instance_emission(*first, [glow, glow, glow, 1.0]).map_err(|e| e.to_string())?;
        }
        if frame == frames / 2 {
            renderer.visualize_cascade(Some(1));
        }
        let stats = renderer.render(scene, view).map_err(|e| e.to_string())?;
        println!(
            "frame {:>3}: submission {:>3}, rebuilt {:<5}, shaded {}",
            stats.frame, stats.submission, stats.rebuilt_scene_index, stats.shaded
        );
    }
    Ok(())
}
