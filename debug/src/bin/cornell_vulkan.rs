//! Cornell box on the Vulkan backend: loads compiled kernels, builds the scene, renders a short
//! orbiting-camera loop and reports frame timings.
//! Run from repo root: cargo run -p debug --bin cornell_vulkan -- <kernel dir> [scene.obj] [frames]
//! Set RADIANCE_VALIDATION=1 for validation layers and RUST_LOG=info for device logs.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use radiance_renderer::{CascadeConfig, KernelLibrary, Model, Renderer, RendererConfig, Scene};
use radiance_rhi::DeviceCreateParams;
use render_api::{ExtractedView, MeshData, IDENTITY};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Axis-aligned box from `min` to `max`, outward winding.
fn cuboid(min: [f32; 3], max: [f32; 3]) -> MeshData {
    let [x0, y0, z0] = min;
    let [x1, y1, z1] = max;
    MeshData {
        positions: vec![
            x0, y0, z0, x1, y0, z0, x1, y1, z0, x0, y1, z0, //
            x0, y0, z1, x1, y0, z1, x1, y1, z1, x0, y1, z1,
        ],
        normals: Vec::new(),
        indices: vec![
            0, 2, 1, 0, 3, 2, 4, 5, 6, 4, 6, 7, 0, 1, 5, 0, 5, 4, //
            3, 6, 2, 3, 7, 6, 0, 4, 7, 0, 7, 3, 1, 2, 6, 1, 6, 5,
        ],
    }
}

/// Every shape in an OBJ file as its own mesh.
fn load_obj(path: &Path) -> Result<Vec<MeshData>, String> {
    let (models, _) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS).map_err(|e| format!("load_obj: {:?}", e))?;
    if models.is_empty() {
        return Err(format!("no mesh in {}", path.display()));
    }
    Ok(models
        .into_iter()
        .map(|m| MeshData {
            positions: m.mesh.positions,
            normals: m.mesh.normals,
            indices: m.mesh.indices,
        })
        .collect())
}

/// Walls, light and two blocks, each with (albedo, emission).
fn cornell_meshes() -> Vec<(MeshData, [f32; 4], [f32; 4])> {
    let white = [0.73, 0.73, 0.73, 1.0];
    let dark = [0.0; 4];
    vec![
        (cuboid([0.0, -0.1, 0.0], [32.0, 0.0, 32.0]), white, dark),
        (cuboid([0.0, 32.0, 0.0], [32.0, 32.1, 32.0]), white, dark),
        (cuboid([0.0, 0.0, 32.0], [32.0, 32.0, 32.1]), white, dark),
        (cuboid([-0.1, 0.0, 0.0], [0.0, 32.0, 32.0]), [0.65, 0.05, 0.05, 1.0], dark),
        (cuboid([32.0, 0.0, 0.0], [32.1, 32.0, 32.0]), [0.12, 0.45, 0.15, 1.0], dark),
        (cuboid([12.0, 31.8, 12.0], [20.0, 31.9, 20.0]), white, [15.0, 15.0, 15.0, 1.0]),
        (cuboid([6.0, 0.0, 8.0], [14.0, 16.0, 16.0]), white, dark),
        (cuboid([18.0, 0.0, 14.0], [26.0, 8.0, 22.0]), white, dark),
    ]
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = dot(v, v).sqrt().max(f32::EPSILON);
    [v[0] / len, v[1] / len, v[2] / len]
}

/// Column-major right-handed look-at.
fn look_at(eye: [f32; 3], target: [f32; 3], up: [f32; 3]) -> [f32; 16] {
    let f = normalize(sub(target, eye));
    let s = normalize(cross(f, up));
    let u = cross(s, f);
    [
        s[0], u[0], -f[0], 0.0, //
        s[1], u[1], -f[1], 0.0, //
        s[2], u[2], -f[2], 0.0, //
        -dot(s, eye), -dot(u, eye), dot(f, eye), 1.0,
    ]
}

/// Column-major perspective, depth 0..1.
fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> [f32; 16] {
    let f = 1.0 / (fov_y * 0.5).tan();
    let mut m = [0.0; 16];
    m[0] = f / aspect;
    m[5] = f;
    m[10] = far / (near - far);
    m[11] = -1.0;
    m[14] = near * far / (near - far);
    m
}

fn mul(a: &[f32; 16], b: &[f32; 16]) -> [f32; 16] {
    let mut out = [0.0; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
        }
    }
    out
}

fn camera(time: f32) -> ExtractedView {
    let eye = [16.0 + 10.0 * time.sin(), 16.0, -30.0 + 4.0 * time.cos()];
    let view = look_at(eye, [16.0, 14.0, 16.0], [0.0, 1.0, 0.0]);
    let proj = perspective(40f32.to_radians(), WIDTH as f32 / HEIGHT as f32, 0.1, 200.0);
    ExtractedView { view_proj: mul(&proj, &view), view, viewport_size: (WIDTH, HEIGHT) }
}

fn main() -> Result<(), String> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let kernel_dir = args
        .next()
        .ok_or("usage: cornell_vulkan <kernel dir> [scene.obj] [frames]")?;
    let obj_path = args.next();
    let frames: u32 = match args.next() {
        Some(n) => n.parse().map_err(|e| format!("frames: {}", e))?,
        None => 120,
    };

    let kernels = KernelLibrary::load_dir(&kernel_dir).map_err(|e| e.to_string())?;
    let device = radiance_rhi::create_device(DeviceCreateParams {
        application_name: "cornell_vulkan",
        ..Default::default()
    })
    .map_err(|e| e.to_string())?;
    let config = RendererConfig {
        width: WIDTH,
        height: HEIGHT,
        cascades: CascadeConfig::with_spacing([32, 32, 32], 4, 1.0),
        ..Default::default()
    };
    let mut renderer = Renderer::new(device, &kernels, config).map_err(|e| e.to_string())?;

    let meshes: Vec<(MeshData, [f32; 4], [f32; 4])> = match obj_path {
        Some(path) => load_obj(Path::new(&path))?
            .into_iter()
            .map(|mesh| (mesh, [0.73, 0.73, 0.73, 1.0], [0.0; 4]))
            .collect(),
        None => cornell_meshes(),
    };
    let mut scene = renderer.create_scene().map_err(|e| e.to_string())?;
    for (mesh, albedo, emission) in &meshes {
        let model = Arc::new(Model::from_mesh(renderer.context_mut(), mesh).map_err(|e| e.to_string())?);
        scene.add_instance(&model, IDENTITY, *albedo, *emission).map_err(|e| e.to_string())?;
    }
    log::info!("scene: {} models, {} instances", scene.model_count(), scene.len());

    let start = Instant::now();
    let result = render_frames(&mut renderer, &mut scene, frames);
    let rebuilds = scene.rebuild_count();
    // Frames may still be running, even on the error path.
    scene.retire(renderer.context_mut());
    renderer.finish().map_err(|e| e.to_string())?;
    result?;
    let elapsed = start.elapsed();
    println!(
        "{} frames in {:.2?} ({:.2} ms/frame), {} top-level rebuilds",
        frames,
        elapsed,
        elapsed.as_secs_f64() * 1000.0 / frames.max(1) as f64,
        rebuilds
    );
    Ok(())
}

fn render_frames(renderer: &mut Renderer, scene: &mut Scene, frames: u32) -> Result<(), String> {
    for frame in 0..frames {
        if frame == frames / 2 {
            renderer.visualize_cascade(Some(0));
        }
        let view = camera(frame as f32 / 60.0);
        let stats = renderer.render(scene, &view).map_err(|e| e.to_string())?;
        log::debug!("frame {} -> submission {}", stats.frame, stats.submission);
    }
    Ok(())
}
