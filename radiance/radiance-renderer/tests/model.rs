mod common;

use radiance_renderer::{Model, RendererError};
use radiance_rhi::headless::RecordedCommand;
use radiance_rhi::{AccelerationStructureLevel, GpuContext};

use common::*;

#[test]
fn streams_are_uploaded_before_the_bottom_level_build() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let mesh = cube_mesh();
    let model = Model::from_mesh(&mut ctx, &mesh).unwrap();

    assert_eq!(model.vertex_count(), 8);
    assert_eq!(model.triangle_count(), 12);
    assert!(model.normals().is_none());
    assert_eq!(
        device.buffer_contents(model.positions()).unwrap(),
        bytemuck::cast_slice::<f32, u8>(&mesh.positions)
    );
    assert_eq!(
        device.buffer_contents(model.indices()).unwrap(),
        bytemuck::cast_slice::<u32, u8>(&mesh.indices)
    );

    let submissions = device.submissions();
    let build = submissions.last().unwrap();
    assert_eq!(
        build.commands.len(),
        1,
        "bottom-level build runs in its own batch"
    );
    assert!(matches!(
        build.commands[0],
        RecordedCommand::BuildAccelerationStructure {
            level: AccelerationStructureLevel::Bottom,
            primitive_count: 12,
            ..
        }
    ));
    assert_eq!(ctx.completed_submission(), ctx.submission_counter());
    assert_no_violations(&device);
}

#[test]
fn normals_get_their_own_stream() {
    let mut ctx = GpuContext::new(headless());
    let mut mesh = cube_mesh();
    mesh.normals = vec![0.0, 0.0, 1.0].repeat(8);
    let model = Model::from_mesh(&mut ctx, &mesh).unwrap();
    assert_eq!(model.normals().map(|n| n.size()), Some(96));
}

#[test]
fn invalid_mesh_is_rejected_before_any_upload() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let mut mesh = cube_mesh();
    mesh.indices.push(0);
    assert!(matches!(Model::from_mesh(&mut ctx, &mesh), Err(RendererError::InvalidMesh(_))));
    assert!(device.submissions().is_empty());
}
