mod common;

use std::sync::Arc;

use radiance_renderer::{InstanceData, InstanceId, Model, Scene, SceneError, UpdateOutcome, MAX_INSTANCES};
use radiance_rhi::headless::RecordedCommand;
use radiance_rhi::{AccelerationStructureInstance, BufferDescriptor, GpuContext, ResourceRef, ViewDescriptor};

use common::*;

fn update_and_submit(ctx: &mut GpuContext, scene: &mut Scene) -> UpdateOutcome {
    let mut batch = ctx.begin_commands().unwrap();
    let outcome = scene.update(ctx, &mut batch).unwrap();
    ctx.submit(batch).unwrap();
    outcome
}

#[test]
fn set_then_read_back_and_gpu_copy_matches() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (model, mut scene) = cube_scene(&mut ctx, 3);

    let id = scene.add_instance(&model, translation(0.0, 5.0, 0.0), [1.0, 0.0, 0.0, 1.0], [0.0; 4]).unwrap();
    let moved = translation(-1.0, 2.0, 3.5);
    scene.set_instance_transform(id, moved).unwrap();
    scene.set_instance_albedo(id, [0.1, 0.2, 0.3, 1.0]).unwrap();
    scene.set_instance_emission(id, [4.0, 4.0, 4.0, 1.0]).unwrap();
    assert_eq!(
        scene.instance(id).unwrap(),
        &InstanceData { transform: moved, albedo: [0.1, 0.2, 0.3, 1.0], emission: [4.0, 4.0, 4.0, 1.0] }
    );

    let outcome = update_and_submit(&mut ctx, &mut scene);
    assert_eq!(outcome, UpdateOutcome { copied: true, rebuilt: true });

    let expected: Vec<InstanceData> = (0..4).map(|i| *scene.instance(InstanceId::from_index(i)).unwrap()).collect();
    let resident = device.buffer_contents(scene.resident_buffer()).unwrap();
    let bytes: &[u8] = bytemuck::cast_slice(&expected);
    assert_eq!(&resident[..bytes.len()], bytes);
    assert_no_violations(&device);
}

#[test]
fn descriptors_carry_id_mask_and_bottom_level_address() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (model, mut scene) = cube_scene(&mut ctx, 2);
    update_and_submit(&mut ctx, &mut scene);

    let contents = device.buffer_contents(scene.descriptor_buffer().unwrap()).unwrap();
    let stride = std::mem::size_of::<AccelerationStructureInstance>();
    for index in 0..2 {
        let descriptor: AccelerationStructureInstance =
            bytemuck::pod_read_unaligned(&contents[index * stride..(index + 1) * stride]);
        assert_eq!(descriptor.custom_index(), index as u32);
        assert_eq!(descriptor.mask(), 0xff);
        assert_eq!(descriptor.flags(), AccelerationStructureInstance::FLAG_TRIANGLE_CULL_DISABLE);
        assert_eq!(descriptor.acceleration_structure_reference, model.bottom_level().device_address());
        // Row 0 ends with the x translation.
        assert_eq!(descriptor.transform[3], 2.0 * index as f32);
    }
    assert_eq!(scene.top_level().unwrap().instance_count(), 2);
}

#[test]
fn unchanged_frame_does_not_rebuild() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 4);

    assert!(update_and_submit(&mut ctx, &mut scene).rebuilt);
    device.clear_submissions();
    assert_eq!(update_and_submit(&mut ctx, &mut scene), UpdateOutcome::default());
    assert_eq!(scene.rebuild_count(), 1);
    assert_eq!(scene.builder().dynamic_build_count(), 1);
    assert!(commands(&device.submissions()).is_empty());
}

#[test]
fn material_change_copies_without_rebuilding() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 2);
    update_and_submit(&mut ctx, &mut scene);

    let first = InstanceId::from_index(0);
    scene.set_instance_emission(first, [10.0, 9.0, 8.0, 1.0]).unwrap();
    device.clear_submissions();
    let outcome = update_and_submit(&mut ctx, &mut scene);
    assert_eq!(outcome, UpdateOutcome { copied: true, rebuilt: false });
    let recorded = commands(&device.submissions());
    assert!(recorded.iter().any(|c| matches!(c, RecordedCommand::CopyBuffer { .. })));
    assert!(!recorded.iter().any(|c| matches!(c, RecordedCommand::BuildAccelerationStructure { .. })));
}

#[test]
fn capacity_boundary() {
    let mut ctx = GpuContext::new(headless());
    let (model, mut scene) = cube_scene(&mut ctx, 0);
    for _ in 0..MAX_INSTANCES {
        scene.add_instance(&model, translation(0.0, 0.0, 0.0), [1.0; 4], [0.0; 4]).unwrap();
    }
    assert_eq!(scene.len(), 65536);
    let overflow = scene.add_instance(&model, translation(0.0, 0.0, 0.0), [1.0; 4], [0.0; 4]);
    assert!(matches!(overflow, Err(SceneError::CapacityExceeded { capacity: 65536 })));

    let outcome = update_and_submit(&mut ctx, &mut scene);
    assert!(outcome.rebuilt);
    assert_eq!(scene.top_level().unwrap().instance_count(), 65536);
}

#[test]
fn unknown_instance_is_rejected() {
    let mut ctx = GpuContext::new(headless());
    let (_model, mut scene) = cube_scene(&mut ctx, 1);
    let missing = InstanceId::from_index(1);
    assert!(matches!(scene.instance(missing), Err(SceneError::UnknownInstance { id: 1 })));
    assert!(scene.set_instance_transform(missing, translation(1.0, 0.0, 0.0)).is_err());
    assert!(scene.set_instance_albedo(missing, [0.0; 4]).is_err());
    assert!(scene.set_instance_emission(missing, [0.0; 4]).is_err());
}

#[test]
fn empty_scene_records_nothing() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 0);
    device.clear_submissions();
    assert_eq!(update_and_submit(&mut ctx, &mut scene), UpdateOutcome::default());
    assert!(scene.acceleration_view().is_none());
    assert!(commands(&device.submissions()).is_empty());
}

#[test]
fn released_scene_index_view_waits_for_its_frame() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 2);
    let first = InstanceId::from_index(0);

    update_and_submit(&mut ctx, &mut scene);
    let old_view = scene.acceleration_view().unwrap();
    let old_structure = scene.top_level().unwrap().structure().id();

    scene.set_instance_transform(first, translation(0.0, 1.0, 0.0)).unwrap();
    update_and_submit(&mut ctx, &mut scene);
    let new_view = scene.acceleration_view().unwrap();
    assert_ne!(new_view, old_view);
    assert_ne!(scene.top_level().unwrap().structure().id(), old_structure);

    // The frame that released the old slot is still running.
    let spare = ctx.create_buffer(&BufferDescriptor { size: 16, ..Default::default() }).unwrap();
    let early = ctx.create_view(ResourceRef::Buffer(spare.as_ref()), &ViewDescriptor::read_only(), None).unwrap();
    assert_ne!(early, old_view);

    device.complete_all();
    ctx.poll().unwrap();
    let reused = ctx.create_view(ResourceRef::Buffer(spare.as_ref()), &ViewDescriptor::read_only(), None).unwrap();
    assert_eq!(reused, old_view);
    assert_no_violations(&device);
}

#[test]
fn instances_share_their_model() {
    let mut ctx = GpuContext::new(headless());
    let (cube, mut scene) = cube_scene(&mut ctx, 3);
    assert_eq!(scene.model_count(), 1);
    assert_eq!(Arc::strong_count(&cube), 2);

    let other = Arc::new(Model::from_mesh(&mut ctx, &cube_mesh()).unwrap());
    let id = scene.add_instance(&other, translation(9.0, 0.0, 0.0), [1.0; 4], [0.0; 4]).unwrap();
    assert_eq!(scene.model_count(), 2);
    assert!(Arc::ptr_eq(scene.model(id).unwrap(), &other));
    assert!(Arc::ptr_eq(scene.model(InstanceId::from_index(0)).unwrap(), &cube));
    assert!(matches!(scene.model(InstanceId::from_index(4)), Err(SceneError::UnknownInstance { id: 4 })));
}

#[test]
fn scene_keeps_models_alive_for_in_flight_work() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let (model, mut scene) = cube_scene(&mut ctx, 2);
    let bottom_level = model.bottom_level().device_address();
    drop(model);

    update_and_submit(&mut ctx, &mut scene);
    scene.set_instance_transform(InstanceId::from_index(1), translation(0.0, 3.0, 0.0)).unwrap();
    assert!(update_and_submit(&mut ctx, &mut scene).rebuilt);
    let contents = device.buffer_contents(scene.descriptor_buffer().unwrap()).unwrap();
    let descriptor: AccelerationStructureInstance = bytemuck::pod_read_unaligned(&contents[..64]);
    assert_eq!(descriptor.acceleration_structure_reference, bottom_level);
    assert_no_violations(&device);

    // Both rebuilds are still running: retiring must not free anything yet.
    scene.retire(&mut ctx);
    assert!(device.live_acceleration_structures() > 0);
    assert_no_violations(&device);

    // Retired objects follow the batch being recorded, here an empty next frame.
    let batch = ctx.begin_commands().unwrap();
    ctx.submit(batch).unwrap();
    ctx.wait_idle().unwrap();
    assert_eq!(device.live_acceleration_structures(), 0);
    assert_no_violations(&device);
}

#[test]
fn dropping_an_in_flight_scene_is_a_violation() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let (model, mut scene) = cube_scene(&mut ctx, 1);
    drop(model);
    update_and_submit(&mut ctx, &mut scene);
    drop(scene);
    assert!(!device.violations().is_empty());
}

#[test]
fn animated_scene_overlaps_frames_with_two_upload_slots() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let (model, _) = cube_scene(&mut ctx, 0);
    let mut scene = Scene::with_upload_slots(&mut ctx, 2).unwrap();
    scene.add_instance(&model, translation(0.0, 0.0, 0.0), [1.0; 4], [0.0; 4]).unwrap();
    let first = InstanceId::from_index(0);
    let settled = ctx.completed_submission();

    let mut stamps = Vec::new();
    let mut descriptor_buffers = Vec::new();
    for frame in 0..3 {
        scene.set_instance_transform(first, translation(frame as f32, 0.0, 0.0)).unwrap();
        update_and_submit(&mut ctx, &mut scene);
        stamps.push(ctx.submission_counter());
        descriptor_buffers.push(scene.descriptor_buffer().unwrap().id());
        if frame < 2 {
            assert_eq!(ctx.completed_submission(), settled, "frame {} waited on the GPU", frame);
        }
    }
    // The third update reuses the first slot, so it waits for the first frame only.
    assert_eq!(ctx.completed_submission(), stamps[0]);
    assert_ne!(descriptor_buffers[0], descriptor_buffers[1]);
    assert_eq!(descriptor_buffers[0], descriptor_buffers[2]);
    assert_eq!(scene.upload_slot_count(), 2);
    ctx.wait_idle().unwrap();
    assert_no_violations(&device);
}

#[test]
fn single_upload_slot_waits_for_the_previous_frame() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let (model, _) = cube_scene(&mut ctx, 0);
    let mut scene = Scene::with_upload_slots(&mut ctx, 1).unwrap();
    scene.add_instance(&model, translation(0.0, 0.0, 0.0), [1.0; 4], [0.0; 4]).unwrap();

    update_and_submit(&mut ctx, &mut scene);
    let previous = ctx.submission_counter();
    scene.set_instance_albedo(InstanceId::from_index(0), [0.5; 4]).unwrap();
    update_and_submit(&mut ctx, &mut scene);
    assert_eq!(ctx.completed_submission(), previous);
    ctx.wait_idle().unwrap();
}
