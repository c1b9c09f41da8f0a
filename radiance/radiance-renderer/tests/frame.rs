mod common;

use radiance_renderer::{InstanceId, Renderer, RendererConfig, Scene};
use radiance_rhi::headless::RecordedCommand;
use radiance_rhi::ResourceState;
use render_api::ExtractedView;

use common::*;

fn view(width: u32, height: u32) -> ExtractedView {
    ExtractedView { viewport_size: (width, height), ..Default::default() }
}

#[test]
fn frame_records_update_cascades_and_shading_in_order() {
    let device = headless();
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), small_config()).unwrap();
    let (_model, mut scene) = cube_scene(renderer.context_mut(), 3);
    device.clear_submissions();

    let stats = renderer.render(&mut scene, &view(64, 32)).unwrap();
    assert_eq!(stats.frame, 0);
    assert!(stats.rebuilt_scene_index);
    assert!(stats.shaded);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].signal_value, stats.submission);
    let recorded = &submissions[0].commands;

    let copy = recorded.iter().position(|c| matches!(c, RecordedCommand::CopyBuffer { .. })).unwrap();
    let build = recorded
        .iter()
        .position(|c| matches!(c, RecordedCommand::BuildAccelerationStructure { .. }))
        .unwrap();
    let first_trace = recorded.iter().position(|c| matches!(c, RecordedCommand::DispatchRays(_))).unwrap();
    assert!(copy < build && build < first_trace);

    // 3 traces, then the shade pass over the output.
    assert_eq!(rays(recorded), vec![[128, 64, 8], [128, 64, 4], [128, 64, 2], [64, 32, 1]]);
    assert_eq!(dispatches(recorded).len(), 2);

    let output = renderer.output().texture().id();
    assert_eq!(
        recorded.last(),
        Some(&RecordedCommand::Transition {
            resource: output,
            before: ResourceState::UnorderedAccess,
            after: ResourceState::ShaderRead,
        })
    );
    assert_eq!(device.resource_state(output), Some(ResourceState::ShaderRead));
    assert_no_violations(&device);
    renderer.finish().unwrap();
}

#[test]
fn shade_binds_finest_radiance_and_output() {
    let device = headless();
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), small_config()).unwrap();
    let (_model, mut scene) = cube_scene(renderer.context_mut(), 1);
    device.clear_submissions();
    renderer.render(&mut scene, &view(64, 32)).unwrap();

    let bindings = dispatch_bindings(&commands(&device.submissions()));
    let shade = bindings.last().unwrap();
    assert_eq!(shade.len(), 6);
    assert_eq!(shade[1], scene.acceleration_view().unwrap().index());
    assert_eq!(shade[2], scene.instance_view().index());
    assert_eq!(shade[3], renderer.cascades().levels()[0].read_view().index());
    assert_eq!(shade[4], renderer.cascades().constants_view().index());
    assert_eq!(shade[5], renderer.output().write_view().index());
}

#[test]
fn identical_frames_skip_rebuild_but_still_generate() {
    let device = headless();
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), small_config()).unwrap();
    let (_model, mut scene) = cube_scene(renderer.context_mut(), 2);

    let first = renderer.render(&mut scene, &view(64, 32)).unwrap();
    device.clear_submissions();
    let second = renderer.render(&mut scene, &view(64, 32)).unwrap();

    assert!(first.rebuilt_scene_index);
    assert!(!second.rebuilt_scene_index);
    assert_eq!(second.frame, 1);
    assert_eq!(scene.rebuild_count(), 1);
    assert_eq!(renderer.cascades().generation_count(), 2);
    let recorded = commands(&device.submissions());
    assert!(!recorded.iter().any(|c| matches!(c, RecordedCommand::BuildAccelerationStructure { .. })));
    assert_eq!(rays(&recorded).len(), 4);
    assert_no_violations(&device);
}

#[test]
fn empty_scene_skips_lighting() {
    let device = headless();
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), small_config()).unwrap();
    let mut scene = Scene::new(renderer.context_mut()).unwrap();
    device.clear_submissions();

    let stats = renderer.render(&mut scene, &view(64, 32)).unwrap();
    assert!(!stats.shaded);
    assert!(!stats.rebuilt_scene_index);
    assert_eq!(renderer.cascades().generation_count(), 0);
    assert!(commands(&device.submissions()).is_empty());
}

#[test]
fn debug_pass_is_clamped_and_bound_to_the_chosen_level() {
    let device = headless();
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), small_config()).unwrap();
    let (_model, mut scene) = cube_scene(renderer.context_mut(), 1);

    renderer.visualize_cascade(Some(99));
    assert_eq!(renderer.debug_cascade(), Some(2));
    device.clear_submissions();
    renderer.render(&mut scene, &view(100, 30)).unwrap();

    let recorded = commands(&device.submissions());
    let dims = dispatches(&recorded);
    assert_eq!(dims.last(), Some(&[13, 4, 1]));
    let debug = dispatch_bindings(&recorded).last().cloned().unwrap();
    assert_eq!(debug[0], 2);
    assert_eq!(debug[3], renderer.cascades().levels()[2].read_view().index());
    assert!(recorded.iter().any(|c| matches!(
        c,
        RecordedCommand::UavBarrier { resource } if *resource == renderer.output().texture().id()
    )));
    assert_no_violations(&device);

    renderer.visualize_cascade(None);
    device.clear_submissions();
    renderer.render(&mut scene, &view(100, 30)).unwrap();
    assert_eq!(dispatches(&commands(&device.submissions())).len(), 2);
}

#[test]
fn viewport_change_recreates_output_in_place() {
    let device = headless();
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), small_config()).unwrap();
    let (_model, mut scene) = cube_scene(renderer.context_mut(), 1);
    renderer.render(&mut scene, &view(64, 32)).unwrap();
    let (read, write) = (renderer.output().read_view(), renderer.output().write_view());
    let old_texture = renderer.output().texture().id();

    device.clear_submissions();
    renderer.render(&mut scene, &view(320, 200)).unwrap();
    assert_eq!(renderer.output().size(), (320, 200));
    assert_ne!(renderer.output().texture().id(), old_texture);
    assert_eq!((renderer.output().read_view(), renderer.output().write_view()), (read, write));
    assert_eq!(rays(&commands(&device.submissions())).last(), Some(&[320, 200, 1]));
    assert_no_violations(&device);
}

#[test]
fn frames_in_flight_bound_allocator_use() {
    let device = headless();
    device.set_auto_complete(false);
    let config = RendererConfig { frames_in_flight: 2, ..small_config() };
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), config).unwrap();
    let (_model, mut scene) = cube_scene(renderer.context_mut(), 2);
    let first = InstanceId::from_index(0);

    for frame in 0..6u32 {
        scene.set_instance_transform(first, translation(frame as f32, 0.0, 0.0)).unwrap();
        renderer.render(&mut scene, &view(64, 32)).unwrap();
        let ctx = renderer.context();
        assert!(ctx.submission_counter() - ctx.completed_submission() <= 2);
        assert!(ctx.pending_allocator_count() <= 2);
    }
    assert_eq!(scene.rebuild_count(), 6);
    assert_no_violations(&device);
    renderer.finish().unwrap();
    assert_eq!(renderer.context().completed_submission(), renderer.context().submission_counter());
}

#[test]
fn created_scene_has_an_upload_slot_per_frame_in_flight() {
    let device = headless();
    device.set_auto_complete(false);
    let config = RendererConfig { frames_in_flight: 3, ..small_config() };
    let mut renderer = Renderer::new(device.clone(), &kernel_library(), config).unwrap();
    let (model, _) = cube_scene(renderer.context_mut(), 0);
    let mut scene = renderer.create_scene().unwrap();
    assert_eq!(scene.upload_slot_count(), 3);
    scene.add_instance(&model, translation(0.0, 0.0, 0.0), [1.0; 4], [0.0; 4]).unwrap();
    drop(model);

    let first = InstanceId::from_index(0);
    for frame in 0..4u32 {
        scene.set_instance_transform(first, translation(frame as f32, 0.0, 0.0)).unwrap();
        renderer.render(&mut scene, &view(64, 32)).unwrap();
    }
    scene.retire(renderer.context_mut());
    renderer.finish().unwrap();
    assert_no_violations(&device);
}
