mod common;

use radiance_renderer::cascades::{CascadeConstants, RadianceCascades};
use radiance_renderer::{CascadeConfig, CascadeError, RendererError, TraceMode};
use radiance_rhi::headless::RecordedCommand;
use radiance_rhi::{GpuContext, ResourceState};

use common::*;

#[test]
fn four_levels_trace_fine_to_coarse_and_merge_coarse_to_fine() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 2);
    let mut cascades =
        RadianceCascades::new(&mut ctx, &kernel_library(), CascadeConfig::with_spacing([32, 32, 32], 4, 1.0)).unwrap();
    device.clear_submissions();

    let mut batch = ctx.begin_commands().unwrap();
    scene.update(&mut ctx, &mut batch).unwrap();
    let scene_index = scene.acceleration_view().unwrap();
    let views = cascades.generate(&mut ctx, &mut batch, scene_index, scene.instance_view()).unwrap();
    ctx.submit(batch).unwrap();

    assert_eq!(views.len(), 4);
    assert_eq!(views, cascades.read_views());
    let recorded = commands(&device.submissions());
    assert_eq!(
        rays(&recorded),
        vec![[512, 256, 32], [512, 256, 16], [512, 256, 8], [512, 256, 4]]
    );
    assert_eq!(dispatches(&recorded), vec![[128, 64, 2], [128, 64, 4], [128, 64, 8]]);

    let levels: Vec<u32> = dispatch_bindings(&recorded).iter().map(|words| words[0]).collect();
    assert_eq!(levels, vec![0, 1, 2, 3, 2, 1, 0]);

    for level in cascades.levels() {
        assert_eq!(device.resource_state(level.texture().id()), Some(ResourceState::ShaderRead));
    }
    assert_no_violations(&device);
}

#[test]
fn merge_reads_coarser_and_writes_finer() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 1);
    let mut cascades = RadianceCascades::new(&mut ctx, &kernel_library(), CascadeConfig::default()).unwrap();
    device.clear_submissions();

    let mut batch = ctx.begin_commands().unwrap();
    scene.update(&mut ctx, &mut batch).unwrap();
    cascades
        .generate(&mut ctx, &mut batch, scene.acceleration_view().unwrap(), scene.instance_view())
        .unwrap();
    ctx.submit(batch).unwrap();

    let bindings = dispatch_bindings(&commands(&device.submissions()));
    let levels = cascades.levels();
    // Merge bindings: level, constants, coarser read, finer read-write.
    for (words, finer) in bindings[4..].iter().zip([2usize, 1, 0]) {
        assert_eq!(words[1], cascades.constants_view().index());
        assert_eq!(words[2], levels[finer + 1].read_view().index());
        assert_eq!(words[3], levels[finer].write_view().index());
    }
}

#[test]
fn finest_only_still_moves_every_level() {
    let device = headless();
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 1);
    let mut config = CascadeConfig::with_spacing([8, 8, 8], 3, 1.0);
    config.trace_mode = TraceMode::FinestOnly;
    let mut cascades = RadianceCascades::new(&mut ctx, &kernel_library(), config).unwrap();
    device.clear_submissions();

    for _ in 0..2 {
        let mut batch = ctx.begin_commands().unwrap();
        scene.update(&mut ctx, &mut batch).unwrap();
        cascades
            .generate(&mut ctx, &mut batch, scene.acceleration_view().unwrap(), scene.instance_view())
            .unwrap();
        ctx.submit(batch).unwrap();
    }

    let recorded = commands(&device.submissions());
    assert_eq!(rays(&recorded).len(), 2);
    assert_eq!(dispatches(&recorded).len(), 4);
    let to_write = recorded
        .iter()
        .filter(|c| {
            matches!(
                c,
                RecordedCommand::Transition { after: ResourceState::UnorderedAccess, .. }
            )
        })
        .count();
    assert_eq!(to_write, 6);
    assert_no_violations(&device);
}

#[test]
fn constants_rewritten_only_when_changed() {
    let device = headless();
    device.set_auto_complete(false);
    let mut ctx = GpuContext::new(device.clone());
    let (_model, mut scene) = cube_scene(&mut ctx, 1);
    let mut cascades = RadianceCascades::new(&mut ctx, &kernel_library(), CascadeConfig::default()).unwrap();

    let mut frame = |ctx: &mut GpuContext, cascades: &mut RadianceCascades| -> u64 {
        let mut batch = ctx.begin_commands().unwrap();
        scene.update(ctx, &mut batch).unwrap();
        cascades
            .generate(ctx, &mut batch, scene.acceleration_view().unwrap(), scene.instance_view())
            .unwrap();
        let completed_while_recording = ctx.completed_submission();
        ctx.submit(batch).unwrap();
        completed_while_recording
    };

    let first = frame(&mut ctx, &mut cascades);
    let expected = CascadeConstants::from_config(cascades.config());
    assert_eq!(device.buffer_contents(cascades.constants_buffer()).unwrap()[..64], *bytemuck::bytes_of(&expected));

    // Unchanged constants: no wait on the frame that read them.
    let second = frame(&mut ctx, &mut cascades);
    assert_eq!(second, first);

    cascades.set_volume([64.0, 64.0, 64.0], [-32.0, -32.0, -32.0]);
    let third = frame(&mut ctx, &mut cascades);
    assert_eq!(third, ctx.submission_counter() - 1);
    let expected = CascadeConstants::from_config(cascades.config());
    assert_eq!(expected.offset, [-32.0; 3]);
    assert_eq!(device.buffer_contents(cascades.constants_buffer()).unwrap()[..64], *bytemuck::bytes_of(&expected));
    assert_eq!(cascades.generation_count(), 3);
}

#[test]
fn fewer_than_two_levels_is_rejected() {
    let mut ctx = GpuContext::new(headless());
    let result = RadianceCascades::new(&mut ctx, &kernel_library(), CascadeConfig::with_spacing([8, 8, 8], 1, 1.0));
    assert!(matches!(
        result,
        Err(RendererError::Cascade(CascadeError::TooFewLevels { count: 1 }))
    ));
}

#[test]
fn empty_probe_grid_is_rejected() {
    let mut ctx = GpuContext::new(headless());
    let result = RadianceCascades::new(&mut ctx, &kernel_library(), CascadeConfig::with_spacing([8, 0, 8], 3, 1.0));
    assert!(matches!(result, Err(RendererError::Cascade(CascadeError::EmptyLevel { .. }))));
}

#[test]
fn oversized_probe_grid_is_rejected() {
    let mut ctx = GpuContext::new(headless());
    let result =
        RadianceCascades::new(&mut ctx, &kernel_library(), CascadeConfig::with_spacing([1 << 29, 8, 8], 3, 1.0));
    assert!(matches!(result, Err(RendererError::Cascade(CascadeError::TooLarge { .. }))));
}
