//! Pipeline caching in both compilation modes.

use ash::vk;
use halcyon_gpu::driver::simulated::{PipelineRecord, RecordedCommand, SimulatedAdapter};
use halcyon_gpu::{
    ColorAttachment, LoadOp, PipelineMode, QueueKind, RenderingDesc, SubmitInfo,
};
use halcyon_test::{color_state, HarnessConfig, SimulatedHarness};

fn without(extensions: &[&std::ffi::CStr]) -> SimulatedHarness {
    let adapter = extensions
        .iter()
        .fold(SimulatedAdapter::discrete("simulated"), |adapter, name| {
            adapter.without_extension(name)
        });
    SimulatedHarness::with_adapter(adapter, HarnessConfig::default()).unwrap()
}

fn linked_count(records: &[PipelineRecord]) -> usize {
    records
        .iter()
        .filter(|record| matches!(record, PipelineRecord::Linked(_)))
        .count()
}

#[test]
fn repeated_requests_hit_the_linked_cache() {
    let harness = SimulatedHarness::new().unwrap();
    let cache = harness.context().pipelines();
    assert_eq!(cache.mode(), PipelineMode::Library);

    let set = harness.shader_set(1, 2).unwrap();
    let state = color_state(vk::Format::B8G8R8A8_SRGB);
    let first = cache.graphics_pipeline(&set, &state).unwrap();
    for _ in 0..10 {
        assert_eq!(cache.graphics_pipeline(&set, &state).unwrap(), first);
    }

    let stats = cache.stats();
    assert_eq!(stats.graphics.misses, 1);
    assert_eq!(stats.graphics.hits, 10);
    assert_eq!(linked_count(&harness.driver().pipeline_records()), 1);
    harness.finish().unwrap();
}

#[test]
fn output_changes_reuse_the_other_fragments() {
    let harness = SimulatedHarness::new().unwrap();
    let cache = harness.context().pipelines();
    let set = harness.shader_set(1, 2).unwrap();

    let srgb = cache
        .graphics_pipeline(&set, &color_state(vk::Format::B8G8R8A8_SRGB))
        .unwrap();
    let hdr = cache
        .graphics_pipeline(&set, &color_state(vk::Format::R16G16B16A16_SFLOAT))
        .unwrap();
    assert_ne!(srgb, hdr);

    let stats = cache.stats();
    assert_eq!(stats.fragment_entries(), 5);
    assert_eq!(stats.vertex_input.hits, 1);
    assert_eq!(stats.pre_rasterization.hits, 1);
    assert_eq!(stats.fragment_shader.hits, 1);
    assert_eq!(stats.fragment_output.misses, 2);
    assert_eq!(stats.graphics.entries, 2);

    let fragments = harness
        .driver()
        .pipeline_records()
        .iter()
        .filter(|record| matches!(record, PipelineRecord::Fragment(_)))
        .count();
    assert_eq!(fragments, 5);
    harness.finish().unwrap();
}

#[test]
fn fragment_shader_changes_reuse_the_other_fragments() {
    let harness = SimulatedHarness::new().unwrap();
    let cache = harness.context().pipelines();
    let state = color_state(vk::Format::B8G8R8A8_SRGB);

    let lit = cache
        .graphics_pipeline(&harness.shader_set(1, 2).unwrap(), &state)
        .unwrap();
    let unlit = cache
        .graphics_pipeline(&harness.shader_set(1, 3).unwrap(), &state)
        .unwrap();
    assert_ne!(lit, unlit);

    let stats = cache.stats();
    assert_eq!(stats.vertex_input.hits, 1);
    assert_eq!(stats.pre_rasterization.hits, 1);
    assert_eq!(stats.fragment_output.hits, 1);
    assert_eq!(stats.fragment_shader.misses, 2);
    assert_eq!(stats.graphics.entries, 2);
    assert_eq!(stats.fragment_entries(), 5);
    harness.finish().unwrap();
}

#[test]
fn concurrent_requests_compile_once() {
    let harness = SimulatedHarness::new().unwrap();
    let cache = harness.context().pipelines();
    let set = harness.shader_set(3, 4).unwrap();
    let state = color_state(vk::Format::R8G8B8A8_UNORM);

    let pipelines: Vec<vk::Pipeline> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| cache.graphics_pipeline(&set, &state).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(pipelines.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(cache.stats().graphics.entries, 1);
    assert_eq!(linked_count(&harness.driver().pipeline_records()), 1);
    harness.finish().unwrap();
}

#[test]
fn missing_pipeline_library_falls_back_to_whole_pipelines() {
    let harness = without(&[ash::ext::graphics_pipeline_library::NAME]);
    let context = harness.context();
    assert!(!context.caps().graphics_pipeline_library);
    assert_eq!(context.pipelines().mode(), PipelineMode::Monolithic);

    let set = harness.shader_set(1, 2).unwrap();
    for format in [vk::Format::B8G8R8A8_SRGB, vk::Format::R16G16B16A16_SFLOAT] {
        context
            .pipelines()
            .graphics_pipeline(&set, &color_state(format))
            .unwrap();
        context
            .pipelines()
            .graphics_pipeline(&set, &color_state(format))
            .unwrap();
    }

    let records = harness.driver().pipeline_records();
    assert_eq!(records, vec![PipelineRecord::Monolithic; 2]);
    let stats = context.pipelines().stats();
    assert_eq!(stats.fragment_entries(), 0);
    assert_eq!(stats.graphics.hits, 2);
    harness.finish().unwrap();
}

#[test]
fn draws_resolve_pipelines_without_shader_objects() {
    let harness = without(&[ash::ext::shader_object::NAME]);
    let context = harness.context();
    assert!(!context.caps().shader_object);

    let set = harness.shader_set(5, 6).unwrap();
    let target = context
        .create_image(&halcyon_gpu::ImageDesc {
            name: "target",
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            mip_levels: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        })
        .unwrap();

    let queue = context.queue(QueueKind::Graphics, 0).unwrap();
    let mut list = queue.begin().unwrap();
    list.begin_rendering(&RenderingDesc {
        extent: target.extent(),
        colors: &[ColorAttachment {
            view: target.view(),
            format: target.format(),
            load: LoadOp::Clear([0.0; 4]),
            store: true,
        }],
        depth: None,
        view_mask: 0,
    })
    .unwrap();
    list.set_viewport(target.extent()).unwrap();
    list.bind_shaders(&set).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.end_rendering().unwrap();
    let cmd = list.raw();
    queue.submit(vec![list], SubmitInfo::default()).unwrap();

    let recorded = harness.driver().recorded(cmd);
    let binds = recorded
        .iter()
        .filter(|command| {
            matches!(
                command,
                RecordedCommand::BindPipeline(vk::PipelineBindPoint::GRAPHICS, _)
            )
        })
        .count();
    assert_eq!(binds, 1, "a pipeline is bound once while state is unchanged");
    let draws = recorded
        .iter()
        .filter(|command| matches!(command, RecordedCommand::Draw { .. }))
        .count();
    assert_eq!(draws, 2);
    assert_eq!(context.pipelines().stats().graphics.entries, 1);

    drop(target);
    harness.finish().unwrap();
}

#[test]
fn compute_pipelines_are_cached_per_shader() {
    let harness = without(&[ash::ext::shader_object::NAME]);
    let context = harness.context();
    let shader = harness.compute_shader(9).unwrap();

    let a = context.pipelines().compute_pipeline(&shader).unwrap();
    let b = context.pipelines().compute_pipeline(&shader).unwrap();
    assert_eq!(a, b);

    let queue = context.queue(QueueKind::AsyncCompute, 0).unwrap();
    let mut list = queue.begin().unwrap();
    list.bind_compute_shader(&shader).unwrap();
    list.dispatch(8, 8, 1).unwrap();
    queue.submit(vec![list], SubmitInfo::default()).unwrap();

    let stats = context.pipelines().stats();
    assert_eq!(stats.compute.entries, 1);
    assert_eq!(stats.compute.misses, 1);
    assert_eq!(stats.compute.hits, 2);
    harness.finish().unwrap();
}
