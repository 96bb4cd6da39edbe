//! Descriptor heap slot management through the public runtime surface.

use ash::vk;
use halcyon_gpu::driver::simulated::SimulatedAdapter;
use halcyon_gpu::driver::DescriptorWrite;
use halcyon_gpu::{GpuError, HeapConfig, HeapMode, ImageDesc, QueueKind, SamplerDesc};
use halcyon_test::{HarnessConfig, SimulatedHarness};
use parking_lot::Mutex;
use std::collections::HashSet;

fn sampled_image(name: &str) -> ImageDesc<'_> {
    ImageDesc {
        name,
        format: vk::Format::R8G8B8A8_UNORM,
        extent: vk::Extent2D {
            width: 8,
            height: 8,
        },
        mip_levels: 1,
        usage: vk::ImageUsageFlags::SAMPLED,
    }
}

#[test]
fn released_indices_come_back_last_in_first_out() {
    let harness = SimulatedHarness::new().unwrap();
    let heap = harness.context().heap();

    let a = heap.allocate_image_index().unwrap();
    let b = heap.allocate_image_index().unwrap();
    let c = heap.allocate_image_index().unwrap();
    assert_eq!((a, b, c), (0, 1, 2));

    heap.release_image_index(b);
    heap.release_image_index(c);
    assert_eq!(heap.allocate_image_index().unwrap(), c);
    assert_eq!(heap.allocate_image_index().unwrap(), b);
    assert_eq!(heap.allocate_image_index().unwrap(), 3);

    for index in [a, b, c, 3] {
        heap.release_image_index(index);
    }
    assert_eq!(heap.stats().images_live, 0);
    harness.finish().unwrap();
}

#[test]
fn concurrent_allocation_hands_out_unique_indices() {
    let harness = SimulatedHarness::new().unwrap();
    let heap = harness.context().heap();
    let live = Mutex::new(HashSet::new());

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for round in 0..200 {
                    let index = heap.allocate_image_index().unwrap();
                    assert!(live.lock().insert(index), "index {index} handed out twice");
                    if round % 3 == 0 {
                        assert!(live.lock().remove(&index));
                        heap.release_image_index(index);
                    }
                }
            });
        }
    });

    let live = live.into_inner();
    assert_eq!(heap.stats().images_live as usize, live.len());
    harness.finish().unwrap();
}

#[test]
fn sampled_images_publish_their_slot() {
    let harness = SimulatedHarness::new().unwrap();
    let context = harness.context();

    let image = context.create_image(&sampled_image("albedo")).unwrap();
    let sampler = context.create_sampler(&SamplerDesc::default()).unwrap();
    let index = image.bindless_index().unwrap();

    let writes = harness.driver().descriptor_writes();
    assert!(writes.contains(&DescriptorWrite::Image {
        index,
        view: image.view(),
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }));
    assert!(writes.contains(&DescriptorWrite::Sampler {
        index: sampler.bindless_index(),
        sampler: sampler.raw(),
    }));
    assert_eq!(context.stats().heap.images_live, 1);
    assert_eq!(context.stats().heap.samplers_live, 1);

    drop(image);
    drop(sampler);
    context.collect_garbage().unwrap();
    assert_eq!(context.stats().heap.images_live, 0);
    assert_eq!(context.stats().heap.samplers_live, 0);
    harness.finish().unwrap();
}

#[test]
fn slots_stay_reserved_while_work_is_in_flight() {
    let harness = SimulatedHarness::manual().unwrap();
    let context = harness.context();

    let first = context.create_image(&sampled_image("first")).unwrap();
    let index = first.bindless_index().unwrap();
    harness.submit_empty(QueueKind::Graphics).unwrap();
    drop(first);

    let second = context.create_image(&sampled_image("second")).unwrap();
    assert_ne!(second.bindless_index(), Some(index));

    harness.complete_all();
    context.collect_garbage().unwrap();
    let third = context.create_image(&sampled_image("third")).unwrap();
    assert_eq!(third.bindless_index(), Some(index));
    drop((second, third));
    harness.finish().unwrap();
}

#[test]
fn exhausted_heaps_report_the_region() {
    let harness = SimulatedHarness::with_adapter(
        SimulatedAdapter::discrete("tiny"),
        HarnessConfig {
            context: halcyon_gpu::ContextConfig {
                heap: HeapConfig {
                    image_capacity: 2,
                    sampler_capacity: 1,
                },
                ..HarnessConfig::default().context
            },
            ..Default::default()
        },
    )
    .unwrap();
    let heap = harness.context().heap();

    heap.allocate_image_index().unwrap();
    heap.allocate_image_index().unwrap();
    assert!(matches!(
        heap.allocate_image_index(),
        Err(GpuError::DescriptorHeapExhausted { capacity: 2, .. })
    ));
    harness.finish().unwrap();
}

#[test]
fn descriptor_sets_back_the_heap_without_descriptor_buffers() {
    let harness = SimulatedHarness::with_adapter(
        SimulatedAdapter::discrete("legacy")
            .without_extension(ash::ext::descriptor_buffer::NAME),
        HarnessConfig::default(),
    )
    .unwrap();
    assert!(!harness.context().caps().descriptor_buffer);
    assert_eq!(harness.context().heap().mode(), HeapMode::DescriptorSet);

    let image = harness
        .context()
        .create_image(&sampled_image("albedo"))
        .unwrap();
    assert_eq!(image.bindless_index(), Some(0));
    drop(image);
    harness.finish().unwrap();
}
