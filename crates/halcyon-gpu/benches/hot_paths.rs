use ash::vk;
use criterion::{criterion_group, criterion_main, Criterion};
use halcyon_gpu::driver::simulated::{SimulatedAdapter, SimulatedBackend};
use halcyon_gpu::pipeline::ColorFormats;
use halcyon_gpu::shader::SPIRV_MAGIC;
use halcyon_gpu::{ContextBuilder, GraphicsState, ShaderSet};
use std::hint::black_box;

fn spirv(tag: u32) -> Vec<u32> {
    vec![SPIRV_MAGIC, 0x0001_0600, tag]
}

fn bench_pipeline_lookup(c: &mut Criterion) {
    let backend = SimulatedBackend::new([SimulatedAdapter::discrete("bench")]);
    let context = ContextBuilder::new().build_with(&backend).unwrap();
    let vertex = context
        .register_shader(vk::ShaderStageFlags::VERTEX, "main", &spirv(1))
        .unwrap();
    let fragment = context
        .register_shader(vk::ShaderStageFlags::FRAGMENT, "main", &spirv(2))
        .unwrap();
    let set = ShaderSet::new(vertex, Some(fragment)).unwrap();
    let state = GraphicsState {
        color_formats: ColorFormats::new(&[vk::Format::B8G8R8A8_SRGB]).unwrap(),
        ..Default::default()
    };
    context.pipelines().graphics_pipeline(&set, &state).unwrap();

    c.bench_function("pipeline_cache_hit", |b| {
        b.iter(|| {
            let pipeline = context
                .pipelines()
                .graphics_pipeline(black_box(&set), black_box(&state))
                .unwrap();
            black_box(pipeline);
        })
    });
}

fn bench_heap_slots(c: &mut Criterion) {
    let backend = SimulatedBackend::new([SimulatedAdapter::discrete("bench")]);
    let context = ContextBuilder::new().build_with(&backend).unwrap();
    let heap = context.heap();

    c.bench_function("heap_image_slot_cycle", |b| {
        b.iter(|| {
            let index = heap.allocate_image_index().unwrap();
            heap.release_image_index(black_box(index));
        })
    });
}

criterion_group!(benches, bench_pipeline_lookup, bench_heap_slots);
criterion_main!(benches);
