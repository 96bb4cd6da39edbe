//! Device selection and capability negotiation.

use ash::vk;
use halcyon_gpu::capabilities::DeviceFeatures;
use halcyon_gpu::driver::simulated::{SimulatedAdapter, SimulatedBackend};
use halcyon_gpu::negotiate::{Capability, Requirement};
use halcyon_gpu::{CapabilityNegotiator, ContextBuilder, GpuError, QueueKind, RuntimeCaps};
use halcyon_test::{HarnessConfig, SimulatedHarness};

#[test]
fn partially_supported_groups_enable_nothing() {
    let adapter = SimulatedAdapter::discrete("sim")
        .without_feature(DeviceFeatures::SHADER_OBJECT)
        .build();
    let negotiated = CapabilityNegotiator::empty(false)
        .add_all(
            "shader object",
            Some(Capability::ShaderObject),
            [
                Requirement::Extension(ash::ext::shader_object::NAME),
                Requirement::Feature(DeviceFeatures::SHADER_OBJECT),
            ],
        )
        .add_all(
            "multiview",
            Some(Capability::Multiview),
            [Requirement::Feature(DeviceFeatures::MULTIVIEW)],
        )
        .negotiate(&[adapter])
        .unwrap();

    assert!(!negotiated.caps.shader_object);
    assert!(!negotiated.enabled.has_extension(ash::ext::shader_object::NAME));
    assert!(!negotiated.enabled.features.contains(DeviceFeatures::SHADER_OBJECT));
    assert!(negotiated.caps.multiview);
}

#[test]
fn full_adapters_enable_every_capability() {
    let harness = SimulatedHarness::new().unwrap();
    assert_eq!(
        harness.context().caps(),
        RuntimeCaps {
            descriptor_buffer: true,
            graphics_pipeline_library: true,
            host_image_copy: true,
            shader_object: true,
            multiview: true,
        }
    );
    harness.finish().unwrap();
}

#[test]
fn missing_required_items_fail_with_their_name() {
    let backend = SimulatedBackend::new([SimulatedAdapter::discrete("old")
        .without_feature(DeviceFeatures::TIMELINE_SEMAPHORE)]);
    match ContextBuilder::new().build_with(&backend) {
        Err(GpuError::MissingCapability(name)) => assert!(name.contains("timeline")),
        other => panic!("expected a missing capability, got {:?}", other.err()),
    }

    let backend = SimulatedBackend::new([
        SimulatedAdapter::discrete("vulkan 1.2").api_version(vk::API_VERSION_1_2)
    ]);
    assert!(matches!(
        ContextBuilder::new().build_with(&backend),
        Err(GpuError::MissingCapability(_))
    ));
    assert!(backend.driver().is_none(), "no device is opened after a failed negotiation");
}

#[test]
fn discrete_adapters_win_over_integrated_ones() {
    let backend = SimulatedBackend::new([
        SimulatedAdapter::integrated("igpu"),
        SimulatedAdapter::discrete("dgpu"),
    ]);
    let context = ContextBuilder::new().build_with(&backend).unwrap();
    assert_eq!(context.adapter().name, "dgpu");
}

#[test]
fn presentation_requirements_filter_adapters() {
    let backend = SimulatedBackend::new([SimulatedAdapter::discrete("headless").presentable(false)]);
    assert!(matches!(
        ContextBuilder::new()
            .require_presentation(true)
            .build_with(&backend),
        Err(GpuError::NoSuitableDevice)
    ));

    // Without the requirement the same adapter is fine.
    let context = ContextBuilder::new().build_with(&backend).unwrap();
    assert!(!context.adapter().can_present());
}

#[test]
fn single_family_devices_share_the_graphics_queue() {
    let harness = SimulatedHarness::with_adapter(
        SimulatedAdapter::discrete("single").single_queue_family(),
        HarnessConfig::default(),
    )
    .unwrap();
    let context = harness.context();

    assert!(context.negotiated().role(QueueKind::AsyncCompute).is_none());
    let compute = context.queue(QueueKind::AsyncCompute, 0).unwrap();
    let transfer = context.queue(QueueKind::Transfer, 0).unwrap();
    assert_eq!(compute.kind(), QueueKind::Graphics);
    assert_eq!(transfer.family(), context.graphics_queue().unwrap().family());
    harness.finish().unwrap();
}

#[test]
fn queue_counts_follow_the_configuration() {
    let mut config = HarnessConfig::default();
    config.context.queues_per_role = 3;
    let harness =
        SimulatedHarness::with_adapter(SimulatedAdapter::discrete("sim"), config).unwrap();
    let context = harness.context();

    let graphics = context.queues().filter(|q| q.kind() == QueueKind::Graphics).count();
    let compute = context
        .queues()
        .filter(|q| q.kind() == QueueKind::AsyncCompute)
        .count();
    let transfer = context.queues().filter(|q| q.kind() == QueueKind::Transfer).count();
    assert_eq!((graphics, compute, transfer), (3, 3, 2));
    assert!(context.queue(QueueKind::Graphics, 2).is_ok());
    assert!(context.queue(QueueKind::Graphics, 3).is_err());
    harness.finish().unwrap();
}
