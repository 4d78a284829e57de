// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end lifecycle of stage graphs on simulated hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camgraph::core::buffers::{
    AcquireHint, AllocationPolicy, BufferManager, BufferPosition, PlaneLayout, PoolGeometry,
};
use camgraph::core::frames::EntityKind;
use camgraph::core::selector::HoldSide;
use camgraph::core::topology::{EdgeSpec, StageSpec};
use camgraph::prelude::*;
use camgraph::{SimulatedBehavior, SimulatedStageProvider};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn default_pools() -> Arc<BufferPools> {
    let config = PipelineConfig::default();
    Arc::new(BufferPools::from_configs(&config.pools, Arc::new(HeapAllocator::new())).unwrap())
}

fn assert_all_free(pools: &BufferPools) {
    for name in pools.names() {
        let pool = pools.get(&name).unwrap();
        assert!(
            pool.positions().iter().all(|p| *p == BufferPosition::Free),
            "pool {} still has assigned buffers: {:?}",
            name,
            pool.positions()
        );
    }
}

fn start(factory: &mut GraphFrameFactory) {
    factory.build_graph().unwrap();
    factory.wire_pipeline_stages().unwrap();
    factory.prepare_stages().unwrap();
    factory.start_stages().unwrap();
}

/// capture -> process -> output, no regeneration.
fn linear_topology() -> Topology {
    Topology {
        mode: OperatingMode::NormalFront,
        stages: vec![
            StageSpec::new(StageId::SENSOR, "capture", EntityKind::OutputOnly)
                .with_dst_pool("sensor"),
            StageSpec::new(StageId::ISP, "process", EntityKind::InputOutput).with_dst_pool("yuv"),
            StageSpec::new(StageId::PREVIEW_SCALER, "output", EntityKind::InputOutput)
                .with_dst_pool("preview"),
        ],
        edges: vec![
            EdgeSpec::new(StageId::SENSOR, StageId::ISP),
            EdgeSpec::new(StageId::ISP, StageId::PREVIEW_SCALER),
        ],
        input_timeout_ms: 40,
        completion_timeout_ms: 500,
    }
}

#[test]
fn test_at_once_pool_exhausts_at_max() {
    let pool = BufferManager::new("sensor", Arc::new(HeapAllocator::new()));
    pool.configure(
        PoolGeometry::new(PlaneLayout::single(512, 32), 3, 5).with_policy(AllocationPolicy::AtOnce),
    )
    .unwrap();
    pool.allocate().unwrap();
    assert_eq!(pool.available_count(), 5);

    let handles: Vec<_> = (0..5)
        .map(|_| pool.acquire(AcquireHint::Next).unwrap())
        .collect();
    assert!(matches!(
        pool.acquire(AcquireHint::Next),
        Err(PipelineError::NoBufferAvailable { .. })
    ));

    for handle in handles {
        handle.release().unwrap();
    }
    assert_eq!(pool.available_count(), 5);
}

#[test]
fn test_single_frame_through_linear_graph() {
    let pools = default_pools();
    let mut factory = GraphFrameFactory::new(
        linear_topology(),
        Arc::clone(&pools),
        Arc::new(SimulatedStageProvider::new(SimulatedBehavior::with_latency(
            Duration::from_millis(2),
        ))),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    let id = factory.create_frame().unwrap();
    factory.enqueue_frame(id).unwrap();
    assert!(wait_until(Duration::from_secs(3), || factory.in_flight_count() == 0));

    for name in ["sensor", "yuv", "preview"] {
        let pool = pools.get(name).unwrap();
        assert_eq!(pool.count_in(BufferPosition::InHardware), 0, "{}", name);
    }
    for stage in [StageId::SENSOR, StageId::ISP, StageId::PREVIEW_SCALER] {
        assert_eq!(factory.stage_status(stage).unwrap().completed, 1);
    }

    factory.stop_stages().unwrap();
    assert_all_free(&pools);
}

#[test]
fn test_stop_with_frames_in_flight_returns_every_buffer() {
    let pools = default_pools();
    let mut factory = GraphFrameFactory::new(
        Topology::for_mode(OperatingMode::NormalBack, Duration::from_millis(10)),
        Arc::clone(&pools),
        Arc::new(SimulatedStageProvider::new(SimulatedBehavior::with_latency(
            Duration::from_millis(8),
        ))),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    assert!(wait_until(Duration::from_secs(3), || {
        factory
            .stage_status(StageId::PREVIEW_SCALER)
            .is_some_and(|s| s.completed >= 2)
    }));
    assert!(factory.in_flight_count() > 0);

    factory.stop_stages().unwrap();
    assert_eq!(factory.in_flight_count(), 0);
    assert_all_free(&pools);
    let held = factory.selector().unwrap();
    assert_eq!(held.hold_len(StageId::SENSOR, HoldSide::Destination), 0);
}

#[test]
fn test_failed_frames_are_retired() {
    let pools = default_pools();
    let mut behavior = SimulatedBehavior::default();
    behavior.fail_frames.insert(1);
    let provider = SimulatedStageProvider::new(SimulatedBehavior::default())
        .with_stage(StageId::ISP, behavior);
    let mut factory = GraphFrameFactory::new(
        linear_topology(),
        Arc::clone(&pools),
        Arc::new(provider),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    for _ in 0..3 {
        let id = factory.create_frame().unwrap();
        factory.enqueue_frame(id).unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || factory.in_flight_count() == 0));

    assert_eq!(factory.stage_status(StageId::ISP).unwrap().failed, 1);
    assert_eq!(factory.stage_status(StageId::PREVIEW_SCALER).unwrap().completed, 2);
    factory.stop_stages().unwrap();
    assert_all_free(&pools);
}

#[test]
fn test_unrequested_optional_stage_is_bypassed() {
    let pools = default_pools();
    let mut factory = GraphFrameFactory::new(
        Topology::for_mode(OperatingMode::NormalBack, Duration::from_millis(10)),
        Arc::clone(&pools),
        Arc::new(SimulatedStageProvider::default()),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    assert!(wait_until(Duration::from_secs(3), || {
        factory
            .stage_status(StageId::SCC)
            .is_some_and(|s| s.bypassed >= 2)
    }));
    assert_eq!(factory.stage_status(StageId::SCC).unwrap().dispatched, 0);

    factory.set_request(StageId::SCC, true).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        factory
            .stage_status(StageId::SCC)
            .is_some_and(|s| s.completed >= 1)
    }));

    factory.stop_stages().unwrap();
    assert_all_free(&pools);
}

#[test]
fn test_stalled_request_is_withdrawn_and_later_frames_complete() {
    let pools = default_pools();
    let mut isp = SimulatedBehavior::default();
    isp.stall_frames.insert(0);
    let provider = Arc::new(
        SimulatedStageProvider::new(SimulatedBehavior::default()).with_stage(StageId::ISP, isp),
    );
    let mut topology = linear_topology();
    topology.completion_timeout_ms = 100;
    let mut factory = GraphFrameFactory::new(
        topology,
        Arc::clone(&pools),
        provider.clone(),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    for _ in 0..4 {
        let id = factory.create_frame().unwrap();
        factory.enqueue_frame(id).unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || factory.in_flight_count() == 0));

    let isp = factory.stage_status(StageId::ISP).unwrap();
    assert_eq!((isp.completed, isp.failed), (3, 1));
    assert_eq!(factory.stage_status(StageId::PREVIEW_SCALER).unwrap().completed, 3);
    assert_eq!(provider.stats(StageId::ISP).unwrap().cancelled, 1);
    assert_eq!(pools.get("yuv").unwrap().count_in(BufferPosition::InHardware), 0);

    factory.stop_stages().unwrap();
    assert_all_free(&pools);
}

#[test]
fn test_wedged_request_keeps_its_buffer_until_stop() {
    let pools = default_pools();
    let mut isp = SimulatedBehavior::default();
    isp.wedged_frames.insert(0);
    let provider = SimulatedStageProvider::new(SimulatedBehavior::default())
        .with_stage(StageId::ISP, isp);
    let mut topology = linear_topology();
    topology.completion_timeout_ms = 60;
    let mut factory = GraphFrameFactory::new(
        topology,
        Arc::clone(&pools),
        Arc::new(provider),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    for _ in 0..2 {
        let id = factory.create_frame().unwrap();
        factory.enqueue_frame(id).unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || factory.in_flight_count() == 0));
    assert_eq!(factory.stage_status(StageId::ISP).unwrap().failed, 2);

    // Frame 0's destination is still queued to the device.
    let yuv = pools.get("yuv").unwrap();
    assert_eq!(yuv.count_in(BufferPosition::InHardware), 1);
    assert_eq!(yuv.count_in(BufferPosition::InHal), 0);

    factory.stop_stages().unwrap();
    assert_all_free(&pools);
}

#[test]
fn test_boosted_stage_reruns_on_held_frame() {
    let pools = default_pools();
    let provider = Arc::new(SimulatedStageProvider::new(SimulatedBehavior::with_latency(
        Duration::from_millis(1),
    )));
    let mut topology = linear_topology();
    topology.stages[0].hold = Some(HoldSide::Destination);
    let mut factory = GraphFrameFactory::new(
        topology,
        Arc::clone(&pools),
        provider.clone(),
        FactoryOptions::default(),
    )
    .unwrap();
    start(&mut factory);

    let id = factory.create_frame().unwrap();
    factory.enqueue_frame(id).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        factory
            .stage_status(StageId::PREVIEW_SCALER)
            .is_some_and(|s| s.completed == 1)
    }));
    let selector = Arc::clone(factory.selector().unwrap());
    assert_eq!(selector.held_ids(StageId::SENSOR, HoldSide::Destination), vec![id]);
    let yuv = pools.get("yuv").unwrap();
    assert_eq!(yuv.stats().released, 0);

    factory.boost_frame(id, StageId::ISP).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        factory
            .stage_status(StageId::ISP)
            .is_some_and(|s| s.completed == 2)
    }));
    assert_eq!(yuv.stats().released, 1);
    assert_eq!(yuv.count_in(BufferPosition::InHal), 1);
    assert_eq!(yuv.count_in(BufferPosition::InHardware), 0);
    assert_eq!(provider.stats(StageId::SENSOR).unwrap().enqueued, 1);
    assert_eq!(provider.stats(StageId::ISP).unwrap().enqueued, 2);
    assert!(factory.store().contains(id));

    let selected = selector
        .select_frames(1, StageId::SENSOR, HoldSide::Destination, 0)
        .unwrap();
    assert_eq!(selected, id);
    selector.finish_selected(selected);
    assert!(wait_until(Duration::from_secs(1), || factory.in_flight_count() == 0));
    assert_all_free(&pools);

    factory.stop_stages().unwrap();
    assert_all_free(&pools);
}
