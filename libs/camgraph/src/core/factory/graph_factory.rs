// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{FactoryState, FrameBuilder, FrameFactory};
use crate::core::buffers::BufferPools;
use crate::core::dispatch::{DispatchTiming, StageContext, StageStatus, StageThread};
use crate::core::frames::{Frame, FrameId, FrameStore, FrameType, StageId, recycle_frame};
use crate::core::selector::{FrameSelector, SelectorConfig};
use crate::core::stage::{FrameQueue, PipelineStage, StageDriver, StageDriverProvider};
use crate::core::topology::{DEFAULT_QUEUE_DEPTH, Topology};
use crate::core::{PipelineError, Result};

/// Knobs a factory takes beyond its topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryOptions {
    pub name: String,
    pub selector: SelectorConfig,
    pub acquire_retries: u32,
    pub acquire_backoff: Duration,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            selector: SelectorConfig::default(),
            acquire_retries: 3,
            acquire_backoff: Duration::from_millis(5),
        }
    }
}

/// Builds and runs any [`Topology`] on stage threads.
pub struct GraphFrameFactory {
    name: String,
    state: FactoryState,
    topology: Arc<Topology>,
    pools: Arc<BufferPools>,
    provider: Arc<dyn StageDriverProvider>,
    store: Arc<FrameStore>,
    builder: Arc<FrameBuilder>,
    selector: Option<Arc<FrameSelector>>,
    selector_config: SelectorConfig,
    timing: DispatchTiming,
    prepared: bool,
    stages: BTreeMap<StageId, PipelineStage>,
    drivers: BTreeMap<StageId, Box<dyn StageDriver>>,
    threads: BTreeMap<StageId, StageThread>,
    statuses: BTreeMap<StageId, Arc<Mutex<StageStatus>>>,
}

impl GraphFrameFactory {
    pub fn new(
        topology: Topology,
        pools: Arc<BufferPools>,
        provider: Arc<dyn StageDriverProvider>,
        options: FactoryOptions,
    ) -> Result<Self> {
        let topology = Arc::new(topology);
        let store = FrameStore::new(options.name.clone());
        let builder = Arc::new(FrameBuilder::new(Arc::clone(&topology), Arc::clone(&store))?);
        let timing = DispatchTiming::from_topology(
            &topology,
            options.acquire_retries,
            options.acquire_backoff,
        );
        tracing::debug!(
            "[{}] factory created for {:?} ({} stages)",
            options.name,
            topology.mode,
            topology.stages.len()
        );
        Ok(Self {
            name: options.name,
            state: FactoryState::Created,
            topology,
            pools,
            provider,
            store,
            builder,
            selector: None,
            selector_config: options.selector,
            timing,
            prepared: false,
            stages: BTreeMap::new(),
            drivers: BTreeMap::new(),
            threads: BTreeMap::new(),
            statuses: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn builder(&self) -> &Arc<FrameBuilder> {
        &self.builder
    }

    pub fn pools(&self) -> &Arc<BufferPools> {
        &self.pools
    }

    /// Present once the graph is built, if any stage holds frames.
    pub fn selector(&self) -> Option<&Arc<FrameSelector>> {
        self.selector.as_ref()
    }

    pub fn stage_status(&self, stage: StageId) -> Option<StageStatus> {
        self.statuses.get(&stage).map(|s| *s.lock())
    }

    pub fn in_flight_count(&self) -> usize {
        self.store.in_flight_count()
    }

    fn expect_state(&self, allowed: &[FactoryState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::Runtime(format!(
                "[{}] cannot {} in state {:?}",
                self.name, action, self.state
            )))
        }
    }

    fn input_queue(&self, stage: StageId) -> Result<&FrameQueue> {
        self.stages
            .get(&stage)
            .map(|s| &s.input)
            .ok_or_else(|| PipelineError::Runtime(format!("[{}] {} is not wired", self.name, stage)))
    }

    /// Request flag for `stage` in frames created from now on.
    pub fn set_request(&self, stage: StageId, requested: bool) -> Result<()> {
        self.builder.set_request(stage, requested)
    }

    /// Re-run `stage` on an in-flight frame, e.g. to add a still output to a
    /// preview frame after the fact.
    pub fn boost_frame(&self, id: FrameId, stage: StageId) -> Result<()> {
        self.expect_state(&[FactoryState::Running], "boost a frame")?;
        let previous = self.store.with_frame_mut(id, |frame| frame.rework(stage))??;
        if let Some(handle) = previous {
            handle.release()?;
        }
        tracing::debug!("[{}] boosting {} on frame {}", self.name, stage, id);
        self.input_queue(stage)?.push(id, self.timing.input_timeout)
    }

    /// Register an externally built frame and feed it to its root stages.
    pub fn submit_frame(&self, frame: Frame) -> Result<FrameId> {
        let id = frame.id();
        self.store.insert(frame)?;
        if let Err(e) = self.enqueue_frame(id) {
            if let Some(frame) = self.store.abandon(id) {
                recycle_frame(frame);
            }
            return Err(e);
        }
        Ok(id)
    }

    fn spawn_threads(&mut self) -> Result<()> {
        for stage in self.topology.teardown_order()? {
            let driver = self.drivers.remove(&stage).ok_or_else(|| {
                PipelineError::Runtime(format!("[{}] no driver for {}", self.name, stage))
            })?;
            let pipeline_stage = self.stages.get(&stage).cloned().ok_or_else(|| {
                PipelineError::Runtime(format!("[{}] {} is not wired", self.name, stage))
            })?;
            let status = Arc::new(Mutex::new(StageStatus::default()));
            self.statuses.insert(stage, Arc::clone(&status));
            let ctx = StageContext {
                stage: pipeline_stage,
                store: Arc::clone(&self.store),
                builder: Arc::clone(&self.builder),
                selector: self.selector.clone(),
                timing: self.timing,
                status,
            };
            let thread = StageThread::spawn(ctx, driver)?;
            self.threads.insert(stage, thread);
        }
        Ok(())
    }

    /// Join stage threads children-first and reclaim their drivers.
    fn join_threads(&mut self) -> Result<()> {
        let mut first_error = None;
        for stage in self.topology.teardown_order()? {
            let Some(thread) = self.threads.remove(&stage) else {
                continue;
            };
            match thread.join() {
                Ok(driver) => {
                    self.drivers.insert(stage, driver);
                }
                Err(e) => {
                    tracing::error!("[{}] {}: {}", self.name, stage, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Return every frame and buffer the graph still holds.
    fn drain(&mut self) {
        for stage in self.stages.values() {
            let dropped = stage.input.drain();
            if !dropped.is_empty() {
                tracing::debug!(
                    "[{}] dropping {} frames queued for {}",
                    self.name,
                    dropped.len(),
                    stage.name()
                );
            }
        }
        if let Some(selector) = &self.selector {
            selector.release();
        }
        for frame in self.store.drain_all() {
            recycle_frame(frame);
        }
        let busy = self.pools.busy_count();
        if busy > 0 {
            tracing::warn!("[{}] {} buffers still assigned after stop", self.name, busy);
        }
    }

    fn stop_drivers(&mut self) {
        for (stage, driver) in &mut self.drivers {
            if let Err(e) = driver.stop() {
                tracing::warn!("[{}] stopping {}: {}", self.name, stage, e);
            }
        }
    }
}

impl FrameFactory for GraphFrameFactory {
    fn state(&self) -> FactoryState {
        self.state
    }

    fn build_graph(&mut self) -> Result<()> {
        self.expect_state(&[FactoryState::Created], "build the graph")?;
        self.topology.validate()?;
        for pool in self.topology.pool_names() {
            self.pools.require(&pool)?;
        }

        let mut drivers = BTreeMap::new();
        for stage in self.topology.topological_order()? {
            let spec = self.topology.require_stage(stage)?;
            drivers.insert(stage, self.provider.create(spec)?);
        }
        self.drivers = drivers;

        if !self.topology.held_stages().is_empty() {
            self.selector = Some(Arc::new(FrameSelector::new(
                self.name.clone(),
                Arc::clone(&self.store),
                self.selector_config.clone(),
            )));
        }

        self.state = FactoryState::Built;
        tracing::info!(
            "[{}] graph built: {:?}",
            self.name,
            self.topology.topological_order()?
        );
        Ok(())
    }

    fn wire_pipeline_stages(&mut self) -> Result<()> {
        self.expect_state(&[FactoryState::Built], "wire stages")?;

        let mut inputs = BTreeMap::new();
        for spec in &self.topology.stages {
            let depth = self
                .topology
                .edges
                .iter()
                .find(|e| e.to == spec.id)
                .map_or(DEFAULT_QUEUE_DEPTH, |e| e.queue_depth);
            inputs.insert(spec.id, FrameQueue::new(format!("{}.in", spec.name), depth));
        }

        let mut stages = BTreeMap::new();
        for spec in &self.topology.stages {
            let outputs = self
                .topology
                .children_of(spec.id)
                .into_iter()
                .filter_map(|edge| inputs.get(&edge.to).map(|q| (edge.to, q.clone())))
                .collect();
            let dst_pool = match &spec.dst_pool {
                Some(name) => Some(self.pools.require(name)?),
                None => None,
            };
            let input = inputs.get(&spec.id).cloned().ok_or_else(|| {
                PipelineError::Runtime(format!("[{}] no input queue for {}", self.name, spec.id))
            })?;
            stages.insert(
                spec.id,
                PipelineStage {
                    spec: spec.clone(),
                    input,
                    outputs,
                    dst_pool,
                },
            );
        }
        self.stages = stages;
        self.state = FactoryState::Wired;
        tracing::debug!("[{}] {} stages wired", self.name, self.stages.len());
        Ok(())
    }

    fn prepare_stages(&mut self) -> Result<()> {
        self.expect_state(&[FactoryState::Wired], "prepare stages")?;
        for (id, driver) in &mut self.drivers {
            let stage = self.stages.get(id).ok_or_else(|| {
                PipelineError::Runtime(format!("[{}] {} is not wired", self.name, id))
            })?;
            let slots = stage
                .dst_pool
                .as_ref()
                .map_or(stage.input.capacity(), |pool| pool.allocated_count().max(1));
            driver.prepare(slots)?;
        }
        self.prepared = true;
        Ok(())
    }

    fn start_stages(&mut self) -> Result<()> {
        self.expect_state(&[FactoryState::Wired, FactoryState::Stopped], "start stages")?;
        if !self.prepared {
            return Err(PipelineError::Runtime(format!(
                "[{}] start before prepare",
                self.name
            )));
        }

        tracing::info!("[{}] Starting stages...", self.name);
        for stage in self.topology.teardown_order()? {
            if let Some(driver) = self.drivers.get_mut(&stage) {
                if let Err(e) = driver.start() {
                    self.stop_drivers();
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.spawn_threads() {
            self.state = FactoryState::Running;
            if let Err(stop_err) = self.stop_stages() {
                tracing::warn!("[{}] cleanup after failed start: {}", self.name, stop_err);
            }
            return Err(e);
        }
        self.state = FactoryState::Running;

        for stage in self.topology.stages.iter().filter(|s| s.regenerate) {
            let id = self.builder.create_frame(FrameType::Preview)?;
            self.input_queue(stage.id)?.push(id, self.timing.input_timeout)?;
        }
        tracing::info!("[{}] Stages running", self.name);
        Ok(())
    }

    fn stop_stages(&mut self) -> Result<()> {
        match self.state {
            FactoryState::Stopped => {
                tracing::debug!("[{}] already stopped", self.name);
                return Ok(());
            }
            FactoryState::Running => {}
            other => {
                return Err(PipelineError::Runtime(format!(
                    "[{}] cannot stop stages in state {:?}",
                    self.name, other
                )));
            }
        }

        tracing::info!("[{}] Stopping stages...", self.name);
        let joined = self.join_threads();
        self.drain();
        self.state = FactoryState::Stopped;
        tracing::info!(
            "[{}] Stages stopped ({} frames in flight)",
            self.name,
            self.store.in_flight_count()
        );
        joined
    }

    fn create_frame(&self) -> Result<FrameId> {
        self.builder.create_frame(FrameType::Preview)
    }

    fn create_frame_for_stage_only(&self, stage: StageId) -> Result<FrameId> {
        self.builder
            .create_frame_for_stage_only(stage, FrameType::Internal)
    }

    fn generate_frame(&self, hint: Option<u64>) -> Result<FrameId> {
        if let Some(hint) = hint {
            let id = FrameId(hint);
            if self.store.contains(id) {
                return Ok(id);
            }
            self.store.advance_to(hint);
        }
        self.create_frame()
    }

    fn enqueue_frame(&self, id: FrameId) -> Result<()> {
        self.expect_state(&[FactoryState::Wired, FactoryState::Running], "enqueue a frame")?;
        let roots = self.store.with_frame(id, Frame::roots)?;
        for root in roots {
            self.input_queue(root)?.push(id, self.timing.input_timeout)?;
        }
        Ok(())
    }
}

impl Drop for GraphFrameFactory {
    fn drop(&mut self) {
        if self.state == FactoryState::Running {
            if let Err(e) = self.stop_stages() {
                tracing::error!("[{}] stop on drop failed: {}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for GraphFrameFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFrameFactory")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("mode", &self.topology.mode)
            .field("in_flight", &self.store.in_flight_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::{BufferPoolConfig, HeapAllocator, PlaneLayout, PoolGeometry};
    use crate::core::frames::EntityKind;
    use crate::core::stage::{SimulatedBehavior, SimulatedStageProvider};
    use crate::core::topology::{EdgeSpec, OperatingMode, StageSpec};
    use std::time::Instant;

    fn linear_topology() -> Topology {
        Topology {
            mode: OperatingMode::NormalFront,
            stages: vec![
                StageSpec::new(StageId::SENSOR, "sensor", EntityKind::OutputOnly)
                    .with_dst_pool("raw"),
                StageSpec::new(StageId::ISP, "isp", EntityKind::InputOutput).with_dst_pool("yuv"),
                StageSpec::new(StageId::PREVIEW_SCALER, "preview", EntityKind::InputOutput)
                    .with_dst_pool("preview"),
            ],
            edges: vec![
                EdgeSpec::new(StageId::SENSOR, StageId::ISP),
                EdgeSpec::new(StageId::ISP, StageId::PREVIEW_SCALER),
            ],
            input_timeout_ms: 50,
            completion_timeout_ms: 500,
        }
    }

    fn pools() -> Arc<BufferPools> {
        let configs: Vec<BufferPoolConfig> = ["raw", "yuv", "preview"]
            .iter()
            .map(|name| BufferPoolConfig {
                name: name.to_string(),
                geometry: PoolGeometry::new(PlaneLayout::single(64, 8), 4, 4),
            })
            .collect();
        Arc::new(BufferPools::from_configs(&configs, Arc::new(HeapAllocator::new())).unwrap())
    }

    fn factory(behavior: SimulatedBehavior) -> GraphFrameFactory {
        GraphFrameFactory::new(
            linear_topology(),
            pools(),
            Arc::new(SimulatedStageProvider::new(behavior)),
            FactoryOptions::default(),
        )
        .unwrap()
    }

    fn running(behavior: SimulatedBehavior) -> GraphFrameFactory {
        let mut factory = factory(behavior);
        factory.build_graph().unwrap();
        factory.wire_pipeline_stages().unwrap();
        factory.prepare_stages().unwrap();
        factory.start_stages().unwrap();
        factory
    }

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

    #[test]
    fn test_lifecycle_order_enforced() {
        let mut factory = factory(SimulatedBehavior::default());
        assert!(factory.stop_stages().is_err());
        assert!(factory.wire_pipeline_stages().is_err());

        factory.build_graph().unwrap();
        assert!(factory.build_graph().is_err());
        factory.wire_pipeline_stages().unwrap();
        assert!(factory.start_stages().is_err());
        assert_eq!(factory.state(), FactoryState::Wired);
    }

    #[test]
    fn test_missing_pool_fails_build() {
        let mut factory = GraphFrameFactory::new(
            linear_topology(),
            Arc::new(BufferPools::new()),
            Arc::new(SimulatedStageProvider::default()),
            FactoryOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            factory.build_graph(),
            Err(PipelineError::NotFound(_)) | Err(PipelineError::Configuration(_))
        ));
        assert_eq!(factory.state(), FactoryState::Created);
    }

    #[test]
    fn test_frame_flows_through_linear_graph() {
        let mut factory = running(SimulatedBehavior::default());
        let id = factory.create_frame().unwrap();
        factory.enqueue_frame(id).unwrap();

        assert!(wait_until(Duration::from_secs(2), || factory.in_flight_count() == 0));
        let preview = factory.stage_status(StageId::PREVIEW_SCALER).unwrap();
        assert_eq!(preview.completed, 1);
        assert_eq!(factory.pools().busy_count(), 0);

        factory.stop_stages().unwrap();
        assert_eq!(factory.state(), FactoryState::Stopped);
        factory.stop_stages().unwrap();
    }

    #[test]
    fn test_stop_with_frames_in_flight_frees_everything() {
        let mut factory = running(SimulatedBehavior::with_latency(Duration::from_millis(40)));
        for _ in 0..3 {
            let id = factory.create_frame().unwrap();
            factory.enqueue_frame(id).unwrap();
        }
        factory.stop_stages().unwrap();

        assert_eq!(factory.in_flight_count(), 0);
        assert_eq!(factory.pools().busy_count(), 0);
        for stage in [StageId::SENSOR, StageId::ISP, StageId::PREVIEW_SCALER] {
            let status = factory.stage_status(stage).unwrap();
            assert_eq!(status.state, crate::core::dispatch::DispatchState::Stopped);
        }
    }

    #[test]
    fn test_generate_frame_honours_hint() {
        let mut factory = factory(SimulatedBehavior::default());
        factory.build_graph().unwrap();

        let first = factory.generate_frame(Some(10)).unwrap();
        assert_eq!(first, FrameId(10));
        assert_eq!(factory.generate_frame(Some(10)).unwrap(), first);
        assert_eq!(factory.generate_frame(Some(4)).unwrap(), FrameId(11));
        assert_eq!(factory.generate_frame(None).unwrap(), FrameId(12));
        assert_eq!(factory.in_flight_count(), 3);
    }

    #[test]
    fn test_restart_after_stop() {
        let mut factory = running(SimulatedBehavior::default());
        factory.stop_stages().unwrap();
        factory.start_stages().unwrap();

        let id = factory.create_frame().unwrap();
        factory.enqueue_frame(id).unwrap();
        assert!(wait_until(Duration::from_secs(2), || factory.in_flight_count() == 0));
        factory.stop_stages().unwrap();
        assert_eq!(factory.pools().busy_count(), 0);
    }
}
