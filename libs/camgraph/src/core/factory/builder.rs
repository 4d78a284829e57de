// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::frames::{
    BufferBinding, CaptureMetadata, Frame, FrameEntity, FrameId, FrameStore, FrameType, StageId,
};
use crate::core::topology::Topology;
use crate::core::Result;

/// Builds frames shaped like a topology and registers them in flight.
///
/// Shared between a factory and its regenerating stage threads.
pub struct FrameBuilder {
    topology: Arc<Topology>,
    order: Vec<StageId>,
    store: Arc<FrameStore>,
    requests: RwLock<HashMap<StageId, bool>>,
    metadata: Mutex<CaptureMetadata>,
}

impl FrameBuilder {
    pub fn new(topology: Arc<Topology>, store: Arc<FrameStore>) -> Result<Self> {
        topology.validate()?;
        let order = creation_order(&topology);
        Ok(Self {
            topology,
            order,
            store,
            requests: RwLock::new(HashMap::new()),
            metadata: Mutex::new(CaptureMetadata::default()),
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Request flag applied to `stage` in frames built from now on. An
    /// explicit request makes an optional stage mandatory.
    pub fn set_request(&self, stage: StageId, requested: bool) -> Result<()> {
        self.topology.require_stage(stage)?;
        self.requests.write().insert(stage, requested);
        tracing::debug!("[{}] {} request -> {}", self.store.name(), stage, requested);
        Ok(())
    }

    pub fn request(&self, stage: StageId) -> bool {
        match self.requests.read().get(&stage) {
            Some(&requested) => requested,
            None => self
                .topology
                .stage(stage)
                .is_some_and(|spec| spec.default_requested),
        }
    }

    /// Control parameters copied into every new frame.
    pub fn set_metadata_template(&self, metadata: CaptureMetadata) {
        *self.metadata.lock() = metadata;
    }

    pub fn build(&self, id: FrameId, frame_type: FrameType) -> Result<Frame> {
        let mut frame = Frame::new(id, frame_type, self.metadata.lock().clone());
        let requests = self.requests.read();
        for &stage in &self.order {
            let spec = self.topology.require_stage(stage)?;
            let entity = match requests.get(&stage) {
                Some(true) => FrameEntity::new(spec.id, spec.kind, BufferBinding::Fixed),
                Some(false) => spec.new_entity(false),
                None => spec.new_entity(spec.default_requested),
            };
            match self.topology.parent_of(stage) {
                Some(parent) => frame.add_child(parent, entity)?,
                None => frame.add_root(entity)?,
            }
        }
        Ok(frame)
    }

    /// A frame with a single entity for `stage`, used to drive one stage alone.
    pub fn build_for_stage(&self, id: FrameId, stage: StageId, frame_type: FrameType) -> Result<Frame> {
        let spec = self.topology.require_stage(stage)?;
        let mut frame = Frame::new(id, frame_type, self.metadata.lock().clone());
        frame.add_root(spec.new_entity(true))?;
        Ok(frame)
    }

    pub fn create_frame(&self, frame_type: FrameType) -> Result<FrameId> {
        let id = self.store.next_frame_id();
        self.store.insert(self.build(id, frame_type)?)?;
        Ok(id)
    }

    pub fn create_frame_for_stage_only(&self, stage: StageId, frame_type: FrameType) -> Result<FrameId> {
        let id = self.store.next_frame_id();
        self.store.insert(self.build_for_stage(id, stage, frame_type)?)?;
        Ok(id)
    }
}

/// Parents before children, siblings in declaration order.
fn creation_order(topology: &Topology) -> Vec<StageId> {
    let mut placed: Vec<StageId> = Vec::with_capacity(topology.stages.len());
    loop {
        let before = placed.len();
        for stage in &topology.stages {
            let ready = topology
                .parent_of(stage.id)
                .is_none_or(|parent| placed.contains(&parent));
            if ready && !placed.contains(&stage.id) {
                placed.push(stage.id);
            }
        }
        if placed.len() == before {
            return placed;
        }
    }
}

impl std::fmt::Debug for FrameBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuilder")
            .field("mode", &self.topology.mode)
            .field("order", &self.order)
            .finish()
    }
}
