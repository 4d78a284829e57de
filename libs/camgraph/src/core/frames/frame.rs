// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{CaptureMetadata, EntityState, FrameEntity, SourceBuffer, StageId, StageOutput};
use crate::core::buffers::BufferHandle;
use crate::core::capture::CaptureGuard;
use crate::core::selector::HoldSide;
use crate::core::{PipelineError, Result};

/// Monotonic frame count; unique among live frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    #[default]
    Preview,
    /// Runs the graph without delivering results (bring-up, AE settling).
    Internal,
    Reprocessing,
}

/// How a buffer leaves a retiring frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDisposition {
    Release,
    /// Never reached hardware.
    Cancel,
}

/// One capture cycle's unit of work.
pub struct Frame {
    id: FrameId,
    frame_type: FrameType,
    entities: Vec<FrameEntity>,
    /// One count per hold list or selection keeping the frame alive.
    locks: u32,
    metadata: CaptureMetadata,
    guards: Vec<CaptureGuard>,
    created_at: Instant,
}

impl Frame {
    pub fn new(id: FrameId, frame_type: FrameType, metadata: CaptureMetadata) -> Self {
        Self {
            id,
            frame_type,
            entities: Vec::new(),
            locks: 0,
            metadata,
            guards: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn metadata(&self) -> &CaptureMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut CaptureMetadata {
        &mut self.metadata
    }

    // ---- graph ----

    /// Add a parentless entity.
    pub fn add_root(&mut self, entity: FrameEntity) -> Result<()> {
        self.push_entity(entity, None)
    }

    /// Add `entity` downstream of the entity for `parent`.
    pub fn add_child(&mut self, parent: StageId, entity: FrameEntity) -> Result<()> {
        let parent_index = self.index_of(parent)?;
        self.push_entity(entity, Some(parent_index))
    }

    fn push_entity(&mut self, mut entity: FrameEntity, parent: Option<usize>) -> Result<()> {
        if self.position(entity.stage()).is_some() {
            return Err(PipelineError::Graph(format!(
                "frame {} already has an entity for {}",
                self.id,
                entity.stage()
            )));
        }
        let index = self.entities.len();
        entity.parent = parent;
        if let Some(parent) = parent {
            self.entities[parent].children.push(index);
        }
        self.entities.push(entity);
        Ok(())
    }

    fn position(&self, stage: StageId) -> Option<usize> {
        self.entities.iter().position(|e| e.stage() == stage)
    }

    fn index_of(&self, stage: StageId) -> Result<usize> {
        self.position(stage).ok_or_else(|| {
            PipelineError::NotFound(format!("entity {} in frame {}", stage, self.id))
        })
    }

    pub fn entity(&self, stage: StageId) -> Option<&FrameEntity> {
        self.position(stage).map(|i| &self.entities[i])
    }

    pub fn entity_mut(&mut self, stage: StageId) -> Option<&mut FrameEntity> {
        self.position(stage).map(move |i| &mut self.entities[i])
    }

    pub fn entities(&self) -> impl Iterator<Item = &FrameEntity> {
        self.entities.iter()
    }

    pub fn roots(&self) -> Vec<StageId> {
        self.entities
            .iter()
            .filter(|e| e.parent.is_none())
            .map(|e| e.stage())
            .collect()
    }

    pub fn children_of(&self, stage: StageId) -> Vec<StageId> {
        match self.position(stage) {
            Some(i) => self.entities[i]
                .children
                .iter()
                .map(|&c| self.entities[c].stage())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn parent_of(&self, stage: StageId) -> Option<StageId> {
        let i = self.position(stage)?;
        self.entities[i].parent.map(|p| self.entities[p].stage())
    }

    fn descendants(&self, index: usize) -> Vec<usize> {
        let mut out = vec![index];
        let mut cursor = 0;
        while cursor < out.len() {
            out.extend(self.entities[out[cursor]].children.iter().copied());
            cursor += 1;
        }
        out
    }

    fn consumers_done(&self, index: usize) -> bool {
        self.entities[index]
            .children
            .iter()
            .all(|&c| self.entities[c].is_terminal())
    }

    // ---- state ----

    pub fn is_complete(&self) -> bool {
        self.entities.iter().all(FrameEntity::is_terminal)
    }

    pub fn has_errors(&self) -> bool {
        self.entities
            .iter()
            .any(|e| e.state() == EntityState::Error)
    }

    pub fn request_count(&self) -> usize {
        self.entities.iter().filter(|e| e.is_requested()).count()
    }

    /// Requested entities that have not reached a terminal state.
    pub fn remaining_request_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| e.is_requested() && !e.is_terminal())
            .count()
    }

    pub fn is_locked(&self) -> bool {
        self.locks > 0
    }

    pub fn lock_count(&self) -> u32 {
        self.locks
    }

    pub fn lock(&mut self) {
        self.locks += 1;
    }

    /// Drop one lock. Unlocking an unlocked frame is a no-op.
    pub fn unlock(&mut self) {
        self.locks = self.locks.saturating_sub(1);
    }

    /// Drop every lock, for frames forced out of the store.
    pub fn release_locks(&mut self) {
        self.locks = 0;
    }

    pub fn is_safe_to_delete(&self) -> bool {
        self.is_complete() && self.locks == 0
    }

    pub fn set_request(&mut self, stage: StageId, requested: bool) -> Result<()> {
        let i = self.index_of(stage)?;
        self.entities[i].set_request(requested)
    }

    /// Re-run `stage` on this frame. The parent's output must still be owned
    /// by the frame so the entity can be fed again.
    pub fn rework(&mut self, stage: StageId) -> Result<Option<BufferHandle>> {
        let i = self.index_of(stage)?;
        if let Some(p) = self.entities[i].parent {
            let parent = &self.entities[p];
            let input_gone = matches!(parent.output(), Some(StageOutput::Produced(_)))
                && parent.destination().is_none();
            if parent.state() != EntityState::Complete || input_gone {
                return Err(PipelineError::EntityState(format!(
                    "{}: cannot rework, input from {} is not available",
                    stage,
                    parent.stage()
                )));
            }
        }
        let previous = self.entities[i].rework()?;
        self.refresh_source(i);
        Ok(previous)
    }

    fn refresh_source(&mut self, index: usize) {
        let Some(p) = self.entities[index].parent else {
            return;
        };
        if let Some(output) = self.entities[p].output().cloned() {
            let source = match output {
                StageOutput::Produced(buffer) => SourceBuffer::Borrowed(buffer),
                StageOutput::Skipped => SourceBuffer::None,
            };
            self.entities[index].set_source(source);
        }
    }

    /// Record `stage`'s result and hand it to its children as input.
    pub fn complete_stage(&mut self, stage: StageId, output: StageOutput) -> Result<()> {
        let i = self.index_of(stage)?;
        self.entities[i].complete(output)?;
        for c in self.entities[i].children.clone() {
            self.refresh_source(c);
        }
        Ok(())
    }

    /// Mark `stage` and everything downstream of it Error.
    pub fn abandon_subtree(&mut self, stage: StageId) -> Result<()> {
        let i = self.index_of(stage)?;
        for d in self.descendants(i) {
            self.entities[d].fail()?;
        }
        Ok(())
    }

    /// Fail every entity that has not finished.
    pub fn abandon_all(&mut self) {
        for entity in &mut self.entities {
            if let Err(e) = entity.fail() {
                tracing::warn!("[frame {}] abandon {}: {}", self.id, entity.stage(), e);
            }
        }
    }

    // ---- buffers ----

    /// Intermediate outputs whose consumers all finished, plus owned inputs of
    /// finished entities. Nothing is released while the frame is locked.
    pub fn take_consumed_outputs(&mut self) -> Vec<BufferHandle> {
        if self.is_locked() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for i in 0..self.entities.len() {
            let entity = &self.entities[i];
            if entity.is_terminal()
                && entity.destination().is_some()
                && !entity.children.is_empty()
                && self.consumers_done(i)
            {
                out.extend(self.entities[i].take_destination());
            }
            if self.entities[i].is_terminal() {
                out.extend(self.entities[i].take_owned_source());
            }
        }
        out
    }

    /// Move `stage`'s produced buffer out of the frame.
    pub fn take_output(&mut self, stage: StageId) -> Result<BufferHandle> {
        let i = self.index_of(stage)?;
        if self.entities[i].state() != EntityState::Complete {
            return Err(PipelineError::EntityState(format!(
                "{}: output taken before completion ({:?})",
                stage,
                self.entities[i].state()
            )));
        }
        self.entities[i].take_destination().ok_or_else(|| {
            PipelineError::NotFound(format!("output of {} in frame {}", stage, self.id))
        })
    }

    /// Move `stage`'s destination out whatever the entity's state, for a
    /// buffer the hardware has not given back.
    pub fn detach_destination(&mut self, stage: StageId) -> Option<BufferHandle> {
        let i = self.position(stage)?;
        self.entities[i].take_destination()
    }

    /// The buffer a hold list keeps for `stage`, if its consumers are done.
    pub fn take_held_buffer(&mut self, stage: StageId, side: HoldSide) -> Option<BufferHandle> {
        let i = self.position(stage)?;
        match side {
            HoldSide::Destination => {
                if self.entities[i].is_terminal() && self.consumers_done(i) {
                    self.entities[i].take_destination()
                } else {
                    None
                }
            }
            HoldSide::Source => {
                if !self.entities[i].is_terminal() {
                    return None;
                }
                if let Some(handle) = self.entities[i].take_owned_source() {
                    return Some(handle);
                }
                let p = self.entities[i].parent?;
                if self.entities[p].is_terminal() && self.consumers_done(p) {
                    self.entities[p].take_destination()
                } else {
                    None
                }
            }
        }
    }

    /// Every buffer still owned by the frame, for retirement.
    pub fn take_all_buffers(&mut self) -> Vec<(BufferHandle, ReturnDisposition)> {
        let mut out = Vec::new();
        for entity in &mut self.entities {
            let disposition = match entity.state() {
                EntityState::Requested | EntityState::Rework => ReturnDisposition::Cancel,
                _ => ReturnDisposition::Release,
            };
            if let Some(handle) = entity.take_destination() {
                out.push((handle, disposition));
            }
            if let Some(handle) = entity.take_owned_source() {
                out.push((handle, ReturnDisposition::Release));
            }
        }
        out
    }

    pub fn held_buffer_count(&self) -> usize {
        self.entities
            .iter()
            .map(|e| {
                usize::from(e.destination().is_some())
                    + usize::from(matches!(e.source(), SourceBuffer::Owned(_)))
            })
            .sum()
    }

    pub fn attach_guard(&mut self, guard: CaptureGuard) {
        self.guards.push(guard);
    }

    /// Record the outcome on every attached guard and drop them.
    pub fn settle_guards(&mut self, success: bool) {
        for mut guard in self.guards.drain(..) {
            guard.settle(success);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("frame_type", &self.frame_type)
            .field("locks", &self.locks)
            .field(
                "entities",
                &self
                    .entities
                    .iter()
                    .map(|e| (e.stage(), e.state()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::{
        AcquireHint, BufferManager, HeapAllocator, PlaneLayout, PoolGeometry,
    };
    use crate::core::frames::{BufferBinding, EntityKind};
    use std::sync::Arc;

    fn pool(name: &str, count: usize) -> Arc<BufferManager> {
        let pool = BufferManager::new(name, Arc::new(HeapAllocator::new()));
        pool.configure(PoolGeometry::new(PlaneLayout::single(64, 8), count, count))
            .unwrap();
        pool.allocate().unwrap();
        pool
    }

    /// sensor -> isp -> {scaler, scc}
    fn frame() -> Frame {
        let mut frame = Frame::new(FrameId(1), FrameType::Preview, CaptureMetadata::default());
        frame
            .add_root(FrameEntity::new(StageId::SENSOR, EntityKind::OutputOnly, BufferBinding::Fixed))
            .unwrap();
        frame
            .add_child(
                StageId::SENSOR,
                FrameEntity::new(StageId::ISP, EntityKind::InputOutput, BufferBinding::Fixed),
            )
            .unwrap();
        frame
            .add_child(
                StageId::ISP,
                FrameEntity::new(StageId::PREVIEW_SCALER, EntityKind::InputOutput, BufferBinding::Fixed),
            )
            .unwrap();
        frame
            .add_child(
                StageId::ISP,
                FrameEntity::new(StageId::SCC, EntityKind::InputOutput, BufferBinding::Delivery),
            )
            .unwrap();
        frame
    }

    fn run_stage(frame: &mut Frame, stage: StageId, pool: &Arc<BufferManager>) {
        let entity = frame.entity_mut(stage).unwrap();
        entity
            .attach_destination(pool.acquire(AcquireHint::Next).unwrap())
            .unwrap();
        entity.begin_processing().unwrap();
        let view = entity.destination().unwrap().view();
        frame.complete_stage(stage, StageOutput::Produced(view)).unwrap();
    }

    fn skip_stage(frame: &mut Frame, stage: StageId) {
        let entity = frame.entity_mut(stage).unwrap();
        entity.skip_destination();
        entity.begin_processing().unwrap();
        frame.complete_stage(stage, StageOutput::Skipped).unwrap();
    }

    #[test]
    fn test_graph_shape() {
        let frame = frame();
        assert_eq!(frame.roots(), vec![StageId::SENSOR]);
        assert_eq!(
            frame.children_of(StageId::ISP),
            vec![StageId::PREVIEW_SCALER, StageId::SCC]
        );
        assert_eq!(frame.parent_of(StageId::SCC), Some(StageId::ISP));
        assert_eq!(frame.request_count(), 4);
        assert_eq!(frame.remaining_request_count(), 4);
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut frame = frame();
        let dup = FrameEntity::new(StageId::ISP, EntityKind::InputOutput, BufferBinding::Fixed);
        assert!(matches!(
            frame.add_child(StageId::SENSOR, dup),
            Err(PipelineError::Graph(_))
        ));
    }

    #[test]
    fn test_completion_feeds_children() {
        let sensor_pool = pool("sensor", 2);
        let mut frame = frame();
        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);

        let isp = frame.entity(StageId::ISP).unwrap();
        assert_eq!(isp.source().view().unwrap().pool.as_ref(), "sensor");

        drop(frame.take_all_buffers());
    }

    #[test]
    fn test_complete_and_safe_to_delete() {
        let sensor_pool = pool("sensor", 2);
        let isp_pool = pool("isp", 2);
        let out_pool = pool("out", 2);
        let mut frame = frame();

        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);
        run_stage(&mut frame, StageId::ISP, &isp_pool);
        run_stage(&mut frame, StageId::PREVIEW_SCALER, &out_pool);
        assert!(!frame.is_complete());
        assert_eq!(frame.remaining_request_count(), 1);

        skip_stage(&mut frame, StageId::SCC);
        assert!(frame.is_complete());
        assert!(frame.is_safe_to_delete());

        frame.lock();
        frame.lock();
        assert!(!frame.is_safe_to_delete());
        frame.unlock();
        assert_eq!(frame.lock_count(), 1);
        assert!(!frame.is_safe_to_delete());
        frame.unlock();
        frame.unlock();
        assert_eq!(frame.lock_count(), 0);
        assert!(frame.is_safe_to_delete());

        for (handle, disposition) in frame.take_all_buffers() {
            assert_eq!(disposition, ReturnDisposition::Release);
            handle.release().unwrap();
        }
        assert_eq!(sensor_pool.available_count(), 2);
        assert_eq!(out_pool.available_count(), 2);
    }

    #[test]
    fn test_consumed_outputs_released_only_when_unlocked() {
        let sensor_pool = pool("sensor", 2);
        let isp_pool = pool("isp", 2);
        let mut frame = frame();

        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);
        assert!(frame.take_consumed_outputs().is_empty());

        run_stage(&mut frame, StageId::ISP, &isp_pool);
        frame.lock();
        assert!(frame.take_consumed_outputs().is_empty());
        frame.unlock();

        let consumed = frame.take_consumed_outputs();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].pool_name(), "sensor");
        for handle in consumed {
            handle.release().unwrap();
        }
        assert_eq!(sensor_pool.available_count(), 2);

        frame.abandon_all();
        for (handle, _) in frame.take_all_buffers() {
            handle.release().unwrap();
        }
        assert_eq!(isp_pool.available_count(), 2);
    }

    #[test]
    fn test_abandon_subtree_leaves_completed_entities() {
        let sensor_pool = pool("sensor", 1);
        let mut frame = frame();
        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);

        frame.abandon_subtree(StageId::ISP).unwrap();
        assert_eq!(frame.entity(StageId::SENSOR).unwrap().state(), EntityState::Complete);
        for stage in [StageId::ISP, StageId::PREVIEW_SCALER, StageId::SCC] {
            assert_eq!(frame.entity(stage).unwrap().state(), EntityState::Error);
        }
        assert!(frame.is_complete());
        assert!(frame.has_errors());

        let buffers = frame.take_all_buffers();
        assert_eq!(buffers.len(), 1);
        for (handle, _) in buffers {
            handle.release().unwrap();
        }
    }

    #[test]
    fn test_unprocessed_destination_is_cancelled() {
        let sensor_pool = pool("sensor", 1);
        let mut frame = frame();
        frame
            .entity_mut(StageId::SENSOR)
            .unwrap()
            .attach_destination(sensor_pool.acquire(AcquireHint::Next).unwrap())
            .unwrap();

        let buffers = frame.take_all_buffers();
        assert_eq!(buffers[0].1, ReturnDisposition::Cancel);
        for (handle, _) in buffers {
            handle.cancel().unwrap();
        }
        assert_eq!(sensor_pool.stats().cancelled, 1);
    }

    #[test]
    fn test_rework_after_skip() {
        let sensor_pool = pool("sensor", 2);
        let isp_pool = pool("isp", 2);
        let mut frame = frame();
        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);
        run_stage(&mut frame, StageId::ISP, &isp_pool);
        skip_stage(&mut frame, StageId::SCC);

        assert!(frame.rework(StageId::SCC).unwrap().is_none());
        let scc = frame.entity(StageId::SCC).unwrap();
        assert_eq!(scc.state(), EntityState::Requested);
        assert_eq!(scc.source().view().unwrap().pool.as_ref(), "isp");

        frame.abandon_all();
        for (handle, _) in frame.take_all_buffers() {
            handle.release().unwrap();
        }
    }

    #[test]
    fn test_rework_refused_once_input_released() {
        let sensor_pool = pool("sensor", 2);
        let isp_pool = pool("isp", 2);
        let out_pool = pool("out", 2);
        let mut frame = frame();
        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);
        run_stage(&mut frame, StageId::ISP, &isp_pool);
        run_stage(&mut frame, StageId::PREVIEW_SCALER, &out_pool);
        skip_stage(&mut frame, StageId::SCC);

        for handle in frame.take_consumed_outputs() {
            handle.release().unwrap();
        }
        assert!(frame.rework(StageId::SCC).is_err());

        for (handle, _) in frame.take_all_buffers() {
            handle.release().unwrap();
        }
    }

    #[test]
    fn test_set_request_only_before_dispatch() {
        let sensor_pool = pool("sensor", 1);
        let mut frame = frame();
        frame.set_request(StageId::SCC, false).unwrap();
        assert_eq!(frame.request_count(), 3);
        assert_eq!(
            frame.entity(StageId::SCC).unwrap().binding(),
            BufferBinding::Delivery
        );

        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);
        assert!(frame.set_request(StageId::SENSOR, false).is_err());
        frame.abandon_all();
        for (handle, _) in frame.take_all_buffers() {
            handle.release().unwrap();
        }
    }

    #[test]
    fn test_held_destination_waits_for_consumers() {
        let sensor_pool = pool("sensor", 1);
        let mut frame = frame();
        run_stage(&mut frame, StageId::SENSOR, &sensor_pool);

        assert!(frame.take_held_buffer(StageId::SENSOR, HoldSide::Destination).is_none());
        frame.abandon_subtree(StageId::ISP).unwrap();
        let held = frame
            .take_held_buffer(StageId::SENSOR, HoldSide::Destination)
            .unwrap();
        held.release().unwrap();
        assert_eq!(sensor_pool.available_count(), 1);
    }

    #[test]
    fn test_guards_settle_with_frame() {
        let counter = crate::core::capture::CaptureCounter::new("frame");
        let mut frame = frame();
        frame.attach_guard(counter.begin());
        assert_eq!(counter.in_flight(), 1);
        frame.settle_guards(true);
        assert_eq!(counter.in_flight(), 0);
        assert_eq!(counter.snapshot().succeeded, 1);
    }
}
