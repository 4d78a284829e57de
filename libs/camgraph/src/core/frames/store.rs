// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Frame, FrameId, ReturnDisposition};
use crate::core::{PipelineError, Result};

/// Arena of live frames and the in-flight list, behind one mutex.
///
/// A frame leaves the store only through [`FrameStore::try_retire`],
/// [`FrameStore::abandon`] or [`FrameStore::drain_all`]. Callers give the
/// returned frame's buffers back with [`recycle_frame`] after the lock is
/// dropped.
pub struct FrameStore {
    name: String,
    frames: Mutex<BTreeMap<FrameId, Frame>>,
    next_id: AtomicU64,
}

impl FrameStore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            frames: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_frame_id(&self) -> FrameId {
        FrameId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure the next id handed out is at least `hint`.
    pub fn advance_to(&self, hint: u64) {
        self.next_id.fetch_max(hint, Ordering::Relaxed);
    }

    pub fn peek_next_id(&self) -> FrameId {
        FrameId(self.next_id.load(Ordering::Relaxed))
    }

    pub fn insert(&self, frame: Frame) -> Result<()> {
        let mut frames = self.frames.lock();
        let id = frame.id();
        if frames.contains_key(&id) {
            return Err(PipelineError::Runtime(format!(
                "[{}] frame {} already in flight",
                self.name, id
            )));
        }
        frames.insert(id, frame);
        tracing::trace!("[{}] frame {} in flight ({})", self.name, id, frames.len());
        Ok(())
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.frames.lock().contains_key(&id)
    }

    pub fn with_frame<R>(&self, id: FrameId, f: impl FnOnce(&Frame) -> R) -> Result<R> {
        let frames = self.frames.lock();
        let frame = frames.get(&id).ok_or_else(|| self.missing(id))?;
        Ok(f(frame))
    }

    pub fn with_frame_mut<R>(&self, id: FrameId, f: impl FnOnce(&mut Frame) -> R) -> Result<R> {
        let mut frames = self.frames.lock();
        let frame = frames.get_mut(&id).ok_or_else(|| self.missing(id))?;
        Ok(f(frame))
    }

    fn missing(&self, id: FrameId) -> PipelineError {
        PipelineError::NotFound(format!("[{}] frame {}", self.name, id))
    }

    pub fn in_flight_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn in_flight_ids(&self) -> Vec<FrameId> {
        self.frames.lock().keys().copied().collect()
    }

    /// The most recent frame still in flight.
    pub fn latest(&self) -> Option<FrameId> {
        self.frames.lock().keys().next_back().copied()
    }

    pub fn lock(&self, id: FrameId) -> Result<()> {
        self.with_frame_mut(id, Frame::lock)
    }

    /// Drop one lock on `id` and retire it if nothing else keeps it alive.
    pub fn unlock(&self, id: FrameId) -> Option<Frame> {
        let mut frames = self.frames.lock();
        let frame = frames.get_mut(&id)?;
        frame.unlock();
        Self::retire_locked(&self.name, &mut frames, id)
    }

    /// Remove `id` if complete and unlocked. The only place a frame is deleted
    /// on the normal path.
    pub fn try_retire(&self, id: FrameId) -> Option<Frame> {
        let mut frames = self.frames.lock();
        Self::retire_locked(&self.name, &mut frames, id)
    }

    fn retire_locked(
        name: &str,
        frames: &mut BTreeMap<FrameId, Frame>,
        id: FrameId,
    ) -> Option<Frame> {
        if !frames.get(&id)?.is_safe_to_delete() {
            return None;
        }
        let frame = frames.remove(&id)?;
        tracing::trace!("[{}] frame {} retired ({} left)", name, id, frames.len());
        Some(frame)
    }

    /// Force `id` out of the store, failing whatever had not finished.
    pub fn abandon(&self, id: FrameId) -> Option<Frame> {
        let mut frame = self.frames.lock().remove(&id)?;
        frame.release_locks();
        frame.abandon_all();
        tracing::debug!("[{}] frame {} abandoned", self.name, id);
        Some(frame)
    }

    pub fn drain_all(&self) -> Vec<Frame> {
        let frames = std::mem::take(&mut *self.frames.lock());
        if !frames.is_empty() {
            tracing::debug!("[{}] draining {} frames", self.name, frames.len());
        }
        frames
            .into_values()
            .map(|mut frame| {
                frame.release_locks();
                frame.abandon_all();
                frame
            })
            .collect()
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight_count())
            .field("next_id", &self.peek_next_id())
            .finish()
    }
}

/// Give every buffer a retired frame still owns back to its pool and settle
/// its capture guards.
pub fn recycle_frame(mut frame: Frame) {
    let success = frame.is_complete() && !frame.has_errors();
    for (handle, disposition) in frame.take_all_buffers() {
        let view = handle.view();
        let result = match disposition {
            ReturnDisposition::Release => handle.release(),
            ReturnDisposition::Cancel => handle.cancel(),
        };
        if let Err(e) = result {
            tracing::error!("[frame {}] returning {} failed: {}", frame.id(), view, e);
        }
    }
    frame.settle_guards(success);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::{
        AcquireHint, BufferManager, HeapAllocator, PlaneLayout, PoolGeometry,
    };
    use crate::core::capture::CaptureCounter;
    use crate::core::frames::{
        BufferBinding, CaptureMetadata, EntityKind, FrameEntity, FrameType, StageId, StageOutput,
    };

    fn sensor_frame(store: &FrameStore) -> Frame {
        let mut frame = Frame::new(
            store.next_frame_id(),
            FrameType::Preview,
            CaptureMetadata::default(),
        );
        frame
            .add_root(FrameEntity::new(
                StageId::SENSOR,
                EntityKind::OutputOnly,
                BufferBinding::Fixed,
            ))
            .unwrap();
        frame
    }

    fn complete_sensor(store: &FrameStore, id: FrameId, pool: &Arc<BufferManager>) {
        let handle = pool.acquire(AcquireHint::Next).unwrap();
        store
            .with_frame_mut(id, |frame| {
                let entity = frame.entity_mut(StageId::SENSOR).unwrap();
                let view = handle.view();
                entity.attach_destination(handle).unwrap();
                entity.begin_processing().unwrap();
                frame
                    .complete_stage(StageId::SENSOR, StageOutput::Produced(view))
                    .unwrap();
            })
            .unwrap();
    }

    fn pool() -> Arc<BufferManager> {
        let pool = BufferManager::new("sensor", Arc::new(HeapAllocator::new()));
        pool.configure(PoolGeometry::new(PlaneLayout::single(64, 8), 2, 2))
            .unwrap();
        pool.allocate().unwrap();
        pool
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = FrameStore::new("ids");
        assert_eq!(store.next_frame_id(), FrameId(0));
        assert_eq!(store.next_frame_id(), FrameId(1));
        store.advance_to(10);
        assert_eq!(store.next_frame_id(), FrameId(10));
        store.advance_to(3);
        assert_eq!(store.next_frame_id(), FrameId(11));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = FrameStore::new("dup");
        let frame = sensor_frame(&store);
        let id = frame.id();
        store.insert(frame).unwrap();
        let again = Frame::new(id, FrameType::Preview, CaptureMetadata::default());
        assert!(store.insert(again).is_err());
        assert_eq!(store.in_flight_count(), 1);
    }

    #[test]
    fn test_retire_requires_complete_and_unlocked() {
        let store = FrameStore::new("retire");
        let pool = pool();
        let frame = sensor_frame(&store);
        let id = frame.id();
        store.insert(frame).unwrap();

        assert!(store.try_retire(id).is_none());
        complete_sensor(&store, id, &pool);
        store.lock(id).unwrap();
        assert!(store.try_retire(id).is_none());

        let frame = store.unlock(id).unwrap();
        assert_eq!(store.in_flight_count(), 0);
        recycle_frame(frame);
        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn test_abandon_cancels_unprocessed_buffers() {
        let store = FrameStore::new("abandon");
        let pool = pool();
        let frame = sensor_frame(&store);
        let id = frame.id();
        store.insert(frame).unwrap();
        let handle = pool.acquire(AcquireHint::Next).unwrap();
        store
            .with_frame_mut(id, |frame| {
                frame
                    .entity_mut(StageId::SENSOR)
                    .unwrap()
                    .attach_destination(handle)
            })
            .unwrap()
            .unwrap();

        let frame = store.abandon(id).unwrap();
        assert!(frame.is_complete());
        recycle_frame(frame);
        assert_eq!(pool.stats().cancelled, 1);
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_drain_all_settles_guards_as_failed() {
        let store = FrameStore::new("drain");
        let counter = CaptureCounter::new("drain");
        for _ in 0..3 {
            let mut frame = sensor_frame(&store);
            frame.attach_guard(counter.begin());
            store.insert(frame).unwrap();
        }
        assert_eq!(store.latest(), Some(FrameId(2)));

        for frame in store.drain_all() {
            recycle_frame(frame);
        }
        assert_eq!(store.in_flight_count(), 0);
        let snapshot = counter.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.failed, 3);
    }

    #[test]
    fn test_missing_frame_is_not_found() {
        let store = FrameStore::new("missing");
        assert!(matches!(
            store.with_frame(FrameId(7), |_| ()),
            Err(PipelineError::NotFound(_))
        ));
        assert!(store.unlock(FrameId(7)).is_none());
    }
}
