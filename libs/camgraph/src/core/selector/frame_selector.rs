// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Bounded hold lists of recent frames, for zero-shutter-lag style selection.
//!
//! Lock order: the hold-list mutex is never held while calling into the
//! [`FrameStore`], so the two locks never nest.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{HoldKey, HoldSide, SelectionPolicy, SelectorConfig};
use crate::core::buffers::BufferHandle;
use crate::core::frames::{Frame, FrameId, FrameStore, StageId, recycle_frame};
use crate::core::{PipelineError, Result};

/// Extra qualification applied to a frame when it enters a hold list.
///
/// The verdict is cached with the entry. Selection walks the list using the
/// cached verdicts and never calls the predicate again, so state the
/// predicate reads must be settled by the time the frame is held.
pub type FramePredicate = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectorStats {
    pub inserted: u64,
    pub evicted: u64,
    pub selected: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy)]
struct HeldFrame {
    id: FrameId,
    qualifies: bool,
}

#[derive(Default)]
struct HoldLists {
    lists: HashMap<HoldKey, VecDeque<HeldFrame>>,
    stats: SelectorStats,
}

pub struct FrameSelector {
    name: String,
    store: Arc<FrameStore>,
    config: SelectorConfig,
    predicate: Option<FramePredicate>,
    inner: Mutex<HoldLists>,
    arrived: Condvar,
}

impl FrameSelector {
    pub fn new(name: impl Into<String>, store: Arc<FrameStore>, config: SelectorConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            predicate: None,
            inner: Mutex::new(HoldLists::default()),
            arrived: Condvar::new(),
        }
    }

    /// Qualify held frames with `predicate` on top of `metadata.valid`.
    /// Evaluated once per frame, in [`FrameSelector::manage_frame_hold_list`].
    pub fn with_predicate(mut self, predicate: FramePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Take one lock on `id` and append it to the hold list for `stage`/`side`,
    /// evicting the oldest entry once the list exceeds `hold_count`. A frame
    /// held on several lists keeps one lock per list.
    pub fn manage_frame_hold_list(&self, id: FrameId, stage: StageId, side: HoldSide) -> Result<()> {
        let predicate = self.predicate.clone();
        let qualifies = self.store.with_frame_mut(id, |frame| {
            frame.lock();
            frame.metadata().valid && predicate.as_ref().is_none_or(|p| p(frame))
        })?;

        let key = HoldKey::new(stage, side);
        let evicted = {
            let mut inner = self.inner.lock();
            let list = inner.lists.entry(key).or_default();
            list.push_back(HeldFrame { id, qualifies });
            let mut evicted = Vec::new();
            while list.len() > self.config.hold_count {
                evicted.extend(list.pop_front());
            }
            let len = list.len();
            inner.stats.inserted += 1;
            inner.stats.evicted += evicted.len() as u64;
            tracing::trace!(
                "[{}] held frame {} on {} ({} held, qualifies={})",
                self.name,
                id,
                key,
                len,
                qualifies
            );
            evicted
        };
        self.arrived.notify_all();

        for held in evicted {
            tracing::debug!("[{}] evicting frame {} from {}", self.name, held.id, key);
            self.let_go(held.id, Some(key));
        }
        Ok(())
    }

    /// Pop a qualifying held frame, waiting up to `retry_count` poll intervals
    /// for one to arrive. The returned frame stays locked until
    /// [`FrameSelector::finish_selected`].
    pub fn select_frames(
        &self,
        remaining_request_count: usize,
        stage: StageId,
        side: HoldSide,
        retry_count: u32,
    ) -> Result<FrameId> {
        let key = HoldKey::new(stage, side);
        let mut inner = self.inner.lock();
        if remaining_request_count == 0 {
            inner.stats.misses += 1;
            return Err(self.miss(stage, 0));
        }

        let mut attempt = 0;
        loop {
            if let Some(id) = self.pop_candidate(&mut inner, key) {
                inner.stats.selected += 1;
                tracing::debug!(
                    "[{}] selected frame {} from {} after {} retries",
                    self.name,
                    id,
                    key,
                    attempt
                );
                return Ok(id);
            }
            if attempt >= retry_count {
                inner.stats.misses += 1;
                return Err(self.miss(stage, attempt + 1));
            }
            attempt += 1;
            self.arrived
                .wait_for(&mut inner, self.config.poll_interval());
        }
    }

    fn pop_candidate(&self, inner: &mut HoldLists, key: HoldKey) -> Option<FrameId> {
        let list = inner.lists.get_mut(&key)?;
        let skip_invalid = self.config.skip_invalid;
        let usable = |held: &HeldFrame| held.qualifies || !skip_invalid;
        let position = match self.config.policy {
            SelectionPolicy::Oldest => list.iter().position(usable),
            SelectionPolicy::Newest => list.iter().rposition(usable),
        }?;
        list.remove(position).map(|held| held.id)
    }

    fn miss(&self, stage: StageId, attempts: u32) -> PipelineError {
        tracing::debug!("[{}] no frame for {} after {} attempts", self.name, stage, attempts);
        PipelineError::SelectionMiss {
            stage: stage.get(),
            attempts,
        }
    }

    /// Give a selected frame back: unlock it and release what it no longer needs.
    pub fn finish_selected(&self, id: FrameId) {
        self.let_go(id, None);
    }

    /// Drop one lock on `id`, hand back buffers its consumers are done with, retire it
    /// if complete. `held` names the hold list slot whose buffer goes too.
    fn let_go(&self, id: FrameId, held: Option<HoldKey>) {
        let buffers = self.store.with_frame_mut(id, |frame| {
            frame.unlock();
            let mut buffers = Vec::new();
            if let Some(key) = held {
                buffers.extend(frame.take_held_buffer(key.stage, key.side));
            }
            buffers.extend(frame.take_consumed_outputs());
            buffers
        });
        match buffers {
            Ok(buffers) => release_all(&self.name, buffers),
            // Already drained by a stop.
            Err(PipelineError::NotFound(_)) => return,
            Err(e) => tracing::warn!("[{}] letting go of frame {}: {}", self.name, id, e),
        }
        if let Some(frame) = self.store.try_retire(id) {
            recycle_frame(frame);
        }
    }

    /// Drop every frame held for `stage`/`side`.
    pub fn clear_list(&self, stage: StageId, side: HoldSide) {
        let key = HoldKey::new(stage, side);
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            match inner.lists.get_mut(&key) {
                Some(list) => list.drain(..).collect(),
                None => Vec::new(),
            }
        };
        for held in drained {
            self.let_go(held.id, Some(key));
        }
    }

    /// Drop every held frame in every list.
    pub fn release(&self) {
        let lists = std::mem::take(&mut self.inner.lock().lists);
        let count: usize = lists.values().map(VecDeque::len).sum();
        if count > 0 {
            tracing::debug!("[{}] releasing {} held frames", self.name, count);
        }
        for (key, list) in lists {
            for held in list {
                self.let_go(held.id, Some(key));
            }
        }
        self.arrived.notify_all();
    }

    pub fn hold_len(&self, stage: StageId, side: HoldSide) -> usize {
        self.inner
            .lock()
            .lists
            .get(&HoldKey::new(stage, side))
            .map_or(0, VecDeque::len)
    }

    /// Held ids for `stage`/`side`, oldest first.
    pub fn held_ids(&self, stage: StageId, side: HoldSide) -> Vec<FrameId> {
        self.inner
            .lock()
            .lists
            .get(&HoldKey::new(stage, side))
            .map(|list| list.iter().map(|held| held.id).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SelectorStats {
        self.inner.lock().stats
    }
}

impl std::fmt::Debug for FrameSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSelector")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn release_all(name: &str, buffers: Vec<BufferHandle>) {
    for handle in buffers {
        let view = handle.view();
        if let Err(e) = handle.release() {
            tracing::error!("[{}] releasing {} failed: {}", name, view, e);
        }
    }
}
