// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hardware buffer pool with per-index state tracking.
//!
//! Every index is in exactly one [`BufferPosition`] at any instant:
//!
//! ```text
//!   Free ──acquire──▶ InHal ──mark_in_hardware──▶ InHardware
//!    ▲                  │  ◀──mark_returned───────────┘
//!    └──release/cancel──┴──────────────────────────────┘
//! ```
//!
//! All mutation happens under the pool's internal lock. Indices are stable for
//! the life of an allocation; `reset` clears assignment without freeing memory
//! and `deinit` frees memory so the pool can be reconfigured.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Buffer, BufferAllocator, BufferHandle, BufferPlane, PlaneLayout, PlaneSet};
use crate::core::{PipelineError, Result};

/// How backing memory is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Allocate `max_count` buffers up front.
    #[default]
    AtOnce,
    /// Allocate `min_count` up front and grow one buffer at a time up to `max_count`.
    OnDemand,
    /// Allocate `max_count` up front without registering buffers with the hardware.
    Silent,
}

/// Pool geometry recorded by [`BufferManager::configure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGeometry {
    pub layout: PlaneLayout,
    pub min_count: usize,
    pub max_count: usize,
    #[serde(default)]
    pub policy: AllocationPolicy,
    /// Append a metadata plane to every buffer.
    #[serde(default)]
    pub metadata_plane: bool,
    /// Expose CPU addresses in buffer descriptors.
    #[serde(default = "default_mapped")]
    pub mapped: bool,
}

fn default_mapped() -> bool {
    true
}

impl PoolGeometry {
    pub fn new(layout: PlaneLayout, min_count: usize, max_count: usize) -> Self {
        Self {
            layout,
            min_count,
            max_count,
            policy: AllocationPolicy::default(),
            metadata_plane: false,
            mapped: true,
        }
    }

    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metadata_plane(mut self, metadata_plane: bool) -> Self {
        self.metadata_plane = metadata_plane;
        self
    }

    pub fn with_mapping(mut self, mapped: bool) -> Self {
        self.mapped = mapped;
        self
    }

    fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        if self.max_count == 0 {
            return Err(PipelineError::Configuration(
                "max_count must be greater than 0".into(),
            ));
        }
        if self.min_count > self.max_count {
            return Err(PipelineError::Configuration(format!(
                "min_count {} exceeds max_count {}",
                self.min_count, self.max_count
            )));
        }
        Ok(())
    }

    fn effective_layout(&self) -> PlaneLayout {
        if self.metadata_plane {
            self.layout.with_metadata_plane()
        } else {
            self.layout.clone()
        }
    }
}

/// Where a buffer index currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferPosition {
    Free,
    /// Acquired by the core, not queued to hardware.
    InHal,
    /// Queued to exactly one stage's hardware.
    InHardware,
}

/// Which index `acquire` should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireHint {
    /// Next free index in round-robin order.
    #[default]
    Next,
    /// This index if free, otherwise the next free one.
    Prefer(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    pub acquired: u64,
    pub released: u64,
    pub cancelled: u64,
    pub double_releases: u64,
    /// Returns through a handle whose index was reset or reassigned since.
    pub stale_returns: u64,
    pub grown: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReturnKind {
    Release,
    Cancel,
}

struct Slot {
    buffer: Buffer,
    memory: PlaneSet,
    position: BufferPosition,
    /// Generation of the handle that owns this index. 0 when nobody does.
    generation: u64,
}

#[derive(Default)]
struct PoolInner {
    geometry: Option<PoolGeometry>,
    slots: Vec<Slot>,
    cursor: usize,
    allocated: bool,
    /// Last generation handed out. Survives reset and deinit.
    generation: u64,
    stats: BufferPoolStats,
}

pub struct BufferManager {
    name: String,
    allocator: Arc<dyn BufferAllocator>,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferManager")
            .field("name", &self.name)
            .field("allocated", &inner.allocated)
            .field("slots", &inner.slots.len())
            .finish()
    }
}

impl BufferManager {
    pub fn new(name: impl Into<String>, allocator: Arc<dyn BufferAllocator>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            allocator,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record pool geometry. Rejected once memory is allocated.
    pub fn configure(&self, geometry: PoolGeometry) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.allocated {
            return Err(PipelineError::Configuration(format!(
                "pool '{}' is already allocated; deinit before reconfiguring",
                self.name
            )));
        }
        geometry.validate().map_err(|e| match e {
            PipelineError::Configuration(msg) => {
                PipelineError::Configuration(format!("pool '{}': {}", self.name, msg))
            }
            other => other,
        })?;

        tracing::debug!(
            "[{}] configured: planes={} min={} max={} policy={:?}",
            self.name,
            geometry.layout.plane_count(),
            geometry.min_count,
            geometry.max_count,
            geometry.policy
        );
        inner.geometry = Some(geometry);
        Ok(())
    }

    pub fn geometry(&self) -> Option<PoolGeometry> {
        self.inner.lock().geometry.clone()
    }

    /// Materialize backing memory according to the configured policy.
    pub fn allocate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let geometry = inner.geometry.clone().ok_or_else(|| {
            PipelineError::Configuration(format!("pool '{}' is not configured", self.name))
        })?;

        if inner.allocated {
            tracing::debug!("[{}] allocate: already allocated", self.name);
            return Ok(());
        }

        let count = match geometry.policy {
            AllocationPolicy::AtOnce | AllocationPolicy::Silent => geometry.max_count,
            AllocationPolicy::OnDemand => geometry.min_count,
        };

        let slots = self.allocate_slots(&geometry, 0, count)?;
        inner.slots = slots;
        inner.cursor = 0;
        inner.allocated = true;

        tracing::info!(
            "[{}] allocated {} buffers ({:?})",
            self.name,
            count,
            geometry.policy
        );
        Ok(())
    }

    fn allocate_slots(
        &self,
        geometry: &PoolGeometry,
        first_index: usize,
        count: usize,
    ) -> Result<Vec<Slot>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let layout = geometry.effective_layout();
        let memory = self
            .allocator
            .allocate(&layout.sizes, count)
            .map_err(|e| self.alloc_failure(e.to_string()))?;

        if memory.len() != count {
            let got = memory.len();
            self.allocator.free(memory);
            return Err(self.alloc_failure(format!(
                "allocator returned {} buffers, expected {}",
                got, count
            )));
        }

        let slots: Vec<Slot> = memory
            .into_iter()
            .enumerate()
            .map(|(offset, planes)| {
                let buffer = Buffer {
                    index: first_index + offset,
                    planes: planes
                        .iter()
                        .zip(&layout.strides)
                        .map(|(plane, &stride)| BufferPlane {
                            size: plane.len(),
                            stride,
                            fd: plane.fd,
                            addr: geometry.mapped.then(|| plane.bytes.as_ptr() as usize),
                        })
                        .collect(),
                };
                Slot {
                    buffer,
                    memory: planes,
                    position: BufferPosition::Free,
                    generation: 0,
                }
            })
            .collect();

        if geometry.policy != AllocationPolicy::Silent {
            let failure = slots
                .iter()
                .find_map(|slot| self.allocator.register(&slot.buffer).err());
            if let Some(err) = failure {
                self.allocator
                    .free(slots.into_iter().map(|slot| slot.memory).collect());
                return Err(self.alloc_failure(format!("registration failed: {}", err)));
            }
        }

        Ok(slots)
    }

    fn alloc_failure(&self, reason: String) -> PipelineError {
        tracing::error!("[{}] allocation failed: {}", self.name, reason);
        PipelineError::AllocFailure {
            pool: self.name.clone(),
            reason,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.inner.lock().allocated
    }

    /// Take the next free buffer and mark it InHal.
    pub fn acquire(self: &Arc<Self>, hint: AcquireHint) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();
        if !inner.allocated {
            return Err(PipelineError::Runtime(format!(
                "pool '{}' acquired before allocation",
                self.name
            )));
        }

        let len = inner.slots.len();
        let preferred = match hint {
            AcquireHint::Prefer(index)
                if index < len && inner.slots[index].position == BufferPosition::Free =>
            {
                Some(index)
            }
            _ => None,
        };

        let index = match preferred.or_else(|| {
            (0..len)
                .map(|step| (inner.cursor + step) % len)
                .find(|&i| inner.slots[i].position == BufferPosition::Free)
        }) {
            Some(index) => index,
            None => self.grow_one(&mut inner)?,
        };

        inner.generation += 1;
        let generation = inner.generation;
        let slot = &mut inner.slots[index];
        slot.position = BufferPosition::InHal;
        slot.generation = generation;
        let buffer = slot.buffer.clone();
        inner.cursor = (index + 1) % inner.slots.len();
        inner.stats.acquired += 1;

        tracing::trace!("[{}] acquired index {} ({})", self.name, index, generation);
        Ok(BufferHandle::new(Arc::clone(self), buffer, generation))
    }

    fn grow_one(&self, inner: &mut PoolInner) -> Result<usize> {
        let no_buffer = || PipelineError::NoBufferAvailable {
            pool: self.name.clone(),
        };
        let geometry = inner.geometry.clone().ok_or_else(no_buffer)?;
        if geometry.policy != AllocationPolicy::OnDemand || inner.slots.len() >= geometry.max_count
        {
            return Err(no_buffer());
        }

        let index = inner.slots.len();
        let mut slots = self.allocate_slots(&geometry, index, 1)?;
        inner.slots.append(&mut slots);
        inner.stats.grown += 1;
        tracing::debug!(
            "[{}] grew to {} of {} buffers",
            self.name,
            inner.slots.len(),
            geometry.max_count
        );
        Ok(index)
    }

    /// Poll `acquire` up to `retries` extra times, sleeping `backoff` between
    /// attempts. Never blocks longer than `retries × backoff`.
    pub fn acquire_with_retry(
        self: &Arc<Self>,
        hint: AcquireHint,
        retries: u32,
        backoff: Duration,
    ) -> Result<BufferHandle> {
        let mut attempt = 0;
        loop {
            match self.acquire(hint) {
                Err(PipelineError::NoBufferAvailable { .. }) if attempt < retries => {
                    attempt += 1;
                    tracing::trace!(
                        "[{}] no buffer available, retry {}/{}",
                        self.name,
                        attempt,
                        retries
                    );
                    std::thread::sleep(backoff);
                }
                result => return result,
            }
        }
    }

    /// Return a buffer after normal completion.
    pub fn release(&self, index: usize) -> Result<()> {
        self.return_to_free(index, None, ReturnKind::Release)
    }

    /// Return a buffer that never reached the hardware.
    pub fn cancel(&self, index: usize) -> Result<()> {
        self.return_to_free(index, None, ReturnKind::Cancel)
    }

    /// Return through a handle. Refused if the index was reset or handed to
    /// a newer handle since `generation` was acquired.
    pub(super) fn settle(&self, index: usize, generation: u64, kind: ReturnKind) -> Result<()> {
        self.return_to_free(index, Some(generation), kind)
    }

    fn stale(&self, inner: &mut PoolInner, index: usize, generation: u64) -> PipelineError {
        inner.stats.stale_returns += 1;
        let current = inner.slots.get(index).map_or(0, |slot| slot.generation);
        tracing::error!(
            "[{}] stale handle for index {} (generation {}, now {})",
            self.name,
            index,
            generation,
            current
        );
        PipelineError::BufferState {
            pool: self.name.clone(),
            reason: format!(
                "index {} was reset or reassigned since generation {}",
                index, generation
            ),
        }
    }

    fn return_to_free(&self, index: usize, generation: Option<u64>, kind: ReturnKind) -> Result<()> {
        let mut inner = self.inner.lock();
        let (position, current) = match inner.slots.get(index) {
            Some(slot) => (slot.position, slot.generation),
            None => {
                return Err(PipelineError::BufferState {
                    pool: self.name.clone(),
                    reason: format!("{:?} of unknown index {}", kind, index),
                });
            }
        };

        if let Some(generation) = generation {
            if generation != current {
                return Err(self.stale(&mut inner, index, generation));
            }
        }

        if position == BufferPosition::Free {
            inner.stats.double_releases += 1;
            tracing::error!("[{}] {:?} of index {} which is already free", self.name, kind, index);
            return Err(PipelineError::BufferState {
                pool: self.name.clone(),
                reason: format!("index {} released twice", index),
            });
        }

        inner.slots[index].position = BufferPosition::Free;
        inner.slots[index].generation = 0;
        match kind {
            ReturnKind::Release => inner.stats.released += 1,
            ReturnKind::Cancel => inner.stats.cancelled += 1,
        }
        tracing::trace!("[{}] {:?} index {}", self.name, kind, index);
        Ok(())
    }

    /// InHal → InHardware, when a stage queues the buffer to its device.
    pub fn mark_in_hardware(&self, index: usize) -> Result<()> {
        self.move_position(index, None, BufferPosition::InHal, BufferPosition::InHardware)
    }

    /// InHardware → InHal, when a stage dequeues the buffer from its device.
    pub fn mark_returned(&self, index: usize) -> Result<()> {
        self.move_position(index, None, BufferPosition::InHardware, BufferPosition::InHal)
    }

    /// Position move through a handle, checked against its generation.
    pub(super) fn move_leased(
        &self,
        index: usize,
        generation: u64,
        from: BufferPosition,
        to: BufferPosition,
    ) -> Result<()> {
        self.move_position(index, Some(generation), from, to)
    }

    fn move_position(
        &self,
        index: usize,
        generation: Option<u64>,
        from: BufferPosition,
        to: BufferPosition,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(generation) = generation {
            if inner.slots.get(index).is_some_and(|slot| slot.generation != generation) {
                return Err(self.stale(&mut inner, index, generation));
            }
        }
        match inner.slots.get_mut(index) {
            Some(slot) if slot.position == from => {
                slot.position = to;
                Ok(())
            }
            Some(slot) => Err(PipelineError::BufferState {
                pool: self.name.clone(),
                reason: format!(
                    "index {} is {:?}, expected {:?} before moving to {:?}",
                    index, slot.position, from, to
                ),
            }),
            None => Err(PipelineError::BufferState {
                pool: self.name.clone(),
                reason: format!("unknown index {}", index),
            }),
        }
    }

    /// Buffers `acquire` could hand out right now, including on-demand headroom.
    pub fn available_count(&self) -> usize {
        let inner = self.inner.lock();
        if !inner.allocated {
            return 0;
        }
        let free = inner
            .slots
            .iter()
            .filter(|slot| slot.position == BufferPosition::Free)
            .count();
        let headroom = match &inner.geometry {
            Some(g) if g.policy == AllocationPolicy::OnDemand => {
                g.max_count.saturating_sub(inner.slots.len())
            }
            _ => 0,
        };
        free + headroom
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn position(&self, index: usize) -> Option<BufferPosition> {
        self.inner.lock().slots.get(index).map(|slot| slot.position)
    }

    /// Position of `index` as seen by the handle of `generation`. `None` once
    /// that handle went stale.
    pub(super) fn leased_position(&self, index: usize, generation: u64) -> Option<BufferPosition> {
        self.inner
            .lock()
            .slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.position)
    }

    /// Snapshot of every index's position, ordered by index.
    pub fn positions(&self) -> Vec<BufferPosition> {
        self.inner.lock().slots.iter().map(|slot| slot.position).collect()
    }

    pub fn count_in(&self, position: BufferPosition) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.position == position)
            .count()
    }

    pub fn buffer(&self, index: usize) -> Option<Buffer> {
        self.inner.lock().slots.get(index).map(|slot| slot.buffer.clone())
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.inner.lock().stats.clone()
    }

    /// Mark every index free without releasing memory. Handles still out are
    /// invalidated: returning one afterwards fails with `BufferState` and
    /// leaves the index alone.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let busy = inner
            .slots
            .iter()
            .filter(|slot| slot.position != BufferPosition::Free)
            .count();
        if busy > 0 {
            tracing::warn!("[{}] reset with {} buffers still assigned", self.name, busy);
        }
        for slot in &mut inner.slots {
            slot.position = BufferPosition::Free;
            slot.generation = 0;
        }
        inner.cursor = 0;
        tracing::debug!("[{}] reset", self.name);
    }

    /// Free all backing memory. Safe to call repeatedly.
    pub fn deinit(&self) {
        let mut inner = self.inner.lock();
        if !inner.allocated && inner.slots.is_empty() {
            return;
        }
        let slots = std::mem::take(&mut inner.slots);
        inner.allocated = false;
        inner.cursor = 0;
        drop(inner);

        let count = slots.len();
        self.allocator
            .free(slots.into_iter().map(|slot| slot.memory).collect());
        tracing::info!("[{}] deinit: freed {} buffers", self.name, count);
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut self.inner.get_mut().slots);
        if !slots.is_empty() {
            self.allocator
                .free(slots.into_iter().map(|slot| slot.memory).collect());
        }
    }
}
