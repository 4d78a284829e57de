// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use crate::core::Result;
use crate::core::buffers::BufferRef;
use crate::core::frames::{CaptureMetadata, FrameId};
use crate::core::topology::StageSpec;

/// One unit of work handed to a stage's hardware.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub frame: FrameId,
    pub src: Option<BufferRef>,
    pub dst: Option<BufferRef>,
    pub metadata: CaptureMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DoneStatus {
    /// Destination written.
    Filled,
    /// Hardware dropped the request without writing anything.
    Skipped,
    Failed(String),
}

/// Completion signal for one [`StageRequest`].
#[derive(Debug, Clone)]
pub struct StageDone {
    pub frame: FrameId,
    pub status: DoneStatus,
    /// Result metadata reported by the stage.
    pub metadata: CaptureMetadata,
}

/// Wrapper around one hardware processing unit.
///
/// A driver is owned by exactly one stage thread while running and handed
/// back to the factory when the thread exits, so it can be restarted.
pub trait StageDriver: Send {
    fn name(&self) -> &str;

    /// Reserve hardware queue slots for `buffer_count` in-flight buffers.
    fn prepare(&mut self, buffer_count: usize) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Stop streaming and drop anything still queued.
    fn stop(&mut self) -> Result<()>;

    fn enqueue(&mut self, request: StageRequest) -> Result<()>;

    /// Withdraw the outstanding request for `frame`. `Ok(true)` if it was
    /// still queued, `Ok(false)` if the driver no longer had it; either way
    /// the hardware is done with its buffers. `Err` when the request cannot
    /// be taken back: its buffers stay with the hardware until `stop`.
    fn cancel(&mut self, frame: FrameId) -> Result<bool>;

    /// Wait up to `timeout` for the next completion. `Ok(None)` on timeout.
    fn wait_done(&mut self, timeout: Duration) -> Result<Option<StageDone>>;
}

/// Builds one driver per stage when a factory wires its graph.
pub trait StageDriverProvider: Send + Sync {
    fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageDriver>>;
}
