// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::core::frames::{FrameId, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoryState {
    Created,
    /// Drivers created and topology checked.
    Built,
    /// Queues connected between stages.
    Wired,
    Running,
    Stopped,
}

/// Constructs the per-mode stage graph and drives its lifecycle.
pub trait FrameFactory: Send {
    fn state(&self) -> FactoryState;

    fn build_graph(&mut self) -> Result<()>;

    fn wire_pipeline_stages(&mut self) -> Result<()>;

    fn prepare_stages(&mut self) -> Result<()>;

    fn start_stages(&mut self) -> Result<()>;

    /// Stop every stage; afterwards no frame is in flight and every buffer is free.
    fn stop_stages(&mut self) -> Result<()>;

    fn create_frame(&self) -> Result<FrameId>;

    fn create_frame_for_stage_only(&self, stage: StageId) -> Result<FrameId>;

    /// Reuse the in-flight frame numbered `hint`, or create one numbered at
    /// least `hint`.
    fn generate_frame(&self, hint: Option<u64>) -> Result<FrameId>;

    /// Feed a frame to the stages at its roots.
    fn enqueue_frame(&self, id: FrameId) -> Result<()>;
}
