// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use super::FrameQueue;
use crate::core::buffers::BufferManager;
use crate::core::frames::StageId;
use crate::core::topology::StageSpec;

/// A stage wired into its graph: its input queue, the queues of its
/// children and the pool its outputs come from.
#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub spec: StageSpec,
    pub input: FrameQueue,
    pub outputs: Vec<(StageId, FrameQueue)>,
    pub dst_pool: Option<Arc<BufferManager>>,
}

impl PipelineStage {
    pub fn id(&self) -> StageId {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn output(&self, child: StageId) -> Option<&FrameQueue> {
        self.outputs
            .iter()
            .find(|(id, _)| *id == child)
            .map(|(_, queue)| queue)
    }
}
