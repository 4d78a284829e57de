// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::topology::Topology;

/// Where a stage thread is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    #[default]
    Idle,
    WaitInput,
    DispatchToStage,
    WaitStageComplete,
    RouteDownstream,
    RegenerateFrame,
    Stopped,
}

/// Per-stage counters, readable while the thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StageStatus {
    pub state: DispatchState,
    pub frames_in: u64,
    pub dispatched: u64,
    pub bypassed: u64,
    pub completed: u64,
    pub failed: u64,
    pub input_timeouts: u64,
    pub regenerated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTiming {
    pub input_timeout: Duration,
    pub completion_timeout: Duration,
    pub acquire_retries: u32,
    pub acquire_backoff: Duration,
}

impl DispatchTiming {
    pub fn from_topology(topology: &Topology, acquire_retries: u32, acquire_backoff: Duration) -> Self {
        Self {
            input_timeout: topology.input_timeout(),
            completion_timeout: topology.completion_timeout(),
            acquire_retries,
            acquire_backoff,
        }
    }
}
