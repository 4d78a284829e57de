// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::frames::StageId;

/// Which of a stage's buffers a hold list keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldSide {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HoldKey {
    pub stage: StageId,
    pub side: HoldSide,
}

impl HoldKey {
    pub fn new(stage: StageId, side: HoldSide) -> Self {
        Self { stage, side }
    }
}

impl std::fmt::Display for HoldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}", self.stage, self.side)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// FIFO: hand out the longest-held qualifying frame.
    #[default]
    Oldest,
    /// Zero-shutter-lag: hand out the most recent qualifying frame.
    Newest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Frames kept per hold list before the oldest is evicted.
    pub hold_count: usize,
    /// Wait per selection retry.
    pub poll_interval_ms: u64,
    pub policy: SelectionPolicy,
    /// Skip frames whose metadata (or custom predicate) marked them unusable.
    /// The verdict is taken once, when the frame enters the hold list.
    pub skip_invalid: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hold_count: 3,
            poll_interval_ms: 33,
            policy: SelectionPolicy::Oldest,
            skip_invalid: true,
        }
    }
}

impl SelectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
