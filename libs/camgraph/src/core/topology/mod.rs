// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod graph;
mod presets;
mod stage_spec;

pub use graph::Topology;
pub use presets::OperatingMode;
pub use stage_spec::{DEFAULT_QUEUE_DEPTH, EdgeSpec, StageSpec};
