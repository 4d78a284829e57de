// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod driver;
mod pipeline_stage;
mod queue;
mod simulated;

pub use driver::{DoneStatus, StageDone, StageDriver, StageDriverProvider, StageRequest};
pub use pipeline_stage::PipelineStage;
pub use queue::FrameQueue;
pub use simulated::{SimulatedBehavior, SimulatedStage, SimulatedStageProvider, SimulatedStats};
