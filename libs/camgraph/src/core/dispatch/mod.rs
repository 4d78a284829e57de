// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-stage worker threads.
//!
//! Each stage runs `WaitInput → DispatchToStage → WaitStageComplete →
//! RouteDownstream → (RegenerateFrame | Idle)` on its own thread until its
//! shutdown channel fires.

mod stage_loop;
mod state;
mod thread;

pub use stage_loop::{StageContext, run_stage_loop};
pub use state::{DispatchState, DispatchTiming, StageStatus};
pub use thread::StageThread;
