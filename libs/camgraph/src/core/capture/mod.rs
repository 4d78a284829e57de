// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod counter;
mod still_capture;

pub use counter::{CaptureCounter, CaptureGuard, CounterSnapshot};
pub use still_capture::{CaptureReport, StillCapture};
