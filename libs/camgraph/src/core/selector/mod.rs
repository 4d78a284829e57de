// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod config;
mod frame_selector;

pub use config::{HoldKey, HoldSide, SelectionPolicy, SelectorConfig};
pub use frame_selector::{FramePredicate, FrameSelector, SelectorStats};
