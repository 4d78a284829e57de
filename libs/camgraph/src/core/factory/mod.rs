// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Frame construction and stage graph lifecycle.

mod builder;
mod frame_factory;
mod graph_factory;

pub use builder::FrameBuilder;
pub use frame_factory::{FactoryState, FrameFactory};
pub use graph_factory::{FactoryOptions, GraphFrameFactory};
