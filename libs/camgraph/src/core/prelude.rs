// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Commonly used types for `use camgraph::prelude::*`.

pub use crate::core::{
    // Buffers
    buffers::{BufferPools, HeapAllocator},

    // Errors
    error::{PipelineError, Result},

    // Factories
    factory::{FactoryOptions, FrameFactory, GraphFrameFactory},

    // Frames
    frames::{FrameId, FrameType, StageId},

    // Configuration
    config::PipelineConfig,

    // Topology
    topology::{OperatingMode, Topology},
};
