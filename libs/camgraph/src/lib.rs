// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Orchestration core for multi-stage hardware camera pipelines.
//!
//! A [`GraphFrameFactory`] turns a [`Topology`] into stage threads connected
//! by bounded queues. Frames are built per capture, walk the graph taking
//! buffers from per-role [`BufferManager`] pools, and are retired once every
//! requested stage has finished. A [`FrameSelector`] keeps recent frames
//! aside so a still capture can be reprocessed from an earlier buffer.

#![allow(clippy::type_complexity)] // Complex types are clear in context

pub use crossbeam_channel;

pub mod core;

pub use core::prelude;
pub use core::{
    BufferManager, BufferPoolConfig, BufferPools, CaptureCounter, CaptureReport, FactoryOptions,
    FactoryState, Frame, FrameBuilder, FrameFactory, FrameId, FrameSelector, FrameStore,
    FrameType, GraphFrameFactory, HeapAllocator, OperatingMode, PipelineConfig, PipelineError,
    Result, SelectorConfig, SimulatedBehavior, SimulatedStageProvider, StageDriver,
    StageDriverProvider, StageId, StillCapture, Topology,
};
