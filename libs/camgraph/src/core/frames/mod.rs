// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod entity;
mod frame;
mod metadata;
mod stage_id;
mod store;

pub use entity::{
    BufferBinding, BufferState, EntityKind, EntityState, FrameEntity, SourceBuffer, StageOutput,
};
pub use frame::{Frame, FrameId, FrameType, ReturnDisposition};
pub use metadata::{CaptureMetadata, MetadataValue};
pub use stage_id::StageId;
pub use store::{FrameStore, recycle_frame};
