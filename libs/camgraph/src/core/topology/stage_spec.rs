// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

use crate::core::frames::{BufferBinding, EntityKind, FrameEntity, StageId};
use crate::core::selector::HoldSide;

/// Default depth of an inter-stage queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_true() -> bool {
    true
}

/// Declarative description of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub name: String,
    pub kind: EntityKind,
    /// Pool an owned input comes from (reprocessing roots).
    #[serde(default)]
    pub src_pool: Option<String>,
    /// Pool this stage's output buffers come from.
    #[serde(default)]
    pub dst_pool: Option<String>,
    /// Optional stages bind their output as `Delivery`: skipped when no buffer is free.
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_true")]
    pub default_requested: bool,
    /// Root stage that creates the next frame itself once it has space.
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default)]
    pub hold: Option<HoldSide>,
}

impl StageSpec {
    pub fn new(id: StageId, name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            src_pool: None,
            dst_pool: None,
            optional: false,
            default_requested: true,
            regenerate: false,
            hold: None,
        }
    }

    pub fn with_src_pool(mut self, pool: impl Into<String>) -> Self {
        self.src_pool = Some(pool.into());
        self
    }

    pub fn with_dst_pool(mut self, pool: impl Into<String>) -> Self {
        self.dst_pool = Some(pool.into());
        self
    }

    pub fn optional(mut self, default_requested: bool) -> Self {
        self.optional = true;
        self.default_requested = default_requested;
        self
    }

    pub fn regenerating(mut self) -> Self {
        self.regenerate = true;
        self
    }

    pub fn holding(mut self, side: HoldSide) -> Self {
        self.hold = Some(side);
        self
    }

    pub fn binding(&self) -> BufferBinding {
        if self.optional {
            BufferBinding::Delivery
        } else {
            BufferBinding::Fixed
        }
    }

    /// Fresh entity for a new frame, carrying `requested`.
    pub fn new_entity(&self, requested: bool) -> FrameEntity {
        let entity = FrameEntity::new(self.id, self.kind, self.binding());
        if requested { entity } else { entity.unrequested() }
    }
}

/// Connection from an upstream stage to a downstream stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: StageId,
    pub to: StageId,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl EdgeSpec {
    pub fn new(from: StageId, to: StageId) -> Self {
        Self {
            from,
            to,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }
}
