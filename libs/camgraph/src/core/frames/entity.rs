// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

use super::StageId;
use crate::core::buffers::{BufferHandle, BufferRef};
use crate::core::{PipelineError, Result};

/// Which buffer slots a stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Consumes a buffer, produces nothing the graph sees (sink stages).
    InputOnly,
    /// Produces a buffer from nothing (sensor capture).
    OutputOnly,
    InputOutput,
}

impl EntityKind {
    pub fn needs_input(&self) -> bool {
        matches!(self, EntityKind::InputOnly | EntityKind::InputOutput)
    }

    pub fn produces_output(&self) -> bool {
        matches!(self, EntityKind::OutputOnly | EntityKind::InputOutput)
    }
}

/// How a requested entity obtains its destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferBinding {
    /// Must run; acquisition retries and failure errors the entity.
    #[default]
    Fixed,
    /// Best effort; skipped this cycle when no buffer is free.
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    None,
    Requested,
    Processing,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    Requested,
    Processing,
    Complete,
    Rework,
    Error,
}

impl EntityState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntityState::Complete | EntityState::Error)
    }
}

/// Result of one stage's work on a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Produced(BufferRef),
    /// Stage ran (or was bypassed) without producing a buffer.
    Skipped,
}

impl StageOutput {
    pub fn buffer(&self) -> Option<&BufferRef> {
        match self {
            StageOutput::Produced(buffer) => Some(buffer),
            StageOutput::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutput::Skipped)
    }
}

/// An entity's input.
#[derive(Debug, Default)]
pub enum SourceBuffer {
    #[default]
    None,
    /// View of the parent entity's output; the parent keeps ownership.
    Borrowed(BufferRef),
    /// Buffer moved into this frame, e.g. a held capture fed to reprocessing.
    Owned(BufferHandle),
}

impl SourceBuffer {
    pub fn view(&self) -> Option<BufferRef> {
        match self {
            SourceBuffer::None => None,
            SourceBuffer::Borrowed(buffer) => Some(buffer.clone()),
            SourceBuffer::Owned(handle) => Some(handle.view()),
        }
    }

    pub fn is_some(&self) -> bool {
        !matches!(self, SourceBuffer::None)
    }
}

/// One stage's work item inside a frame.
#[derive(Debug)]
pub struct FrameEntity {
    stage: StageId,
    kind: EntityKind,
    binding: BufferBinding,
    requested: bool,
    state: EntityState,
    src_state: BufferState,
    dst_state: BufferState,
    src: SourceBuffer,
    dst: Option<BufferHandle>,
    output: Option<StageOutput>,
    pub(super) parent: Option<usize>,
    pub(super) children: Vec<usize>,
}

impl FrameEntity {
    pub fn new(stage: StageId, kind: EntityKind, binding: BufferBinding) -> Self {
        Self {
            stage,
            kind,
            binding,
            requested: true,
            state: EntityState::Requested,
            src_state: Self::initial_src_state(kind),
            dst_state: Self::initial_dst_state(kind),
            src: SourceBuffer::None,
            dst: None,
            output: None,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Start without a request: the stage passes the frame through unbuffered.
    pub fn unrequested(mut self) -> Self {
        self.requested = false;
        self.binding = BufferBinding::Delivery;
        self
    }

    fn initial_src_state(kind: EntityKind) -> BufferState {
        if kind.needs_input() {
            BufferState::Requested
        } else {
            BufferState::None
        }
    }

    fn initial_dst_state(kind: EntityKind) -> BufferState {
        if kind.produces_output() {
            BufferState::Requested
        } else {
            BufferState::None
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn binding(&self) -> BufferBinding {
        self.binding
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn src_state(&self) -> BufferState {
        self.src_state
    }

    pub fn dst_state(&self) -> BufferState {
        self.dst_state
    }

    pub fn source(&self) -> &SourceBuffer {
        &self.src
    }

    pub fn destination(&self) -> Option<&BufferHandle> {
        self.dst.as_ref()
    }

    pub fn output(&self) -> Option<&StageOutput> {
        self.output.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The only place entity state changes.
    pub fn transition(&mut self, to: EntityState) -> Result<()> {
        use EntityState::*;
        let legal = match (self.state, to) {
            (Requested, Processing) => {
                self.src_state != BufferState::Requested && self.dst_state != BufferState::Requested
            }
            (Processing, Complete) => true,
            (Requested | Processing, Error) => true,
            (Complete | Error | Requested, Rework) => true,
            (Rework, Requested) => true,
            _ => false,
        };
        if !legal {
            return Err(PipelineError::EntityState(format!(
                "{}: {:?} -> {:?} (src {:?}, dst {:?})",
                self.stage, self.state, to, self.src_state, self.dst_state
            )));
        }
        tracing::trace!("[{}] entity {:?} -> {:?}", self.stage, self.state, to);
        self.state = to;
        Ok(())
    }

    pub(super) fn set_request(&mut self, requested: bool) -> Result<()> {
        if self.state != EntityState::Requested || self.dst.is_some() {
            return Err(PipelineError::EntityState(format!(
                "{}: request flag changed after dispatch ({:?})",
                self.stage, self.state
            )));
        }
        self.requested = requested;
        self.binding = if requested {
            BufferBinding::Fixed
        } else {
            BufferBinding::Delivery
        };
        Ok(())
    }

    /// Install this entity's input. An absent input satisfies the source slot.
    pub fn set_source(&mut self, src: SourceBuffer) {
        self.src_state = if src.is_some() {
            BufferState::Complete
        } else {
            BufferState::None
        };
        self.src = src;
    }

    /// Bind the destination buffer the stage will fill.
    pub fn attach_destination(&mut self, handle: BufferHandle) -> Result<()> {
        if !self.kind.produces_output() {
            return Err(PipelineError::EntityState(format!(
                "{}: {:?} entity has no destination slot",
                self.stage, self.kind
            )));
        }
        if let Some(existing) = &self.dst {
            return Err(PipelineError::EntityState(format!(
                "{}: destination already bound to {}",
                self.stage,
                existing.view()
            )));
        }
        self.dst = Some(handle);
        self.dst_state = BufferState::Processing;
        Ok(())
    }

    /// Mark the destination slot as intentionally empty for this cycle.
    pub fn skip_destination(&mut self) {
        self.dst_state = BufferState::None;
    }

    pub fn begin_processing(&mut self) -> Result<()> {
        self.transition(EntityState::Processing)
    }

    /// Record the stage result and move to Complete.
    pub fn complete(&mut self, output: StageOutput) -> Result<()> {
        self.transition(EntityState::Complete)?;
        self.dst_state = match (&output, self.kind.produces_output()) {
            (StageOutput::Produced(_), true) => BufferState::Complete,
            _ => BufferState::None,
        };
        self.output = Some(output);
        Ok(())
    }

    /// Move to Error. No-op if already terminal in Error; Complete stays Complete.
    pub fn fail(&mut self) -> Result<()> {
        match self.state {
            EntityState::Error | EntityState::Complete => Ok(()),
            EntityState::Rework => {
                self.transition(EntityState::Requested)?;
                self.fail()
            }
            _ => {
                self.transition(EntityState::Error)?;
                if self.dst.is_some() {
                    self.dst_state = BufferState::Error;
                }
                if self.src.is_some() {
                    self.src_state = BufferState::Error;
                }
                Ok(())
            }
        }
    }

    /// Complete ∣ Error ∣ Requested → Rework → Requested. Returns a previously
    /// bound destination buffer, which the caller must give back to its pool.
    pub(super) fn rework(&mut self) -> Result<Option<BufferHandle>> {
        self.transition(EntityState::Rework)?;
        let previous = self.dst.take();
        self.output = None;
        self.requested = true;
        self.binding = BufferBinding::Fixed;
        self.src_state = Self::initial_src_state(self.kind);
        self.dst_state = Self::initial_dst_state(self.kind);
        if let SourceBuffer::Borrowed(_) = self.src {
            self.src = SourceBuffer::None;
        }
        self.transition(EntityState::Requested)?;
        Ok(previous)
    }

    pub(super) fn take_destination(&mut self) -> Option<BufferHandle> {
        self.dst.take()
    }

    pub(super) fn take_owned_source(&mut self) -> Option<BufferHandle> {
        match std::mem::take(&mut self.src) {
            SourceBuffer::Owned(handle) => Some(handle),
            other => {
                self.src = other;
                None
            }
        }
    }
}
