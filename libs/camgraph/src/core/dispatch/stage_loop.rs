// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::Mutex;

use super::{DispatchState, DispatchTiming, StageStatus};
use crate::core::buffers::{AcquireHint, BufferHandle, BufferPosition};
use crate::core::factory::FrameBuilder;
use crate::core::frames::{
    BufferBinding, EntityKind, EntityState, FrameId, FrameStore, FrameType, StageId, StageOutput,
    recycle_frame,
};
use crate::core::selector::{FrameSelector, HoldSide};
use crate::core::stage::{DoneStatus, PipelineStage, StageDone, StageDriver, StageRequest};
use crate::core::{PipelineError, Result};

/// Longest single wait on the driver, so stop requests are seen promptly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Everything a stage thread needs besides its driver.
pub struct StageContext {
    pub stage: PipelineStage,
    pub store: Arc<FrameStore>,
    pub builder: Arc<FrameBuilder>,
    pub selector: Option<Arc<FrameSelector>>,
    pub timing: DispatchTiming,
    pub status: Arc<Mutex<StageStatus>>,
}

/// How a frame left the dispatch step.
enum Dispatch {
    Sent,
    Bypassed,
    Abandoned,
    /// Nothing for this stage to do (entity missing or already finished).
    Ignored,
}

struct Plan {
    requested: bool,
    binding: BufferBinding,
    kind: EntityKind,
    state: EntityState,
    has_input: bool,
    is_root: bool,
}

/// Run one stage until its shutdown channel fires, then hand the driver back.
pub fn run_stage_loop(
    ctx: StageContext,
    mut driver: Box<dyn StageDriver>,
    shutdown_rx: Receiver<()>,
) -> Box<dyn StageDriver> {
    let mut stage_loop = StageLoop {
        ctx: &ctx,
        driver: driver.as_mut(),
        shutdown_rx,
        stopping: false,
        stranded: Vec::new(),
    };
    stage_loop.run();
    driver
}

struct StageLoop<'a> {
    ctx: &'a StageContext,
    driver: &'a mut dyn StageDriver,
    shutdown_rx: Receiver<()>,
    stopping: bool,
    /// Destinations of requests the driver would not give back. They stay
    /// InHardware until the driver completes them or is stopped.
    stranded: Vec<(FrameId, BufferHandle)>,
}

impl StageLoop<'_> {
    fn name(&self) -> &str {
        self.ctx.stage.name()
    }

    fn stage(&self) -> StageId {
        self.ctx.stage.id()
    }

    fn set_state(&self, state: DispatchState) {
        self.ctx.status.lock().state = state;
    }

    fn count(&self, f: impl FnOnce(&mut StageStatus)) {
        f(&mut self.ctx.status.lock());
    }

    fn stop_requested(&mut self) -> bool {
        if !self.stopping {
            self.stopping = !matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Empty));
        }
        self.stopping
    }

    fn run(&mut self) {
        tracing::info!("[{}] Stage thread started", self.name());
        let shutdown = self.shutdown_rx.clone();
        let input = self.ctx.stage.input.receiver().clone();

        loop {
            self.set_state(DispatchState::WaitInput);
            let id = crossbeam_channel::select! {
                recv(shutdown) -> _ => {
                    self.stopping = true;
                    break;
                },
                recv(input) -> msg => match msg {
                    Ok(id) => id,
                    Err(_) => break,
                },
                default(self.ctx.timing.input_timeout) => {
                    self.count(|s| s.input_timeouts += 1);
                    tracing::trace!(
                        "[{}] no input within {:?}",
                        self.name(),
                        self.ctx.timing.input_timeout
                    );
                    self.regenerate();
                    continue;
                }
            };

            self.count(|s| s.frames_in += 1);
            self.process(id);
            if self.stop_requested() {
                break;
            }
            self.regenerate();
            self.set_state(DispatchState::Idle);
        }

        self.shutdown();
    }

    fn process(&mut self, id: FrameId) {
        self.set_state(DispatchState::DispatchToStage);
        let outcome = match self.dispatch(id) {
            Ok(Dispatch::Sent) => {
                self.count(|s| s.dispatched += 1);
                self.set_state(DispatchState::WaitStageComplete);
                let result = self.await_completion(id);
                if result.is_err() {
                    self.withdraw(id);
                }
                result
            }
            Ok(Dispatch::Bypassed) => {
                self.count(|s| s.bypassed += 1);
                Ok(())
            }
            Ok(Dispatch::Abandoned) => {
                self.count(|s| s.failed += 1);
                Ok(())
            }
            Ok(Dispatch::Ignored) => Ok(()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {}
            Err(PipelineError::NotFound(what)) => {
                tracing::debug!("[{}] frame {} gone: {}", self.name(), id, what);
                return;
            }
            Err(e) => {
                if self.stopping {
                    tracing::debug!("[{}] frame {} dropped on stop: {}", self.name(), id, e);
                } else {
                    tracing::warn!("[{}] frame {} failed: {}", self.name(), id, e);
                }
                self.count(|s| s.failed += 1);
                self.fail_frame(id);
            }
        }

        self.set_state(DispatchState::RouteDownstream);
        self.hold(id);
        self.route(id);
        self.finish(id);
    }

    fn plan(&self, id: FrameId) -> Result<Option<Plan>> {
        let stage = self.stage();
        self.ctx.store.with_frame(id, |frame| {
            let is_root = frame.parent_of(stage).is_none();
            frame.entity(stage).map(|e| Plan {
                requested: e.is_requested(),
                binding: e.binding(),
                kind: e.kind(),
                state: e.state(),
                has_input: e.source().is_some(),
                is_root,
            })
        })
    }

    fn dispatch(&mut self, id: FrameId) -> Result<Dispatch> {
        let Some(plan) = self.plan(id)? else {
            tracing::debug!("[{}] frame {} has no entity for this stage", self.name(), id);
            return Ok(Dispatch::Ignored);
        };
        if plan.state != EntityState::Requested {
            return Ok(Dispatch::Ignored);
        }

        let input_missing = plan.kind.needs_input() && !plan.has_input;
        if input_missing && plan.is_root {
            return Err(PipelineError::Stage {
                stage: self.name().to_string(),
                reason: format!("frame {} arrived without an input buffer", id),
            });
        }
        if !plan.requested || input_missing {
            return self.bypass(id);
        }

        let handle = match self.acquire_destination(id, &plan)? {
            Some(Acquired::Buffer(handle)) => Some(handle),
            Some(Acquired::Skip) => return self.bypass(id),
            Some(Acquired::Abandon) => {
                self.ctx
                    .store
                    .with_frame_mut(id, |frame| frame.abandon_subtree(self.stage()))??;
                return Ok(Dispatch::Abandoned);
            }
            None => None,
        };

        let request = self.bind_request(id, handle)?;
        tracing::trace!(
            "[{}] frame {} -> hardware (src {:?}, dst {:?})",
            self.name(),
            id,
            request.src,
            request.dst
        );
        self.driver.enqueue(request)?;
        Ok(Dispatch::Sent)
    }

    fn acquire_destination(&self, id: FrameId, plan: &Plan) -> Result<Option<Acquired>> {
        if !plan.kind.produces_output() {
            return Ok(None);
        }
        let pool = self.ctx.stage.dst_pool.as_ref().ok_or_else(|| {
            PipelineError::Configuration(format!("stage '{}' has no destination pool", self.name()))
        })?;
        let timing = &self.ctx.timing;

        let acquired = match plan.binding {
            BufferBinding::Delivery => match pool.acquire(AcquireHint::Next) {
                Ok(handle) => Acquired::Buffer(handle),
                Err(e) if e.is_transient() => {
                    tracing::trace!("[{}] frame {}: skipping delivery, {}", self.name(), id, e);
                    Acquired::Skip
                }
                Err(e) => return Err(e),
            },
            BufferBinding::Fixed => {
                match pool.acquire_with_retry(
                    AcquireHint::Next,
                    timing.acquire_retries,
                    timing.acquire_backoff,
                ) {
                    Ok(handle) => Acquired::Buffer(handle),
                    Err(e) => {
                        tracing::warn!("[{}] frame {} abandoned: {}", self.name(), id, e);
                        Acquired::Abandon
                    }
                }
            }
        };
        Ok(Some(acquired))
    }

    /// Attach the destination, move the entity to Processing and build the
    /// hardware request.
    fn bind_request(&self, id: FrameId, handle: Option<BufferHandle>) -> Result<StageRequest> {
        let stage = self.stage();
        self.ctx.store.with_frame_mut(id, move |frame| -> Result<StageRequest> {
            let metadata = frame.metadata().clone();
            let entity = frame
                .entity_mut(stage)
                .ok_or_else(|| PipelineError::NotFound(format!("entity {} in frame {}", stage, id)))?;
            let dst = match handle {
                Some(handle) => {
                    let view = handle.view();
                    entity.attach_destination(handle)?;
                    Some(view)
                }
                None => {
                    entity.skip_destination();
                    None
                }
            };
            entity.begin_processing()?;
            if let Some(handle) = entity.destination() {
                handle.mark_in_hardware()?;
            }
            Ok(StageRequest {
                frame: id,
                src: entity.source().view(),
                dst,
                metadata,
            })
        })?
    }

    fn bypass(&self, id: FrameId) -> Result<Dispatch> {
        let stage = self.stage();
        self.ctx.store.with_frame_mut(id, |frame| -> Result<()> {
            let entity = frame
                .entity_mut(stage)
                .ok_or_else(|| PipelineError::NotFound(format!("entity {} in frame {}", stage, id)))?;
            entity.skip_destination();
            entity.begin_processing()?;
            frame.complete_stage(stage, StageOutput::Skipped)
        })??;
        tracing::trace!("[{}] frame {} bypassed", self.name(), id);
        Ok(Dispatch::Bypassed)
    }

    fn await_completion(&mut self, id: FrameId) -> Result<()> {
        let deadline = Instant::now() + self.ctx.timing.completion_timeout;
        loop {
            if self.stop_requested() {
                return Err(PipelineError::Runtime(format!(
                    "stopped while waiting on frame {}",
                    id
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::Stage {
                    stage: self.name().to_string(),
                    reason: format!(
                        "no completion for frame {} within {:?}",
                        id, self.ctx.timing.completion_timeout
                    ),
                });
            }
            match self.driver.wait_done(WAIT_SLICE.min(deadline - now))? {
                Some(done) if done.frame == id => return self.complete(id, done),
                Some(done) => {
                    tracing::warn!(
                        "[{}] discarding stale completion for frame {}",
                        self.name(),
                        done.frame
                    );
                    self.reclaim(Some(done.frame));
                }
                None => {}
            }
        }
    }

    fn complete(&self, id: FrameId, done: StageDone) -> Result<()> {
        let stage = self.stage();
        let name = self.name();
        let failed = self.ctx.store.with_frame_mut(id, |frame| -> Result<bool> {
            frame.metadata_mut().merge_from(&done.metadata);
            let entity = frame
                .entity(stage)
                .ok_or_else(|| PipelineError::NotFound(format!("entity {} in frame {}", stage, id)))?;
            let produced = match entity.destination() {
                Some(handle) => {
                    handle.mark_returned()?;
                    Some(handle.view())
                }
                None => None,
            };
            match done.status {
                DoneStatus::Filled => {
                    let output = produced.map_or(StageOutput::Skipped, StageOutput::Produced);
                    frame.complete_stage(stage, output)?;
                    Ok(false)
                }
                DoneStatus::Skipped => {
                    frame.complete_stage(stage, StageOutput::Skipped)?;
                    Ok(false)
                }
                DoneStatus::Failed(reason) => {
                    tracing::warn!("[{}] hardware failed frame {}: {}", name, id, reason);
                    frame.abandon_subtree(stage)?;
                    Ok(true)
                }
            }
        })??;

        if failed {
            self.count(|s| s.failed += 1);
        } else {
            self.count(|s| s.completed += 1);
        }
        Ok(())
    }

    /// Take back a request the driver never completed. If the driver refuses,
    /// the destination is detached from the frame and parked as stranded so
    /// nothing hands it out while the hardware may still write to it.
    fn withdraw(&mut self, id: FrameId) {
        let reason = match self.driver.cancel(id) {
            Ok(true) => {
                tracing::debug!("[{}] frame {} withdrawn from hardware", self.name(), id);
                return;
            }
            Ok(false) => return,
            Err(e) => e,
        };
        tracing::warn!(
            "[{}] frame {} stays with the hardware until stop: {}",
            self.name(),
            id,
            reason
        );
        let stage = self.stage();
        match self
            .ctx
            .store
            .with_frame_mut(id, |frame| frame.detach_destination(stage))
        {
            Ok(Some(handle)) => self.stranded.push((id, handle)),
            Ok(None) => {}
            Err(e) => tracing::warn!("[{}] detaching frame {}: {}", self.name(), id, e),
        }
    }

    /// Give stranded destinations back to their pools once the driver is done
    /// with them: the one for `frame`, or all of them after a stop.
    fn reclaim(&mut self, frame: Option<FrameId>) {
        let (done, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stranded)
            .into_iter()
            .partition(|(id, _)| frame.is_none_or(|f| f == *id));
        self.stranded = kept;
        for (id, handle) in done {
            let view = handle.view();
            if let Err(e) = handle.mark_returned() {
                tracing::warn!("[{}] returning {}: {}", self.name(), view, e);
            }
            match handle.release() {
                Ok(()) => tracing::debug!("[{}] reclaimed {} of frame {}", self.name(), view, id),
                Err(e) => tracing::error!("[{}] reclaiming {}: {}", self.name(), view, e),
            }
        }
    }

    /// Fail this stage's part of `id`, bringing any buffer back from hardware.
    fn fail_frame(&self, id: FrameId) {
        let stage = self.stage();
        let result = self.ctx.store.with_frame_mut(id, |frame| {
            if let Some(handle) = frame.entity(stage).and_then(|e| e.destination()) {
                if handle.position() == Some(BufferPosition::InHardware) {
                    if let Err(e) = handle.mark_returned() {
                        tracing::warn!("[{}] returning {}: {}", self.name(), handle.view(), e);
                    }
                }
            }
            frame.abandon_subtree(stage)
        });
        match result {
            Ok(Ok(())) | Err(PipelineError::NotFound(_)) => {}
            Ok(Err(e)) | Err(e) => {
                tracing::warn!("[{}] failing frame {}: {}", self.name(), id, e);
            }
        }
    }

    fn hold(&self, id: FrameId) {
        let (Some(side), Some(selector)) = (self.ctx.stage.spec.hold, &self.ctx.selector) else {
            return;
        };
        let stage = self.stage();
        let worth_holding = self
            .ctx
            .store
            .with_frame(id, |frame| {
                frame.entity(stage).is_some_and(|e| {
                    e.state() == EntityState::Complete
                        && match side {
                            HoldSide::Destination => e.destination().is_some(),
                            HoldSide::Source => e.source().is_some(),
                        }
                })
            })
            .unwrap_or(false);
        if !worth_holding {
            return;
        }
        if let Err(e) = selector.manage_frame_hold_list(id, stage, side) {
            tracing::warn!("[{}] holding frame {}: {}", self.name(), id, e);
        }
    }

    fn route(&self, id: FrameId) {
        let stage = self.stage();
        let children = self
            .ctx
            .store
            .with_frame(id, |frame| {
                frame
                    .children_of(stage)
                    .into_iter()
                    .filter(|&c| frame.entity(c).is_some_and(|e| !e.is_terminal()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for child in children {
            let Some(queue) = self.ctx.stage.output(child) else {
                tracing::warn!("[{}] no queue wired to {}", self.name(), child);
                self.abandon_child(id, child);
                continue;
            };
            if let Err(e) = queue.push(id, self.ctx.timing.input_timeout) {
                tracing::warn!("[{}] frame {} not delivered to {}: {}", self.name(), id, child, e);
                self.abandon_child(id, child);
            }
        }
    }

    fn abandon_child(&self, id: FrameId, child: StageId) {
        if let Ok(Err(e)) = self
            .ctx
            .store
            .with_frame_mut(id, |frame| frame.abandon_subtree(child))
        {
            tracing::warn!("[{}] abandoning {} of frame {}: {}", self.name(), child, id, e);
        }
    }

    /// Release what the frame no longer needs and retire it if it is done.
    fn finish(&self, id: FrameId) {
        let consumed = self
            .ctx
            .store
            .with_frame_mut(id, |frame| frame.take_consumed_outputs())
            .unwrap_or_default();
        for handle in consumed {
            let view = handle.view();
            if let Err(e) = handle.release() {
                tracing::error!("[{}] releasing {}: {}", self.name(), view, e);
            }
        }
        if let Some(frame) = self.ctx.store.try_retire(id) {
            tracing::trace!("[{}] frame {} retired", self.name(), id);
            recycle_frame(frame);
        }
    }

    fn regenerate(&mut self) {
        let spec = &self.ctx.stage.spec;
        if !spec.regenerate || self.stop_requested() || !self.ctx.stage.input.is_empty() {
            return;
        }
        let has_space = self
            .ctx
            .stage
            .dst_pool
            .as_ref()
            .is_none_or(|pool| pool.available_count() > 0);
        if !has_space {
            tracing::trace!("[{}] no buffer space, not regenerating", self.name());
            return;
        }

        self.set_state(DispatchState::RegenerateFrame);
        match self.ctx.builder.create_frame(FrameType::Preview) {
            Ok(id) => {
                if let Err(e) = self.ctx.stage.input.push(id, self.ctx.timing.input_timeout) {
                    tracing::warn!("[{}] regenerated frame {} not queued: {}", self.name(), id, e);
                    if let Some(frame) = self.ctx.store.abandon(id) {
                        recycle_frame(frame);
                    }
                } else {
                    self.count(|s| s.regenerated += 1);
                    tracing::trace!("[{}] regenerated frame {}", self.name(), id);
                }
            }
            Err(e) => tracing::warn!("[{}] regeneration failed: {}", self.name(), e),
        }
    }

    fn shutdown(&mut self) {
        let drained = self.ctx.stage.input.drain();
        if !drained.is_empty() {
            tracing::debug!("[{}] dropping {} queued frames", self.name(), drained.len());
        }
        for id in drained {
            self.fail_frame(id);
            self.finish(id);
        }
        if let Err(e) = self.driver.stop() {
            tracing::warn!("[{}] driver stop failed: {}", self.name(), e);
        }
        self.reclaim(None);
        self.set_state(DispatchState::Stopped);
        tracing::info!("[{}] Stage thread stopped", self.name());
    }
}

enum Acquired {
    Buffer(BufferHandle),
    /// Delivery output with no free buffer: run the frame through unbuffered.
    Skip,
    /// Mandatory output with no buffer after retries.
    Abandon,
}
