// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::CaptureCounter;
use crate::core::factory::GraphFrameFactory;
use crate::core::frames::{FrameId, FrameType, SourceBuffer};
use crate::core::selector::{FrameSelector, HoldKey};
use crate::core::{PipelineError, Result};

/// Outcome of one still-capture burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CaptureReport {
    pub requested: u64,
    pub completed: u64,
    /// Shots that never became a reprocessing frame.
    pub skipped: u64,
    pub failed: u64,
}

/// Turns frames held by a preview pipeline into reprocessing frames.
///
/// Each shot pops a frame from the hold list, moves its held buffer into a
/// new reprocessing frame as an owned source, copies the capture metadata
/// across and hands the frame to the reprocessing factory. The frame carries
/// a [`CaptureGuard`](super::CaptureGuard) so the burst can wait for every
/// shot to settle.
pub struct StillCapture {
    name: String,
    selector: Arc<FrameSelector>,
    hold: HoldKey,
    retry_count: u32,
    counter: CaptureCounter,
}

impl StillCapture {
    pub fn new(name: impl Into<String>, selector: Arc<FrameSelector>, hold: HoldKey) -> Self {
        let name = name.into();
        Self {
            counter: CaptureCounter::new(name.clone()),
            name,
            selector,
            hold,
            retry_count: 3,
        }
    }

    /// Poll intervals to wait for a held frame before a shot is skipped.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn counter(&self) -> &CaptureCounter {
        &self.counter
    }

    /// Prepare a single shot and submit it to `target`.
    pub fn prepare_shot(&self, remaining: usize, target: &GraphFrameFactory) -> Result<FrameId> {
        let source = self.selector.select_frames(
            remaining,
            self.hold.stage,
            self.hold.side,
            self.retry_count,
        )?;

        let taken = self.selector.store().with_frame_mut(source, |frame| {
            (
                frame.take_held_buffer(self.hold.stage, self.hold.side),
                frame.metadata().clone(),
            )
        });
        self.selector.finish_selected(source);
        let (buffer, metadata) = taken?;
        let buffer = buffer.ok_or_else(|| PipelineError::Stage {
            stage: self.name.clone(),
            reason: format!("frame {} still in use at {}", source, self.hold),
        })?;

        let id = target.store().next_frame_id();
        let mut frame = match target.builder().build(id, FrameType::Reprocessing) {
            Ok(frame) => frame,
            Err(e) => {
                buffer.release()?;
                return Err(e);
            }
        };
        let Some(root) = frame.roots().first().copied() else {
            buffer.release()?;
            return Err(PipelineError::Configuration(format!(
                "[{}] reprocessing graph has no root stage",
                self.name
            )));
        };
        if let Some(entity) = frame.entity_mut(root) {
            entity.set_source(SourceBuffer::Owned(buffer));
        }
        *frame.metadata_mut() = metadata;
        frame.attach_guard(self.counter.begin());

        tracing::debug!(
            "[{}] preview frame {} -> reprocessing frame {}",
            self.name,
            source,
            id
        );
        target.submit_frame(frame)
    }

    /// Run `shots` shots through `target` and wait up to `timeout` for them
    /// to settle.
    pub fn capture_burst(
        &self,
        shots: u32,
        target: &GraphFrameFactory,
        timeout: Duration,
    ) -> CaptureReport {
        let before = self.counter.snapshot();
        let mut report = CaptureReport {
            requested: u64::from(shots),
            ..CaptureReport::default()
        };

        tracing::info!("[{}] Still capture burst of {} shots", self.name, shots);
        for shot in 0..shots {
            let remaining = (shots - shot) as usize;
            match self.prepare_shot(remaining, target) {
                Ok(_) => {}
                Err(e @ PipelineError::SelectionMiss { .. }) => {
                    tracing::debug!("[{}] shot {} skipped: {}", self.name, shot, e);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!("[{}] shot {} skipped: {}", self.name, shot, e);
                    report.skipped += 1;
                }
            }
        }

        if !self.counter.wait_idle(timeout) {
            tracing::warn!(
                "[{}] {} shots still in flight after {:?}",
                self.name,
                self.counter.in_flight(),
                timeout
            );
        }
        let after = self.counter.snapshot();
        report.completed = after.succeeded - before.succeeded;
        report.failed = after.failed - before.failed;
        tracing::info!("[{}] Still capture finished: {:?}", self.name, report);
        report
    }
}

impl std::fmt::Debug for StillCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillCapture")
            .field("name", &self.name)
            .field("hold", &self.hold)
            .field("counter", &self.counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::BufferPools;
    use crate::core::factory::FactoryOptions;
    use crate::core::frames::{FrameStore, StageId};
    use crate::core::selector::{HoldSide, SelectorConfig};
    use crate::core::stage::SimulatedStageProvider;
    use crate::core::topology::{OperatingMode, Topology};

    #[test]
    fn test_empty_hold_list_skips_every_shot() {
        let store = FrameStore::new("preview");
        let selector = Arc::new(FrameSelector::new(
            "preview",
            store,
            SelectorConfig {
                poll_interval_ms: 1,
                ..SelectorConfig::default()
            },
        ));
        let target = GraphFrameFactory::new(
            Topology::for_mode(OperatingMode::Reprocessing, Duration::from_millis(33)),
            Arc::new(BufferPools::new()),
            Arc::new(SimulatedStageProvider::default()),
            FactoryOptions::default(),
        )
        .unwrap();

        let still = StillCapture::new(
            "still",
            selector,
            HoldKey::new(StageId::SENSOR, HoldSide::Destination),
        )
        .with_retry_count(1);
        let report = still.capture_burst(3, &target, Duration::from_millis(50));

        assert_eq!(
            report,
            CaptureReport {
                requested: 3,
                completed: 0,
                skipped: 3,
                failed: 0,
            }
        );
        assert_eq!(still.counter().snapshot().started, 0);
        assert_eq!(target.in_flight_count(), 0);
    }
}
