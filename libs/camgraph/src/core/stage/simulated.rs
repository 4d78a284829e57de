// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! In-process stand-in for stage hardware.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{DoneStatus, StageDone, StageDriver, StageDriverProvider, StageRequest};
use crate::core::frames::{FrameId, StageId};
use crate::core::topology::StageSpec;
use crate::core::{PipelineError, Result};

/// Latency and fault injection for one simulated stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedBehavior {
    pub latency_ms: u64,
    /// Drop every Nth request without writing its destination.
    pub skip_every: Option<u64>,
    /// Frame numbers whose request fails.
    pub fail_frames: BTreeSet<u64>,
    /// Frame numbers whose request never completes.
    pub stall_frames: BTreeSet<u64>,
    /// Frame numbers whose request never completes and refuses cancel.
    pub wedged_frames: BTreeSet<u64>,
}

impl SimulatedBehavior {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency_ms: latency.as_millis() as u64,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulatedStats {
    pub prepared_slots: usize,
    pub starts: u32,
    pub stops: u32,
    pub enqueued: u64,
    pub filled: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct SimulatedStage {
    name: String,
    behavior: SimulatedBehavior,
    streaming: bool,
    slots: usize,
    pending: VecDeque<(StageRequest, Instant)>,
    epoch: Instant,
    stats: Arc<Mutex<SimulatedStats>>,
}

impl SimulatedStage {
    pub fn new(name: impl Into<String>, behavior: SimulatedBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            streaming: false,
            slots: 0,
            pending: VecDeque::new(),
            epoch: Instant::now(),
            stats: Arc::new(Mutex::new(SimulatedStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<Mutex<SimulatedStats>> {
        Arc::clone(&self.stats)
    }

    fn stage_error(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::Stage {
            stage: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn finish(&mut self, request: StageRequest) -> StageDone {
        let frame_no = request.frame.0;
        let mut stats = self.stats.lock();
        let sequence = stats.filled + stats.skipped + stats.failed + 1;

        let status = if self.behavior.fail_frames.contains(&frame_no) {
            stats.failed += 1;
            DoneStatus::Failed(format!("injected failure on frame {}", frame_no))
        } else if self
            .behavior
            .skip_every
            .is_some_and(|n| n > 0 && sequence % n == 0)
            || request.dst.is_none() && request.src.is_none()
        {
            stats.skipped += 1;
            DoneStatus::Skipped
        } else {
            stats.filled += 1;
            DoneStatus::Filled
        };

        let mut metadata = request.metadata;
        if request.src.is_none() {
            metadata.timestamp_ns = self.epoch.elapsed().as_nanos() as i64;
            metadata.exposure_ns = self.behavior.latency_ms * 1_000_000;
        }
        metadata.set(format!("{}.sequence", self.name), sequence as i64);

        StageDone {
            frame: request.frame,
            status,
            metadata,
        }
    }
}

impl StageDriver for SimulatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, buffer_count: usize) -> Result<()> {
        if buffer_count == 0 {
            return Err(self.stage_error("prepare with zero buffers"));
        }
        self.slots = buffer_count;
        self.stats.lock().prepared_slots = buffer_count;
        tracing::debug!("[{}] prepared {} slots", self.name, buffer_count);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.slots == 0 {
            return Err(self.stage_error("started before prepare"));
        }
        self.streaming = true;
        self.stats.lock().starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let dropped = self.pending.len();
        self.pending.clear();
        self.streaming = false;
        self.stats.lock().stops += 1;
        if dropped > 0 {
            tracing::debug!("[{}] stop dropped {} pending requests", self.name, dropped);
        }
        Ok(())
    }

    fn enqueue(&mut self, request: StageRequest) -> Result<()> {
        if !self.streaming {
            return Err(self.stage_error("enqueue while not streaming"));
        }
        if self.pending.len() >= self.slots {
            return Err(self.stage_error(format!("all {} slots busy", self.slots)));
        }
        let ready = Instant::now() + Duration::from_millis(self.behavior.latency_ms);
        self.stats.lock().enqueued += 1;
        self.pending.push_back((request, ready));
        Ok(())
    }

    fn cancel(&mut self, frame: FrameId) -> Result<bool> {
        let Some(position) = self.pending.iter().position(|(r, _)| r.frame == frame) else {
            return Ok(false);
        };
        if self.behavior.wedged_frames.contains(&frame.0) {
            return Err(self.stage_error(format!("frame {} is wedged in hardware", frame)));
        }
        self.pending.remove(position);
        self.stats.lock().cancelled += 1;
        tracing::debug!("[{}] cancelled frame {}", self.name, frame);
        Ok(true)
    }

    fn wait_done(&mut self, timeout: Duration) -> Result<Option<StageDone>> {
        let deadline = Instant::now() + timeout;
        let Some((request, ready)) = self.pending.front() else {
            std::thread::sleep(timeout);
            return Ok(None);
        };
        let frame = request.frame.0;
        let stalled = self.behavior.stall_frames.contains(&frame)
            || self.behavior.wedged_frames.contains(&frame);
        if stalled || *ready > deadline {
            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
            return Ok(None);
        }
        std::thread::sleep(ready.saturating_duration_since(Instant::now()));
        match self.pending.pop_front() {
            Some((request, _)) => Ok(Some(self.finish(request))),
            None => Ok(None),
        }
    }
}

/// Hands out [`SimulatedStage`]s, keeping each one's stats reachable.
#[derive(Default)]
pub struct SimulatedStageProvider {
    default: SimulatedBehavior,
    per_stage: HashMap<StageId, SimulatedBehavior>,
    stats: Mutex<HashMap<StageId, Arc<Mutex<SimulatedStats>>>>,
}

impl SimulatedStageProvider {
    pub fn new(default: SimulatedBehavior) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: StageId, behavior: SimulatedBehavior) -> Self {
        self.per_stage.insert(stage, behavior);
        self
    }

    pub fn stats(&self, stage: StageId) -> Option<SimulatedStats> {
        self.stats.lock().get(&stage).map(|s| *s.lock())
    }
}

impl StageDriverProvider for SimulatedStageProvider {
    fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageDriver>> {
        let behavior = self
            .per_stage
            .get(&spec.id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        let stage = SimulatedStage::new(spec.name.clone(), behavior);
        self.stats.lock().insert(spec.id, stage.stats_handle());
        Ok(Box::new(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::BufferRef;
    use crate::core::frames::{CaptureMetadata, FrameId};

    fn request(frame: u64) -> StageRequest {
        StageRequest {
            frame: FrameId(frame),
            src: None,
            dst: Some(BufferRef {
                pool: Arc::from("sensor"),
                index: 0,
            }),
            metadata: CaptureMetadata::default(),
        }
    }

    fn started(behavior: SimulatedBehavior) -> SimulatedStage {
        let mut stage = SimulatedStage::new("sim", behavior);
        stage.prepare(2).unwrap();
        stage.start().unwrap();
        stage
    }

    #[test]
    fn test_lifecycle_order_enforced() {
        let mut stage = SimulatedStage::new("sim", SimulatedBehavior::default());
        assert!(stage.start().is_err());
        assert!(stage.enqueue(request(0)).is_err());
        stage.prepare(1).unwrap();
        stage.start().unwrap();
        stage.enqueue(request(0)).unwrap();
        assert!(stage.enqueue(request(1)).is_err());
    }

    #[test]
    fn test_completion_in_order() {
        let mut stage = started(SimulatedBehavior::default());
        stage.enqueue(request(3)).unwrap();
        stage.enqueue(request(4)).unwrap();
        let first = stage.wait_done(Duration::from_millis(50)).unwrap().unwrap();
        let second = stage.wait_done(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!((first.frame, second.frame), (FrameId(3), FrameId(4)));
        assert_eq!(first.status, DoneStatus::Filled);
        assert!(stage.wait_done(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_fault_injection() {
        let mut stage = started(SimulatedBehavior {
            skip_every: Some(2),
            fail_frames: [5].into_iter().collect(),
            ..SimulatedBehavior::default()
        });
        let mut statuses = Vec::new();
        for frame in [1, 2, 5] {
            stage.enqueue(request(frame)).unwrap();
            statuses.push(stage.wait_done(Duration::from_millis(50)).unwrap().unwrap().status);
        }
        assert_eq!(statuses[0], DoneStatus::Filled);
        assert_eq!(statuses[1], DoneStatus::Skipped);
        assert!(matches!(statuses[2], DoneStatus::Failed(_)));
        let stats = *stage.stats_handle().lock();
        assert_eq!((stats.filled, stats.skipped, stats.failed), (1, 1, 1));
    }

    #[test]
    fn test_stalled_frame_times_out_and_stop_clears_it() {
        let mut stage = started(SimulatedBehavior {
            stall_frames: [7].into_iter().collect(),
            ..SimulatedBehavior::default()
        });
        stage.enqueue(request(7)).unwrap();
        assert!(stage.wait_done(Duration::from_millis(5)).unwrap().is_none());
        stage.stop().unwrap();
        assert!(stage.pending.is_empty());
        assert!(stage.enqueue(request(8)).is_err());
    }

    #[test]
    fn test_cancel_unblocks_requests_behind_a_stall() {
        let mut stage = started(SimulatedBehavior {
            stall_frames: [0].into_iter().collect(),
            ..SimulatedBehavior::default()
        });
        stage.enqueue(request(0)).unwrap();
        stage.enqueue(request(1)).unwrap();
        assert!(stage.wait_done(Duration::from_millis(5)).unwrap().is_none());

        assert!(stage.cancel(FrameId(0)).unwrap());
        assert!(!stage.cancel(FrameId(0)).unwrap());
        let done = stage.wait_done(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!(done.frame, FrameId(1));
        assert_eq!(stage.stats_handle().lock().cancelled, 1);
    }

    #[test]
    fn test_wedged_request_refuses_cancel_until_stop() {
        let mut stage = started(SimulatedBehavior {
            wedged_frames: [4].into_iter().collect(),
            ..SimulatedBehavior::default()
        });
        stage.enqueue(request(4)).unwrap();
        assert!(stage.cancel(FrameId(4)).is_err());
        assert_eq!(stage.pending.len(), 1);
        stage.stop().unwrap();
        assert!(stage.pending.is_empty());
    }

    #[test]
    fn test_provider_tracks_stats_per_stage() {
        let provider = SimulatedStageProvider::new(SimulatedBehavior::default()).with_stage(
            StageId::ISP,
            SimulatedBehavior::with_latency(Duration::from_millis(1)),
        );
        let spec = StageSpec::new(
            StageId::ISP,
            "isp",
            crate::core::frames::EntityKind::InputOutput,
        );
        let mut driver = provider.create(&spec).unwrap();
        driver.prepare(4).unwrap();
        assert_eq!(provider.stats(StageId::ISP).unwrap().prepared_slots, 4);
        assert!(provider.stats(StageId::SENSOR).is_none());
    }
}
