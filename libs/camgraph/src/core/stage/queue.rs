// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::core::frames::FrameId;
use crate::core::{PipelineError, Result};

/// Bounded blocking queue of frame ids feeding one stage.
#[derive(Clone)]
pub struct FrameQueue {
    name: String,
    capacity: usize,
    tx: Sender<FrameId>,
    rx: Receiver<FrameId>,
}

impl FrameQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            name: name.into(),
            capacity,
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// For `crossbeam_channel::select!` alongside a shutdown channel.
    pub fn receiver(&self) -> &Receiver<FrameId> {
        &self.rx
    }

    pub fn push(&self, id: FrameId, timeout: Duration) -> Result<()> {
        match self.tx.send_timeout(id, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(self.timed_out(timeout)),
            Err(SendTimeoutError::Disconnected(_)) => Err(PipelineError::Runtime(format!(
                "queue '{}' disconnected",
                self.name
            ))),
        }
    }

    pub fn wait_and_pop(&self, timeout: Duration) -> Result<FrameId> {
        match self.rx.recv_timeout(timeout) {
            Ok(id) => Ok(id),
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Runtime(format!(
                "queue '{}' disconnected",
                self.name
            ))),
        }
    }

    fn timed_out(&self, timeout: Duration) -> PipelineError {
        PipelineError::QueueTimeout {
            queue: self.name.clone(),
            waited_ms: timeout.as_millis() as u64,
        }
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<FrameId> {
        self.rx.try_iter().collect()
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new("isp", 4);
        for i in 0..3 {
            queue.push(FrameId(i), Duration::from_millis(10)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.wait_and_pop(Duration::from_millis(10)).unwrap(), FrameId(0));
        assert_eq!(queue.drain(), vec![FrameId(1), FrameId(2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_times_out() {
        let queue = FrameQueue::new("scc", 1);
        let err = queue.wait_and_pop(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::QueueTimeout { ref queue, waited_ms: 5 } if queue == "scc"
        ));
    }

    #[test]
    fn test_push_times_out_when_full() {
        let queue = FrameQueue::new("full", 1);
        queue.push(FrameId(0), Duration::from_millis(5)).unwrap();
        assert!(queue.push(FrameId(1), Duration::from_millis(5)).unwrap_err().is_transient());
    }

    #[test]
    fn test_clones_share_the_channel() {
        let queue = FrameQueue::new("shared", 2);
        let producer = queue.clone();
        std::thread::spawn(move || producer.push(FrameId(9), Duration::from_secs(1)))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(queue.wait_and_pop(Duration::from_secs(1)).unwrap(), FrameId(9));
    }
}
