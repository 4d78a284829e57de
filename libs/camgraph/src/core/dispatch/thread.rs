// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::{StageContext, StageStatus, run_stage_loop};
use crate::core::frames::StageId;
use crate::core::stage::StageDriver;
use crate::core::{PipelineError, Result};

/// A running stage thread and the means to stop it.
pub struct StageThread {
    stage: StageId,
    name: String,
    shutdown_tx: Sender<()>,
    handle: JoinHandle<Box<dyn StageDriver>>,
    status: Arc<Mutex<StageStatus>>,
}

impl StageThread {
    pub fn spawn(ctx: StageContext, driver: Box<dyn StageDriver>) -> Result<Self> {
        let stage = ctx.stage.id();
        let name = ctx.stage.name().to_string();
        let status = Arc::clone(&ctx.status);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name(format!("stage-{}", name))
            .spawn(move || run_stage_loop(ctx, driver, shutdown_rx))
            .map_err(|e| PipelineError::Runtime(format!("Failed to spawn thread: {}", e)))?;

        Ok(Self {
            stage,
            name,
            shutdown_tx,
            handle,
            status,
        })
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn status(&self) -> StageStatus {
        *self.status.lock()
    }

    /// Raise the stop flag without waiting.
    pub fn signal_stop(&self) {
        // Full means a stop is already pending.
        let _ = self.shutdown_tx.try_send(());
    }

    /// Stop the thread and take its driver back.
    pub fn join(self) -> Result<Box<dyn StageDriver>> {
        self.signal_stop();
        match self.handle.join() {
            Ok(driver) => {
                tracing::debug!("[{}] Stage thread joined", self.name);
                Ok(driver)
            }
            Err(panic_err) => {
                tracing::error!("[{}] Stage thread panicked: {:?}", self.name, panic_err);
                Err(PipelineError::Runtime(format!(
                    "stage '{}' thread panicked",
                    self.name
                )))
            }
        }
    }
}

impl std::fmt::Debug for StageThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageThread")
            .field("stage", &self.stage)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
