// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline configuration via `camgraph.toml`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::buffers::{BufferPoolConfig, PlaneLayout, PoolGeometry};
use crate::core::factory::FactoryOptions;
use crate::core::selector::SelectorConfig;
use crate::core::stage::SimulatedBehavior;
use crate::core::topology::{OperatingMode, Topology};
use crate::core::{PipelineError, Result};

/// Buffers per pool when the configuration names none.
const DEFAULT_POOL_DEPTH: usize = 8;

/// Pools every built-in topology draws from, with their plane sizes.
const DEFAULT_POOLS: &[(&str, usize, usize)] = &[
    ("sensor", 4096, 64),
    ("bayer", 4096, 64),
    ("yuv", 6144, 64),
    ("preview", 6144, 64),
    ("still", 6144, 64),
    ("yuv_reprocessing", 6144, 64),
    ("thumbnail", 1024, 32),
    ("jpeg", 2048, 2048),
    ("vision", 1024, 32),
];

/// Timing knobs for the per-stage dispatch loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Input wait, in frame periods.
    pub input_timeout_frames: u32,
    /// Overrides the mode's completion timeout.
    pub completion_timeout_ms: Option<u64>,
    pub acquire_retries: u32,
    pub acquire_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            input_timeout_frames: 2,
            completion_timeout_ms: None,
            acquire_retries: 3,
            acquire_backoff_ms: 5,
        }
    }
}

/// Pipeline configuration from `camgraph.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub mode: OperatingMode,
    pub frame_period_ms: u64,
    pub pools: Vec<BufferPoolConfig>,
    pub selector: SelectorConfig,
    pub dispatch: DispatchConfig,
    /// Replaces the built-in graph for `mode`.
    pub topology: Option<Topology>,
    /// Driver behaviour for `camgraph-sim`.
    pub simulation: SimulatedBehavior,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "camgraph".into(),
            mode: OperatingMode::default(),
            frame_period_ms: 33,
            pools: default_pools(),
            selector: SelectorConfig::default(),
            dispatch: DispatchConfig::default(),
            topology: None,
            simulation: SimulatedBehavior::with_latency(Duration::from_millis(5)),
        }
    }
}

fn default_pools() -> Vec<BufferPoolConfig> {
    DEFAULT_POOLS
        .iter()
        .map(|&(name, size, stride)| BufferPoolConfig {
            name: name.to_string(),
            geometry: PoolGeometry::new(
                PlaneLayout::single(size, stride),
                DEFAULT_POOL_DEPTH,
                DEFAULT_POOL_DEPTH,
            ),
        })
        .collect()
}

impl PipelineConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "camgraph.toml";

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content).map_err(|e| {
            PipelineError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        tracing::info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    /// Like [`PipelineConfig::load`], falling back to defaults if the file is
    /// missing or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No {} found, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PipelineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_period_ms == 0 {
            return Err(PipelineError::Configuration(
                "frame_period_ms must be positive".into(),
            ));
        }
        if self.dispatch.input_timeout_frames == 0 {
            return Err(PipelineError::Configuration(
                "dispatch.input_timeout_frames must be positive".into(),
            ));
        }
        if self.selector.hold_count == 0 {
            return Err(PipelineError::Configuration(
                "selector.hold_count must be positive".into(),
            ));
        }
        if let Some(topology) = &self.topology {
            topology.validate()?;
        }
        Ok(())
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(self.frame_period_ms)
    }

    /// The graph to run: the configured one, or the built-in graph for
    /// `mode`, with dispatch timing overrides applied.
    pub fn topology_for(&self, mode: OperatingMode) -> Topology {
        let mut topology = match &self.topology {
            Some(topology) if topology.mode == mode => topology.clone(),
            _ => Topology::for_mode(mode, self.frame_period()),
        };
        topology.input_timeout_ms =
            self.frame_period_ms * u64::from(self.dispatch.input_timeout_frames);
        if let Some(ms) = self.dispatch.completion_timeout_ms {
            topology.completion_timeout_ms = ms;
        }
        topology
    }

    pub fn topology(&self) -> Topology {
        self.topology_for(self.mode)
    }

    pub fn factory_options(&self, name: impl Into<String>) -> FactoryOptions {
        FactoryOptions {
            name: name.into(),
            selector: self.selector.clone(),
            acquire_retries: self.dispatch.acquire_retries,
            acquire_backoff: Duration::from_millis(self.dispatch.acquire_backoff_ms),
        }
    }
}
