// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod pipeline_config;

pub use pipeline_config::{DispatchConfig, PipelineConfig};
