// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-frame capture metadata.
//!
//! Each frame owns its own copy; stages never share a metadata instance
//! between in-flight frames.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form metadata values attached by stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<MetadataValue>),
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Hardware control/result parameters for one capture cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Sensor start-of-exposure timestamp.
    pub timestamp_ns: i64,
    pub exposure_ns: u64,
    pub frame_duration_ns: u64,
    pub iso: u32,
    /// False when a stage reported the frame as unusable (AE not settled,
    /// flash pre-fire, corrupted statistics).
    pub valid: bool,
    #[serde(default)]
    pub values: BTreeMap<String, MetadataValue>,
}

impl Default for CaptureMetadata {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            exposure_ns: 0,
            frame_duration_ns: 0,
            iso: 100,
            valid: true,
            values: BTreeMap::new(),
        }
    }
}

impl CaptureMetadata {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.values.get(key)
    }

    /// Overlay a stage's result metadata onto this frame's copy.
    pub fn merge_from(&mut self, result: &CaptureMetadata) {
        if result.timestamp_ns != 0 {
            self.timestamp_ns = result.timestamp_ns;
        }
        if result.exposure_ns != 0 {
            self.exposure_ns = result.exposure_ns;
        }
        if result.frame_duration_ns != 0 {
            self.frame_duration_ns = result.frame_duration_ns;
        }
        self.iso = result.iso;
        self.valid &= result.valid;
        for (key, value) in &result.values {
            self.values.insert(key.clone(), value.clone());
        }
    }
}
