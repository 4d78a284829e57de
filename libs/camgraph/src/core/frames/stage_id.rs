// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one pipeline stage within a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub u32);

impl StageId {
    /// Sensor capture (bayer out).
    pub const SENSOR: StageId = StageId(0);
    /// 3A statistics + front-end bayer processing.
    pub const THREE_AA: StageId = StageId(1);
    /// Image signal processor.
    pub const ISP: StageId = StageId(2);
    /// Secondary capture channel (full-size still output).
    pub const SCC: StageId = StageId(3);
    /// Display/preview scaler.
    pub const PREVIEW_SCALER: StageId = StageId(4);
    /// Color conversion (callback/thumbnail formats).
    pub const COLOR_CONVERSION: StageId = StageId(5);
    pub const STILL_ENCODE: StageId = StageId(6);
    pub const VIDEO_ENCODE: StageId = StageId(7);
    pub const ISP_REPROCESSING: StageId = StageId(8);
    pub const SCC_REPROCESSING: StageId = StageId(9);
    /// Low-power vision capture.
    pub const VISION: StageId = StageId(10);

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Human-readable name for the well-known stages.
    pub fn well_known_name(&self) -> Option<&'static str> {
        Some(match *self {
            StageId::SENSOR => "sensor",
            StageId::THREE_AA => "3aa",
            StageId::ISP => "isp",
            StageId::SCC => "scc",
            StageId::PREVIEW_SCALER => "preview_scaler",
            StageId::COLOR_CONVERSION => "color_conversion",
            StageId::STILL_ENCODE => "still_encode",
            StageId::VIDEO_ENCODE => "video_encode",
            StageId::ISP_REPROCESSING => "isp_reprocessing",
            StageId::SCC_REPROCESSING => "scc_reprocessing",
            StageId::VISION => "vision",
            _ => return None,
        })
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.well_known_name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "stage({})", self.0),
        }
    }
}

impl From<u32> for StageId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StageId::ISP.to_string(), "isp(2)");
        assert_eq!(StageId(42).to_string(), "stage(42)");
    }

    #[test]
    fn test_serde_transparent() {
        let json = serde_json::to_string(&StageId::SCC).unwrap();
        assert_eq!(json, "3");
        let back: StageId = serde_json::from_str("10").unwrap();
        assert_eq!(back, StageId::VISION);
    }
}
