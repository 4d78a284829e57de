// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Built-in topologies, one per operating mode.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{EdgeSpec, StageSpec, Topology};
use crate::core::frames::{EntityKind, StageId};
use crate::core::selector::HoldSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Rear sensor: full 3AA/ISP chain with a held raw buffer for stills.
    #[default]
    NormalBack,
    NormalFront,
    /// Offline pass over a previously captured buffer.
    Reprocessing,
    Vision,
    HighSpeed,
}

impl OperatingMode {
    pub const ALL: [OperatingMode; 5] = [
        OperatingMode::NormalBack,
        OperatingMode::NormalFront,
        OperatingMode::Reprocessing,
        OperatingMode::Vision,
        OperatingMode::HighSpeed,
    ];
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal_back" | "back" => Ok(OperatingMode::NormalBack),
            "normal_front" | "front" => Ok(OperatingMode::NormalFront),
            "reprocessing" => Ok(OperatingMode::Reprocessing),
            "vision" => Ok(OperatingMode::Vision),
            "high_speed" => Ok(OperatingMode::HighSpeed),
            other => Err(format!("unknown operating mode '{}'", other)),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

impl Topology {
    /// The built-in graph for `mode` at the given sensor frame period.
    pub fn for_mode(mode: OperatingMode, frame_period: Duration) -> Topology {
        let input_timeout_ms = millis(frame_period * 2);
        let (stages, edges, completion_timeout_ms) = match mode {
            OperatingMode::NormalBack => normal_back(),
            OperatingMode::NormalFront => normal_front(),
            OperatingMode::Reprocessing => reprocessing(),
            OperatingMode::Vision => vision(),
            OperatingMode::HighSpeed => high_speed(),
        };
        Topology {
            mode,
            stages,
            edges,
            input_timeout_ms,
            completion_timeout_ms: millis(frame_period * completion_timeout_ms),
        }
    }
}

type Preset = (Vec<StageSpec>, Vec<EdgeSpec>, u32);

fn sensor() -> StageSpec {
    StageSpec::new(StageId::SENSOR, "sensor", EntityKind::OutputOnly)
        .with_dst_pool("sensor")
        .regenerating()
}

fn normal_back() -> Preset {
    let stages = vec![
        sensor().holding(HoldSide::Destination),
        StageSpec::new(StageId::THREE_AA, "3aa", EntityKind::InputOutput).with_dst_pool("bayer"),
        StageSpec::new(StageId::ISP, "isp", EntityKind::InputOutput).with_dst_pool("yuv"),
        StageSpec::new(StageId::PREVIEW_SCALER, "preview", EntityKind::InputOutput)
            .with_dst_pool("preview"),
        StageSpec::new(StageId::SCC, "scc", EntityKind::InputOutput)
            .with_dst_pool("still")
            .optional(false),
    ];
    let edges = vec![
        EdgeSpec::new(StageId::SENSOR, StageId::THREE_AA),
        EdgeSpec::new(StageId::THREE_AA, StageId::ISP),
        EdgeSpec::new(StageId::ISP, StageId::PREVIEW_SCALER),
        EdgeSpec::new(StageId::ISP, StageId::SCC),
    ];
    (stages, edges, 4)
}

fn normal_front() -> Preset {
    let stages = vec![
        sensor(),
        StageSpec::new(StageId::ISP, "isp", EntityKind::InputOutput).with_dst_pool("yuv"),
        StageSpec::new(StageId::PREVIEW_SCALER, "preview", EntityKind::InputOutput)
            .with_dst_pool("preview"),
    ];
    let edges = vec![
        EdgeSpec::new(StageId::SENSOR, StageId::ISP),
        EdgeSpec::new(StageId::ISP, StageId::PREVIEW_SCALER),
    ];
    (stages, edges, 4)
}

fn reprocessing() -> Preset {
    let stages = vec![
        StageSpec::new(StageId::ISP_REPROCESSING, "isp_reprocessing", EntityKind::InputOutput)
            .with_src_pool("sensor")
            .with_dst_pool("yuv_reprocessing"),
        StageSpec::new(StageId::SCC_REPROCESSING, "scc_reprocessing", EntityKind::InputOutput)
            .with_dst_pool("still"),
        StageSpec::new(StageId::COLOR_CONVERSION, "thumbnail", EntityKind::InputOutput)
            .with_dst_pool("thumbnail")
            .optional(true),
        StageSpec::new(StageId::STILL_ENCODE, "jpeg", EntityKind::InputOutput)
            .with_dst_pool("jpeg"),
    ];
    let edges = vec![
        EdgeSpec::new(StageId::ISP_REPROCESSING, StageId::SCC_REPROCESSING).with_depth(2),
        EdgeSpec::new(StageId::SCC_REPROCESSING, StageId::COLOR_CONVERSION).with_depth(2),
        EdgeSpec::new(StageId::SCC_REPROCESSING, StageId::STILL_ENCODE).with_depth(2),
    ];
    (stages, edges, 10)
}

fn vision() -> Preset {
    let stages = vec![
        StageSpec::new(StageId::VISION, "vision", EntityKind::OutputOnly)
            .with_dst_pool("vision")
            .regenerating(),
    ];
    (stages, Vec::new(), 4)
}

fn high_speed() -> Preset {
    let (stages, edges, _) = normal_front();
    let edges = edges.into_iter().map(|e| e.with_depth(8)).collect();
    (stages, edges, 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(33);

    #[test]
    fn test_every_preset_validates() {
        for mode in OperatingMode::ALL {
            let topology = Topology::for_mode(mode, PERIOD);
            topology.validate().unwrap();
            assert_eq!(topology.mode, mode);
            assert_eq!(topology.input_timeout(), Duration::from_millis(66));
        }
    }

    #[test]
    fn test_normal_back_holds_sensor_output() {
        let topology = Topology::for_mode(OperatingMode::NormalBack, PERIOD);
        assert_eq!(
            topology.held_stages(),
            vec![(StageId::SENSOR, HoldSide::Destination)]
        );
        let scc = topology.stage(StageId::SCC).unwrap();
        assert!(scc.optional);
        assert!(!scc.default_requested);
    }

    #[test]
    fn test_reprocessing_root_takes_owned_input() {
        let topology = Topology::for_mode(OperatingMode::Reprocessing, PERIOD);
        assert_eq!(topology.roots(), vec![StageId::ISP_REPROCESSING]);
        let root = topology.stage(StageId::ISP_REPROCESSING).unwrap();
        assert_eq!(root.src_pool.as_deref(), Some("sensor"));
        assert!(!root.regenerate);
    }

    #[test]
    fn test_high_speed_runs_deeper_and_tighter() {
        let normal = Topology::for_mode(OperatingMode::NormalFront, PERIOD);
        let fast = Topology::for_mode(OperatingMode::HighSpeed, PERIOD);
        assert!(fast.edges.iter().all(|e| e.queue_depth == 8));
        assert!(fast.completion_timeout() < normal.completion_timeout());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("back".parse::<OperatingMode>(), Ok(OperatingMode::NormalBack));
        assert_eq!("high_speed".parse::<OperatingMode>(), Ok(OperatingMode::HighSpeed));
        assert!("slowmo".parse::<OperatingMode>().is_err());
    }
}
