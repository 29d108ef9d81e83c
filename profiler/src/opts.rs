//! Configuration for the per-hart engine bundle.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::poison::TrackingMode;

const DEFAULT_SIMPOINT_INTERVAL: u64 = 100_000_000;
const TEST_SIMPOINT_INTERVAL: u64 = 1 << 10;

/// SimPoint profile collection (BBV + PC frequency vectors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpointOpts {
    /// Interval length in retired instructions.
    pub interval_size: u64,
}

impl Default for SimpointOpts {
    fn default() -> Self {
        Self {
            interval_size: env::var("RVSCOPE_SIMPOINT_INTERVAL").map_or_else(
                |_| DEFAULT_SIMPOINT_INTERVAL,
                |s| s.parse().unwrap_or(DEFAULT_SIMPOINT_INTERVAL),
            ),
        }
    }
}

/// Debug trace collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOpts {
    /// Retirements to skip before the driver enables tracing.
    pub skip: u64,
    /// Ring capacity; 0 streams every record directly.
    pub last_n: usize,
}

impl Default for TraceOpts {
    fn default() -> Self {
        Self {
            skip: 0,
            last_n: env::var("RVSCOPE_TRACE_LAST_N")
                .map_or(0, |s| s.parse().unwrap_or(0)),
        }
    }
}

/// Everything a hart's instrumentation bundle is configured by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerOpts {
    /// Directory all artifacts are written into.
    pub out_dir: PathBuf,
    /// Stem of the SimPoint artifact file names.
    pub out_name: String,
    pub simpoint: Option<SimpointOpts>,
    pub trace: Option<TraceOpts>,
    /// Train the reconvergence predictor.
    pub reconv: bool,
    pub poison_mode: TrackingMode,
}

impl Default for ProfilerOpts {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            out_name: "profile".to_string(),
            simpoint: None,
            trace: None,
            reconv: false,
            poison_mode: env::var("RVSCOPE_POISON_MODE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
        }
    }
}

impl ProfilerOpts {
    /// Small intervals and everything enabled, for exercising the bundle.
    pub fn test_opts(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            out_name: "test".to_string(),
            simpoint: Some(SimpointOpts {
                interval_size: TEST_SIMPOINT_INTERVAL,
            }),
            trace: Some(TraceOpts { skip: 0, last_n: 0 }),
            reconv: true,
            poison_mode: TrackingMode::Poisoning,
        }
    }
}
