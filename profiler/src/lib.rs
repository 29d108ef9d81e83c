//! Instrumentation engines layered over a RISC-V ISA simulator.
//!
//! The simulator's retire loop produces a stream of committed-instruction
//! events; the engines here turn that stream into workload-characterization
//! and speculative-execution-study artifacts:
//!
//! - [`simpoint`]: SimPoint basic-block vectors and hashed-PC frequency
//!   vectors, one line per interval of retired instructions.
//! - [`tracer`]: a per-instruction architectural-effect trace, streamed
//!   directly or bounded to the last N records.
//! - [`reconv`]: a reconvergence predictor learning where divergent paths
//!   of each static branch rejoin, persisted as CSV.
//! - [`poison`]: a producer-pc dependency tracker over registers and
//!   memory, fed by drained trace records.
//! - [`hart`]: the per-hart bundle tying the engines to one hart's event
//!   feed.

pub mod errors;
pub mod hart;
pub mod opts;
pub mod output;
pub mod poison;
pub mod reconv;
pub mod simpoint;
pub mod tracer;

pub use errors::{ArtifactError, CsvLoadError};
pub use hart::HartProfilers;
pub use opts::{ProfilerOpts, SimpointOpts, TraceOpts};
pub use poison::{InsnPoisoningTracker, TrackingMode};
pub use reconv::{DynamicReconvPredictor, ReconvPredict, RiscvReconvPredictor, StaticReconvPredictor};
pub use simpoint::{BbTracker, PcFreqVecTracker};
pub use tracer::{DebugTracer, InsnBits, InsnRecord, Operand, PostExecState};
