//! SimPoint-style interval profiling.

pub mod bb_tracker;
pub mod pc_freqvec;

pub use bb_tracker::BbTracker;
pub use pc_freqvec::{freq_vec_index, PcFreqVecTracker, FREQ_VEC_SIZE, PC_SAMPLING_BITS};
