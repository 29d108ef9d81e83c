//! Hashed-PC frequency-vector tracker.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::errors::ArtifactError;
use crate::output::{gz_line_writer, LineSink};

/// Bits of pc (word-granular) folded into the vector index.
pub const PC_SAMPLING_BITS: u32 = 13;
/// Number of counters per vector.
pub const FREQ_VEC_SIZE: usize = 1 << PC_SAMPLING_BITS;

const SAMPLING_MASK: u64 = (FREQ_VEC_SIZE as u64) - 1;

/// Index is the word-address folded over itself:
/// `pc[2*B+1 : B] xor pc[B-1 : 0]` of `pc >> 2`, for `B = PC_SAMPLING_BITS`.
pub fn freq_vec_index(pc: u64) -> usize {
    let word = pc >> 2;
    (((word >> PC_SAMPLING_BITS) & SAMPLING_MASK) ^ (word & SAMPLING_MASK)) as usize
}

pub struct PcFreqVecTracker {
    freqvec: Box<[u32; FREQ_VEC_SIZE]>,
    insn_in_vec: u32,
    path: PathBuf,
    out: LineSink,
}

impl PcFreqVecTracker {
    /// Opens `<dir>/<name>.pcfreq.gz` for the run.
    pub fn create(dir: &Path, name: &str) -> Result<Self, ArtifactError> {
        let path = dir.join(format!("{name}.pcfreq.gz"));
        let out = gz_line_writer(&path)?;
        Ok(Self::with_sink(out, path))
    }

    pub fn from_writer(out: LineSink) -> Self {
        Self::with_sink(out, PathBuf::from("<writer>"))
    }

    fn with_sink(out: LineSink, path: PathBuf) -> Self {
        Self {
            freqvec: Box::new([0; FREQ_VEC_SIZE]),
            insn_in_vec: 0,
            path,
            out,
        }
    }

    pub fn update(&mut self, pc: u64) {
        self.insn_in_vec += 1;
        self.freqvec[freq_vec_index(pc)] += 1;
    }

    pub fn insn_in_vec(&self) -> u32 {
        self.insn_in_vec
    }

    /// Writes the current vector and resets it. Interval pacing is the
    /// caller's business; the per-hart context finishes the vector whenever
    /// the basic-block tracker closes an interval.
    pub fn finish_vec(&mut self) {
        let line = format!(
            "{} : {} \n",
            self.insn_in_vec,
            self.freqvec.iter().join(" ")
        );
        if let Err(err) = self.out.write_all(line.as_bytes()) {
            panic!(
                "PC frequency vector output error: write to `{}` failed: {err}",
                self.path.display()
            );
        }
        self.reset_vec();
    }

    fn reset_vec(&mut self) {
        self.insn_in_vec = 0;
        self.freqvec.fill(0);
    }
}

impl Drop for PcFreqVecTracker {
    fn drop(&mut self) {
        if self.insn_in_vec > 0 {
            self.finish_vec();
        }
        let _ = self.out.flush();
    }
}
