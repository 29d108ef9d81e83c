//! SimPoint basic-block vector tracker.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::errors::ArtifactError;
use crate::output::{gz_line_writer, LineSink};

#[derive(Debug, Clone, Copy)]
struct BbNode {
    bb_id: u64,
    /// Instructions attributed to this block in the current interval.
    count: u64,
}

/// Accumulates per-basic-block instruction counts and emits one sparse
/// frequency vector per interval of retired instructions.
///
/// Block identity is the pc of the block's last instruction; ids are
/// assigned on first appearance and never change.
pub struct BbTracker {
    blocks: HashMap<u64, BbNode>,
    next_bb_id: u64,
    interval_size: u64,
    dyn_inst: u64,
    total_inst: u64,
    path: PathBuf,
    out: LineSink,
}

impl BbTracker {
    /// Opens `<dir>/<name>.bb.gz` for the run.
    pub fn create(dir: &Path, name: &str, interval_size: u64) -> Result<Self, ArtifactError> {
        let path = dir.join(format!("{name}.bb.gz"));
        let out = gz_line_writer(&path)?;
        Ok(Self::with_sink(out, path, interval_size))
    }

    pub fn from_writer(out: LineSink, interval_size: u64) -> Self {
        Self::with_sink(out, PathBuf::from("<writer>"), interval_size)
    }

    fn with_sink(out: LineSink, path: PathBuf, interval_size: u64) -> Self {
        Self {
            blocks: HashMap::new(),
            next_bb_id: 0,
            interval_size,
            dyn_inst: 0,
            total_inst: 0,
            path,
            out,
        }
    }

    /// Called at each control-flow terminator with the pc of the block's
    /// last instruction and the block's instruction count. Returns true when
    /// this call closed an interval and dumped a vector.
    pub fn record(&mut self, pc: u64, num_inst: u64) -> bool {
        let next_bb_id = &mut self.next_bb_id;
        let node = self.blocks.entry(pc).or_insert_with(|| {
            let bb_id = *next_bb_id;
            *next_bb_id += 1;
            BbNode { bb_id, count: 0 }
        });
        node.count += num_inst;

        self.dyn_inst += num_inst;
        self.total_inst += num_inst;

        if self.dyn_inst > self.interval_size {
            self.dyn_inst -= self.interval_size;
            self.dump_interval();
            true
        } else {
            false
        }
    }

    pub fn total_inst(&self) -> u64 {
        self.total_inst
    }

    /// Emits the current interval's non-zero counters in ascending block-id
    /// order (ids are 1-based on the wire) and clears them.
    fn dump_interval(&mut self) {
        let mut by_id = vec![0u64; self.next_bb_id as usize];
        for node in self.blocks.values_mut() {
            by_id[node.bb_id as usize] = node.count;
            node.count = 0;
        }

        let mut line = String::with_capacity(16 + by_id.len());
        line.push('T');
        for (bb_id, &count) in by_id.iter().enumerate() {
            if count > 0 {
                line.push_str(&format!(":{}:{}   ", bb_id + 1, count));
            }
        }
        line.push('\n');

        if let Err(err) = self.out.write_all(line.as_bytes()) {
            panic!(
                "SimPoint output error: write to `{}` failed: {err}",
                self.path.display()
            );
        }
    }

    /// Flushes a trailing partial interval, if any.
    pub fn finish(&mut self) {
        if self.blocks.values().any(|node| node.count > 0) {
            self.dump_interval();
        }
        let _ = self.out.flush();
    }
}

impl Drop for BbTracker {
    fn drop(&mut self) {
        self.finish();
    }
}
