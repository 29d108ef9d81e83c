//! Instruction-dependency ("poisoning") tracker: propagates producer-pc
//! sets through registers and memory as drained trace records arrive.

pub mod mem;
pub mod reg;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::tracer::record::{InsnRecord, RegRecord};

pub use mem::MemPoisoningTracker;
pub use reg::RegPoisoningTracker;

pub const N_INT_REG: usize = 32;
pub const N_FP_REG: usize = 32;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TrackingMode {
    /// Ignore the record stream.
    #[default]
    Stop,
    /// Every retired instruction becomes a producer of its destination.
    Poisoning,
    /// Only instructions with an already-poisoned source propagate.
    Propagate,
}

/// Consumes drained [`InsnRecord`]s and maintains the dependency state.
///
/// Register slots 0..32 are the integer file, 32..64 the fp file.
pub struct InsnPoisoningTracker {
    mode: TrackingMode,
    mem: MemPoisoningTracker,
    regs: RegPoisoningTracker,
}

impl Default for InsnPoisoningTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn reg_slot(rec: &RegRecord) -> usize {
    if rec.val.is_fp() {
        N_INT_REG + rec.reg
    } else {
        rec.reg
    }
}

impl InsnPoisoningTracker {
    pub fn new() -> Self {
        Self {
            mode: TrackingMode::Stop,
            mem: MemPoisoningTracker::new(),
            regs: RegPoisoningTracker::new(N_INT_REG + N_FP_REG),
        }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TrackingMode) {
        self.mode = mode;
    }

    pub fn update(&mut self, insn: &InsnRecord) {
        match self.mode {
            TrackingMode::Poisoning => {
                let mut producers = self.src_producer_set(insn);
                producers.insert(insn.pc);
                self.poison_destinations(insn, &producers);
            }
            TrackingMode::Propagate => {
                if self.src_poisoned(insn) {
                    let mut producers = self.src_producer_set(insn);
                    producers.insert(insn.pc);
                    self.poison_destinations(insn, &producers);
                }
            }
            TrackingMode::Stop => {}
        }
    }

    pub fn src_poisoned(&self, insn: &InsnRecord) -> bool {
        for rs in insn.rs_rec.iter().filter(|rs| rs.valid) {
            if self.regs.is_poisoned(reg_slot(rs)) {
                return true;
            }
        }
        if insn.mem_rec.valid && !insn.mem_rec.write {
            return self.mem.is_poisoned(insn.mem_rec.vaddr, insn.mem_rec.op_size);
        }
        false
    }

    pub fn src_producer_set(&self, insn: &InsnRecord) -> BTreeSet<u64> {
        let mut producers = BTreeSet::new();
        for rs in insn.rs_rec.iter().filter(|rs| rs.valid) {
            producers.extend(self.regs.query_producer(reg_slot(rs)).iter().copied());
        }
        if insn.mem_rec.valid && !insn.mem_rec.write {
            producers.extend(
                self.mem
                    .query_producer(insn.mem_rec.vaddr, insn.mem_rec.op_size),
            );
        }
        producers
    }

    fn poison_destinations(&mut self, insn: &InsnRecord, producers: &BTreeSet<u64>) {
        for rd in insn.rd_rec.iter().filter(|rd| rd.valid) {
            self.regs.poisoning(reg_slot(rd), producers);
        }
        if insn.mem_rec.valid && insn.mem_rec.write {
            self.mem
                .poisoning(insn.mem_rec.vaddr, insn.mem_rec.op_size, producers);
        }
    }

    pub fn reg_tracker(&self) -> &RegPoisoningTracker {
        &self.regs
    }

    pub fn mem_tracker(&self) -> &MemPoisoningTracker {
        &self.mem
    }

    pub fn reset(&mut self) {
        self.mem.reset();
        self.regs.reset();
    }
}
