//! Per-retired-instruction trace recorder.
//!
//! The simulator drives the hooks in a fixed order per retirement:
//! `before_insn_ic_fetch` → `before_insn_execute` → any number of register
//! and data-cache hooks → `after_insn_execute`, or `after_take_trap` when
//! the instruction traps. The tracer accumulates one [`InsnRecord`] across
//! that window and drains it into the configured sink.

pub mod disasm;
pub mod output;
pub mod record;

use std::path::Path;

use crate::errors::ArtifactError;

pub use disasm::{Disassembler, InsnBits};
pub use output::{DirectOutput, LastNOutput, TraceOutput};
pub use record::{InsnRecord, MemRecord, Operand, PostExecState, RegRecord, RegVal};

/// Heartbeat cadence for the "traced N instructions" diagnostic.
const SEQNO_REPORT_MASK: u64 = (1 << 24) - 1;

pub fn trace_file_name(hart_id: u32) -> String {
    format!("trace_proc_{hart_id}.gz")
}

pub struct DebugTracer {
    hart_id: u32,
    enabled: bool,
    seqno: u64,
    instret: u64,
    rec: InsnRecord,
    output: Option<Box<dyn TraceOutput>>,
}

impl DebugTracer {
    pub fn new(hart_id: u32) -> Self {
        Self {
            hart_id,
            enabled: false,
            seqno: 0,
            instret: 0,
            rec: InsnRecord::default(),
            output: None,
        }
    }

    /// Starts tracing into `<dir>/trace_proc_<hart>.gz`.
    ///
    /// `last_n == 0` selects the direct sink; otherwise only the most recent
    /// `last_n` records survive to shutdown. `instret_base` seeds the
    /// retired-instruction counter from the hart's current state.
    pub fn enable_trace(
        &mut self,
        dir: &Path,
        last_n: usize,
        instret_base: u64,
    ) -> Result<(), ArtifactError> {
        let path = dir.join(trace_file_name(self.hart_id));
        let direct = DirectOutput::create(&path)?;
        let output: Box<dyn TraceOutput> = if last_n != 0 {
            Box::new(LastNOutput::new(direct, last_n))
        } else {
            Box::new(direct)
        };
        self.enable_trace_with_output(output, instret_base);
        Ok(())
    }

    pub fn enable_trace_with_output(&mut self, output: Box<dyn TraceOutput>, instret_base: u64) {
        self.output = Some(output);
        self.instret = instret_base;
        self.enabled = true;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn increment_instret(&mut self) {
        self.instret += 1;
    }

    pub fn before_insn_ic_fetch(&mut self, pc: u64) {
        if !self.enabled {
            return;
        }
        self.rec.pc = pc;
        self.rec.seqno = self.seqno;
        // One trace per cycle in an ISA-only simulation.
        self.rec.cycle = self.seqno;
        self.rec.instret = self.instret;
        self.rec.valid = true;
    }

    pub fn before_insn_execute(&mut self, pc: u64, insn: InsnBits) {
        if !self.enabled {
            return;
        }
        if !self.rec.valid {
            self.before_insn_ic_fetch(pc);
        }
        assert!(self.rec.valid);
        assert_eq!(self.rec.pc, pc, "execute hook pc disagrees with fetch");

        self.rec.insn = insn;
        self.rec.good = true;
    }

    pub fn after_xpr_access(&mut self, rn: usize, val: u64, operand: Operand) {
        self.record_reg_access(rn, RegVal::X(val), operand);
    }

    pub fn after_fpr_access(&mut self, rn: usize, val: u64, operand: Operand) {
        self.record_reg_access(rn, RegVal::F(val), operand);
    }

    fn record_reg_access(&mut self, rn: usize, val: RegVal, operand: Operand) {
        if !self.enabled {
            return;
        }
        assert!(self.rec.valid && self.rec.good);

        match operand.src_index() {
            Some(idx) => {
                let slot = &mut self.rec.rs_rec[idx];
                // A slot may be re-read, but only with the same value.
                assert!(
                    !slot.valid || slot.val.bits() == val.bits(),
                    "source operand {idx} rewritten with a different value at pc {:#x}",
                    self.rec.pc
                );
                slot.reg = rn;
                slot.val = val;
                slot.valid = true;
            }
            None => {
                let slot = &mut self.rec.rd_rec[0];
                assert!(
                    !slot.valid,
                    "second destination write at pc {:#x}",
                    self.rec.pc
                );
                slot.reg = rn;
                slot.val = val;
                slot.valid = true;
            }
        }
    }

    pub fn before_dc_translate(&mut self, vaddr: u64, write: bool) {
        if !self.enabled {
            return;
        }
        assert!(self.rec.valid && self.rec.good);

        self.rec.mem_rec.vaddr = vaddr;
        self.rec.mem_rec.write = write;
        self.rec.mem_rec.valid = true;
    }

    pub fn after_dc_access(
        &mut self,
        vaddr: u64,
        paddr: Option<u64>,
        val: u64,
        size: usize,
        write: bool,
    ) {
        if !self.enabled {
            return;
        }
        assert!(
            self.rec.valid
                && self.rec.good
                && self.rec.mem_rec.valid
                && self.rec.mem_rec.vaddr == vaddr
                && self.rec.mem_rec.write == write,
            "data access does not match the pending translation at pc {:#x}",
            self.rec.pc
        );

        self.rec.mem_rec.val = val;
        self.rec.mem_rec.paddr = paddr.unwrap_or(0);
        self.rec.mem_rec.op_size = size;
    }

    /// Completes the in-flight record and returns a copy of what was drained
    /// so downstream consumers (the dependency tracker) can observe it.
    pub fn after_insn_execute(&mut self, pc: u64, post: PostExecState) -> Option<InsnRecord> {
        if !self.enabled {
            return None;
        }
        assert!(self.rec.valid);
        assert_eq!(self.rec.pc, pc, "retire hook pc disagrees with fetch");

        self.rec.post_exec = post;
        self.drain_curr_record()
    }

    /// Trap delivery. A valid in-flight record means a synchronous trap; an
    /// empty one means an external interrupt, logged as an artificial record
    /// with an all-ones pc and zero instruction bits.
    pub fn after_take_trap(
        &mut self,
        epc: u64,
        _new_pc: u64,
        post: PostExecState,
    ) -> Option<InsnRecord> {
        if !self.enabled {
            return None;
        }
        if self.rec.valid {
            assert_eq!(self.rec.pc, epc, "synchronous trap epc disagrees with fetch");
            self.rec.post_exec = post;
            self.rec.exception = true;
        } else {
            self.clear_curr_record();
            self.rec.pc = u64::MAX;
            self.rec.insn = InsnBits(0);
            self.rec.good = false;
            self.rec.valid = true;
            self.rec.seqno = self.seqno;
            self.rec.cycle = self.seqno;
            self.rec.instret = self.instret;
            self.rec.post_exec = post;
            self.rec.exception = true;
        }
        self.drain_curr_record()
    }

    fn drain_curr_record(&mut self) -> Option<InsnRecord> {
        let drained = if self.rec.valid {
            let rec = self.rec;
            self.output
                .as_mut()
                .expect("tracer enabled without an output sink")
                .issue_insn(&rec);
            self.seqno_incr();
            Some(rec)
        } else {
            None
        };
        self.clear_curr_record();
        drained
    }

    fn clear_curr_record(&mut self) {
        self.rec = InsnRecord::default();
    }

    fn seqno_incr(&mut self) {
        if self.seqno & SEQNO_REPORT_MASK == 0 {
            tracing::info!(hart = self.hart_id, "traced {:#x} instructions", self.seqno);
        }
        self.seqno += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::SharedBuf;

    fn enabled_tracer(sink: &SharedBuf) -> DebugTracer {
        let mut tracer = DebugTracer::new(0);
        let direct = DirectOutput::from_writer(Box::new(sink.clone()));
        tracer.enable_trace_with_output(Box::new(direct), 0);
        tracer
    }

    #[test]
    fn add_instruction_formats_exactly() {
        let sink = SharedBuf::new();
        let mut tracer = enabled_tracer(&sink);

        let pc = 0x8000_0000;
        tracer.before_insn_ic_fetch(pc);
        tracer.before_insn_execute(pc, InsnBits(0x003100b3)); // add ra, sp, gp
        tracer.after_xpr_access(2, 0xaa, Operand::Src1);
        tracer.after_xpr_access(3, 0xbb, Operand::Src2);
        tracer.after_xpr_access(1, 0x165, Operand::Dst);
        let drained = tracer.after_insn_execute(pc, PostExecState::default());
        assert!(drained.is_some());

        let text = sink.as_string();
        assert_eq!(
            text,
            "S/0 C/0 I/0 PC/0x0000000080000000 (0x003100b3) add ra, sp, gp\n\
             \tRS0/sp\t0x000000aa\n\
             \tRS1/gp\t0x000000bb\n\
             \tRD/ra\t0x00000165\n\
             \n"
        );
    }

    #[test]
    fn load_records_address_and_destination() {
        let sink = SharedBuf::new();
        let mut tracer = enabled_tracer(&sink);

        let pc = 0x1000;
        tracer.before_insn_ic_fetch(pc);
        tracer.before_insn_execute(pc, InsnBits(0x0000b283)); // ld t0, 0(ra)
        tracer.after_xpr_access(1, 0x2000, Operand::Src1);
        tracer.before_dc_translate(0x2000, false);
        tracer.after_dc_access(0x2000, Some(0x2000), 0xdead_beef, 8, false);
        tracer.after_xpr_access(5, 0xdead_beef, Operand::Dst);
        tracer.after_insn_execute(pc, PostExecState::default());

        let text = sink.as_string();
        assert!(text.contains("\tADDR\t0x00002000\n"), "got: {text}");
        assert!(text.contains("\tRD/t0\t0xdeadbeef\n"), "got: {text}");
    }

    #[test]
    fn seqno_increases_per_drain() {
        let sink = SharedBuf::new();
        let mut tracer = enabled_tracer(&sink);

        for i in 0..3u64 {
            let pc = 0x100 + 4 * i;
            tracer.before_insn_ic_fetch(pc);
            tracer.before_insn_execute(pc, InsnBits(0x00000013));
            let rec = tracer.after_insn_execute(pc, PostExecState::default()).unwrap();
            assert_eq!(rec.seqno, i);
        }
    }

    #[test]
    fn duplicate_source_read_with_same_value_is_tolerated() {
        let sink = SharedBuf::new();
        let mut tracer = enabled_tracer(&sink);

        let pc = 0x100;
        tracer.before_insn_ic_fetch(pc);
        tracer.before_insn_execute(pc, InsnBits(0x003100b3));
        tracer.after_xpr_access(2, 0x7, Operand::Src1);
        tracer.after_xpr_access(2, 0x7, Operand::Src1);
        tracer.after_insn_execute(pc, PostExecState::default());
    }

    #[test]
    fn spontaneous_trap_logs_artificial_record() {
        let sink = SharedBuf::new();
        let mut tracer = enabled_tracer(&sink);

        let post = PostExecState {
            evec: 0x100,
            cause: 0x8000_0000_0000_0001,
            epc: 0x4242,
            sr: 0x11,
        };
        let rec = tracer.after_take_trap(0x4242, 0x100, post).unwrap();
        assert!(rec.exception);
        assert!(!rec.good);
        assert_eq!(rec.pc, u64::MAX);
        assert_eq!(rec.insn.bits(), 0);

        let text = sink.as_string();
        assert!(text.contains("\tINV_FETCH\t0x00000001\n"));
        assert!(text.contains("\tEXCEPTION\t0x0000000000000001\n"));
        assert!(text.contains("\tEPC\t0x0000000000004242\n"));
        assert!(text.contains("\tSR\t0x00000011\n"));
    }

    #[test]
    fn execute_without_fetch_implicitly_fetches() {
        let sink = SharedBuf::new();
        let mut tracer = enabled_tracer(&sink);

        tracer.before_insn_execute(0x100, InsnBits(0x00000013));
        let rec = tracer.after_insn_execute(0x100, PostExecState::default()).unwrap();
        assert!(rec.good && rec.valid);
        assert_eq!(rec.pc, 0x100);
    }
}
