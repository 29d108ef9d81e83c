//! Per-hart bundle of the instrumentation engines.
//!
//! One instance per hart; nothing is shared across harts. The simulator's
//! retire loop drives the hook surface and calls [`HartProfilers::finish`]
//! once at the end of the run.

use crate::errors::ArtifactError;
use crate::opts::ProfilerOpts;
use crate::poison::{InsnPoisoningTracker, TrackingMode};
use crate::reconv::RiscvReconvPredictor;
use crate::simpoint::{BbTracker, PcFreqVecTracker};
use crate::tracer::{DebugTracer, InsnBits, InsnRecord, Operand, PostExecState};

pub struct HartProfilers {
    pub hart_id: u32,
    pub bbt: Option<BbTracker>,
    pub pc_freqvec: Option<PcFreqVecTracker>,
    pub tracer: DebugTracer,
    pub reconv: Option<RiscvReconvPredictor>,
    pub poison: InsnPoisoningTracker,
    opts: ProfilerOpts,
}

impl HartProfilers {
    pub fn new(hart_id: u32, opts: &ProfilerOpts) -> Result<Self, ArtifactError> {
        let (bbt, pc_freqvec) = match &opts.simpoint {
            Some(sp) => (
                Some(BbTracker::create(
                    &opts.out_dir,
                    &opts.out_name,
                    sp.interval_size,
                )?),
                Some(PcFreqVecTracker::create(&opts.out_dir, &opts.out_name)?),
            ),
            None => (None, None),
        };

        let mut tracer = DebugTracer::new(hart_id);
        if let Some(trace) = &opts.trace {
            // With a skip configured the driver enables tracing itself once
            // the skip window has elapsed.
            if trace.skip == 0 {
                tracer.enable_trace(&opts.out_dir, trace.last_n, 0)?;
            }
        }

        let reconv = opts.reconv.then(RiscvReconvPredictor::new);

        let mut poison = InsnPoisoningTracker::new();
        poison.set_mode(opts.poison_mode);

        Ok(Self {
            hart_id,
            bbt,
            pc_freqvec,
            tracer,
            reconv,
            poison,
            opts: opts.clone(),
        })
    }

    /// Late trace enablement, used when a skip amount was configured.
    pub fn enable_trace(&mut self, instret_base: u64) -> Result<(), ArtifactError> {
        let last_n = self.opts.trace.map_or(0, |t| t.last_n);
        self.tracer
            .enable_trace(&self.opts.out_dir, last_n, instret_base)
    }

    /// Every retired instruction lands here for the PC histogram.
    pub fn retire_insn(&mut self, pc: u64) {
        if let Some(pc_freqvec) = &mut self.pc_freqvec {
            pc_freqvec.update(pc);
        }
    }

    /// A basic block ended at `last_pc` after `num_inst` instructions.
    /// Closing a BBV interval also closes the PC-frequency interval so the
    /// two artifacts stay aligned.
    pub fn end_basic_block(&mut self, last_pc: u64, num_inst: u64) -> bool {
        let Some(bbt) = &mut self.bbt else {
            return false;
        };
        let dumped = bbt.record(last_pc, num_inst);
        if dumped {
            if let Some(pc_freqvec) = &mut self.pc_freqvec {
                pc_freqvec.finish_vec();
            }
        }
        dumped
    }

    /// Reconvergence training; the wrapper only sees user-mode retirements.
    pub fn on_userspace_insn_retired(&mut self, insn: InsnBits, pc: u64, npc: u64) {
        if let Some(reconv) = &mut self.reconv {
            reconv.on_userspace_insn_retired(insn, pc, npc);
        }
    }

    // Trace hooks, in per-instruction order. Drained records feed the
    // dependency tracker.

    pub fn trace_before_insn_ic_fetch(&mut self, pc: u64) {
        self.tracer.before_insn_ic_fetch(pc);
    }

    pub fn trace_before_insn_execute(&mut self, pc: u64, insn: InsnBits) {
        self.tracer.before_insn_execute(pc, insn);
    }

    pub fn trace_after_xpr_access(&mut self, rn: usize, val: u64, operand: Operand) {
        self.tracer.after_xpr_access(rn, val, operand);
    }

    pub fn trace_after_fpr_access(&mut self, rn: usize, val: u64, operand: Operand) {
        self.tracer.after_fpr_access(rn, val, operand);
    }

    pub fn trace_before_dc_translate(&mut self, vaddr: u64, write: bool) {
        self.tracer.before_dc_translate(vaddr, write);
    }

    pub fn trace_after_dc_access(
        &mut self,
        vaddr: u64,
        paddr: Option<u64>,
        val: u64,
        size: usize,
        write: bool,
    ) {
        self.tracer.after_dc_access(vaddr, paddr, val, size, write);
    }

    pub fn trace_after_insn_execute(&mut self, pc: u64, post: PostExecState) {
        if let Some(rec) = self.tracer.after_insn_execute(pc, post) {
            self.consume_record(&rec);
        }
    }

    pub fn trace_after_take_trap(&mut self, epc: u64, new_pc: u64, post: PostExecState) {
        if let Some(rec) = self.tracer.after_take_trap(epc, new_pc, post) {
            self.consume_record(&rec);
        }
    }

    fn consume_record(&mut self, rec: &InsnRecord) {
        if self.poison.mode() != TrackingMode::Stop {
            self.poison.update(rec);
        }
    }

    /// End of run: flush trailing intervals and write the predictor CSVs.
    /// The trace sinks flush when the tracer drops.
    pub fn finish(&mut self) -> Result<(), ArtifactError> {
        if let Some(bbt) = &mut self.bbt {
            bbt.finish();
        }
        if let Some(pc_freqvec) = &mut self.pc_freqvec {
            if pc_freqvec.insn_in_vec() > 0 {
                pc_freqvec.finish_vec();
            }
        }
        if let Some(reconv) = &self.reconv {
            reconv.predictor.dump_artifacts(&self.opts.out_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::SharedBuf;
    use crate::simpoint::FREQ_VEC_SIZE;

    fn memory_bundle(interval: u64) -> (HartProfilers, SharedBuf, SharedBuf) {
        let bb_sink = SharedBuf::new();
        let pcf_sink = SharedBuf::new();
        let profilers = HartProfilers {
            hart_id: 0,
            bbt: Some(BbTracker::from_writer(Box::new(bb_sink.clone()), interval)),
            pc_freqvec: Some(PcFreqVecTracker::from_writer(Box::new(pcf_sink.clone()))),
            tracer: DebugTracer::new(0),
            reconv: Some(RiscvReconvPredictor::new()),
            poison: InsnPoisoningTracker::new(),
            opts: ProfilerOpts::default(),
        };
        (profilers, bb_sink, pcf_sink)
    }

    #[test]
    fn bbv_interval_dump_closes_the_pc_frequency_interval() {
        let (mut hart, bb_sink, pcf_sink) = memory_bundle(8);

        for i in 0..5u64 {
            hart.retire_insn(0x100 + i * 4);
        }
        assert!(!hart.end_basic_block(0x110, 5));
        assert_eq!(pcf_sink.contents(), b"");

        for i in 0..4u64 {
            hart.retire_insn(0x200 + i * 4);
        }
        assert!(hart.end_basic_block(0x20c, 4));

        assert!(bb_sink.as_string().starts_with("T:1:5   :2:4   \n"));
        let pcf = pcf_sink.as_string();
        assert!(pcf.starts_with("9 : "), "got: {pcf}");
        assert_eq!(
            pcf.trim_end_matches(['\n', ' ']).split(' ').count(),
            FREQ_VEC_SIZE + 2
        );
    }

    #[test]
    fn drained_records_feed_the_dependency_tracker() {
        let (mut hart, _bb, _pcf) = memory_bundle(1 << 20);
        hart.poison.set_mode(TrackingMode::Poisoning);
        let trace_sink = SharedBuf::new();
        hart.tracer.enable_trace_with_output(
            Box::new(crate::tracer::DirectOutput::from_writer(Box::new(
                trace_sink.clone(),
            ))),
            0,
        );

        let pc = 0x500;
        hart.trace_before_insn_ic_fetch(pc);
        hart.trace_before_insn_execute(pc, InsnBits(0x003100b3)); // add ra, sp, gp
        hart.trace_after_xpr_access(2, 1, Operand::Src1);
        hart.trace_after_xpr_access(3, 2, Operand::Src2);
        hart.trace_after_xpr_access(1, 3, Operand::Dst);
        hart.trace_after_insn_execute(pc, PostExecState::default());

        assert!(hart.poison.reg_tracker().is_poisoned(1));
        assert!(trace_sink.as_string().contains("add ra, sp, gp"));
    }
}
