//! Classifies retired RISC-V instructions into the predictor's event
//! vocabulary: call, return, indirect jump, conditional branch, or other.

use crate::tracer::disasm::{InsnBits, OP_BRANCH, OP_JAL, OP_JALR};

use super::DynamicReconvPredictor;

const REG_RA: usize = 1;
const REG_ZERO: usize = 0;

/// Front-end the ISA wrapper drives once per user-mode retirement.
#[derive(Default)]
pub struct RiscvReconvPredictor {
    pub predictor: DynamicReconvPredictor,
}

impl RiscvReconvPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `npc` is the pc the hart actually retired to next.
    pub fn on_userspace_insn_retired(&mut self, insn: InsnBits, pc: u64, npc: u64) {
        let opcode = insn.opcode();

        if opcode == OP_JAL && insn.rd() == REG_RA {
            self.predictor.on_function_call(pc, npc);
        } else if opcode == OP_JALR && insn.rd() == REG_RA {
            // Indirect call.
            self.predictor.on_function_call(pc, npc);
        } else if opcode == OP_JALR && insn.rs1() == REG_RA && insn.rd() == REG_ZERO {
            self.predictor.on_function_return(pc, npc);
        } else if opcode == OP_JALR {
            // Any other jalr is an indirect jump.
            self.predictor.on_indirect_jmp_retired(pc, npc);
        } else if opcode == OP_BRANCH {
            self.predictor.on_branch_retired(pc, npc, npc != pc.wrapping_add(4));
        } else {
            self.predictor.on_other_insn_retired(pc);
        }
    }
}
