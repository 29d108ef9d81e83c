//! The per-retired-instruction trace record assembled by the tracer state
//! machine and consumed by the trace sinks and the dependency tracker.

use serde::{Deserialize, Serialize};

use super::disasm::InsnBits;

/// Source operand slots per instruction.
pub const MAX_RSRC: usize = 3;
/// Destination operand slots per instruction.
pub const MAX_RDST: usize = 1;

/// Operand role reported by the register-access hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Src1,
    Src2,
    Src3,
    Dst,
}

impl Operand {
    /// Source slot index, or `None` for the destination role.
    pub fn src_index(self) -> Option<usize> {
        match self {
            Operand::Src1 => Some(0),
            Operand::Src2 => Some(1),
            Operand::Src3 => Some(2),
            Operand::Dst => None,
        }
    }
}

/// A register value tagged by which file it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegVal {
    X(u64),
    F(u64),
}

impl RegVal {
    /// Raw payload bits, for printing and idempotence checks.
    pub fn bits(self) -> u64 {
        match self {
            RegVal::X(v) | RegVal::F(v) => v,
        }
    }

    pub fn is_fp(self) -> bool {
        matches!(self, RegVal::F(_))
    }
}

impl Default for RegVal {
    fn default() -> Self {
        RegVal::X(0)
    }
}

/// One observed register operand.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegRecord {
    pub valid: bool,
    /// Architectural register number within its file.
    pub reg: usize,
    pub val: RegVal,
}

/// The single data access an instruction may perform.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemRecord {
    pub valid: bool,
    pub write: bool,
    pub vaddr: u64,
    pub paddr: u64,
    pub val: u64,
    pub op_size: usize,
}

/// Trap-reporting snapshot taken after execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PostExecState {
    pub evec: u64,
    pub cause: u64,
    pub epc: u64,
    pub sr: u32,
}

/// Everything recorded about one retired instruction.
///
/// Invariants: at most one destination; `mem_rec.valid` implies exactly one
/// data access; a synchronous trap keeps `pc` equal to the trap's `epc`,
/// while an asynchronous interrupt is logged as an artificial record with
/// `pc` all-ones and zero instruction bits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InsnRecord {
    pub valid: bool,
    /// Fetch succeeded and execution hooks may fire.
    pub good: bool,
    pub exception: bool,

    pub pc: u64,
    pub insn: InsnBits,
    pub seqno: u64,
    pub cycle: u64,
    pub instret: u64,

    pub rs_rec: [RegRecord; MAX_RSRC],
    pub rd_rec: [RegRecord; MAX_RDST],

    pub mem_rec: MemRecord,

    pub post_exec: PostExecState,
}
