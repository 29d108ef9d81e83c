//! Trace sinks: a direct formatter and a bounded "last N" ring that only
//! materializes the tail of the trace at shutdown.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::errors::ArtifactError;
use crate::output::{gz_line_writer, LineSink};

use super::disasm::{
    fpr_name, xpr_name, Disassembler, OP_BRANCH, OP_JAL, OP_JALR, OP_LOAD, OP_STORE,
};
use super::record::{InsnRecord, RegRecord};

/// Consumer of drained instruction records.
pub trait TraceOutput {
    fn issue_insn(&mut self, rec: &InsnRecord);
}

/// Formats each record as it arrives.
///
/// The emitted byte layout is consumed by downstream diffing tools and must
/// not change, including the `%08x`-style minimum widths on 64-bit fields.
pub struct DirectOutput {
    disasm: Disassembler,
    path: PathBuf,
    out: LineSink,
}

impl DirectOutput {
    pub fn create(path: &Path) -> Result<Self, ArtifactError> {
        let out = gz_line_writer(path)?;
        Ok(Self {
            disasm: Disassembler::new(),
            path: path.to_path_buf(),
            out,
        })
    }

    /// Sink into an arbitrary writer; used by tests and custom drivers.
    pub fn from_writer(out: LineSink) -> Self {
        Self {
            disasm: Disassembler::new(),
            path: PathBuf::from("<writer>"),
            out,
        }
    }

    fn reg_name(rec: &RegRecord) -> &'static str {
        if rec.val.is_fp() {
            fpr_name(rec.reg)
        } else {
            xpr_name(rec.reg)
        }
    }

    fn format_insn_record(&self, rec: &InsnRecord, buf: &mut String) {
        let insn = rec.insn;

        let _ = writeln!(
            buf,
            "S/{} C/{} I/{} PC/0x{:016x} (0x{:08x}) {}",
            rec.seqno,
            rec.cycle,
            rec.instret,
            rec.pc,
            insn.bits() & 0xffff_ffff,
            self.disasm.disassemble(insn)
        );

        if !rec.good {
            buf.push_str("\tINV_FETCH\t0x00000001\n");
        }

        for (idx, rs) in rec.rs_rec.iter().enumerate() {
            if rs.valid {
                let _ = writeln!(buf, "\tRS{}/{}\t0x{:08x}", idx, Self::reg_name(rs), rs.val.bits());
            }
        }

        for rd in rec.rd_rec.iter() {
            if rd.valid && rd.reg != 0 {
                let _ = writeln!(buf, "\tRD/{}\t0x{:08x}", Self::reg_name(rd), rd.val.bits());
            }
        }

        match insn.opcode() {
            OP_LOAD | OP_STORE => {
                assert!(
                    rec.mem_rec.valid,
                    "memory instruction at pc {:#x} drained without a data access",
                    rec.pc
                );
                let _ = writeln!(buf, "\tADDR\t0x{:08x}", rec.mem_rec.vaddr);
            }
            OP_BRANCH | OP_JAL | OP_JALR => {
                let taken_target = match insn.opcode() {
                    OP_BRANCH => rec.pc.wrapping_add(insn.sb_imm() as u64),
                    OP_JAL => rec.pc.wrapping_add(insn.uj_imm() as u64),
                    _ => {
                        assert!(
                            rec.rs_rec[0].valid,
                            "jalr at pc {:#x} drained without its base register",
                            rec.pc
                        );
                        rec.rs_rec[0].val.bits().wrapping_add(insn.i_imm() as u64) & !1u64
                    }
                };
                let _ = writeln!(buf, "\tTAKEN_PC\t0x{:08x}", taken_target);
            }
            _ => {}
        }

        if rec.exception {
            let _ = writeln!(buf, "\tEXCEPTION\t0x{:016x}", 1u64);
            let _ = writeln!(buf, "\tEVEC\t0x{:016x}", rec.post_exec.evec);
            let _ = writeln!(buf, "\tECAUSE\t0x{:016x}", rec.post_exec.cause);
            let _ = writeln!(buf, "\tEPC\t0x{:016x}", rec.post_exec.epc);
            let _ = writeln!(buf, "\tSR\t0x{:08x}", rec.post_exec.sr);
        }

        buf.push('\n');
    }
}

impl TraceOutput for DirectOutput {
    fn issue_insn(&mut self, rec: &InsnRecord) {
        if !rec.valid {
            return;
        }
        let mut buf = String::with_capacity(256);
        self.format_insn_record(rec, &mut buf);
        if let Err(err) = self.out.write_all(buf.as_bytes()) {
            panic!("trace output error: write to `{}` failed: {err}", self.path.display());
        }
    }
}

impl Drop for DirectOutput {
    fn drop(&mut self) {
        tracing::info!(path = %self.path.display(), "saving trace");
        let _ = self.out.flush();
    }
}

/// Retains only the most recent `n` records, handing them to an embedded
/// [`DirectOutput`] in FIFO order at shutdown.
pub struct LastNOutput {
    buf: Vec<InsnRecord>,
    tail: usize,
    head: usize,
    empty: bool,
    direct: DirectOutput,
}

impl LastNOutput {
    pub fn new(direct: DirectOutput, n: usize) -> Self {
        assert!(n > 0, "last-n trace ring capacity must be non-zero");
        tracing::info!(
            records = n,
            mib = (n * std::mem::size_of::<InsnRecord>()) >> 20,
            "reserved instruction history ring"
        );
        Self {
            buf: vec![InsnRecord::default(); n],
            tail: 0,
            head: 0,
            empty: true,
            direct,
        }
    }

    // Hot path; keeps the wrap as a compare instead of a modulo.
    fn next_idx(&self, i: usize) -> usize {
        let nidx = i + 1;
        if nidx == self.buf.len() {
            0
        } else {
            nidx
        }
    }

    fn push(&mut self, rec: &InsnRecord) {
        self.buf[self.tail] = *rec;
        if self.tail == self.head {
            if self.empty {
                self.tail = self.next_idx(self.tail);
                self.empty = false;
            } else {
                // Full: overwrite the oldest element.
                self.tail = self.next_idx(self.tail);
                self.head = self.tail;
            }
        } else {
            self.tail = self.next_idx(self.tail);
        }
    }

    fn pop(&mut self) -> Option<InsnRecord> {
        if self.empty {
            return None;
        }
        let rec = self.buf[self.head];
        self.head = self.next_idx(self.head);
        if self.head == self.tail {
            self.empty = true;
        }
        Some(rec)
    }
}

impl TraceOutput for LastNOutput {
    fn issue_insn(&mut self, rec: &InsnRecord) {
        self.push(rec);
    }
}

impl Drop for LastNOutput {
    fn drop(&mut self) {
        while let Some(rec) = self.pop() {
            self.direct.issue_insn(&rec);
        }
    }
}
