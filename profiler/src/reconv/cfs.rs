//! Control-flow stack: pairs retired branches with their predicted
//! reconvergence points and tracks how long each divergent region stays
//! open.

use super::rpt::{RECONV_PC_INVALID, RECONV_PC_RETURN};

/// Retirements a frame may stay open before `good()` gives up on it.
const CD_REGION_MAX: u64 = 128;

/// One open divergent region. `branch_bottom..=branch_top` indexes the
/// shared active-branch stack.
#[derive(Debug, Clone, Copy)]
pub struct CfsFrame {
    pub call_depth: i64,
    pub reconv_pc: u64,
    pub n_retired: u64,
    branch_top: usize,
    branch_bottom: usize,
}

impl CfsFrame {
    /// Branches folded into this frame.
    pub fn branch_count(&self) -> usize {
        self.branch_top - self.branch_bottom + 1
    }
}

#[derive(Debug, Default)]
pub struct ControlFlowStack {
    call_depth: i64,
    active_branches: Vec<u64>,
    frames: Vec<CfsFrame>,
}

impl ControlFlowStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.call_depth = 0;
        self.active_branches.clear();
        self.frames.clear();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn active_branches(&self) -> &[u64] {
        &self.active_branches
    }

    fn push(&mut self, br_pc: u64, reconv_pc: u64) {
        let branch_idx = self.active_branches.len();
        self.active_branches.push(br_pc);

        if let Some(top) = self.frames.last_mut() {
            if top.call_depth == self.call_depth && top.reconv_pc == reconv_pc {
                // Same region: fold the branch into the open frame.
                top.branch_top = branch_idx;
                return;
            }
        }
        self.frames.push(CfsFrame {
            call_depth: self.call_depth,
            reconv_pc,
            n_retired: 0,
            branch_top: branch_idx,
            branch_bottom: branch_idx,
        });
    }

    fn pop(&mut self) {
        let Some(top) = self.frames.pop() else {
            return;
        };
        self.active_branches
            .truncate(top.branch_bottom.min(self.active_branches.len()));
    }

    fn check_reconv(&self, pc: u64) -> bool {
        match self.frames.last() {
            None => false,
            Some(top) => top.call_depth == self.call_depth && top.reconv_pc == pc,
        }
    }

    /// Whether the top region still looks reconvergeable: it has neither
    /// outlived the retirement limit nor had its call frame popped away.
    pub fn good(&self) -> bool {
        match self.frames.last() {
            None => {
                debug_assert!(self.active_branches.is_empty());
                true
            }
            Some(top) => {
                top.n_retired <= CD_REGION_MAX && self.call_depth >= top.call_depth
            }
        }
    }

    fn on_insn_retire(&mut self, pc: u64) {
        if let Some(top) = self.frames.last_mut() {
            top.n_retired += 1;
            if self.check_reconv(pc) {
                self.pop();
            }
        }
    }

    /// A retired branch opens (or extends) a region closed by `reconv_pc`.
    /// Under an enclosing region with an unknown reconvergence point the
    /// new region inherits the unknown point and merges into it.
    pub fn on_branch(&mut self, br_pc: u64, reconv_pc: u64) {
        self.on_insn_retire(br_pc);

        let merge_invalid = matches!(
            self.frames.last(),
            Some(top) if top.call_depth == self.call_depth
                && top.reconv_pc == RECONV_PC_INVALID
        );
        if merge_invalid {
            self.push(br_pc, RECONV_PC_INVALID);
        } else {
            self.push(br_pc, reconv_pc);
        }
    }

    pub fn on_fcall(&mut self, pc: u64) {
        self.on_insn_retire(pc);
        self.call_depth += 1;
    }

    pub fn on_fret(&mut self, pc: u64) {
        self.on_insn_retire(pc);
        if self.check_reconv(RECONV_PC_RETURN) {
            self.pop();
        }
        self.call_depth -= 1;
    }

    pub fn on_other(&mut self, pc: u64) {
        self.on_insn_retire(pc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_closes_when_the_reconvergence_point_commits() {
        let mut cfs = ControlFlowStack::new();
        cfs.on_branch(0x60, 0x80);
        assert_eq!(cfs.depth(), 1);
        assert_eq!(cfs.active_branches(), &[0x60]);

        cfs.on_other(0x70);
        assert_eq!(cfs.depth(), 1);
        cfs.on_other(0x80);
        assert_eq!(cfs.depth(), 0);
        assert!(cfs.active_branches().is_empty());
    }

    #[test]
    fn same_region_branches_merge_into_one_frame() {
        let mut cfs = ControlFlowStack::new();
        cfs.on_branch(0x60, 0x100);
        cfs.on_branch(0x70, 0x100);
        assert_eq!(cfs.depth(), 1);
        assert_eq!(cfs.frames.last().unwrap().branch_count(), 2);
        assert_eq!(cfs.active_branches(), &[0x60, 0x70]);

        cfs.on_other(0x100);
        assert_eq!(cfs.depth(), 0);
        assert!(cfs.active_branches().is_empty());
    }

    #[test]
    fn unknown_reconvergence_absorbs_nested_branches() {
        let mut cfs = ControlFlowStack::new();
        cfs.on_branch(0x60, RECONV_PC_INVALID);
        cfs.on_branch(0x70, 0x90);
        // merged into the unknown region instead of opening its own
        assert_eq!(cfs.depth(), 1);
        cfs.on_other(0x90);
        assert_eq!(cfs.depth(), 1);
    }

    #[test]
    fn return_prediction_closes_at_function_return() {
        let mut cfs = ControlFlowStack::new();
        cfs.on_fcall(0x40);
        cfs.on_branch(0x60, RECONV_PC_RETURN);
        cfs.on_other(0x64);
        assert_eq!(cfs.depth(), 1);
        cfs.on_fret(0x90);
        assert_eq!(cfs.depth(), 0);
    }

    #[test]
    fn good_gives_up_on_stale_regions() {
        let mut cfs = ControlFlowStack::new();
        cfs.on_branch(0x60, 0x8000);
        assert!(cfs.good());
        for pc in 0..=CD_REGION_MAX {
            cfs.on_other(0x100 + pc * 4);
        }
        assert!(!cfs.good());

        cfs.reset();
        cfs.on_fcall(0x40);
        cfs.on_branch(0x60, 0x8000);
        cfs.on_fret(0x90);
        // the frame's call depth was popped out from under it
        assert!(!cfs.good());
    }
}
