//! Reconvergence prediction table: per-branch training of three candidate
//! reconvergence points under a call-depth-scoped activation stack.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use strum_macros::Display;

/// Sentinel for "no candidate pc learned yet".
pub const RECONV_PC_INVALID: u64 = i64::MAX as u64;
/// Sentinel prediction meaning "control reconverges at function return".
pub const RECONV_PC_RETURN: u64 = u64::MAX - 1;

/// Depth range of the activation stack.
pub const MAX_CALL_DEPTH: usize = 256;
/// Starting depth; the midpoint lets control both descend and return past
/// the point where tracking began.
pub const INIT_CALL_DEPTH: usize = MAX_CALL_DEPTH / 2;

/// One candidate reconvergence pc and its training flags.
#[derive(Debug, Clone, Copy)]
pub struct PotentialPoint {
    pc: u64,
    hit_return: bool,
    ar_taken: bool,
    ar_ntaken: bool,
    reached_first: bool,
}

impl PotentialPoint {
    fn new(pc: u64) -> Self {
        Self {
            pc,
            hit_return: false,
            ar_taken: true,
            ar_ntaken: true,
            reached_first: true,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn pc_is_valid(&self) -> bool {
        self.pc != RECONV_PC_INVALID
    }

    pub fn hit_return(&self) -> bool {
        self.hit_return
    }

    pub fn ar_taken(&self) -> bool {
        self.ar_taken
    }

    pub fn ar_ntaken(&self) -> bool {
        self.ar_ntaken
    }

    pub fn reached_first(&self) -> bool {
        self.reached_first
    }

    fn clear_ar_for_outcome(&mut self, taken: bool) {
        if taken {
            self.ar_taken = false;
        } else {
            self.ar_ntaken = false;
        }
    }

    /// Re-learn this candidate at `pc`: a fresh pc has been reached on every
    /// path seen so far, by definition.
    fn relearn_at(&mut self, pc: u64) {
        self.pc = pc;
        self.hit_return = false;
        self.ar_taken = true;
        self.ar_ntaken = true;
    }
}

/// Which candidate a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ReconvCategory {
    Return,
    Below,
    Above,
    Rebound,
}

/// Which rule of `make_prediction` fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PredictionReason {
    #[strum(serialize = "[1] All hit return")]
    AllHitReturn,
    #[strum(serialize = "[2] Reach first")]
    ReachFirst,
    #[strum(serialize = "[3] Always reach whether taken or not taken")]
    AlwaysReachBoth,
    #[strum(serialize = "[4] Always reach only taken or not taken")]
    AlwaysReachOne,
    #[strum(serialize = "[5] Fallback to BelowPotential")]
    FallbackBelow,
}

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub pc: u64,
    pub category: ReconvCategory,
    pub reason: PredictionReason,
}

/// Per-static-branch training state.
#[derive(Debug, Clone)]
pub struct RptEntry {
    branch_pc: u64,
    last_taken: bool,
    below_active: bool,
    above_active: bool,
    rebound_active: bool,
    below_reached: bool,
    above_reached: bool,
    rebound_reached: bool,
    below: PotentialPoint,
    above: PotentialPoint,
    rebound: PotentialPoint,
    taken_activations: u64,
    ntaken_activations: u64,
}

fn pc_next(pc: u64) -> u64 {
    pc + 4
}

impl RptEntry {
    pub fn new(branch_pc: u64) -> Self {
        Self {
            branch_pc,
            last_taken: false,
            below_active: false,
            above_active: false,
            rebound_active: false,
            below_reached: false,
            above_reached: false,
            rebound_reached: false,
            below: PotentialPoint::new(pc_next(branch_pc)),
            above: PotentialPoint::new(RECONV_PC_INVALID),
            rebound: PotentialPoint::new(pc_next(branch_pc)),
            taken_activations: 0,
            ntaken_activations: 0,
        }
    }

    pub fn branch_pc(&self) -> u64 {
        self.branch_pc
    }

    pub fn taken_activations(&self) -> u64 {
        self.taken_activations
    }

    pub fn ntaken_activations(&self) -> u64 {
        self.ntaken_activations
    }

    /// Begin (or restart) a training episode after this branch retires.
    ///
    /// A candidate still active from the previous episode was never reached
    /// on that path, so it loses the always-reached bit for the previous
    /// outcome before the new episode starts.
    pub fn activate(&mut self, taken: bool) {
        if self.below_active {
            self.below.clear_ar_for_outcome(self.last_taken);
        }
        if self.above_active {
            self.above.clear_ar_for_outcome(self.last_taken);
        }
        if self.rebound_active {
            self.rebound.clear_ar_for_outcome(self.last_taken);
        }

        self.last_taken = taken;
        self.below_active = true;
        self.above_active = true;
        self.rebound_active = true;
        self.below_reached = false;
        self.above_reached = false;
        self.rebound_reached = false;

        if taken {
            self.taken_activations += 1;
        } else {
            self.ntaken_activations += 1;
        }
    }

    /// Observe a committed pc while this entry is active.
    pub fn train(&mut self, commit_pc: u64) {
        // Below: reached when its pc commits; superseded when anything
        // farther below commits first.
        if self.below_active {
            if self.below.pc == commit_pc {
                self.reach_below();
            } else if self.below.pc < commit_pc {
                self.update_below(commit_pc);
            }
        }

        // Above only reacts to pcs before the branch, learning the closest
        // one seen so far.
        if self.above_active && commit_pc < self.branch_pc {
            if !self.above.pc_is_valid() || self.above.pc < commit_pc {
                self.update_above(commit_pc);
            } else if self.above.pc == commit_pc {
                self.reach_above();
            }
        }

        // Rebound: reached when its pc commits; after Below was reached this
        // episode it may move up to the latest pc strictly between the
        // branch and Below.
        if self.rebound_active {
            if self.rebound.pc == commit_pc {
                self.reach_rebound();
            } else if self.below_reached
                && self.branch_pc < commit_pc
                && self.rebound.pc < commit_pc
                && commit_pc < self.below.pc
            {
                self.update_rebound(commit_pc);
            }
        }
    }

    /// Abort the current episode without training (uncommon-path retirement).
    pub fn early_deactivate(&mut self) {
        self.below_active = false;
        self.above_active = false;
        self.rebound_active = false;
    }

    /// Snapshot and silence this entry when execution calls deeper than the
    /// level it is training at.
    pub fn save_call_level(&mut self) -> u8 {
        let saved = self.pack_status_bits();
        self.below_active = false;
        self.above_active = false;
        self.rebound_active = false;
        self.below_reached = false;
        self.above_reached = false;
        self.rebound_reached = false;
        saved
    }

    /// Returning past the entry's own level: candidates still pending were
    /// never reached before the function returned.
    pub fn restore_call_level(&mut self, saved: u8) {
        if self.below_active {
            self.below.hit_return = true;
            self.below.clear_ar_for_outcome(self.last_taken);
        }
        if self.above_active {
            self.above.hit_return = true;
            self.above.clear_ar_for_outcome(self.last_taken);
        }
        if self.rebound_active {
            self.rebound.hit_return = true;
            self.rebound.clear_ar_for_outcome(self.last_taken);
        }
        self.unpack_status_bits(saved);
    }

    pub fn make_prediction(&self) -> Prediction {
        // (1) Every candidate ran into a function return: the reconvergence
        // point is outside this frame.
        if self.below.hit_return && self.above.hit_return && self.rebound.hit_return {
            return Prediction {
                pc: RECONV_PC_RETURN,
                category: ReconvCategory::Return,
                reason: PredictionReason::AllHitReturn,
            };
        }

        // (2) A candidate that is always the first one reached.
        for (point, category) in self.candidates() {
            if point.reached_first {
                return Prediction {
                    pc: point.pc,
                    category,
                    reason: PredictionReason::ReachFirst,
                };
            }
        }

        // (3) Always reached on both outcomes.
        for (point, category) in self.candidates() {
            if point.ar_taken && point.ar_ntaken {
                return Prediction {
                    pc: point.pc,
                    category,
                    reason: PredictionReason::AlwaysReachBoth,
                };
            }
        }

        // (4) Always reached on one outcome.
        for (point, category) in self.candidates() {
            if point.ar_taken || point.ar_ntaken {
                return Prediction {
                    pc: point.pc,
                    category,
                    reason: PredictionReason::AlwaysReachOne,
                };
            }
        }

        // (5) Nothing survived; fall back to Below.
        Prediction {
            pc: self.below.pc,
            category: ReconvCategory::Below,
            reason: PredictionReason::FallbackBelow,
        }
    }

    /// Candidates in tie-break order.
    fn candidates(&self) -> [(&PotentialPoint, ReconvCategory); 3] {
        [
            (&self.below, ReconvCategory::Below),
            (&self.above, ReconvCategory::Above),
            (&self.rebound, ReconvCategory::Rebound),
        ]
    }

    fn pack_status_bits(&self) -> u8 {
        (u8::from(self.below_reached) << 6)
            | (u8::from(self.above_reached) << 5)
            | (u8::from(self.rebound_reached) << 4)
            | (u8::from(self.below_active) << 3)
            | (u8::from(self.above_active) << 2)
            | (u8::from(self.rebound_active) << 1)
            | u8::from(self.last_taken)
    }

    fn unpack_status_bits(&mut self, bits: u8) {
        self.below_reached = bits & (1 << 6) != 0;
        self.above_reached = bits & (1 << 5) != 0;
        self.rebound_reached = bits & (1 << 4) != 0;
        self.below_active = bits & (1 << 3) != 0;
        self.above_active = bits & (1 << 2) != 0;
        self.rebound_active = bits & (1 << 1) != 0;
        self.last_taken = bits & 1 != 0;
    }

    fn set_all_reached_first(&mut self) {
        self.below.reached_first = true;
        self.above.reached_first = true;
        self.rebound.reached_first = true;
    }

    fn reach_below(&mut self) {
        self.below_active = false;
        self.below_reached = true;
        if !self.above_reached && !self.rebound_reached {
            self.above.reached_first = false;
            self.rebound.reached_first = false;
        }
    }

    fn reach_above(&mut self) {
        self.above_active = false;
        self.above_reached = true;
        if !self.below_reached && !self.rebound_reached {
            self.below.reached_first = false;
            self.rebound.reached_first = false;
        }
    }

    fn reach_rebound(&mut self) {
        self.rebound_active = false;
        self.rebound_reached = true;
        if !self.below_reached && !self.above_reached {
            self.below.reached_first = false;
            self.above.reached_first = false;
        }
    }

    fn update_below(&mut self, new_pc: u64) {
        self.below.relearn_at(new_pc);
        // A moved Below invalidates what Rebound learned between the branch
        // and the old Below.
        self.rebound.pc = pc_next(self.branch_pc);
        self.set_all_reached_first();
        self.below_active = false;
    }

    fn update_above(&mut self, new_pc: u64) {
        self.above.relearn_at(new_pc);
        self.set_all_reached_first();
        self.above_active = false;
    }

    fn update_rebound(&mut self, new_pc: u64) {
        self.rebound.relearn_at(new_pc);
        self.set_all_reached_first();
        self.rebound_active = false;
    }
}

/// The table proper: entries keyed by branch pc, plus a stack of per-depth
/// activation records mapping branch pc to the status snapshot taken when
/// the entry was first activated at that depth.
pub struct Rpt {
    depth: usize,
    active_record: Vec<HashMap<u64, u8>>,
    entries: BTreeMap<u64, RptEntry>,
}

impl Default for Rpt {
    fn default() -> Self {
        Self::new()
    }
}

impl Rpt {
    pub fn new() -> Self {
        Self {
            depth: INIT_CALL_DEPTH,
            active_record: vec![HashMap::new(); MAX_CALL_DEPTH],
            entries: BTreeMap::new(),
        }
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.entries.contains_key(&pc)
    }

    pub fn predict(&self, pc: u64) -> Option<Prediction> {
        self.entries.get(&pc).map(RptEntry::make_prediction)
    }

    pub fn current_call_depth(&self) -> usize {
        self.depth
    }

    pub fn entries(&self) -> impl Iterator<Item = (&u64, &RptEntry)> {
        self.entries.iter()
    }

    pub fn activate(&mut self, pc: u64, taken: bool) {
        let entry = self
            .entries
            .entry(pc)
            .or_insert_with(|| RptEntry::new(pc));
        self.active_record[self.depth]
            .entry(pc)
            .or_insert_with(|| entry.save_call_level());
        entry.activate(taken);
    }

    /// Train every entry activated at the current depth on a committed pc.
    pub fn train(&mut self, commit_pc: u64) {
        for (&pc, _) in &self.active_record[self.depth] {
            self.entries
                .get_mut(&pc)
                .expect("activation record names an unknown branch")
                .train(commit_pc);
        }
    }

    /// Abort training of everything at the current depth (does not pop).
    pub fn deactivate_all(&mut self) {
        for (&pc, _) in &self.active_record[self.depth] {
            self.entries
                .get_mut(&pc)
                .expect("activation record names an unknown branch")
                .early_deactivate();
        }
    }

    pub fn increase_call_level(&mut self) {
        assert!(
            self.depth < MAX_CALL_DEPTH - 1,
            "reconvergence call depth overflow at {}",
            self.depth
        );
        self.depth += 1;
        self.active_record[self.depth].clear();
    }

    pub fn decrease_call_level(&mut self) {
        assert!(self.depth > 0, "reconvergence call depth underflow");
        let record = std::mem::take(&mut self.active_record[self.depth]);
        for (&pc, &saved) in &record {
            self.entries
                .get_mut(&pc)
                .expect("activation record names an unknown branch")
                .restore_call_level(saved);
        }
        self.depth -= 1;
    }

    /// Back to the initial depth with a clean activation stack; learned
    /// entries survive.
    pub fn reset(&mut self) {
        self.depth = INIT_CALL_DEPTH;
        for record in &mut self.active_record {
            record.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_candidates() {
        let entry = RptEntry::new(0x60);
        assert_eq!(entry.below.pc(), 0x64);
        assert!(!entry.above.pc_is_valid());
        assert_eq!(entry.rebound.pc(), 0x64);
        for (point, _) in entry.candidates() {
            assert!(point.reached_first());
            assert!(point.ar_taken() && point.ar_ntaken());
            assert!(!point.hit_return());
        }
    }

    #[test]
    fn simple_diamond_learns_below() {
        let mut rpt = Rpt::new();

        // First episode: the taken path lands at 0x80, past the initial
        // Below of 0x64, so Below moves there.
        rpt.activate(0x60, true);
        rpt.train(0x80);
        assert_eq!(rpt.entries.get(&0x60).unwrap().below.pc(), 0x80);

        // Second episode reaches the relocated Below.
        rpt.activate(0x60, true);
        rpt.train(0x80);

        let pred = rpt.predict(0x60).unwrap();
        assert_eq!(pred.pc, 0x80);
        assert_eq!(pred.category, ReconvCategory::Below);
        assert_eq!(pred.reason, PredictionReason::ReachFirst);
    }

    #[test]
    fn above_learns_backward_reconvergence() {
        let mut rpt = Rpt::new();
        rpt.activate(0x100, true);
        rpt.train(0x80); // above the branch: Above learns it
        let entry = rpt.entries.get(&0x100).unwrap();
        assert_eq!(entry.above.pc(), 0x80);
        assert!(!entry.above_active);
    }

    #[test]
    fn rebound_moves_between_branch_and_below() {
        let mut entry = RptEntry::new(0x60);
        entry.activate(true);
        entry.train(0x90); // below update → below = 0x90, rebound reset 0x64
        entry.activate(true);
        entry.train(0x90); // below reached
        entry.train(0x70); // between branch and below, above rebound: moves
        assert_eq!(entry.rebound.pc(), 0x70);
        assert!(!entry.rebound_active);
    }

    #[test]
    fn call_level_round_trip_restores_status() {
        let mut rpt = Rpt::new();
        rpt.activate(0x60, true);
        let before_depth = rpt.current_call_depth();

        rpt.increase_call_level();
        assert_eq!(rpt.current_call_depth(), before_depth + 1);
        assert!(rpt.active_record[rpt.current_call_depth()].is_empty());

        // Re-activation of the same branch at the deeper level snapshots
        // the (cleared) status and trains independently.
        rpt.activate(0x60, false);
        rpt.train(0x64);
        rpt.decrease_call_level();
        assert_eq!(rpt.current_call_depth(), before_depth);

        // Back at the outer level the entry is active again.
        let entry = rpt.entries.get(&0x60).unwrap();
        assert!(entry.below_active && entry.above_active && entry.rebound_active);
    }

    #[test]
    fn returning_past_active_candidates_sets_hit_return() {
        let mut entry = RptEntry::new(0x60);
        entry.activate(true);
        let saved = entry.pack_status_bits();
        // All three candidates still pending when the frame returns.
        entry.restore_call_level(saved);
        assert!(entry.below.hit_return());
        assert!(entry.above.hit_return());
        assert!(entry.rebound.hit_return());
        // The taken-side always-reached bit is gone.
        assert!(!entry.below.ar_taken());
        assert!(entry.below.ar_ntaken());
    }

    #[test]
    fn all_hit_return_predicts_return() {
        let mut entry = RptEntry::new(0x60);
        entry.activate(true);
        let saved = entry.pack_status_bits();
        entry.restore_call_level(saved);
        // Kill ReachedFirst so rule 1 is actually what fires.
        entry.below.reached_first = false;
        entry.above.reached_first = false;
        entry.rebound.reached_first = false;
        let pred = entry.make_prediction();
        assert_eq!(pred.pc, RECONV_PC_RETURN);
        assert_eq!(pred.category, ReconvCategory::Return);
        assert_eq!(pred.reason, PredictionReason::AllHitReturn);
    }

    #[test]
    fn prediction_rule_order_and_tie_break() {
        let mut entry = RptEntry::new(0x60);
        entry.activate(true);
        entry.train(0x64); // Below reached: Above and Rebound lose ReachedFirst

        let pred = entry.make_prediction();
        assert_eq!(pred.reason, PredictionReason::ReachFirst);
        assert_eq!(pred.category, ReconvCategory::Below);

        // Strip ReachedFirst and the AR pairs step rules 3 → 4 → 5.
        entry.below.reached_first = false;
        let pred = entry.make_prediction();
        assert_eq!(pred.reason, PredictionReason::AlwaysReachBoth);

        entry.below.ar_ntaken = false;
        entry.above.ar_ntaken = false;
        entry.rebound.ar_ntaken = false;
        let pred = entry.make_prediction();
        assert_eq!(pred.reason, PredictionReason::AlwaysReachOne);
        assert_eq!(pred.category, ReconvCategory::Below);

        entry.below.ar_taken = false;
        entry.above.ar_taken = false;
        entry.rebound.ar_taken = false;
        let pred = entry.make_prediction();
        assert_eq!(pred.reason, PredictionReason::FallbackBelow);
    }

    #[test]
    fn stale_activation_clears_ar_for_previous_outcome() {
        let mut entry = RptEntry::new(0x60);
        entry.activate(true);
        // Below never reached; re-activating punishes the taken side.
        entry.activate(false);
        assert!(!entry.below.ar_taken());
        assert!(entry.below.ar_ntaken());
    }

    #[test]
    fn early_deactivate_stops_training() {
        let mut entry = RptEntry::new(0x60);
        entry.activate(true);
        entry.early_deactivate();
        entry.train(0x90);
        // Below unchanged: training was aborted.
        assert_eq!(entry.below.pc(), 0x64);
    }

    #[test]
    #[should_panic(expected = "depth overflow")]
    fn depth_overflow_aborts() {
        let mut rpt = Rpt::new();
        for _ in 0..MAX_CALL_DEPTH {
            rpt.increase_call_level();
        }
    }
}
