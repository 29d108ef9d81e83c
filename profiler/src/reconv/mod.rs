//! Reconvergence prediction: learns, per static branch, the pc at which the
//! taken and not-taken paths rejoin, and persists the result as CSV.

pub mod bft;
pub mod cfs;
pub mod riscv;
pub mod rpt;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{ArtifactError, CsvLoadError};

pub use bft::{Bft, BranchStat};
pub use cfs::ControlFlowStack;
pub use riscv::RiscvReconvPredictor;
pub use rpt::{
    Prediction, PredictionReason, ReconvCategory, Rpt, RptEntry, RECONV_PC_INVALID,
    RECONV_PC_RETURN,
};

pub const RPT_CSV_HEADER: [&str; 6] = [
    "Branch",
    "ReconvPoint",
    "TakenCnt",
    "NTakenCnt",
    "RecCat",
    "Reason",
];

/// File names of the artifacts written at the end of a run.
pub const RPT_RESULT_FILE: &str = "RPT_Result.csv";
pub const RPT_RESULT_IGNORE_UNCOMMON_FILE: &str = "RPT_Result_IgnoreUncommonPath.csv";
pub const BFT_RESULT_FILE: &str = "BFT_Result.csv";

/// Reconvergence-point lookup served to consumers (e.g. the control-flow
/// stack), whether backed by live training or a loaded artifact.
pub trait ReconvPredict {
    fn contains(&self, br_pc: u64) -> bool;

    /// Predicted reconvergence pc for a known branch. Looking up a branch
    /// the predictor has never seen is a caller bug and aborts.
    fn predict(&self, br_pc: u64) -> u64;
}

/// The live predictor: a branch frequency table plus two reconvergence
/// prediction tables fed from the same retirement stream.
///
/// The plain table treats every observed path as common. The second table
/// aborts in-flight training whenever the (statically loaded) branch
/// statistics flag the retired target as uncommon, keeping rare paths from
/// skewing its estimate; with a dynamically trained BFT the two tables
/// behave identically.
#[derive(Default)]
pub struct DynamicReconvPredictor {
    pub bft: Bft,
    pub rpt: Rpt,
    pub rpt_ignore_uncommon: Rpt,
}

impl DynamicReconvPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_branch_retired(&mut self, pc: u64, npc: u64, outcome: bool) {
        self.bft.train(pc, npc, outcome);

        drive_rpt(&mut self.rpt, &self.bft, pc, npc, outcome, false);
        drive_rpt(&mut self.rpt_ignore_uncommon, &self.bft, pc, npc, outcome, true);
    }

    /// An indirect jump trains as an always-taken branch.
    pub fn on_indirect_jmp_retired(&mut self, pc: u64, npc: u64) {
        self.on_branch_retired(pc, npc, true);
    }

    pub fn on_other_insn_retired(&mut self, pc: u64) {
        self.rpt.train(pc);
        self.rpt_ignore_uncommon.train(pc);
    }

    pub fn on_function_call(&mut self, _pc: u64, _target_addr: u64) {
        self.rpt.increase_call_level();
        self.rpt_ignore_uncommon.increase_call_level();
    }

    pub fn on_function_return(&mut self, _pc: u64, _return_addr: u64) {
        self.rpt.decrease_call_level();
        self.rpt_ignore_uncommon.decrease_call_level();
    }

    /// Writes `RPT_Result.csv`, `RPT_Result_IgnoreUncommonPath.csv` and
    /// `BFT_Result.csv` into `dir`.
    pub fn dump_artifacts(&self, dir: &Path) -> Result<(), ArtifactError> {
        dump_rpt(&self.rpt, &dir.join(RPT_RESULT_FILE))?;
        dump_rpt(
            &self.rpt_ignore_uncommon,
            &dir.join(RPT_RESULT_IGNORE_UNCOMMON_FILE),
        )?;
        self.bft.dump(&dir.join(BFT_RESULT_FILE))
    }
}

impl ReconvPredict for DynamicReconvPredictor {
    fn contains(&self, br_pc: u64) -> bool {
        self.rpt.contains(br_pc)
    }

    fn predict(&self, br_pc: u64) -> u64 {
        self.rpt
            .predict(br_pc)
            .unwrap_or_else(|| panic!("no reconvergence entry for branch pc {br_pc:#x}"))
            .pc
    }
}

fn drive_rpt(rpt: &mut Rpt, bft: &Bft, pc: u64, npc: u64, outcome: bool, honor_uncommon: bool) {
    if honor_uncommon && bft.is_uncommon_target(pc, npc) {
        // Heading down a rare path: stop everything in flight rather than
        // letting it distort the common-path estimate.
        rpt.deactivate_all();
    } else {
        rpt.train(pc);
        if rpt.contains(pc) || !bft.is_filtered(pc) {
            rpt.activate(pc, outcome);
        }
    }
}

pub fn dump_rpt(rpt: &Rpt, path: &Path) -> Result<(), ArtifactError> {
    let writer = csv::Writer::from_path(path).map_err(|source| ArtifactError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    dump_rpt_to(rpt, writer).map_err(|source| ArtifactError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

pub fn dump_rpt_to<W: Write>(rpt: &Rpt, mut writer: csv::Writer<W>) -> Result<(), csv::Error> {
    writer.write_record(RPT_CSV_HEADER)?;
    for (&pc, entry) in rpt.entries() {
        let prediction = entry.make_prediction();
        writer.write_record([
            format!("{pc:016x}"),
            format!("{:016x}", prediction.pc),
            entry.taken_activations().to_string(),
            entry.ntaken_activations().to_string(),
            prediction.category.to_string(),
            prediction.reason.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Serves predictions from a previously dumped RPT artifact.
#[derive(Debug, Default)]
pub struct StaticReconvPredictor {
    points: std::collections::BTreeMap<u64, u64>,
    loaded: bool,
}

impl StaticReconvPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn load(&mut self, path: &Path) -> Result<(), CsvLoadError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|source| CsvLoadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.load_from(reader, path)
    }

    pub fn load_from<R: Read>(
        &mut self,
        mut reader: csv::Reader<R>,
        origin: &Path,
    ) -> Result<(), CsvLoadError> {
        let read_err = |source: csv::Error| CsvLoadError::Read {
            path: origin.to_path_buf(),
            source,
        };
        let mut records = reader.records();

        let header = records
            .next()
            .transpose()
            .map_err(read_err)?
            .ok_or_else(|| CsvLoadError::MissingHeader {
                path: origin.to_path_buf(),
            })?;
        bft::check_header(&header, &RPT_CSV_HEADER, origin)?;

        let mut points = std::collections::BTreeMap::new();
        let mut record_no = 0u64;
        for record in records {
            record_no += 1;
            let record = record.map_err(read_err)?;
            if record.iter().all(|field| field.is_empty()) {
                continue;
            }
            let field_err = |field: &str| CsvLoadError::Field {
                path: origin.to_path_buf(),
                record: record_no,
                field: field.to_string(),
            };
            let branch_pc =
                u64::from_str_radix(&record[0], 16).map_err(|_| field_err(&record[0]))?;
            let reconv_pc =
                u64::from_str_radix(&record[1], 16).map_err(|_| field_err(&record[1]))?;
            if points.insert(branch_pc, reconv_pc).is_some() {
                return Err(CsvLoadError::DuplicateBranch {
                    path: origin.to_path_buf(),
                    record: record_no,
                    pc: branch_pc,
                });
            }
        }

        self.points = points;
        self.loaded = true;
        Ok(())
    }
}

impl ReconvPredict for StaticReconvPredictor {
    fn contains(&self, br_pc: u64) -> bool {
        self.points.contains_key(&br_pc)
    }

    fn predict(&self, br_pc: u64) -> u64 {
        *self
            .points
            .get(&br_pc)
            .unwrap_or_else(|| panic!("loaded reconvergence table has no entry for branch pc {br_pc:#x}"))
    }
}

/// Name is kept separate so drivers can place artifacts per hart.
pub fn artifact_path(dir: &Path, file: &str) -> PathBuf {
    dir.join(file)
}
