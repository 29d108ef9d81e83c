//! Branch frequency table: per-branch retirement statistics used to gate
//! reconvergence training, persistable as CSV.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{ArtifactError, CsvLoadError};

/// Branches sampled fewer times than this stay filtered / uncommon.
pub const SAMPLE_THRESHOLD: u64 = 30;
/// Bias at or above this marks a branch as effectively single-target.
pub const BIAS_THRESHOLD: f64 = 0.95;

pub const BFT_CSV_HEADER: [&str; 6] = [
    "BranchPC",
    "TotalCnt",
    "BiasRate",
    "MajorTarget",
    "MajorCnt",
    "Details...",
];

/// Retirement statistics for one static branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchStat {
    pub total_cnt: u64,
    pub major_target: u64,
    pub major_cnt: u64,
    pub cnt_by_target: BTreeMap<u64, u64>,
}

impl BranchStat {
    pub fn bias_rate(&self) -> f64 {
        self.major_cnt as f64 / self.total_cnt as f64
    }
}

/// The table. In dynamic mode it trains on every branch retirement; once
/// statistics are loaded from a CSV it flips to static mode and training
/// becomes a no-op.
#[derive(Debug, Default)]
pub struct Bft {
    branches: BTreeMap<u64, BranchStat>,
    static_stats: bool,
}

impl Bft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_static_mode(&self) -> bool {
        self.static_stats
    }

    pub fn stat(&self, pc: u64) -> Option<&BranchStat> {
        self.branches.get(&pc)
    }

    pub fn train(&mut self, pc: u64, npc: u64, _branch_taken: bool) {
        if self.static_stats {
            return;
        }
        let stat = self.branches.entry(pc).or_default();
        stat.total_cnt += 1;
        let target_cnt = stat.cnt_by_target.entry(npc).or_insert(0);
        *target_cnt += 1;
        if stat.major_cnt < *target_cnt {
            stat.major_cnt = *target_cnt;
            stat.major_target = npc;
        }
    }

    /// A branch is filtered out of reconvergence training until it has been
    /// sampled enough and shown a real second path.
    pub fn is_filtered(&self, pc: u64) -> bool {
        match self.branches.get(&pc) {
            None => true,
            Some(stat) => !(stat.total_cnt > SAMPLE_THRESHOLD
                && (stat.major_cnt as f64 / stat.total_cnt as f64) < BIAS_THRESHOLD),
        }
    }

    /// Whether `npc` is an uncommon target of `pc`. Only meaningful against
    /// statically loaded statistics; a dynamically trained table treats
    /// every path as common.
    pub fn is_uncommon_target(&self, pc: u64, npc: u64) -> bool {
        if !self.static_stats {
            return false;
        }

        let Some(stat) = self.branches.get(&pc) else {
            panic!("loaded branch statistics contain no entry for branch pc {pc:#x}");
        };

        if stat.total_cnt < SAMPLE_THRESHOLD {
            // The branch itself is rare; so is any path through it.
            return true;
        }

        if BIAS_THRESHOLD <= stat.bias_rate() {
            npc != stat.major_target
        } else {
            false
        }
    }

    pub fn dump(&self, path: &Path) -> Result<(), ArtifactError> {
        let writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|source| ArtifactError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
        self.dump_to(writer).map_err(|source| ArtifactError::Csv {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn dump_to<W: Write>(&self, mut writer: csv::Writer<W>) -> Result<(), csv::Error> {
        writer.write_record(BFT_CSV_HEADER)?;
        for (pc, stat) in &self.branches {
            let mut record: Vec<String> = vec![
                format!("{pc:016x}"),
                stat.total_cnt.to_string(),
                format!("{:.3}", stat.bias_rate()),
                format!("{:016x}", stat.major_target),
                stat.major_cnt.to_string(),
            ];
            for (target, cnt) in &stat.cnt_by_target {
                record.push(format!("{target:016x}:{cnt}"));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
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
        let mut records = reader.records();

        let header = records
            .next()
            .transpose()
            .map_err(|source| CsvLoadError::Read {
                path: origin.to_path_buf(),
                source,
            })?
            .ok_or_else(|| CsvLoadError::MissingHeader {
                path: origin.to_path_buf(),
            })?;
        check_header(&header, &BFT_CSV_HEADER, origin)?;

        let mut branches = BTreeMap::new();
        let mut record_no = 0u64;
        for record in records {
            record_no += 1;
            let record = record.map_err(|source| CsvLoadError::Read {
                path: origin.to_path_buf(),
                source,
            })?;
            if record.iter().all(|field| field.is_empty()) {
                continue;
            }
            if record.len() < 6 {
                return Err(CsvLoadError::Field {
                    path: origin.to_path_buf(),
                    record: record_no,
                    field: record.as_slice().to_string(),
                });
            }

            let field_err = |field: &str| CsvLoadError::Field {
                path: origin.to_path_buf(),
                record: record_no,
                field: field.to_string(),
            };
            let pc = u64::from_str_radix(&record[0], 16).map_err(|_| field_err(&record[0]))?;
            let total_cnt: u64 = record[1].parse().map_err(|_| field_err(&record[1]))?;
            let major_target =
                u64::from_str_radix(&record[3], 16).map_err(|_| field_err(&record[3]))?;
            let major_cnt: u64 = record[4].parse().map_err(|_| field_err(&record[4]))?;

            let mut stat = BranchStat {
                total_cnt,
                major_target,
                major_cnt,
                cnt_by_target: BTreeMap::new(),
            };

            let mut calc_total = 0u64;
            for detail in record.iter().skip(5) {
                let (target_str, cnt_str) =
                    detail.rsplit_once(':').ok_or_else(|| field_err(detail))?;
                let target =
                    u64::from_str_radix(target_str, 16).map_err(|_| field_err(detail))?;
                let cnt: u64 = cnt_str.parse().map_err(|_| field_err(detail))?;
                if cnt > major_cnt {
                    return Err(CsvLoadError::CountExceedsMajor {
                        path: origin.to_path_buf(),
                        record: record_no,
                        count: cnt,
                        major: major_cnt,
                    });
                }
                if stat.cnt_by_target.insert(target, cnt).is_some() {
                    return Err(CsvLoadError::DuplicateTarget {
                        path: origin.to_path_buf(),
                        record: record_no,
                        pc: target,
                    });
                }
                calc_total += cnt;
            }
            if calc_total != total_cnt {
                return Err(CsvLoadError::CountSumMismatch {
                    path: origin.to_path_buf(),
                    record: record_no,
                    sum: calc_total,
                    total: total_cnt,
                });
            }

            if branches.insert(pc, stat).is_some() {
                return Err(CsvLoadError::DuplicateBranch {
                    path: origin.to_path_buf(),
                    record: record_no,
                    pc,
                });
            }
        }

        self.branches = branches;
        self.static_stats = true;
        Ok(())
    }
}

pub(crate) fn check_header(
    header: &csv::StringRecord,
    expected: &[&'static str],
    origin: &Path,
) -> Result<(), CsvLoadError> {
    for (index, want) in expected.iter().enumerate() {
        let got = header.get(index).unwrap_or("");
        if got != *want {
            return Err(CsvLoadError::Header {
                path: origin.to_path_buf(),
                index,
                expected: want,
                got: got.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained_bft() -> Bft {
        let mut bft = Bft::new();
        for _ in 0..99 {
            bft.train(0xa0, 0xa4, false);
        }
        bft.train(0xa0, 0xb0, true);
        for i in 0..40 {
            bft.train(0x200, if i % 2 == 0 { 0x300 } else { 0x204 }, i % 2 == 0);
        }
        bft
    }

    #[test]
    fn argmax_bookkeeping_holds() {
        let bft = trained_bft();
        let stat = bft.stat(0xa0).unwrap();
        assert_eq!(stat.total_cnt, 100);
        assert_eq!(stat.major_target, 0xa4);
        assert_eq!(stat.major_cnt, 99);
        assert_eq!(
            stat.cnt_by_target.values().sum::<u64>(),
            stat.total_cnt
        );
        assert_eq!(stat.cnt_by_target[&stat.major_target], stat.major_cnt);
    }

    #[test]
    fn high_bias_branches_stay_filtered() {
        let bft = trained_bft();
        // bias 0.99 >= 0.95
        assert!(bft.is_filtered(0xa0));
        // 50/50 branch with 40 samples passes the filter
        assert!(!bft.is_filtered(0x200));
        // never-seen branch is filtered
        assert!(bft.is_filtered(0xdead));
    }

    #[test]
    fn uncommon_target_requires_static_mode() {
        let bft = trained_bft();
        assert!(!bft.is_uncommon_target(0xa0, 0xb0));
    }

    fn round_trip(bft: &Bft) -> (Vec<u8>, Bft) {
        let mut bytes = Vec::new();
        bft.dump_to(csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(&mut bytes))
            .unwrap();
        let mut reloaded = Bft::new();
        reloaded
            .load_from(
                csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .trim(csv::Trim::All)
                    .from_reader(bytes.as_slice()),
                Path::new("<memory>"),
            )
            .unwrap();
        (bytes, reloaded)
    }

    #[test]
    fn csv_round_trip_is_lossless() {
        let bft = trained_bft();
        let (bytes, reloaded) = round_trip(&bft);
        assert!(reloaded.is_static_mode());
        assert_eq!(reloaded.branches, bft.branches);

        let mut bytes_again = Vec::new();
        reloaded
            .dump_to(csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(&mut bytes_again))
            .unwrap();
        assert_eq!(bytes, bytes_again);
    }

    #[test]
    fn static_mode_freezes_training_and_flags_uncommon_targets() {
        let (_, mut reloaded) = round_trip(&trained_bft());
        reloaded.train(0xa0, 0xb0, true);
        assert_eq!(reloaded.stat(0xa0).unwrap().total_cnt, 100);

        assert!(reloaded.is_uncommon_target(0xa0, 0xb0));
        assert!(!reloaded.is_uncommon_target(0xa0, 0xa4));
        // the unbiased branch has no uncommon paths
        assert!(!reloaded.is_uncommon_target(0x200, 0x300));
    }

    #[test]
    #[should_panic(expected = "no entry for branch pc")]
    fn static_lookup_miss_is_fatal() {
        let (_, reloaded) = round_trip(&trained_bft());
        reloaded.is_uncommon_target(0xbeef, 0x4);
    }

    #[test]
    fn load_rejects_sum_mismatch() {
        let text = "BranchPC,TotalCnt,BiasRate,MajorTarget,MajorCnt,Details...\n\
                    00000000000000a0,3,1.000,00000000000000a4,3,00000000000000a4:2\n";
        let mut bft = Bft::new();
        let err = bft
            .load_from(
                csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .trim(csv::Trim::All)
                    .from_reader(text.as_bytes()),
                Path::new("<memory>"),
            )
            .unwrap_err();
        assert!(matches!(err, CsvLoadError::CountSumMismatch { sum: 2, total: 3, .. }));
    }

    #[test]
    fn load_rejects_count_above_major() {
        let text = "BranchPC,TotalCnt,BiasRate,MajorTarget,MajorCnt,Details...\n\
                    00000000000000a0,5,0.400,00000000000000a4,2,00000000000000a4:5\n";
        let mut bft = Bft::new();
        let err = bft
            .load_from(
                csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .trim(csv::Trim::All)
                    .from_reader(text.as_bytes()),
                Path::new("<memory>"),
            )
            .unwrap_err();
        assert!(matches!(err, CsvLoadError::CountExceedsMajor { count: 5, major: 2, .. }));
    }

    #[test]
    fn load_rejects_wrong_header() {
        let text = "Branch,TotalCnt,BiasRate,MajorTarget,MajorCnt,Details...\n";
        let mut bft = Bft::new();
        let err = bft
            .load_from(
                csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .trim(csv::Trim::All)
                    .from_reader(text.as_bytes()),
                Path::new("<memory>"),
            )
            .unwrap_err();
        assert!(matches!(err, CsvLoadError::Header { index: 0, .. }));
    }
}
