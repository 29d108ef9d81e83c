use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while creating or writing a profiling artifact.
///
/// The engines themselves treat mid-run write failures as fatal (they are
/// consumed synchronously from a retire loop and cannot roll the simulator
/// back); these variants cover the fallible setup and finalization surface
/// the driver is expected to report and exit on.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to open `{}`: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write `{}`: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write CSV `{}`: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Errors raised while loading predictor state from a CSV artifact.
#[derive(Debug, Error)]
pub enum CsvLoadError {
    #[error("failed to read `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("`{}`: missing header row", path.display())]
    MissingHeader { path: PathBuf },

    #[error("`{}`: header column {index} is `{got}`, expected `{expected}`", path.display())]
    Header {
        path: PathBuf,
        index: usize,
        expected: &'static str,
        got: String,
    },

    #[error("`{}` record {record}: malformed field `{field}`", path.display())]
    Field {
        path: PathBuf,
        record: u64,
        field: String,
    },

    #[error("`{}` record {record}: duplicate branch pc {pc:#x}", path.display())]
    DuplicateBranch { path: PathBuf, record: u64, pc: u64 },

    #[error("`{}` record {record}: duplicate target pc {pc:#x}", path.display())]
    DuplicateTarget { path: PathBuf, record: u64, pc: u64 },

    #[error(
        "`{}` record {record}: per-target counts sum to {sum}, expected {total}",
        path.display()
    )]
    CountSumMismatch {
        path: PathBuf,
        record: u64,
        sum: u64,
        total: u64,
    },

    #[error(
        "`{}` record {record}: target count {count} exceeds major count {major}",
        path.display()
    )]
    CountExceedsMajor {
        path: PathBuf,
        record: u64,
        count: u64,
        major: u64,
    },
}
