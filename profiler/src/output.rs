//! Line-oriented gzip sinks shared by the interval trackers and the trace
//! recorder.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::errors::ArtifactError;

/// All engines emit through a boxed writer so tests can capture bytes in
/// memory and drivers can substitute their own streams.
pub type LineSink = Box<dyn Write>;

/// Opens `path` for truncating write and wraps it in a gzip stream.
pub fn gz_line_writer(path: &Path) -> Result<LineSink, ArtifactError> {
    let file = File::create(path).map_err(|source| ArtifactError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Box::new(BufWriter::new(GzEncoder::new(
        file,
        Compression::default(),
    ))))
}
