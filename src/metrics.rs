use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    series: &'a str,
    epoch: usize,
    value: f64,
}

/// Append-only scalar metrics sink, one JSON record per line.
///
/// Records are buffered; call `finish` at the end of the run to flush and
/// close the file.
pub struct ScalarLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl ScalarLog {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create metrics dir: {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics log: {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn log_scalar(&mut self, series: &str, epoch: usize, value: f64) -> anyhow::Result<()> {
        let record = ScalarRecord {
            series,
            epoch,
            value,
        };
        serde_json::to_writer(&mut self.writer, &record)
            .with_context(|| format!("Failed writing metrics record: {}", self.path.display()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed flushing metrics log: {}", self.path.display()))
    }
}
