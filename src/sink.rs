use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::SlpRecord;

/// Destination for successful probe records.
///
/// Takes `&mut self`, so a sink has a single writer at a time.
pub trait ResultSink {
    fn write(&mut self, record: &SlpRecord<'_>) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
///
/// Each record is serialized in full before a single write, then flushed, so the file never
/// ends in a partial record.
#[derive(Debug)]
pub struct JsonLinesSink {
    file: File,
    path: PathBuf,
    written: u64,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open output file: {}", path.display()))?;
        Ok(Self {
            file,
            path,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl ResultSink for JsonLinesSink {
    fn write(&mut self, record: &SlpRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .with_context(|| format!("failed to sync {}", self.path.display()))
    }
}

/// Keeps serialized records in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub lines: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for MemorySink {
    fn write(&mut self, record: &SlpRecord<'_>) -> Result<()> {
        self.lines.push(serde_json::to_string(record)?);
        Ok(())
    }
}
