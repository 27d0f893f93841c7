//! Export of server favicons to PNG files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::prelude::*;

use crate::protocol::StatusSummary;
use crate::types::ScanResult;

/// Prefix servers put in front of the base64 image data.
const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Decode a `data:image/png;base64,...` favicon into PNG bytes.
///
/// A value without the prefix is decoded as bare base64. Embedded line breaks are tolerated.
pub fn decode_favicon(favicon: &str) -> Result<Vec<u8>> {
    let data = favicon.trim();
    let data = data.strip_prefix(PNG_DATA_URI_PREFIX).unwrap_or(data);
    let cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64_STANDARD
        .decode(cleaned)
        .context("favicon is not valid base64")
}

/// Writes each found server's favicon as `<dir>/<n>.png`, numbering from 1.
#[derive(Debug)]
pub struct FaviconExporter {
    dir: PathBuf,
    next: u64,
}

impl FaviconExporter {
    /// Create `dir` if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create favicon dir: {}", dir.display()))?;
        Ok(Self { dir, next: 1 })
    }

    pub fn written(&self) -> u64 {
        self.next - 1
    }

    /// Write the favicon of a successful result, if it has one.
    ///
    /// Returns the path written, or `None` for failures and servers without a favicon.
    pub fn export(&mut self, result: &ScanResult) -> Result<Option<PathBuf>> {
        let ScanResult::Success { status, .. } = result else {
            return Ok(None);
        };
        let summary = StatusSummary::from_raw(status);
        if !summary.has_favicon() {
            return Ok(None);
        }
        let favicon = summary.favicon.as_deref().unwrap_or_default();

        let png = decode_favicon(favicon).with_context(|| format!("bad favicon from {}", result.target()))?;
        let path = self.dir.join(format!("{}.png", self.next));
        fs::write(&path, png).with_context(|| format!("failed to write {}", path.display()))?;
        self.next += 1;
        Ok(Some(path))
    }
}
