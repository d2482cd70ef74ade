//! Per-session transcript files

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::result::Result;

/// Raw record of everything sent to and received from a terminal.
///
/// One file per session name, `ssh_<name>.log`, truncated on every connect.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: File,
}

impl Transcript {
    /// Create (or truncate) the transcript for `name` under `dir`.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file_name: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = dir.join(format!("ssh_{file_name}.log"));
        let file = File::create(&path)?;
        Ok(Self { path, file })
    }

    /// Location of the transcript on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes. Failures are logged, not propagated.
    pub fn record(&mut self, data: &[u8]) {
        if let Err(e) = self.file.write_all(data) {
            tracing::debug!("failed to write transcript {}: {e}", self.path.display());
        }
    }
}
