//! Per-instance log capture.
//!
//! One append-only file per instance receives both of the child's output
//! streams, line-tagged. Rotation keeps a single previous generation.
//! The run loop is the only writer; tail reads are safe at any time
//! because writes are whole-line appends.

use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{OrchestratorError, Result};

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn tag(&self) -> &'static str {
        match self {
            Self::Stdout => "[stdout]",
            Self::Stderr => "[stderr]",
        }
    }
}

struct Sink {
    file: File,
    written: u64,
}

/// Append sink with size-bounded rotation and a tail read.
pub struct LogCapture {
    path: PathBuf,
    max_bytes: u64,
    sink: Mutex<Sink>,
}

impl LogCapture {
    /// Open (or create) the capture file. `max_bytes` of 0 disables
    /// rotation.
    pub fn new(path: PathBuf, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::io(format!("create log dir: {e}")))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| OrchestratorError::io(format!("open {}: {e}", path.display())))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            sink: Mutex::new(Sink { file, written }),
        })
    }

    fn rotated_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".1");
        PathBuf::from(os)
    }

    /// Append one line from the given stream.
    pub fn write_line(&self, stream: StreamKind, line: &str) -> Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());

        if self.max_bytes > 0 && sink.written >= self.max_bytes {
            // Rotate: current file becomes the single kept generation.
            drop(std::mem::replace(
                &mut sink.file,
                self.rotate_locked()?,
            ));
            sink.written = 0;
        }

        let entry = format!("{} {}\n", stream.tag(), line);
        sink.file
            .write_all(entry.as_bytes())
            .map_err(|e| OrchestratorError::io(format!("append {}: {e}", self.path.display())))?;
        sink.written += entry.len() as u64;
        Ok(())
    }

    fn rotate_locked(&self) -> Result<File> {
        std::fs::rename(&self.path, self.rotated_path())
            .map_err(|e| OrchestratorError::io(format!("rotate {}: {e}", self.path.display())))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| OrchestratorError::io(format!("reopen {}: {e}", self.path.display())))
    }

    /// Last `n` captured lines, spanning the rotated generation when the
    /// current file is short.
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut lines = read_lines(&self.rotated_path())?;
        lines.extend(read_lines(&self.path)?);

        let skip = lines.len().saturating_sub(n);
        Ok(lines.split_off(skip))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(OrchestratorError::io(format!(
                "read {}: {e}",
                path.display()
            )))
        }
    };
    let reader = BufReader::new(file);
    reader
        .lines()
        .collect::<std::io::Result<Vec<String>>>()
        .map_err(|e| OrchestratorError::io(format!("read {}: {e}", path.display())))
}
