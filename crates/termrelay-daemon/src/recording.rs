//! Output recording for sessions created with `recording_enabled`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Receives a copy of every output chunk relayed to the caller.
pub trait RecordingSink: Send {
    fn record(&mut self, chunk: &[u8]) -> io::Result<()>;

    fn finish(&mut self) -> io::Result<()>;
}

/// Appends raw output bytes to a file.
pub struct FileRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileRecorder {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordingSink for FileRecorder {
    fn record(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}
