//! Where artifact bytes go.
//!
//! The writers only see [`ArtifactSink`]; [`FileSinks`] opens real files.
//! Another [`SinkFactory`] can wrap or replace them, e.g. to account for
//! bytes or to reproduce a disk failing part-way through a session.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// A byte stream an artifact is written to.
pub trait ArtifactSink: Write + Send {
    /// Push written data to stable storage.
    fn sync_data(&mut self) -> io::Result<()>;
}

impl ArtifactSink for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// Opens one sink per artifact path.
pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ArtifactSink>>;
}

/// Creates (or truncates) a file at each path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSinks;

impl SinkFactory for FileSinks {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ArtifactSink>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(file))
    }
}
