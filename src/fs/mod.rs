//! File-system capability used for config and secret reads, so tests can
//! substitute an in-memory implementation.

use std::fmt::Debug;
use std::io;
use std::path::Path;

pub trait Filesystem: Debug + Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

#[derive(Debug, Default)]
pub struct OsFilesystem;

impl Filesystem for OsFilesystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// In-memory filesystem keyed by path; reads of unknown paths return
/// NotFound like the real thing.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemFilesystem {
    files: std::sync::Mutex<std::collections::HashMap<std::path::PathBuf, String>>,
}

#[cfg(test)]
impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(&self, path: impl Into<std::path::PathBuf>, contents: impl Into<String>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), contents.into());
    }
}

#[cfg(test)]
impl Filesystem for MemFilesystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("file does not exist: {}", path.display()),
                )
            })
    }
}
