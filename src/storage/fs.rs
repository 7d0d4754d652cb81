//! Directory-backed file provider.
//!
//! Maps image paths onto files below a root directory, the way an SD card
//! mount point would be used on the device.

use super::{FileProvider, FileReader, ReadResult, StorageError};
use bytes::BytesMut;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

/// File provider rooted at a directory
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    /// Create a provider serving files below `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve an image path below the root
    ///
    /// Leading slashes are ignored so "/images/a.bmp" and "images/a.bmp"
    /// name the same file. Paths that would leave the root are rejected.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut resolved = self.root.clone();

        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    tracing::warn!("Rejected path outside storage root: {}", path);
                    return Err(StorageError::NotFound(path.to_string()));
                }
            }
        }

        Ok(resolved)
    }
}

impl FileProvider for DirectoryProvider {
    fn open(&self, path: &str) -> Result<Box<dyn FileReader>, StorageError> {
        let full_path = self.resolve(path)?;

        let file = File::open(&full_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            _ => StorageError::Io(e),
        })?;

        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(StorageError::NotFound(path.to_string()));
        }

        tracing::debug!("Opened {} ({} bytes)", full_path.display(), metadata.len());

        Ok(Box::new(FsReader {
            file,
            size: metadata.len(),
        }))
    }
}

/// Reader over an open file
struct FsReader {
    file: File,
    size: u64,
}

impl FileReader for FsReader {
    fn read(&mut self, max_bytes: usize) -> Result<ReadResult, StorageError> {
        let mut buf = BytesMut::zeroed(max_bytes.max(1));

        let n = loop {
            match self.file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadResult::Pending),
                Err(e) => return Err(StorageError::Io(e)),
            }
        };

        if n == 0 {
            return Ok(ReadResult::Eof);
        }

        buf.truncate(n);
        Ok(ReadResult::Data(buf.freeze()))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }
}
