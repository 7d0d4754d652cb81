//! Storage providers the loader reads image files from.
//!
//! A provider opens a path and hands back a reader that yields bounded
//! chunks. Readers never block: a provider that has nothing ready yet
//! returns [`ReadResult::Pending`] and the loader tries again on its
//! next step.

pub mod fs;
pub mod memory;

pub use fs::DirectoryProvider;
pub use memory::MemoryProvider;

use bytes::Bytes;
use thiserror::Error;

/// Storage-level errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a single bounded read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Up to `max_bytes` of file content
    Data(Bytes),
    /// No data available right now, but the file has not ended
    Pending,
    /// End of file reached
    Eof,
}

/// An open file. Owned exclusively by one load for its whole duration and
/// closed when dropped.
pub trait FileReader: Send {
    /// Read at most `max_bytes` bytes
    fn read(&mut self, max_bytes: usize) -> Result<ReadResult, StorageError>;

    /// Total file size, when the provider knows it up front
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Something that can open files by path (an SD card, a directory, ...)
pub trait FileProvider: Send + Sync {
    /// Open `path` for reading
    fn open(&self, path: &str) -> Result<Box<dyn FileReader>, StorageError>;
}
