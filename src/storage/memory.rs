//! In-memory file provider.
//!
//! Holds whole files as shared byte buffers. Files can be replaced while the
//! provider is in use; a reader keeps the content it opened.

use super::{FileProvider, FileReader, ReadResult, StorageError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// How an in-memory file behaves when read
#[derive(Debug, Clone)]
enum Entry {
    File(Bytes),
    /// Opens fine but never delivers data
    Stalled,
    /// Opens fine but every read fails
    Broken,
}

/// File provider backed by a map of path to content
#[derive(Debug, Default)]
pub struct MemoryProvider {
    files: RwLock<HashMap<String, Entry>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file
    pub fn insert(&self, path: &str, content: impl Into<Bytes>) {
        self.set(path, Entry::File(content.into()));
    }

    /// Add a file that never becomes readable
    pub fn insert_stalled(&self, path: &str) {
        self.set(path, Entry::Stalled);
    }

    /// Add a file whose reads fail with an I/O error
    pub fn insert_broken(&self, path: &str) {
        self.set(path, Entry::Broken);
    }

    fn set(&self, path: &str, entry: Entry) {
        match self.files.write() {
            Ok(mut files) => {
                files.insert(normalize(path), entry);
            }
            Err(_) => tracing::warn!("Provider lock poisoned, dropping write of {}", path),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

impl FileProvider for MemoryProvider {
    fn open(&self, path: &str) -> Result<Box<dyn FileReader>, StorageError> {
        let files = self
            .files
            .read()
            .map_err(|_| StorageError::Io(std::io::Error::other("provider lock poisoned")))?;

        let entry = files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        Ok(Box::new(MemoryReader { entry, pos: 0 }))
    }
}

struct MemoryReader {
    entry: Entry,
    pos: usize,
}

impl FileReader for MemoryReader {
    fn read(&mut self, max_bytes: usize) -> Result<ReadResult, StorageError> {
        match &self.entry {
            Entry::Stalled => Ok(ReadResult::Pending),
            Entry::Broken => Err(StorageError::Io(std::io::Error::other(
                "simulated read failure",
            ))),
            Entry::File(content) => {
                if self.pos >= content.len() {
                    return Ok(ReadResult::Eof);
                }
                let end = (self.pos + max_bytes.max(1)).min(content.len());
                let chunk = content.slice(self.pos..end);
                self.pos = end;
                Ok(ReadResult::Data(chunk))
            }
        }
    }

    fn size_hint(&self) -> Option<u64> {
        match &self.entry {
            Entry::File(content) => Some(content.len() as u64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_then_eof() {
        let provider = MemoryProvider::new();
        provider.insert("/a.bmp", vec![1u8, 2, 3, 4, 5]);

        let mut reader = provider.open("a.bmp").unwrap();
        assert_eq!(
            reader.read(2).unwrap(),
            ReadResult::Data(Bytes::from_static(&[1, 2]))
        );
        assert_eq!(
            reader.read(2).unwrap(),
            ReadResult::Data(Bytes::from_static(&[3, 4]))
        );
        assert_eq!(
            reader.read(2).unwrap(),
            ReadResult::Data(Bytes::from_static(&[5]))
        );
        assert_eq!(reader.read(2).unwrap(), ReadResult::Eof);
    }

    #[test]
    fn test_reader_keeps_content_after_replace() {
        let provider = MemoryProvider::new();
        provider.insert("a", vec![1u8]);
        let mut reader = provider.open("a").unwrap();
        provider.insert("a", vec![9u8, 9]);

        assert_eq!(
            reader.read(8).unwrap(),
            ReadResult::Data(Bytes::from_static(&[1]))
        );
    }

    #[test]
    fn test_stalled_and_broken() {
        let provider = MemoryProvider::new();
        provider.insert_stalled("slow");
        provider.insert_broken("bad");

        assert_eq!(provider.open("slow").unwrap().read(8).unwrap(), ReadResult::Pending);
        assert!(matches!(
            provider.open("bad").unwrap().read(8),
            Err(StorageError::Io(_))
        ));
        assert!(matches!(provider.open("none"), Err(StorageError::NotFound(_))));
    }
}
