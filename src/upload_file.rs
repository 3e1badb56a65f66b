use std::path::PathBuf;

use log::{debug, warn};
use tempfile::NamedTempFile;
use tokio::fs::File;

use crate::FormPart;

/// A file part that was spooled to disk.
#[derive(Debug)]
pub struct UploadFile {
    pub field: String,
    pub name: String,
    pub content_type: String,
    pub(crate) temp_file_path: PathBuf,
}

impl UploadFile {
    pub async fn open(&self) -> Result<File, std::io::Error> {
        File::open(&self.temp_file_path).await
    }
}

impl FormPart for UploadFile {
    fn field_name(&self) -> &str {
        &self.field
    }

    fn file_name(&self) -> &str {
        &self.name
    }
}

/// Temp files of one request. Travels with the response and is removed once
/// the handler is done with the files.
#[derive(Debug, Default)]
pub struct Cleanup(Vec<NamedTempFile>);

impl Cleanup {
    pub fn push(&mut self, file: NamedTempFile) {
        self.0.push(file);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deletes the files on the blocking pool without holding up the caller.
    /// A crash before this runs leaves orphans behind for the OS temp reaper.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            for file in self.0 {
                let path = file.path().to_path_buf();
                match file.close() {
                    Ok(()) => debug!("Removed temp file {:?}", path),
                    Err(e) => warn!("Failed to remove temp file {:?}: {}", path, e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_removes_files() {
        let mut cleanup = Cleanup::default();
        let first = NamedTempFile::new().unwrap();
        let second = NamedTempFile::new().unwrap();
        let paths = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        cleanup.push(first);
        cleanup.push(second);
        assert_eq!(cleanup.len(), 2);

        cleanup.spawn().await.unwrap();

        for path in paths {
            assert!(!path.exists(), "{path:?} still exists");
        }
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::remove_file(file.path()).unwrap();

        let mut cleanup = Cleanup::default();
        cleanup.push(file);
        cleanup.spawn().await.unwrap();
    }
}
