// Local file data source

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use streamplay_core::{AudioError, DataSource, Result};

/// Reads a file from disk. The file is opened lazily on the first `open`.
pub struct FileDataSource {
    path: PathBuf,
    file: Option<File>,
    length: Option<u64>,
    position: u64,
}

impl FileDataSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            length: None,
            position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for FileDataSource {
    fn open(&mut self, offset: u64) -> Result<()> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AudioError::DataNotFound(format!("{}: {}", self.path.display(), e))
                }
                _ => AudioError::DataSourceError(format!(
                    "Failed to open {}: {}",
                    self.path.display(),
                    e
                )),
            })?;
            self.length = file.metadata().ok().map(|m| m.len());
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(offset))?;
        }
        self.position = offset;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.file.is_none() {
            self.open(self.position)?;
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let read = file.read(buf).map_err(|e| {
            AudioError::DataSourceError(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        self.position += read as u64;
        Ok(read)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn format_hint(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_from_offset() {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(b"abcdefgh").unwrap();

        let mut source = FileDataSource::new(file.path());
        source.open(3).unwrap();
        assert_eq!(source.length(), Some(8));
        assert_eq!(source.format_hint().as_deref(), Some("wav"));

        let mut buf = [0u8; 16];
        let n = source.read_into(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"defgh");
        assert_eq!(source.read_into(&mut buf).unwrap(), 0);
        assert_eq!(source.position(), 8);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileDataSource::new(dir.path().join("missing.wav"));
        assert!(matches!(source.open(0), Err(AudioError::DataNotFound(_))));
    }
}
