// In-memory data sources

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use streamplay_core::{AudioError, CancelFlag, DataSource, Result};

/// Fixed bytes held in memory
pub struct MemoryDataSource {
    data: Arc<[u8]>,
    position: usize,
    hint: Option<String>,
}

impl MemoryDataSource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl DataSource for MemoryDataSource {
    fn open(&mut self, offset: u64) -> Result<()> {
        self.position = (offset as usize).min(self.data.len());
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.data.len().saturating_sub(self.position);
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn format_hint(&self) -> Option<String> {
        self.hint.clone()
    }

    fn describe(&self) -> String {
        format!("memory ({} bytes)", self.data.len())
    }
}

#[derive(Default)]
struct Progress {
    data: Vec<u8>,
    complete: bool,
    failure: Option<AudioError>,
    declared_length: Option<u64>,
}

struct ProgressShared {
    progress: Mutex<Progress>,
    grown: Condvar,
}

/// Producer half of a [`ProgressiveDataSource`]
#[derive(Clone)]
pub struct ProgressiveWriter {
    shared: Arc<ProgressShared>,
}

impl ProgressiveWriter {
    /// Append downloaded bytes
    pub fn write(&self, data: &[u8]) {
        self.shared.progress.lock().data.extend_from_slice(data);
        self.shared.grown.notify_all();
    }

    /// Mark the download as complete
    pub fn set_complete(&self) {
        self.shared.progress.lock().complete = true;
        self.shared.grown.notify_all();
    }

    /// Make the next read past the written data fail
    pub fn fail(&self, error: AudioError) {
        self.shared.progress.lock().failure = Some(error);
        self.shared.grown.notify_all();
    }

    pub fn buffer_len(&self) -> usize {
        self.shared.progress.lock().data.len()
    }
}

/// Source fed by a separate writer, as bytes arrive from a download. Reads past the
/// written data block until more arrives, the writer completes, or the read is cancelled.
pub struct ProgressiveDataSource {
    shared: Arc<ProgressShared>,
    position: usize,
    poll_interval: Duration,
    cancel: Option<CancelFlag>,
    hint: Option<String>,
}

impl ProgressiveDataSource {
    pub fn new() -> (Self, ProgressiveWriter) {
        Self::with_length(None)
    }

    /// The writer announces the final length up front, as a Content-Length would
    pub fn with_length(length: Option<u64>) -> (Self, ProgressiveWriter) {
        let shared = Arc::new(ProgressShared {
            progress: Mutex::new(Progress {
                declared_length: length,
                ..Progress::default()
            }),
            grown: Condvar::new(),
        });
        let source = Self {
            shared: shared.clone(),
            position: 0,
            poll_interval: Duration::from_millis(100),
            cancel: None,
            hint: None,
        };
        (source, ProgressiveWriter { shared })
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }
}

impl DataSource for ProgressiveDataSource {
    fn open(&mut self, offset: u64) -> Result<()> {
        self.position = offset as usize;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut progress = self.shared.progress.lock();
        loop {
            let available = progress.data.len().saturating_sub(self.position);
            if available > 0 {
                let count = available.min(buf.len());
                buf[..count].copy_from_slice(&progress.data[self.position..self.position + count]);
                self.position += count;
                return Ok(count);
            }
            if let Some(error) = progress.failure.clone() {
                return Err(error);
            }
            if progress.complete {
                return Ok(0);
            }
            if self.is_cancelled() {
                return Err(AudioError::DataSourceError("Progressive read cancelled".to_string()));
            }
            // Timed so that cancellation is noticed without a writer notification
            self.shared.grown.wait_for(&mut progress, self.poll_interval);
        }
    }

    fn length(&self) -> Option<u64> {
        let progress = self.shared.progress.lock();
        if progress.complete {
            Some(progress.data.len() as u64)
        } else {
            progress.declared_length
        }
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn format_hint(&self) -> Option<String> {
        self.hint.clone()
    }

    fn attach_cancel(&mut self, cancel: CancelFlag) {
        self.cancel = Some(cancel);
    }

    fn describe(&self) -> String {
        "progressive buffer".to_string()
    }
}
