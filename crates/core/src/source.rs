// Data source collaborator: a byte-range addressable producer of raw stream bytes

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag handed to data sources so that blocking or retrying
/// reads can give up when their entry is cancelled or the player is disposed
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Raw byte producer for one queue item
pub trait DataSource: Send {
    /// (Re)open the source so the next read starts at `offset`
    fn open(&mut self, offset: u64) -> Result<()>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of data.
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Total length in bytes, if known (unknown for live streams)
    fn length(&self) -> Option<u64>;

    /// Offset of the next byte `read_into` returns
    fn position(&self) -> u64;

    fn is_seekable(&self) -> bool {
        true
    }

    /// Container hint (file extension or MIME type) used to pick a parser
    fn format_hint(&self) -> Option<String> {
        None
    }

    fn attach_cancel(&mut self, _cancel: CancelFlag) {}

    /// Release underlying resources. Reads after close reopen lazily or fail.
    fn close(&mut self) {}

    /// Short description for log lines
    fn describe(&self) -> String {
        "data source".to_string()
    }
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn open(&mut self, offset: u64) -> Result<()> {
        (**self).open(offset)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_into(buf)
    }

    fn length(&self) -> Option<u64> {
        (**self).length()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn format_hint(&self) -> Option<String> {
        (**self).format_hint()
    }

    fn attach_cancel(&mut self, cancel: CancelFlag) {
        (**self).attach_cancel(cancel)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
