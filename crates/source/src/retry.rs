// Data source wrapper that retries transient failures with exponential backoff

use std::thread;
use std::time::Duration;
use streamplay_core::{AudioError, CancelFlag, DataSource, Result};

/// Backoff settings for [`AutoRecoveringDataSource`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failure before giving up
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Wraps a source and transparently reopens it at the current position when a read
/// fails. Missing data is never retried; cancellation stops retrying immediately.
pub struct AutoRecoveringDataSource<S> {
    inner: S,
    policy: RetryPolicy,
    cancel: Option<CancelFlag>,
}

impl<S: DataSource> AutoRecoveringDataSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            cancel: None,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }

    fn retryable(&self, err: &AudioError) -> bool {
        !matches!(err, AudioError::DataNotFound(_)) && !self.is_cancelled()
    }

    /// Sleep in short slices so a cancellation cuts the wait short
    fn backoff(&self, attempt: u32) {
        let delay = self.policy.delay_for(attempt);
        log::warn!(
            "[source] {} failed (attempt {}), retrying after {:?}",
            self.inner.describe(),
            attempt + 1,
            delay
        );
        let slice = Duration::from_millis(20);
        let mut waited = Duration::ZERO;
        while waited < delay && !self.is_cancelled() {
            let step = slice.min(delay - waited);
            thread::sleep(step);
            waited += step;
        }
    }

    fn with_retries<T>(&mut self, mut op: impl FnMut(&mut S, u32) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op(&mut self.inner, attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.policy.max_retries && self.retryable(&err) => {
                    log::debug!("[source] transient failure: {}", err);
                    self.backoff(attempt);
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 0 {
                        log::error!(
                            "[source] {} failed after {} attempts: {}",
                            self.inner.describe(),
                            attempt + 1,
                            err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl<S: DataSource> DataSource for AutoRecoveringDataSource<S> {
    fn open(&mut self, offset: u64) -> Result<()> {
        self.with_retries(|inner, _| inner.open(offset))
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.with_retries(|inner, attempt| {
            if attempt > 0 {
                let position = inner.position();
                inner.open(position)?;
            }
            inner.read_into(buf)
        })
    }

    fn length(&self) -> Option<u64> {
        self.inner.length()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    fn format_hint(&self) -> Option<String> {
        self.inner.format_hint()
    }

    fn attach_cancel(&mut self, cancel: CancelFlag) {
        self.inner.attach_cancel(cancel.clone());
        self.cancel = Some(cancel);
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
