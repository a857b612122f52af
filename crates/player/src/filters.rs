// Named PCM frame filters run on every buffer before it reaches the sink

use std::sync::Arc;
use streamplay_core::{AudioError, Result};

/// Called with `(channels, bytes_per_frame, frame_count, frames)` and may rewrite the
/// interleaved samples in place
pub type FrameFilter = Arc<dyn Fn(u16, u32, u64, &mut [u8]) + Send + Sync>;

#[derive(Default)]
pub(crate) struct FrameFilterChain {
    filters: Vec<(String, FrameFilter)>,
}

impl FrameFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.filters.iter().position(|(n, _)| n == name)
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if self.position(name).is_some() {
            return Err(AudioError::InvalidState(format!(
                "Frame filter '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    pub fn append(&mut self, name: &str, filter: FrameFilter) -> Result<()> {
        self.ensure_unique(name)?;
        self.filters.push((name.to_string(), filter));
        Ok(())
    }

    pub fn add_after(&mut self, name: &str, after: &str, filter: FrameFilter) -> Result<()> {
        self.ensure_unique(name)?;
        let index = self
            .position(after)
            .ok_or_else(|| AudioError::InvalidState(format!("No frame filter named '{}'", after)))?;
        self.filters.insert(index + 1, (name.to_string(), filter));
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.filters.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.filters.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn apply(&self, channels: u16, bytes_per_frame: u32, frames: u64, data: &mut [u8]) {
        for (_, filter) in &self.filters {
            filter(channels, bytes_per_frame, frames, data);
        }
    }
}
