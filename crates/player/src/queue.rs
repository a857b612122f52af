// Ordered item management: playing, reading, and pending entries

use crate::entry::QueueEntry;
use std::collections::VecDeque;
use std::sync::Arc;
use streamplay_core::QueueItemId;

/// Queue positions. `reading` may be the same entry as `playing` (the first item, or
/// the playing item after a seek); otherwise an entry is held in exactly one place.
///
/// Pending entries, in play order, are `buffering` (fully read, waiting their turn),
/// then `reading` when it is not also playing, then `upcoming`.
#[derive(Default)]
pub(crate) struct PlaybackQueue {
    playing: Option<Arc<QueueEntry>>,
    reading: Option<Arc<QueueEntry>>,
    buffering: VecDeque<Arc<QueueEntry>>,
    upcoming: VecDeque<Arc<QueueEntry>>,
}

fn same(a: &Option<Arc<QueueEntry>>, b: &Arc<QueueEntry>) -> bool {
    a.as_ref().map(|a| Arc::ptr_eq(a, b)).unwrap_or(false)
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn playing(&self) -> Option<&Arc<QueueEntry>> {
        self.playing.as_ref()
    }

    pub fn reading(&self) -> Option<&Arc<QueueEntry>> {
        self.reading.as_ref()
    }

    pub fn is_playing(&self, entry: &Arc<QueueEntry>) -> bool {
        same(&self.playing, entry)
    }

    pub fn is_reading(&self, entry: &Arc<QueueEntry>) -> bool {
        same(&self.reading, entry)
    }

    /// The reading entry is ahead of the playing one
    pub fn is_reading_ahead(&self) -> bool {
        match (&self.reading, &self.playing) {
            (Some(reading), Some(playing)) => !Arc::ptr_eq(reading, playing),
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.playing.is_none()
            && self.reading.is_none()
            && self.buffering.is_empty()
            && self.upcoming.is_empty()
    }

    pub fn push(&mut self, entry: Arc<QueueEntry>) {
        self.upcoming.push_back(entry);
    }

    /// Start reading the next upcoming entry if nothing is being read. When nothing is
    /// playing either, the entry also becomes the playing entry and is returned.
    pub fn promote_reading(&mut self) -> Option<Arc<QueueEntry>> {
        if self.reading.is_some() {
            return None;
        }
        let next = self.upcoming.pop_front()?;
        self.reading = Some(next.clone());
        if self.playing.is_none() && self.buffering.is_empty() {
            self.playing = Some(next.clone());
            return Some(next);
        }
        None
    }

    /// The reading entry reached the end of its data
    pub fn finish_reading(&mut self) {
        if let Some(entry) = self.reading.take() {
            if !same(&self.playing, &entry) {
                self.buffering.push_back(entry);
            }
        }
    }

    /// Drop the reading entry without keeping it anywhere
    pub fn abandon_reading(&mut self) -> Option<Arc<QueueEntry>> {
        let entry = self.reading.take()?;
        if same(&self.playing, &entry) {
            self.playing = None;
        }
        Some(entry)
    }

    /// The playing entry finished. The next entry in play order becomes the playing
    /// entry and is returned.
    pub fn advance_playing(&mut self) -> Option<Arc<QueueEntry>> {
        let finished = self.playing.take();
        if let Some(finished) = &finished {
            if same(&self.reading, finished) {
                self.reading = None;
            }
        }

        let next = match self.buffering.pop_front() {
            Some(entry) => Some(entry),
            None => match self.reading.clone() {
                Some(reading) => Some(reading),
                None => {
                    // Nothing read ahead; start on the next upcoming entry
                    let next = self.upcoming.pop_front();
                    self.reading = next.clone();
                    next
                }
            },
        };
        self.playing = next.clone();
        next
    }

    /// Replace everything that is playing or reading with `entry`. Returns the entry that
    /// was playing. Pending entries must have been taken first.
    pub fn replace_playing(&mut self, entry: Arc<QueueEntry>) -> Option<Arc<QueueEntry>> {
        let previous = self.playing.take();
        self.reading = Some(entry.clone());
        self.playing = Some(entry);
        previous
    }

    pub fn take_playing(&mut self) -> Option<Arc<QueueEntry>> {
        let entry = self.playing.take()?;
        if same(&self.reading, &entry) {
            self.reading = None;
        }
        Some(entry)
    }

    /// Remove every entry that has not started playing, in play order
    pub fn take_pending(&mut self) -> Vec<Arc<QueueEntry>> {
        let mut pending: Vec<Arc<QueueEntry>> = self.buffering.drain(..).collect();
        if self.is_reading_ahead() {
            if let Some(reading) = self.reading.take() {
                pending.push(reading);
            }
        }
        pending.extend(self.upcoming.drain(..));
        pending
    }

    pub fn pending_ids(&self) -> Vec<QueueItemId> {
        let reading_ahead = if self.is_reading_ahead() {
            self.reading.as_ref()
        } else {
            None
        };
        self.buffering
            .iter()
            .chain(reading_ahead)
            .chain(self.upcoming.iter())
            .map(|e| e.id().clone())
            .collect()
    }

    /// After a seek every entry read ahead of the playing one must be read again.
    /// They go back to the front of `upcoming` in play order and the playing entry
    /// becomes the reading entry. Returns the requeued entries.
    pub fn requeue_read_ahead(&mut self) -> Vec<Arc<QueueEntry>> {
        let mut requeued: Vec<Arc<QueueEntry>> = self.buffering.drain(..).collect();
        if self.is_reading_ahead() {
            if let Some(reading) = self.reading.take() {
                requeued.push(reading);
            }
        }
        for entry in requeued.iter().rev() {
            self.upcoming.push_front(entry.clone());
        }
        self.reading = self.playing.clone();
        requeued
    }

    pub fn all(&self) -> Vec<Arc<QueueEntry>> {
        let mut all: Vec<Arc<QueueEntry>> = Vec::new();
        all.extend(self.playing.iter().cloned());
        all.extend(self.buffering.iter().cloned());
        if self.is_reading_ahead() {
            all.extend(self.reading.iter().cloned());
        }
        all.extend(self.upcoming.iter().cloned());
        all
    }

    pub fn clear(&mut self) {
        self.playing = None;
        self.reading = None;
        self.buffering.clear();
        self.upcoming.clear();
    }
}
