// Public player handle: queue and transport control, queries, and teardown

use crate::driver;
use crate::engine::{Inner, SeekRequest, Shared};
use crate::entry::QueueEntry;
use crate::filters::FrameFilter;
use crate::ingest;
use crate::metering::MeterReading;
use crate::options::PlayerOptions;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use streamplay_core::{
    AudioError, DataSource, ErrorCode, InternalState, ParserFactory, PlayerListener, PublicState,
    QueueItemId, Result, StopReason, Subscription,
};
use streamplay_demux::DefaultParserFactory;
use streamplay_sink_api::PlaybackSink;
use streamplay_source::data_source_from_url;

/// Streaming audio player.
///
/// Owns two worker threads: one reads and parses the current item into the frame
/// buffer pool, the other feeds filled buffers to the sink. Every method returns
/// without waiting on either of them, except [`AudioPlayer::dispose`].
pub struct AudioPlayer {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioPlayer {
    /// Player that understands WAV and raw PCM sources
    pub fn new(sink: Box<dyn PlaybackSink>, options: PlayerOptions) -> Result<Self> {
        Self::with_factory(sink, Arc::new(DefaultParserFactory::new()), options)
    }

    pub fn with_factory(
        sink: Box<dyn PlaybackSink>,
        factory: Arc<dyn ParserFactory>,
        options: PlayerOptions,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(options, factory)?);
        let ingest = ingest::spawn(shared.clone())?;
        let driver = match driver::spawn(shared.clone(), sink) {
            Ok(handle) => handle,
            Err(err) => {
                shared.inner.lock().dispose_requested = true;
                shared.pool.close();
                shared.poke();
                if ingest.join().is_err() {
                    log::warn!("[player] ingest thread panicked");
                }
                return Err(err);
            }
        };
        log::info!(
            "[player] created with {} buffers of {} bytes",
            shared.options.buffer_count,
            shared.options.buffer_size
        );
        Ok(Self {
            shared,
            threads: Mutex::new(vec![ingest, driver]),
        })
    }

    /// Register a listener. Events stop when the returned handle is dropped.
    pub fn subscribe(&self, listener: Arc<dyn PlayerListener>) -> Subscription {
        self.shared.dispatcher.subscribe(listener)
    }

    /// Run a public operation under the engine lock, then wake both loops
    fn command<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let result = self.shared.with_inner(|inner| {
            if inner.dispose_requested {
                return Err(AudioError::Disposed);
            }
            inner.machine.ensure_usable()?;
            f(inner)
        });
        self.shared.poke();
        result
    }

    fn new_entry(
        inner: &mut Inner,
        id: QueueItemId,
        source: Box<dyn DataSource>,
    ) -> Arc<QueueEntry> {
        let serial = inner.next_serial;
        inner.next_serial += 1;
        Arc::new(QueueEntry::new(id, serial, source))
    }

    /// Append an item. Playback starts if the player is not already running.
    pub fn enqueue(&self, source: Box<dyn DataSource>, id: impl Into<QueueItemId>) -> Result<()> {
        let id = id.into();
        self.command(move |inner| {
            let entry = Self::new_entry(inner, id, source);
            log::info!("[player] queued {} ({})", entry.id(), entry.serial());
            inner.queue.push(entry);
            if let Some(started) = inner.queue.promote_reading() {
                inner.item_started(&started);
            }
            start_running(inner)
        })
    }

    /// Drop everything queued or playing and play this item now
    pub fn play_now(&self, source: Box<dyn DataSource>, id: impl Into<QueueItemId>) -> Result<()> {
        let id = id.into();
        self.command(move |inner| {
            let entry = Self::new_entry(inner, id, source);
            log::info!("[player] playing {} now", entry.id());

            let pending = inner.queue.take_pending();
            inner.cancel_entries(&pending);
            if let Some(previous) = inner.queue.take_playing() {
                inner.item_finished(&previous, StopReason::UserAction);
                previous.cancel();
            }

            inner.generation += 1;
            inner.seek_request = None;
            inner.stop_request = None;
            inner.queue.replace_playing(entry.clone());
            inner.item_started(&entry);
            inner.machine.set_stop_reason(StopReason::NoStop);
            inner.transition(InternalState::StartingThread)
        })
    }

    /// Play the file or stream at `url` now, using the url as the item id
    pub fn play_url(&self, url: &str) -> Result<()> {
        let source = data_source_from_url(url)?;
        self.play_now(source, url)
    }

    /// Continue the current item from `time` seconds
    pub fn seek(&self, time: f64) -> Result<()> {
        self.command(|inner| {
            let playing = inner
                .queue
                .playing()
                .cloned()
                .ok_or_else(|| AudioError::InvalidState("Nothing is playing".to_string()))?;
            let duration = playing.duration();
            if duration <= 0.0 {
                return Err(AudioError::InvalidState(format!(
                    "Duration of {} is not known yet",
                    playing.id()
                )));
            }
            if !(0.0..=duration).contains(&time) {
                return Err(AudioError::InvalidState(format!(
                    "Seek to {:.2}s outside 0..{:.2}s",
                    time, duration
                )));
            }

            log::info!("[player] seeking {} to {:.2}s", playing.id(), time);
            inner.generation += 1;
            for entry in inner.queue.requeue_read_ahead() {
                entry.reset_for_seek(0.0);
            }
            playing.reset_for_seek(time);
            inner.seek_request = Some(SeekRequest {
                entry: playing,
                time,
                generation: inner.generation,
            });
            if inner.state() != InternalState::Paused {
                inner.transition(InternalState::WaitingForDataAfterSeek)?;
            }
            Ok(())
        })
    }

    /// Pause output. Does nothing unless the player is running.
    pub fn pause(&self) -> Result<()> {
        self.command(|inner| {
            let state = inner.state();
            if state.is_running() && state != InternalState::Paused {
                inner.transition(InternalState::Paused)?;
            }
            Ok(())
        })
    }

    pub fn resume(&self) -> Result<()> {
        let pool = &self.shared.pool;
        self.command(|inner| {
            if inner.state() != InternalState::Paused {
                return Ok(());
            }
            let target = if inner.seek_request.is_some() {
                InternalState::WaitingForDataAfterSeek
            } else if pool.in_flight() > 0 {
                InternalState::Playing
            } else if inner
                .queue
                .playing()
                .map(|entry| entry.frames_queued() > 0)
                .unwrap_or(false)
            {
                InternalState::Rebuffering
            } else {
                InternalState::WaitingForData
            };
            inner.transition(target)
        })
    }

    /// End the current item and cancel everything queued. With `flush` the sink also
    /// discards audio it has buffered.
    pub fn stop(&self, flush: bool) -> Result<()> {
        self.command(|inner| {
            if !inner.state().is_running() && inner.queue.is_empty() {
                return Ok(());
            }
            let reason = if flush {
                StopReason::UserActionFlush
            } else {
                StopReason::UserAction
            };
            log::info!("[player] stopping ({:?})", reason);

            let pending = inner.queue.take_pending();
            if !pending.is_empty() {
                inner.cancel_entries(&pending);
            }
            if let Some(playing) = inner.queue.take_playing() {
                inner.item_finished(&playing, reason);
                playing.cancel();
            }
            inner.queue.clear();

            inner.machine.set_stop_reason(reason);
            inner.generation += 1;
            inner.seek_request = None;
            if inner.state().is_running() {
                inner.stop_request = Some(flush);
                inner.transition(InternalState::Stopping)?;
            }
            Ok(())
        })
    }

    /// Cancel every item that has not started playing. The current item keeps playing.
    pub fn clear_pending(&self) -> Result<()> {
        self.command(|inner| {
            let pending = inner.queue.take_pending();
            inner.cancel_entries(&pending);
            inner.cancel_epoch += 1;
            Ok(())
        })
    }

    /// Stop both worker threads, return every buffer to the pool and release all
    /// items. Returns once nothing is running. Later operations fail with
    /// [`AudioError::Disposed`].
    pub fn dispose(&self) {
        let first = self.shared.with_inner(|inner| {
            if inner.dispose_requested {
                return false;
            }
            inner.dispose_requested = true;
            for entry in inner.queue.all() {
                entry.cancel();
            }
            true
        });
        if !first {
            return;
        }
        log::info!("[player] disposing");
        self.shared.pool.close();
        self.shared.poke();

        let handles = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                // Called from a listener on this worker; it exits once the listener returns
                log::debug!("[player] not joining the calling thread");
                continue;
            }
            if handle.join().is_err() {
                log::warn!("[player] worker thread panicked");
            }
        }

        self.shared.with_inner(|inner| {
            for entry in inner.queue.all() {
                entry.close_source();
            }
            inner.queue.clear();
            inner.in_sink.clear();
            inner.seek_request = None;
            inner.stop_request = None;
            inner.dispose();
        });
        self.shared.pool.reset();
        self.shared.close_events();
        log::info!("[player] disposed");
    }

    pub fn current_item_id(&self) -> Option<QueueItemId> {
        let inner = self.shared.inner.lock();
        inner.queue.playing().map(|entry| entry.id().clone())
    }

    /// Items waiting to play, in play order
    pub fn pending_ids(&self) -> Vec<QueueItemId> {
        self.shared.inner.lock().queue.pending_ids()
    }

    /// Seconds played of the current item
    pub fn progress(&self) -> f64 {
        let inner = self.shared.inner.lock();
        inner.queue.playing().map(|entry| entry.progress()).unwrap_or(0.0)
    }

    /// Duration of the current item in seconds, 0 while unknown
    pub fn duration(&self) -> f64 {
        let inner = self.shared.inner.lock();
        inner.queue.playing().map(|entry| entry.duration()).unwrap_or(0.0)
    }

    /// Tags found so far in the current item's stream, keyed by frame index
    pub fn current_metadata(&self) -> Vec<(u64, Vec<(String, String)>)> {
        let inner = self.shared.inner.lock();
        inner.queue.playing().map(|entry| entry.metadata()).unwrap_or_default()
    }

    pub fn state(&self) -> PublicState {
        self.shared.inner.lock().machine.public()
    }

    pub fn internal_state(&self) -> InternalState {
        self.shared.inner.lock().state()
    }

    pub fn stop_reason(&self) -> StopReason {
        self.shared.inner.lock().machine.stop_reason()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.shared.inner.lock().machine.error_code()
    }

    /// Peak and average level of `channel` in the last played buffer. `None` while
    /// metering is off or for a channel the stream does not have.
    pub fn metering(&self, channel: usize) -> Option<MeterReading> {
        self.shared.meter.reading(channel)
    }

    pub fn set_metering_enabled(&self, enabled: bool) -> Result<()> {
        self.ensure_usable()?;
        self.shared.meter.set_enabled(enabled);
        Ok(())
    }

    pub fn is_metering_enabled(&self) -> bool {
        self.shared.meter.is_enabled()
    }

    /// Output gain in 0..=1
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            return Err(AudioError::InvalidState(format!("Invalid volume {}", volume)));
        }
        self.command(|inner| {
            inner.volume = volume.clamp(0.0, 1.0);
            inner.volume_dirty = true;
            Ok(())
        })
    }

    pub fn volume(&self) -> f32 {
        self.shared.inner.lock().volume
    }

    pub fn mute(&self) -> Result<()> {
        self.set_muted(true)
    }

    pub fn unmute(&self) -> Result<()> {
        self.set_muted(false)
    }

    fn set_muted(&self, muted: bool) -> Result<()> {
        self.command(|inner| {
            if inner.muted != muted {
                inner.muted = muted;
                inner.volume_dirty = true;
            }
            Ok(())
        })
    }

    pub fn is_muted(&self) -> bool {
        self.shared.inner.lock().muted
    }

    pub fn append_frame_filter(&self, name: &str, filter: FrameFilter) -> Result<()> {
        self.ensure_usable()?;
        self.shared.filters.write().append(name, filter)
    }

    /// Insert a filter directly after the one named `after`
    pub fn add_frame_filter_after(
        &self,
        name: &str,
        after: &str,
        filter: FrameFilter,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.shared.filters.write().add_after(name, after, filter)
    }

    /// Whether a filter named `name` was installed
    pub fn remove_frame_filter(&self, name: &str) -> Result<bool> {
        self.ensure_usable()?;
        Ok(self.shared.filters.write().remove(name))
    }

    /// Installed filters in the order they run. Readable after dispose, like the other
    /// queries.
    pub fn frame_filter_names(&self) -> Vec<String> {
        self.shared.filters.read().names()
    }

    fn ensure_usable(&self) -> Result<()> {
        let inner = self.shared.inner.lock();
        if inner.dispose_requested {
            return Err(AudioError::Disposed);
        }
        inner.machine.ensure_usable()
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Leave a stopped or fresh player for the starting state
fn start_running(inner: &mut Inner) -> Result<()> {
    if inner.state().is_running() {
        return Ok(());
    }
    inner.machine.set_stop_reason(StopReason::NoStop);
    inner.transition(InternalState::StartingThread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use streamplay_core::PlayerEvent;
    use streamplay_sink::ClockedSink;
    use streamplay_source::MemoryDataSource;

    fn wav(seconds: f64) -> Box<dyn DataSource> {
        let frames = (8_000.0 * seconds) as u32;
        let data_len = frames * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&8_000u32.to_le_bytes());
        bytes.extend_from_slice(&16_000u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.resize(44 + data_len as usize, 0);
        Box::new(MemoryDataSource::new(bytes).with_hint("wav"))
    }

    fn player(speed: f64) -> AudioPlayer {
        let options = PlayerOptions::default()
            .with_buffer_count(8)
            .with_buffer_size(2048)
            .with_wait_interval(Duration::from_millis(20));
        AudioPlayer::new(Box::new(ClockedSink::with_speed(speed).unwrap()), options).unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn dispose_returns_every_buffer_to_the_pool() {
        let player = player(1.0);
        // Longer than the pool holds, so ingest is blocked on a full pool
        player.enqueue(wav(3.0), "a").unwrap();
        assert!(wait_until(|| player.state() == PublicState::Playing));
        assert!(wait_until(|| player.shared.pool.free_count() == 0));

        player.dispose();
        assert!(player.shared.pool.all_free());
        assert!(player.shared.inner.lock().in_sink.is_empty());
        assert!(player.threads.lock().is_empty());
        assert_eq!(player.state(), PublicState::Disposed);
    }

    #[test]
    fn played_frames_never_exceed_queued_frames() {
        let player = player(0.0);
        player.enqueue(wav(0.5), "a").unwrap();
        player.enqueue(wav(0.5), "b").unwrap();

        let mut observed = 0;
        let drained = wait_until(|| {
            let inner = player.shared.inner.lock();
            for entry in inner.queue.all() {
                assert!(entry.frames_played() <= entry.frames_queued());
                observed += 1;
            }
            inner.queue.is_empty() && !inner.state().is_running()
        });
        assert!(drained);
        assert!(observed > 0);
    }

    struct DisposeOnStart {
        player: Mutex<Option<Arc<AudioPlayer>>>,
        events: Mutex<Vec<PlayerEvent>>,
    }

    impl PlayerListener for DisposeOnStart {
        fn on_event(&self, event: &PlayerEvent) {
            self.events.lock().push(event.clone());
            if let PlayerEvent::StateChanged {
                new: PublicState::Playing,
                ..
            } = event
            {
                let player = self.player.lock().take();
                if let Some(player) = player {
                    player.dispose();
                }
            }
        }
    }

    #[test]
    fn listener_may_dispose_the_player() {
        let player = Arc::new(player(1.0));
        let listener = Arc::new(DisposeOnStart {
            player: Mutex::new(Some(player.clone())),
            events: Mutex::new(Vec::new()),
        });
        let _sub = player.subscribe(listener.clone());

        player.enqueue(wav(1.0), "a").unwrap();
        assert!(wait_until(|| player.state() == PublicState::Disposed));
        assert_eq!(player.enqueue(wav(0.1), "b"), Err(AudioError::Disposed));
        assert!(listener
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, PlayerEvent::StateChanged { new: PublicState::Disposed, .. })));
    }
}
