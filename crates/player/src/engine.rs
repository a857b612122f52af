// Shared engine state: one lock over queue and state machine, the frame pool, and
// ordered event delivery

use crate::entry::QueueEntry;
use crate::filters::FrameFilterChain;
use crate::metering::Meter;
use crate::options::PlayerOptions;
use crate::queue::PlaybackQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use streamplay_core::{
    AudioError, BufferId, EventDispatcher, InternalState, ParserFactory, PlayerEvent,
    PlayerStateMachine, Result, StopReason, StreamFormat, Transition,
};
use streamplay_framepool::FrameBufferPool;
use streamplay_sink_api::SinkBuffer;

/// Carried by every filled buffer
#[derive(Debug)]
pub(crate) struct BufferMeta {
    pub entry: Arc<QueueEntry>,
    /// Engine generation the frames were read under
    pub generation: u64,
    pub format: StreamFormat,
}

/// A buffer lent to the sink
#[derive(Debug)]
pub(crate) struct InSink {
    pub id: BufferId,
    pub meta: BufferMeta,
}

pub(crate) struct SeekRequest {
    pub entry: Arc<QueueEntry>,
    pub time: f64,
    pub generation: u64,
}

/// Everything guarded by the engine lock
pub(crate) struct Inner {
    pub machine: PlayerStateMachine,
    pub queue: PlaybackQueue,
    /// Bumped whenever buffered frames become worthless (seek, play-now, stop).
    /// Buffers from older generations are recycled without being counted as played.
    pub generation: u64,
    /// Bumped when pending entries are cancelled while others keep playing
    pub cancel_epoch: u64,
    pub seek_request: Option<SeekRequest>,
    /// `Some(flush)` until the driver has stopped the sink
    pub stop_request: Option<bool>,
    pub dispose_requested: bool,
    pub in_sink: VecDeque<InSink>,
    pub volume: f32,
    pub muted: bool,
    pub volume_dirty: bool,
    pub next_serial: u64,
    events: Vec<PlayerEvent>,
}

impl Inner {
    fn new() -> Self {
        Self {
            machine: PlayerStateMachine::new(),
            queue: PlaybackQueue::new(),
            generation: 0,
            cancel_epoch: 0,
            seek_request: None,
            stop_request: None,
            dispose_requested: false,
            in_sink: VecDeque::new(),
            volume: 1.0,
            muted: false,
            volume_dirty: false,
            next_serial: 1,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: PlayerEvent) {
        self.events.push(event);
    }

    fn record(&mut self, transition: Transition) {
        if transition.internal_changed() {
            self.push(PlayerEvent::InternalStateChanged {
                old: transition.old_internal,
                new: transition.new_internal,
            });
        }
        if transition.public_changed() {
            self.push(PlayerEvent::StateChanged {
                old: transition.old_public,
                new: transition.new_public,
            });
        }
        if let Some(active) = transition.activity_changed() {
            self.push(PlayerEvent::PlaybackActivityChanged { active });
        }
    }

    pub fn state(&self) -> InternalState {
        self.machine.internal()
    }

    pub fn transition(&mut self, to: InternalState) -> Result<()> {
        let transition = self.machine.transition(to)?;
        self.record(transition);
        Ok(())
    }

    /// Enter the error state. The error event precedes the state change events; an
    /// engine already failed or disposed is left alone.
    pub fn fail(&mut self, err: &AudioError) {
        if self.machine.is_error() || self.machine.is_disposed() {
            log::debug!("[engine] ignoring error after shutdown: {}", err);
            return;
        }
        log::error!("[engine] entering error state: {}", err);
        let code = err.code();
        self.push(PlayerEvent::Error { code });
        if let Ok(transition) = self.machine.fail(code) {
            self.record(transition);
        }
    }

    pub fn dispose(&mut self) {
        if let Some(transition) = self.machine.dispose() {
            self.record(transition);
        }
    }

    pub fn effective_volume(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    /// Frames in this buffer still count towards playback
    pub fn is_current(&self, meta: &BufferMeta) -> bool {
        meta.generation == self.generation && !meta.entry.is_cancelled()
    }

    pub fn item_started(&mut self, entry: &Arc<QueueEntry>) {
        log::info!("[engine] item started: {}", entry.id());
        self.push(PlayerEvent::ItemStarted {
            id: entry.id().clone(),
        });
    }

    pub fn item_finished(&mut self, entry: &Arc<QueueEntry>, reason: StopReason) {
        let progress = entry.progress();
        let duration = entry.duration();
        log::info!(
            "[engine] item finished: {} ({:?}, {:.2}s of {:.2}s)",
            entry.id(),
            reason,
            progress,
            duration
        );
        self.push(PlayerEvent::ItemFinishedPlaying {
            id: entry.id().clone(),
            reason,
            progress,
            duration,
        });
    }

    /// Cancel `entries` and report them, in order, as one notification
    pub fn cancel_entries(&mut self, entries: &[Arc<QueueEntry>]) {
        for entry in entries {
            entry.cancel();
        }
        if !entries.is_empty() {
            log::info!("[engine] cancelled {} pending item(s)", entries.len());
        }
        self.push(PlayerEvent::ItemsCancelled {
            ids: entries.iter().map(|e| e.id().clone()).collect(),
        });
    }

    /// Move past every playing entry that has played out. Stops once nothing is left.
    pub fn check_finished(&mut self) {
        if !self.state().is_running() {
            return;
        }
        loop {
            let Some(playing) = self.queue.playing().cloned() else {
                if let Some(next) = self.queue.promote_reading() {
                    self.item_started(&next);
                    return;
                }
                break;
            };
            if !playing.is_finished_playing() {
                return;
            }
            self.item_finished(&playing, StopReason::Eof);
            match self.queue.advance_playing() {
                Some(next) => self.item_started(&next),
                None => break,
            }
        }

        log::info!("[engine] queue played out");
        self.machine.set_stop_reason(StopReason::Eof);
        if let Err(err) = self.transition(InternalState::Stopped) {
            log::warn!("[engine] cannot stop after the last item: {}", err);
        }
    }

    /// Raise rebuffering when playback ran dry before the playing entry was fully read
    pub fn check_starved(&mut self, in_flight: usize) {
        if in_flight > 0 || self.state() != InternalState::Playing {
            return;
        }
        let starving = self
            .queue
            .playing()
            .map(|entry| !entry.is_fully_read())
            .unwrap_or(false);
        if starving {
            log::debug!("[engine] out of buffered audio, rebuffering");
            if let Err(err) = self.transition(InternalState::Rebuffering) {
                log::warn!("[engine] {}", err);
            }
        }
    }

    fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn take_events(&mut self) -> Vec<PlayerEvent> {
        std::mem::take(&mut self.events)
    }
}

/// State shared by the public handle, the ingest thread, the driver thread and the
/// sink's completion handler.
///
/// Lock order: `inner` before the pool's internal lock. Blocking pool waits happen with
/// `inner` released.
pub(crate) struct Shared {
    pub inner: Mutex<Inner>,
    /// Wakes the ingest when it has nothing to read, and the driver when the sink drains
    pub wake: Condvar,
    pub pool: FrameBufferPool<BufferMeta>,
    pub dispatcher: EventDispatcher,
    pub meter: Meter,
    pub filters: RwLock<FrameFilterChain>,
    pub options: PlayerOptions,
    pub factory: Arc<dyn ParserFactory>,
    /// Held while delivering events so listeners see them in the order they were raised
    dispatch_order: Mutex<()>,
    /// Thread currently delivering, so a listener calling back in is recognised
    dispatching: Mutex<Option<ThreadId>>,
    /// Close the dispatcher once the delivering thread runs out of events
    close_pending: AtomicBool,
}

impl Shared {
    pub fn new(options: PlayerOptions, factory: Arc<dyn ParserFactory>) -> Result<Self> {
        options.validate()?;
        let pool = FrameBufferPool::new(
            options.buffer_count,
            options.buffer_size,
            options.max_packets_per_buffer,
        )?;
        Ok(Self {
            inner: Mutex::new(Inner::new()),
            wake: Condvar::new(),
            pool,
            dispatcher: EventDispatcher::new(),
            meter: Meter::new(options.metering_enabled),
            filters: RwLock::new(FrameFilterChain::new()),
            options,
            factory,
            dispatch_order: Mutex::new(()),
            dispatching: Mutex::new(None),
            close_pending: AtomicBool::new(false),
        })
    }

    /// Run `f` under the engine lock, then deliver whatever events it raised
    pub fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let result = {
            let mut inner = self.inner.lock();
            f(&mut inner)
        };
        self.flush_events();
        result
    }

    /// Deliver queued events with no engine lock held. A thread that finds another
    /// thread delivering leaves its events to that thread, which re-checks after
    /// finishing, so nothing is stranded and nobody blocks on a slow listener. This
    /// includes a listener calling back into the player: its events wait until the
    /// current batch has reached every listener.
    pub fn flush_events(&self) {
        loop {
            {
                let Some(_order) = self.dispatch_order.try_lock() else {
                    return;
                };
                self.deliver();
            }
            if !self.inner.lock().has_events() {
                return;
            }
        }
    }

    /// Deliver what is left, then stop delivering for good. From inside a listener
    /// the close is left to the delivering loop so the final events still arrive.
    pub fn close_events(&self) {
        self.close_pending.store(true, Ordering::Release);
        if *self.dispatching.lock() == Some(thread::current().id()) {
            return;
        }
        let _order = self.dispatch_order.lock();
        self.deliver();
    }

    /// Caller holds `dispatch_order`
    fn deliver(&self) {
        *self.dispatching.lock() = Some(thread::current().id());
        loop {
            let events = self.inner.lock().take_events();
            if events.is_empty() {
                break;
            }
            self.dispatcher.dispatch(events);
        }
        *self.dispatching.lock() = None;
        if self.close_pending.load(Ordering::Acquire) {
            self.dispatcher.close();
        }
    }

    /// Make both loops re-check their requests now
    pub fn poke(&self) {
        self.pool.interrupt();
        self.wake.notify_all();
    }

    /// Completion handler body. Runs on the sink's thread, so it only queues events
    /// and leaves delivery to the driver.
    pub fn on_buffer_played(&self, buffer: SinkBuffer) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.in_sink.iter().position(|r| r.id == buffer.id) else {
            log::warn!(
                "[engine] sink completed unknown buffer (slot {}, lease {})",
                buffer.id.slot,
                buffer.id.lease
            );
            return;
        };
        let Some(record) = inner.in_sink.remove(index) else {
            return;
        };

        let current = inner.is_current(&record.meta);
        if current {
            record.meta.entry.add_frames_played(buffer.frames);
            self.meter.capture(&record.meta.format, &buffer.data);
        }

        let in_flight = match self.pool.recycle_parts(buffer.id, buffer.data, buffer.packets) {
            Ok(in_flight) => in_flight,
            Err(err) => {
                log::warn!("[engine] {}", err);
                self.pool.in_flight()
            }
        };

        if current {
            inner.check_finished();
        }
        inner.check_starved(in_flight);
        let raised = inner.has_events();
        let drained = inner.in_sink.is_empty();
        drop(inner);

        if drained {
            self.wake.notify_all();
        }
        if raised {
            // Wake the driver to deliver
            self.pool.interrupt();
        }
    }

    /// Take back buffers the sink returned unplayed. Those still current are returned
    /// for re-enqueueing in their original order; the rest are recycled.
    pub fn reclaim(&self, returned: Vec<SinkBuffer>, keep_current: bool) -> Vec<SinkBuffer> {
        let mut inner = self.inner.lock();
        let mut keep = Vec::new();
        for buffer in returned {
            let index = inner.in_sink.iter().position(|r| r.id == buffer.id);
            let current = index
                .and_then(|i| inner.in_sink.get(i))
                .map(|r| inner.is_current(&r.meta))
                .unwrap_or(false);
            if keep_current && current {
                keep.push(buffer);
                continue;
            }
            if let Some(i) = index {
                inner.in_sink.remove(i);
            }
            if let Err(err) = self.pool.recycle_parts(buffer.id, buffer.data, buffer.packets) {
                log::debug!("[engine] {}", err);
            }
        }
        let drained = inner.in_sink.is_empty();
        drop(inner);
        if drained {
            self.wake.notify_all();
        }
        keep
    }
}
