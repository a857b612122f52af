// Consumer: moves filled buffers to the sink in order and keeps the sink in step with
// the player state

use crate::engine::{BufferMeta, InSink, Shared};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use streamplay_core::{AudioError, InternalState, Result, StreamFormat};
use streamplay_framepool::{FrameBuffer, Next};
use streamplay_sink_api::{PlaybackSink, SinkBuffer};

pub(crate) fn spawn(shared: Arc<Shared>, sink: Box<dyn PlaybackSink>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("streamplay-driver".to_string())
        .spawn(move || Driver::new(shared, sink).run())
        .map_err(|e| AudioError::ResourceError(format!("Failed to spawn driver thread: {}", e)))
}

/// Requests and state read at the top of each loop
struct Snapshot {
    exit: bool,
    state: InternalState,
    generation: u64,
    cancel_epoch: u64,
    stop: Option<bool>,
    volume: Option<f32>,
}

enum Pull {
    Buffer(FrameBuffer<BufferMeta>),
    Idle,
    Closed,
}

struct Driver {
    shared: Arc<Shared>,
    sink: Box<dyn PlaybackSink>,
    configured: Option<StreamFormat>,
    started: bool,
    volume: Option<f32>,
    /// Buffer waiting for the sink to drain before a format change
    held: Option<FrameBuffer<BufferMeta>>,
    generation: u64,
    cancel_epoch: u64,
}

impl Driver {
    fn new(shared: Arc<Shared>, sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            shared,
            sink,
            configured: None,
            started: false,
            volume: None,
            held: None,
            generation: 0,
            cancel_epoch: 0,
        }
    }

    fn run(mut self) {
        log::debug!("[driver] thread started");
        let weak = Arc::downgrade(&self.shared);
        self.sink.set_completion_handler(Box::new(move |buffer: SinkBuffer| {
            if let Some(shared) = weak.upgrade() {
                shared.on_buffer_played(buffer);
            }
        }));

        loop {
            let epoch = self.shared.pool.epoch();
            self.shared.flush_events();

            let snapshot = self.snapshot();
            if snapshot.exit {
                break;
            }
            if let Err(err) = self.sync(&snapshot) {
                self.escalate(err);
                continue;
            }

            match self.pull(epoch) {
                Pull::Buffer(buffer) => {
                    if let Err(err) = self.play(buffer) {
                        self.escalate(err);
                    }
                }
                Pull::Idle => {}
                Pull::Closed => break,
            }
        }

        self.shutdown();
        log::debug!("[driver] thread exiting");
    }

    fn snapshot(&self) -> Snapshot {
        self.shared.with_inner(|inner| {
            if inner.state() == InternalState::StartingThread {
                if let Err(err) = inner.transition(InternalState::WaitingForData) {
                    log::warn!("[driver] {}", err);
                }
            }
            let volume = if inner.volume_dirty {
                inner.volume_dirty = false;
                Some(inner.effective_volume())
            } else {
                None
            };
            Snapshot {
                exit: inner.dispose_requested || inner.state().is_terminal(),
                state: inner.state(),
                generation: inner.generation,
                cancel_epoch: inner.cancel_epoch,
                stop: inner.stop_request.take(),
                volume,
            }
        })
    }

    /// Bring the sink in line with the requests seen in `snapshot`
    fn sync(&mut self, snapshot: &Snapshot) -> Result<()> {
        if let Some(flush) = snapshot.stop {
            self.stop_sink(flush)?;
        }

        if snapshot.generation != self.generation || snapshot.cancel_epoch != self.cancel_epoch {
            self.generation = snapshot.generation;
            self.cancel_epoch = snapshot.cancel_epoch;
            self.resync()?;
        }

        if let Some(volume) = snapshot.volume {
            self.volume = Some(volume);
            self.sink.set_volume(volume)?;
        }

        let want_running = snapshot.state.is_running() && snapshot.state != InternalState::Paused;
        if want_running && !self.started && self.configured.is_some() {
            self.sink.start()?;
            self.started = true;
        } else if !want_running && self.started {
            self.sink.pause()?;
            self.started = false;
        }
        Ok(())
    }

    fn stop_sink(&mut self, flush: bool) -> Result<()> {
        let mut returned = Vec::new();
        if flush {
            returned.extend(self.sink.flush()?);
        }
        returned.extend(self.sink.stop()?);
        self.started = false;
        log::debug!("[driver] sink stopped, {} buffers discarded", returned.len());
        self.shared.reclaim(returned, false);
        self.drop_stale_held();

        self.shared.with_inner(|inner| {
            if inner.state() == InternalState::Stopping {
                if let Err(err) = inner.transition(InternalState::Stopped) {
                    log::warn!("[driver] {}", err);
                }
            }
        });
        Ok(())
    }

    /// Pull back what the sink still holds, dropping buffers that no longer count and
    /// re-enqueueing the rest in their original order
    fn resync(&mut self) -> Result<()> {
        let returned = self.sink.flush()?;
        let keep = self.shared.reclaim(returned, true);
        if !keep.is_empty() {
            log::debug!("[driver] re-enqueueing {} buffers", keep.len());
        }
        for buffer in keep {
            self.sink.enqueue(buffer)?;
        }
        self.drop_stale_held();
        Ok(())
    }

    fn drop_stale_held(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let current = {
            let inner = self.shared.inner.lock();
            held.meta().map(|m| inner.is_current(m)).unwrap_or(false)
        };
        if current {
            self.held = Some(held);
        } else {
            self.recycle(held);
        }
    }

    fn pull(&mut self, epoch: u64) -> Pull {
        if let Some(held) = self.held.take() {
            return Pull::Buffer(held);
        }
        match self
            .shared
            .pool
            .next_filled(epoch, self.shared.options.wait_interval)
        {
            Next::Buffer(buffer) => Pull::Buffer(buffer),
            Next::Interrupted | Next::TimedOut => Pull::Idle,
            Next::Closed => Pull::Closed,
        }
    }

    fn play(&mut self, mut buffer: FrameBuffer<BufferMeta>) -> Result<()> {
        let checked = {
            let inner = self.shared.inner.lock();
            buffer
                .meta()
                .filter(|meta| inner.is_current(meta))
                .map(|meta| (meta.format, inner.in_sink.is_empty()))
        };
        let Some((format, drained)) = checked else {
            self.recycle(buffer);
            return Ok(());
        };

        let compatible = self
            .configured
            .map(|configured| configured.is_definitely_compatible(&format))
            .unwrap_or(false);
        if !compatible {
            if !drained {
                // Let the sink play out the previous format first
                let mut inner = self.shared.inner.lock();
                if !inner.in_sink.is_empty() {
                    self.shared
                        .wake
                        .wait_for(&mut inner, self.shared.options.wait_interval);
                }
                drop(inner);
                self.held = Some(buffer);
                return Ok(());
            }
            self.reconfigure(&format)?;
        }

        if format.is_pcm() {
            let filters = self.shared.filters.read();
            if !filters.is_empty() {
                let frames = buffer.frames();
                filters.apply(format.channels, format.bytes_per_frame, frames, buffer.data_mut());
            }
        }

        let (id, data, packets, frames, meta) = buffer.into_parts();
        let Some(meta) = meta else {
            if let Err(err) = self.shared.pool.recycle_parts(id, data, packets) {
                log::debug!("[driver] {}", err);
            }
            return Ok(());
        };
        {
            let mut inner = self.shared.inner.lock();
            if !inner.is_current(&meta) {
                drop(inner);
                if let Err(err) = self.shared.pool.recycle_parts(id, data, packets) {
                    log::debug!("[driver] {}", err);
                }
                return Ok(());
            }
            inner.in_sink.push_back(InSink { id, meta });
        }

        // The sink may complete the buffer before `enqueue` returns
        let result = self.sink.enqueue(SinkBuffer {
            id,
            data,
            packets,
            frames,
        });
        if let Err(err) = result {
            self.shared.inner.lock().in_sink.retain(|record| record.id != id);
            return Err(err);
        }
        Ok(())
    }

    fn reconfigure(&mut self, format: &StreamFormat) -> Result<()> {
        if self.started {
            self.sink.pause()?;
            self.started = false;
        }
        self.sink.configure(format)?;
        if let Some(volume) = self.volume {
            self.sink.set_volume(volume)?;
        }
        log::info!(
            "[driver] sink configured for {} Hz, {} channels, {} bits",
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );
        self.configured = Some(*format);
        Ok(())
    }

    fn recycle(&self, buffer: FrameBuffer<BufferMeta>) {
        if let Err(err) = self.shared.pool.recycle(buffer) {
            log::debug!("[driver] {}", err);
        }
    }

    fn escalate(&self, err: AudioError) {
        self.shared.with_inner(|inner| inner.fail(&err));
        self.shared.poke();
    }

    /// Stop output and give every buffer back to the pool
    fn shutdown(&mut self) {
        match self.sink.stop() {
            Ok(returned) => {
                self.shared.reclaim(returned, false);
            }
            Err(err) => log::warn!("[driver] sink stop failed: {}", err),
        }
        self.started = false;
        if let Some(held) = self.held.take() {
            self.recycle(held);
        }
        for buffer in self.shared.pool.drain_queued() {
            self.recycle(buffer);
        }
        self.shared.flush_events();
    }
}
