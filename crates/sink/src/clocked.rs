// Device-less sink that "plays" buffers against the wall clock

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use streamplay_core::{AudioError, Result, StreamFormat};
use streamplay_sink_api::{CompletionHandler, PlaybackSink, SinkBuffer};

struct Playing {
    buffer: SinkBuffer,
    remaining: Duration,
    resumed_at: Option<Instant>,
}

struct ClockState {
    format: Option<StreamFormat>,
    queue: VecDeque<SinkBuffer>,
    current: Option<Playing>,
    running: bool,
    shutdown: bool,
    speed: f64,
    volume: f32,
    handler: Option<Arc<CompletionHandler>>,
}

impl ClockState {
    fn duration_of(&self, buffer: &SinkBuffer) -> Duration {
        let rate = self.format.map(|f| f.sample_rate).unwrap_or(0);
        if rate == 0 || self.speed <= 0.0 || !self.speed.is_finite() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(buffer.frames as f64 / rate as f64 / self.speed)
    }

    /// Pull back everything that has not completed
    fn take_unplayed(&mut self) -> Vec<SinkBuffer> {
        let mut unplayed = Vec::with_capacity(self.queue.len() + 1);
        if let Some(playing) = self.current.take() {
            unplayed.push(playing.buffer);
        }
        unplayed.extend(self.queue.drain(..));
        unplayed
    }
}

struct ClockShared {
    state: Mutex<ClockState>,
    cond: Condvar,
}

/// Sink that completes each buffer after its playing time has elapsed, scaled by a
/// speed factor. A speed of zero (or infinity) completes buffers as fast as possible.
pub struct ClockedSink {
    shared: Arc<ClockShared>,
    thread: Option<JoinHandle<()>>,
}

impl ClockedSink {
    /// Real-time clock
    pub fn new() -> Result<Self> {
        Self::with_speed(1.0)
    }

    pub fn with_speed(speed: f64) -> Result<Self> {
        let shared = Arc::new(ClockShared {
            state: Mutex::new(ClockState {
                format: None,
                queue: VecDeque::new(),
                current: None,
                running: false,
                shutdown: false,
                speed,
                volume: 1.0,
                handler: None,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("streamplay-clock".to_string())
            .spawn(move || clock_loop(thread_shared))
            .map_err(|e| AudioError::SinkError(format!("Failed to spawn clock thread: {}", e)))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn volume(&self) -> f32 {
        self.shared.state.lock().volume
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.state.lock().format
    }
}

fn clock_loop(shared: Arc<ClockShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        if !state.running {
            shared.cond.wait(&mut state);
            continue;
        }

        if state.current.is_none() {
            let Some(buffer) = state.queue.pop_front() else {
                shared.cond.wait(&mut state);
                continue;
            };
            let remaining = state.duration_of(&buffer);
            state.current = Some(Playing {
                buffer,
                remaining,
                resumed_at: None,
            });
        }

        let Some(playing) = state.current.as_mut() else {
            continue;
        };
        let resumed_at = *playing.resumed_at.get_or_insert_with(Instant::now);
        let elapsed = resumed_at.elapsed();

        if elapsed >= playing.remaining {
            let Some(done) = state.current.take() else {
                continue;
            };
            if let Some(handler) = state.handler.clone() {
                parking_lot::MutexGuard::unlocked(&mut state, || handler(done.buffer));
            }
            continue;
        }

        let wait = playing.remaining - elapsed;
        shared.cond.wait_for(&mut state, wait);
    }
}

impl PlaybackSink for ClockedSink {
    fn configure(&mut self, format: &StreamFormat) -> Result<()> {
        format.validate()?;
        let mut state = self.shared.state.lock();
        if state.current.is_some() || !state.queue.is_empty() {
            return Err(AudioError::SinkError(
                "Cannot reconfigure while buffers are queued".to_string(),
            ));
        }
        log::debug!(
            "[sink] configured for {} Hz, {} channels, {} bits",
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );
        state.format = Some(*format);
        Ok(())
    }

    fn enqueue(&mut self, buffer: SinkBuffer) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.format.is_none() {
            return Err(AudioError::SinkError("Sink is not configured".to_string()));
        }
        state.queue.push_back(buffer);
        drop(state);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.running = true;
        drop(state);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.running = false;
        if let Some(playing) = state.current.as_mut() {
            if let Some(resumed_at) = playing.resumed_at.take() {
                playing.remaining = playing.remaining.saturating_sub(resumed_at.elapsed());
            }
        }
        drop(state);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> Result<Vec<SinkBuffer>> {
        let unplayed = self.shared.state.lock().take_unplayed();
        self.shared.cond.notify_all();
        Ok(unplayed)
    }

    fn stop(&mut self) -> Result<Vec<SinkBuffer>> {
        let mut state = self.shared.state.lock();
        state.running = false;
        let unplayed = state.take_unplayed();
        drop(state);
        self.shared.cond.notify_all();
        Ok(unplayed)
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.shared.state.lock().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.shared.state.lock().handler = Some(Arc::new(handler));
    }

    fn queued(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + usize::from(state.current.is_some())
    }

    fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl Drop for ClockedSink {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.take() {
            // The clock thread may be the one dropping us from inside a completion
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamplay_core::{BufferId, SampleEncoding};

    fn buffer(slot: usize, frames: u64) -> SinkBuffer {
        SinkBuffer {
            id: BufferId { slot, lease: 1 },
            data: vec![0; frames as usize * 4],
            packets: Vec::new(),
            frames,
        }
    }

    fn recording_sink(speed: f64) -> (ClockedSink, Arc<Mutex<Vec<usize>>>) {
        let mut sink = ClockedSink::with_speed(speed).unwrap();
        sink.configure(&StreamFormat::pcm(1000, 2, 16, SampleEncoding::PcmSigned)).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let recorder = done.clone();
        sink.set_completion_handler(Box::new(move |b: SinkBuffer| recorder.lock().push(b.id.slot)));
        (sink, done)
    }

    fn wait_for(done: &Arc<Mutex<Vec<usize>>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn completes_buffers_in_order() {
        let (mut sink, done) = recording_sink(0.0);
        for slot in 0..4 {
            sink.enqueue(buffer(slot, 10)).unwrap();
        }
        sink.start().unwrap();
        wait_for(&done, 4);
        assert_eq!(*done.lock(), vec![0, 1, 2, 3]);
        assert_eq!(sink.queued(), 0);
    }

    #[test]
    fn nothing_completes_before_start() {
        let (mut sink, done) = recording_sink(0.0);
        sink.enqueue(buffer(0, 10)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(done.lock().is_empty());
        assert_eq!(sink.queued(), 1);
    }

    #[test]
    fn stop_returns_unplayed_buffers() {
        // 1000 frames at 1000 Hz is one second per buffer
        let (mut sink, done) = recording_sink(1.0);
        sink.enqueue(buffer(0, 1000)).unwrap();
        sink.enqueue(buffer(1, 1000)).unwrap();
        sink.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let unplayed = sink.stop().unwrap();
        let slots: Vec<usize> = unplayed.iter().map(|b| b.id.slot).collect();
        assert_eq!(slots, vec![0, 1]);
        assert!(done.lock().is_empty());
        assert!(!sink.is_running());
    }

    #[test]
    fn enqueue_requires_configuration() {
        let mut sink = ClockedSink::with_speed(0.0).unwrap();
        assert!(sink.enqueue(buffer(0, 1)).is_err());
    }

    #[test]
    fn reconfigure_while_busy_fails() {
        let (mut sink, _done) = recording_sink(1.0);
        sink.enqueue(buffer(0, 1000)).unwrap();
        let other = StreamFormat::pcm(48_000, 2, 16, SampleEncoding::PcmSigned);
        assert!(sink.configure(&other).is_err());
        sink.flush().unwrap();
        assert!(sink.configure(&other).is_ok());
    }
}
