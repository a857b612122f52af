// cpal-based output sink for the platform's default device

use crate::pcm;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use streamplay_core::{AudioError, Result, StreamFormat};
use streamplay_sink_api::{CompletionHandler, PlaybackSink, SinkBuffer};

struct Queued {
    buffer: SinkBuffer,
    samples: Vec<f32>,
    position: usize,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<Queued>,
    done: VecDeque<SinkBuffer>,
    shutdown: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    done_ready: Condvar,
    playing: AtomicBool,
    volume_bits: AtomicU32,
}

enum Command {
    Configure(StreamConfig, mpsc::Sender<Result<()>>),
    Play(mpsc::Sender<Result<()>>),
    Pause(mpsc::Sender<Result<()>>),
    Shutdown,
}

/// Plays PCM buffers on the default output device.
///
/// The cpal stream lives on its own thread because streams cannot move between
/// threads on every platform; completions are reported from a notifier thread so the
/// audio callback never runs the completion handler.
pub struct CpalSink {
    shared: Arc<Shared>,
    format: Option<StreamFormat>,
    commands: mpsc::Sender<Command>,
    handler: Arc<Mutex<Option<CompletionHandler>>>,
    stream_thread: Option<JoinHandle<()>>,
    notifier_thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            done_ready: Condvar::new(),
            playing: AtomicBool::new(false),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
        });
        let handler: Arc<Mutex<Option<CompletionHandler>>> = Arc::new(Mutex::new(None));

        let (commands, receiver) = mpsc::channel();
        let stream_shared = shared.clone();
        let stream_thread = thread::Builder::new()
            .name("streamplay-cpal".to_string())
            .spawn(move || stream_loop(stream_shared, receiver))
            .map_err(|e| AudioError::SinkError(format!("Failed to spawn output thread: {}", e)))?;

        let notifier_shared = shared.clone();
        let notifier_handler = handler.clone();
        let notifier_thread = thread::Builder::new()
            .name("streamplay-cpal-notify".to_string())
            .spawn(move || notify_loop(notifier_shared, notifier_handler))
            .map_err(|e| AudioError::SinkError(format!("Failed to spawn notifier thread: {}", e)))?;

        Ok(Self {
            shared,
            format: None,
            commands,
            handler,
            stream_thread: Some(stream_thread),
            notifier_thread: Some(notifier_thread),
        })
    }

    fn request(&self, make: impl FnOnce(mpsc::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply, answer) = mpsc::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| AudioError::SinkError("Output thread is gone".to_string()))?;
        answer
            .recv()
            .map_err(|_| AudioError::SinkError("Output thread did not answer".to_string()))?
    }
}

fn stream_loop(shared: Arc<Shared>, commands: mpsc::Receiver<Command>) {
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Configure(config, reply) => {
                stream = None;
                let result = build_stream(&shared, &config).map(|s| {
                    stream = Some(s);
                });
                let _ = reply.send(result);
            }
            Command::Play(reply) => {
                let result = match &stream {
                    Some(s) => s.play().map_err(|e| {
                        AudioError::SinkError(format!("Failed to start stream: {}", e))
                    }),
                    None => Err(AudioError::SinkError("Sink is not configured".to_string())),
                };
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = match &stream {
                    Some(s) => s.pause().map_err(|e| {
                        AudioError::SinkError(format!("Failed to pause stream: {}", e))
                    }),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown => break,
        }
    }
}

fn build_stream(shared: &Arc<Shared>, config: &StreamConfig) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::SinkError("No output device available".to_string()))?;

    let callback_shared = shared.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill(&callback_shared, data),
            |err| {
                log::error!("[sink] audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::SinkError(format!("Failed to build output stream: {}", e)))
}

/// Audio callback: copy queued samples, moving finished buffers to the done list
fn fill(shared: &Shared, data: &mut [f32]) {
    if !shared.playing.load(Ordering::Relaxed) {
        data.fill(0.0);
        return;
    }
    let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));

    let mut written = 0;
    let mut completed = false;
    {
        let mut pending = shared.pending.lock();
        while written < data.len() {
            let Some(front) = pending.queue.front_mut() else {
                break;
            };
            let available = front.samples.len() - front.position;
            let count = available.min(data.len() - written);
            for (out, sample) in data[written..written + count]
                .iter_mut()
                .zip(&front.samples[front.position..front.position + count])
            {
                *out = sample * volume;
            }
            written += count;
            front.position += count;

            if front.position >= front.samples.len() {
                if let Some(finished) = pending.queue.pop_front() {
                    pending.done.push_back(finished.buffer);
                    completed = true;
                }
            }
        }
    }

    // Zero-fill any unwritten samples to prevent playing stale data
    if written < data.len() {
        data[written..].fill(0.0);
    }
    if completed {
        shared.done_ready.notify_one();
    }
}

fn notify_loop(shared: Arc<Shared>, handler: Arc<Mutex<Option<CompletionHandler>>>) {
    let mut pending = shared.pending.lock();
    loop {
        if pending.shutdown {
            return;
        }
        let Some(buffer) = pending.done.pop_front() else {
            shared.done_ready.wait(&mut pending);
            continue;
        };
        parking_lot::MutexGuard::unlocked(&mut pending, || {
            if let Some(handler) = handler.lock().as_ref() {
                handler(buffer);
            }
        });
    }
}

impl PlaybackSink for CpalSink {
    fn configure(&mut self, format: &StreamFormat) -> Result<()> {
        format.validate()?;
        if !format.is_pcm() {
            return Err(AudioError::UnsupportedFormat(
                "The cpal sink only plays PCM".to_string(),
            ));
        }
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        self.request(|reply| Command::Configure(config, reply))?;
        self.format = Some(*format);
        Ok(())
    }

    fn enqueue(&mut self, buffer: SinkBuffer) -> Result<()> {
        let format = self
            .format
            .ok_or_else(|| AudioError::SinkError("Sink is not configured".to_string()))?;
        let mut samples = Vec::new();
        pcm::to_f32_samples(&format, &buffer.data, &mut samples)?;
        self.shared.pending.lock().queue.push_back(Queued {
            buffer,
            samples,
            position: 0,
        });
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.request(Command::Play)?;
        self.shared.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.shared.playing.store(false, Ordering::Relaxed);
        self.request(Command::Pause)
    }

    fn flush(&mut self) -> Result<Vec<SinkBuffer>> {
        let mut pending = self.shared.pending.lock();
        Ok(pending.queue.drain(..).map(|q| q.buffer).collect())
    }

    fn stop(&mut self) -> Result<Vec<SinkBuffer>> {
        self.pause()?;
        self.flush()
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.shared
            .volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn queued(&self) -> usize {
        self.shared.pending.lock().queue.len()
    }

    fn is_running(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.playing.store(false, Ordering::Relaxed);
        let _ = self.commands.send(Command::Shutdown);
        self.shared.pending.lock().shutdown = true;
        self.shared.done_ready.notify_all();

        let current = thread::current().id();
        let handles = [self.stream_thread.take(), self.notifier_thread.take()];
        for handle in handles.into_iter().flatten() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
