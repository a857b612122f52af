// Shared fixtures for player scenario tests: WAV generation, scripted sources and an
// event recorder

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use streamplay_player::{
    AudioError, AudioPlayer, DataSource, PlayerEvent, PlayerListener, PlayerOptions, PublicState,
    Result,
};
use streamplay_sink::ClockedSink;
use streamplay_source::MemoryDataSource;

pub const RATE: u32 = 8_000;

/// Longest any scenario waits for an event
pub const DEADLINE: Duration = Duration::from_secs(10);

/// Mono 16-bit WAV at 8 kHz: a square wave of +/- `amplitude`
pub fn wav_bytes(seconds: f64, amplitude: i16) -> Vec<u8> {
    let frames = (RATE as f64 * seconds) as u32;
    let data_len = frames * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&RATE.to_le_bytes());
    out.extend_from_slice(&(RATE * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let sample = if (i / 20) % 2 == 0 { amplitude } else { -amplitude };
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

pub fn wav_source(seconds: f64) -> Box<dyn DataSource> {
    Box::new(MemoryDataSource::new(wav_bytes(seconds, 8_000)).with_hint("wav"))
}

/// WAV bytes that fail with a data source error once `fail_at` bytes have been read
pub struct FailingSource {
    data: Vec<u8>,
    position: usize,
    fail_at: usize,
}

impl FailingSource {
    pub fn boxed(seconds: f64, fail_at: usize) -> Box<dyn DataSource> {
        Box::new(Self {
            data: wav_bytes(seconds, 8_000),
            position: 0,
            fail_at,
        })
    }
}

impl DataSource for FailingSource {
    fn open(&mut self, offset: u64) -> Result<()> {
        self.position = offset as usize;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.fail_at {
            return Err(AudioError::DataSourceError("connection reset".to_string()));
        }
        let end = self.data.len().min(self.fail_at).min(self.position + buf.len());
        let count = end - self.position;
        buf[..count].copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(count)
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn format_hint(&self) -> Option<String> {
        Some("wav".to_string())
    }
}

/// Keeps every event in the order it was delivered
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<PlayerEvent>>,
}

impl PlayerListener for Recorder {
    fn on_event(&self, event: &PlayerEvent) {
        self.events.lock().push(event.clone());
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn position(&self, pred: impl Fn(&PlayerEvent) -> bool) -> Option<usize> {
        self.events.lock().iter().position(pred)
    }

    /// Wait until an event matching `pred` has been delivered and return its index
    pub fn wait_for(&self, pred: impl Fn(&PlayerEvent) -> bool) -> Option<usize> {
        let deadline = Instant::now() + DEADLINE;
        loop {
            if let Some(index) = self.position(&pred) {
                return Some(index);
            }
            if Instant::now() > deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Player on a clocked sink. Speed 0 plays instantly, 1 in real time.
pub fn player(speed: f64) -> AudioPlayer {
    let sink = ClockedSink::with_speed(speed).unwrap();
    let options = PlayerOptions::default()
        .with_buffer_count(16)
        .with_buffer_size(4096)
        .with_wait_interval(Duration::from_millis(20));
    AudioPlayer::new(Box::new(sink), options).unwrap()
}

pub fn recorded_player(
    speed: f64,
) -> (AudioPlayer, Arc<Recorder>, streamplay_player::Subscription) {
    let player = player(speed);
    let recorder = Arc::new(Recorder::default());
    let subscription = player.subscribe(recorder.clone());
    (player, recorder, subscription)
}

pub fn wait_for_state(player: &AudioPlayer, state: PublicState) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while player.state() != state {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

pub fn is_started(event: &PlayerEvent, wanted: &str) -> bool {
    matches!(event, PlayerEvent::ItemStarted { id } if id.as_str() == wanted)
}

pub fn is_finished(event: &PlayerEvent, wanted: &str) -> bool {
    matches!(event, PlayerEvent::ItemFinishedPlaying { id, .. } if id.as_str() == wanted)
}
