// Command line player: queues the given files or URLs and plays them in order

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use streamplay_player::{
    init_logging, AudioPlayer, ErrorCode, PlaybackSink, PlayerListener, PlayerOptions, PublicState,
    QueueItemId, StopReason,
};
use streamplay_sink::ClockedSink;
use streamplay_source::data_source_from_url;

/// Streaming audio player
#[derive(Parser, Debug)]
#[clap(name = "streamplay")]
#[clap(about = "Play WAV or raw PCM files and HTTP streams back to back")]
struct Args {
    /// Files, file:// URLs or http(s):// URLs, played in order
    #[clap(required = true, value_name = "URL")]
    urls: Vec<String>,

    /// Clock speed of the device-less sink (0 plays as fast as possible)
    #[clap(long, default_value = "1.0")]
    speed: f64,

    /// Print channel levels while playing
    #[clap(long)]
    metering: bool,

    /// Frame buffers in the pool
    #[clap(long, default_value = "64")]
    buffers: usize,

    /// Bytes per frame buffer
    #[clap(long, default_value = "8192")]
    buffer_size: usize,

    /// Play through the default output device
    #[cfg(feature = "cpal")]
    #[clap(long)]
    device: bool,
}

/// Logs every event the player raises
struct EventLogger;

impl PlayerListener for EventLogger {
    fn state_changed(&self, new: PublicState, old: PublicState) {
        log::info!("[cli] state {:?} -> {:?}", old, new);
    }

    fn error(&self, code: ErrorCode) {
        log::error!("[cli] playback failed: {:?}", code);
    }

    fn item_started(&self, id: &QueueItemId) {
        log::info!("[cli] started {}", id);
    }

    fn item_finished_buffering(&self, id: &QueueItemId) {
        log::debug!("[cli] buffered {}", id);
    }

    fn item_finished_playing(
        &self,
        id: &QueueItemId,
        reason: StopReason,
        progress: f64,
        duration: f64,
    ) {
        log::info!(
            "[cli] finished {} ({:?}) at {:.1}s of {:.1}s",
            id,
            reason,
            progress,
            duration
        );
    }

    fn items_cancelled(&self, ids: &[QueueItemId]) {
        if !ids.is_empty() {
            log::warn!("[cli] skipped {:?}", ids);
        }
    }

    fn metadata(&self, id: &QueueItemId, _frame: u64, tags: &[(String, String)]) {
        for (key, value) in tags {
            log::info!("[cli] {} {}: {}", id, key, value);
        }
    }
}

#[cfg(feature = "cpal")]
fn open_sink(args: &Args) -> streamplay_player::Result<Box<dyn PlaybackSink>> {
    if args.device {
        return Ok(Box::new(streamplay_sink::CpalSink::new()?));
    }
    Ok(Box::new(ClockedSink::with_speed(args.speed)?))
}

#[cfg(not(feature = "cpal"))]
fn open_sink(args: &Args) -> streamplay_player::Result<Box<dyn PlaybackSink>> {
    Ok(Box::new(ClockedSink::with_speed(args.speed)?))
}

fn run(args: Args) -> streamplay_player::Result<bool> {
    let options = PlayerOptions::default()
        .with_buffer_count(args.buffers)
        .with_buffer_size(args.buffer_size)
        .with_metering(args.metering);
    let player = AudioPlayer::new(open_sink(&args)?, options)?;
    let _subscription = player.subscribe(Arc::new(EventLogger));

    for url in &args.urls {
        let source = data_source_from_url(url)?;
        player.enqueue(source, url.as_str())?;
    }

    loop {
        thread::sleep(Duration::from_millis(500));
        match player.state() {
            PublicState::Stopped => break,
            PublicState::Error | PublicState::Disposed => {
                player.dispose();
                return Ok(false);
            }
            _ => {}
        }
        if args.metering {
            if let (Some(left), right) = (player.metering(0), player.metering(1)) {
                let right = right.unwrap_or(left);
                log::info!(
                    "[cli] {:.1}s  L {:6.1} dB  R {:6.1} dB",
                    player.progress(),
                    left.peak_db,
                    right.peak_db
                );
            }
        }
    }

    player.dispose();
    Ok(true)
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("[cli] {}", err);
            ExitCode::FAILURE
        }
    }
}
