// Producer: pulls bytes from the reading entry's source, parses them and fills frame
// buffers

use crate::engine::{BufferMeta, Inner, Shared};
use crate::entry::QueueEntry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use streamplay_core::{
    AudioDataLayout, AudioError, DataSource, InternalState, ParserEvent, PlayerEvent, Result,
    StreamFormat, StreamParser,
};
use streamplay_framepool::{Acquire, FrameBuffer};

pub(crate) fn spawn(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("streamplay-ingest".to_string())
        .spawn(move || Ingest::new(shared).run())
        .map_err(|e| AudioError::ResourceError(format!("Failed to spawn ingest thread: {}", e)))
}

/// What the loop does after looking at the shared state
enum Plan {
    Exit,
    Idle,
    Start {
        entry: Arc<QueueEntry>,
        generation: u64,
        seek: Option<f64>,
    },
    Seek {
        time: f64,
        generation: u64,
    },
    Work,
}

enum Fill {
    Done,
    /// No free buffer yet; keep the remaining events for later
    Blocked,
    Closed,
}

/// Reading state for the entry being read
struct ReadingContext {
    entry: Arc<QueueEntry>,
    source: Box<dyn DataSource>,
    parser: Box<dyn StreamParser>,
    generation: u64,
    slot: Option<FrameBuffer<BufferMeta>>,
    pending: VecDeque<ParserEvent>,
    /// Progress through the front audio event: bytes for constant-size frames, packet
    /// index for described packets
    cursor: usize,
    end_of_data: bool,
}

impl ReadingContext {
    fn format(&self) -> Result<StreamFormat> {
        self.entry
            .format()
            .ok_or_else(|| {
                AudioError::ParseError("Audio data before the stream format".to_string())
            })
    }

    fn ensure_slot(&mut self, shared: &Shared, epoch: u64) -> Fill {
        if self.slot.is_some() {
            return Fill::Done;
        }
        match shared.pool.acquire_free_slot(epoch, shared.options.wait_interval) {
            Acquire::Slot(buffer) => {
                self.slot = Some(buffer);
                Fill::Done
            }
            Acquire::Interrupted | Acquire::TimedOut => Fill::Blocked,
            Acquire::Closed => Fill::Closed,
        }
    }

    /// Hand the current buffer to the driver. Frames read under an older generation, or
    /// for an entry no longer being read, go straight back to the pool.
    fn submit(&mut self, shared: &Shared) -> Result<()> {
        let Some(mut buffer) = self.slot.take() else {
            return Ok(());
        };
        if buffer.is_empty() {
            return shared.pool.release(buffer);
        }
        let format = match self.format() {
            Ok(format) => format,
            Err(err) => {
                shared.pool.release(buffer)?;
                return Err(err);
            }
        };

        shared.with_inner(|inner| {
            let current = inner.generation == self.generation
                && inner.queue.is_reading(&self.entry)
                && !self.entry.is_cancelled();
            if !current {
                return shared.pool.release(buffer);
            }

            let frames = buffer.frames();
            buffer.set_meta(BufferMeta {
                entry: self.entry.clone(),
                generation: self.generation,
                format,
            });
            let first = shared.pool.submit_filled_slot(buffer)?;
            self.entry.add_frames_queued(frames);
            if first {
                log::debug!("[ingest] pool no longer empty");
            }
            if inner.state().is_waiting_for_data() {
                inner.transition(InternalState::Playing)?;
            }
            Ok(())
        })
    }

    /// Copy the front audio event into buffers, submitting each one as it fills
    fn fill_audio(&mut self, shared: &Shared, epoch: u64) -> Result<Fill> {
        let Some(ParserEvent::Audio { data, packets }) = self.pending.pop_front() else {
            return Ok(Fill::Done);
        };
        let format = self.format()?;

        if self.cursor == 0 {
            let packet_count = if !packets.is_empty() {
                packets.len() as u64
            } else if format.bytes_per_packet > 0 {
                (data.len() / format.bytes_per_packet as usize) as u64
            } else {
                0
            };
            self.entry.record_parsed(data.len(), packet_count);
        }

        let outcome = if !packets.is_empty() {
            self.fill_packets(shared, epoch, &format, &data, &packets)?
        } else if format.bytes_per_frame > 0 {
            self.fill_frames(shared, epoch, format.bytes_per_frame as usize, &data)?
        } else if format.bytes_per_packet > 0 {
            let constant = constant_packets(&format, data.len());
            self.fill_packets(shared, epoch, &format, &data, &constant)?
        } else {
            return Err(AudioError::ParseError(
                "Variable-size packets without descriptions".to_string(),
            ));
        };

        match outcome {
            Fill::Done => self.cursor = 0,
            _ => self.pending.push_front(ParserEvent::Audio { data, packets }),
        }
        Ok(outcome)
    }

    fn fill_frames(
        &mut self,
        shared: &Shared,
        epoch: u64,
        bytes_per_frame: usize,
        data: &[u8],
    ) -> Result<Fill> {
        while data.len() - self.cursor >= bytes_per_frame {
            match self.ensure_slot(shared, epoch) {
                Fill::Done => {}
                other => return Ok(other),
            }
            let Some(slot) = self.slot.as_mut() else {
                continue;
            };
            let taken = slot.append_frames(&data[self.cursor..], bytes_per_frame);
            if taken == 0 && slot.is_empty() {
                return Err(AudioError::ResourceError(format!(
                    "A {} byte frame does not fit a {} byte buffer",
                    bytes_per_frame,
                    slot.capacity()
                )));
            }
            self.cursor += taken;
            if taken == 0 || slot.is_full() {
                self.submit(shared)?;
            }
        }
        Ok(Fill::Done)
    }

    fn fill_packets(
        &mut self,
        shared: &Shared,
        epoch: u64,
        format: &StreamFormat,
        data: &[u8],
        packets: &[streamplay_core::PacketDescription],
    ) -> Result<Fill> {
        while let Some(packet) = packets.get(self.cursor) {
            match self.ensure_slot(shared, epoch) {
                Fill::Done => {}
                other => return Ok(other),
            }
            let bytes = data
                .get(packet.start_offset..packet.start_offset + packet.byte_size)
                .ok_or_else(|| {
                    AudioError::ParseError("Packet outside its audio data".to_string())
                })?;
            let frames = if packet.frames > 0 {
                packet.frames
            } else {
                format.frames_per_packet
            };
            let Some(slot) = self.slot.as_mut() else {
                continue;
            };
            if slot.push_packet(bytes, frames) {
                self.cursor += 1;
                if slot.is_full() {
                    self.submit(shared)?;
                }
            } else {
                self.submit(shared)?;
            }
        }
        Ok(Fill::Done)
    }

    /// Give the buffer and the data source back
    fn release(self, shared: &Shared) {
        if let Some(slot) = self.slot {
            if let Err(err) = shared.pool.release(slot) {
                log::debug!("[ingest] {}", err);
            }
        }
        self.entry.return_source(self.source);
    }
}

/// Packet descriptors for constant-size compressed packets
fn constant_packets(format: &StreamFormat, len: usize) -> Vec<streamplay_core::PacketDescription> {
    let size = format.bytes_per_packet as usize;
    (0..len / size)
        .map(|i| streamplay_core::PacketDescription {
            start_offset: i * size,
            byte_size: size,
            frames: format.frames_per_packet,
        })
        .collect()
}

struct Ingest {
    shared: Arc<Shared>,
    ctx: Option<ReadingContext>,
    read_buf: Vec<u8>,
    parsed: Vec<ParserEvent>,
}

impl Ingest {
    fn new(shared: Arc<Shared>) -> Self {
        let read_buf = vec![0u8; shared.options.read_buffer_size];
        Self {
            shared,
            ctx: None,
            read_buf,
            parsed: Vec::new(),
        }
    }

    fn run(mut self) {
        log::debug!("[ingest] thread started");
        loop {
            // Taken before looking at requests so that a request made after the check
            // still cuts the next wait short
            let epoch = self.shared.pool.epoch();
            match self.plan() {
                Plan::Exit => break,
                Plan::Idle => {}
                Plan::Start {
                    entry,
                    generation,
                    seek,
                } => self.start(entry, generation, seek),
                Plan::Seek { time, generation } => self.seek(time, generation),
                Plan::Work => {
                    if !self.step(epoch) {
                        break;
                    }
                }
            }
        }
        self.abandon();
        self.shared.flush_events();
        log::debug!("[ingest] thread exiting");
    }

    fn plan(&mut self) -> Plan {
        let shared = self.shared.clone();
        let mut inner = shared.inner.lock();
        if inner.dispose_requested || inner.state().is_terminal() {
            return Plan::Exit;
        }

        let generation = inner.generation;
        let seek = inner
            .seek_request
            .take()
            .filter(|request| request.generation == generation);
        let reading = inner.queue.reading().cloned();

        let stale = match &self.ctx {
            Some(ctx) => {
                let same_entry = reading
                    .as_ref()
                    .map(|r| Arc::ptr_eq(r, &ctx.entry))
                    .unwrap_or(false);
                let seek_here = seek
                    .as_ref()
                    .map(|s| Arc::ptr_eq(&s.entry, &ctx.entry))
                    .unwrap_or(false);
                let current = ctx.generation == generation || seek_here;
                !(same_entry && !ctx.entry.is_cancelled() && current)
            }
            None => false,
        };
        if stale {
            self.abandon();
        }

        let Some(entry) = reading else {
            shared.wake.wait_for(&mut inner, shared.options.wait_interval);
            return Plan::Idle;
        };

        let seek_time = seek
            .filter(|s| Arc::ptr_eq(&s.entry, &entry))
            .map(|s| s.time);
        match (&self.ctx, seek_time) {
            (None, seek) => Plan::Start {
                entry,
                generation,
                seek,
            },
            (Some(_), Some(time)) => Plan::Seek { time, generation },
            (Some(_), None) => Plan::Work,
        }
    }

    fn start(&mut self, entry: Arc<QueueEntry>, generation: u64, seek: Option<f64>) {
        let Some(mut source) = entry.take_source() else {
            self.item_failed(
                &entry,
                AudioError::ResourceError(format!(
                    "Data source of {} is already in use",
                    entry.id()
                )),
            );
            return;
        };

        match self.prepare(&entry, source.as_mut(), seek) {
            Ok(parser) => {
                log::info!("[ingest] reading {} from {}", entry.id(), source.describe());
                self.ctx = Some(ReadingContext {
                    entry,
                    source,
                    parser,
                    generation,
                    slot: None,
                    pending: VecDeque::new(),
                    cursor: 0,
                    end_of_data: false,
                });
            }
            Err(err) => {
                entry.return_source(source);
                self.item_failed(&entry, err);
            }
        }
    }

    fn prepare(
        &self,
        entry: &QueueEntry,
        source: &mut dyn DataSource,
        seek: Option<f64>,
    ) -> Result<Box<dyn StreamParser>> {
        let hint = source.format_hint();
        let mut parser = self.shared.factory.create(hint.as_deref())?;
        match seek {
            Some(time) => {
                let (layout, offset) = seek_target(entry, time)?;
                source.open(layout.audio_data_offset + offset)?;
                parser.seek(&layout, offset)?;
                log::debug!("[ingest] {} resumes at byte {} ({:.2}s)", entry.id(), offset, time);
            }
            None => source.open(0)?,
        }
        entry.set_source_length(source.length());
        Ok(parser)
    }

    fn seek(&mut self, time: f64, generation: u64) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        ctx.pending.clear();
        ctx.cursor = 0;
        ctx.end_of_data = false;
        ctx.generation = generation;
        if let Some(slot) = ctx.slot.take() {
            if let Err(err) = self.shared.pool.release(slot) {
                log::debug!("[ingest] {}", err);
            }
        }

        let result = seek_target(&ctx.entry, time).and_then(|(layout, offset)| {
            ctx.source.open(layout.audio_data_offset + offset)?;
            ctx.parser.seek(&layout, offset)?;
            log::debug!("[ingest] {} seeks to byte {} ({:.2}s)", ctx.entry.id(), offset, time);
            Ok(())
        });
        if let Err(err) = result {
            self.fail_reading(err);
        }
    }

    /// Advance the reading entry by one unit of work. Returns false when the pool closed.
    fn step(&mut self, epoch: u64) -> bool {
        let Some(ctx) = self.ctx.as_mut() else {
            return true;
        };

        if ctx.pending.is_empty() {
            if ctx.end_of_data {
                self.complete();
                return true;
            }
            let result = match ctx.source.read_into(&mut self.read_buf) {
                Ok(0) => {
                    ctx.end_of_data = true;
                    ctx.parser.finish(&mut self.parsed)
                }
                Ok(n) => ctx.parser.parse(&self.read_buf[..n], &mut self.parsed),
                Err(err) => Err(err),
            };
            ctx.pending.extend(self.parsed.drain(..));
            if let Err(err) = result {
                self.fail_reading(err);
            }
            return true;
        }

        match self.process(epoch) {
            Ok(Fill::Closed) => false,
            Ok(_) => true,
            Err(err) => {
                self.fail_reading(err);
                true
            }
        }
    }

    /// Work through parsed events until they run out or no buffer is free
    fn process(&mut self, epoch: u64) -> Result<Fill> {
        let shared = self.shared.clone();
        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(Fill::Done);
        };

        while let Some(event) = ctx.pending.front() {
            match event {
                ParserEvent::Format {
                    format,
                    audio_data_offset,
                    audio_data_byte_count,
                    packet_buffer_size_hint,
                } => {
                    format.validate()?;
                    let layout = AudioDataLayout {
                        format: *format,
                        audio_data_offset: *audio_data_offset,
                        audio_data_byte_count: *audio_data_byte_count,
                    };
                    if ctx.entry.set_layout(layout, *packet_buffer_size_hint) {
                        log::info!(
                            "[ingest] {}: {} Hz, {} channels, {} bits, {:.2}s",
                            ctx.entry.id(),
                            format.sample_rate,
                            format.channels,
                            format.bits_per_sample,
                            ctx.entry.duration()
                        );
                    }
                    ctx.pending.pop_front();
                }
                ParserEvent::Metadata { frame, tags } => {
                    ctx.entry.add_metadata(*frame, tags);
                    let event = PlayerEvent::Metadata {
                        id: ctx.entry.id().clone(),
                        frame: *frame,
                        tags: tags.clone(),
                    };
                    shared.with_inner(|inner| inner.push(event));
                    ctx.pending.pop_front();
                }
                ParserEvent::Audio { .. } => match ctx.fill_audio(&shared, epoch)? {
                    Fill::Done => {}
                    other => return Ok(other),
                },
            }
        }
        Ok(Fill::Done)
    }

    /// End of data: flush the last buffer and move on to the next entry
    fn complete(&mut self) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        if let Err(err) = ctx.submit(&self.shared) {
            let entry = ctx.entry.clone();
            ctx.release(&self.shared);
            self.item_failed(&entry, err);
            return;
        }

        let entry = ctx.entry.clone();
        let generation = ctx.generation;
        ctx.release(&self.shared);

        self.shared.with_inner(|inner| {
            if inner.generation != generation
                || !inner.queue.is_reading(&entry)
                || entry.is_cancelled()
            {
                return;
            }
            entry.mark_fully_read();
            log::info!(
                "[ingest] finished reading {} ({} frames)",
                entry.id(),
                entry.frames_queued()
            );
            inner.push(PlayerEvent::ItemFinishedBuffering {
                id: entry.id().clone(),
            });
            inner.queue.finish_reading();
            if let Some(started) = inner.queue.promote_reading() {
                inner.item_started(&started);
            }
            inner.check_finished();
        });
    }

    fn abandon(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            log::debug!("[ingest] no longer reading {}", ctx.entry.id());
            ctx.release(&self.shared);
        }
    }

    fn fail_reading(&mut self, err: AudioError) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        let entry = ctx.entry.clone();
        ctx.release(&self.shared);
        self.item_failed(&entry, err);
    }

    /// Read-ahead entries that fail are dropped; failures of the playing entry, and
    /// failures that are not about the entry's data, stop the player
    fn item_failed(&self, entry: &Arc<QueueEntry>, err: AudioError) {
        self.shared.with_inner(|inner| handle_item_failure(inner, entry, &err));
        self.shared.poke();
    }
}

fn handle_item_failure(inner: &mut Inner, entry: &Arc<QueueEntry>, err: &AudioError) {
    if entry.is_cancelled() || !inner.queue.is_reading(entry) {
        log::debug!("[ingest] {} failed after it was dropped: {}", entry.id(), err);
        return;
    }

    if err.is_item_error() && !inner.queue.is_playing(entry) {
        log::warn!("[ingest] dropping {}: {}", entry.id(), err);
        inner.queue.abandon_reading();
        inner.cancel_entries(std::slice::from_ref(entry));
        inner.cancel_epoch += 1;
        if let Some(started) = inner.queue.promote_reading() {
            inner.item_started(&started);
        }
        return;
    }

    log::error!("[ingest] {} failed: {}", entry.id(), err);
    inner.fail(err);
}

/// Layout and byte offset for a seek to `time`
fn seek_target(entry: &QueueEntry, time: f64) -> Result<(AudioDataLayout, u64)> {
    let layout = entry
        .layout()
        .map(|l| l.layout)
        .ok_or_else(|| {
            AudioError::InvalidState("Cannot seek before the format is known".to_string())
        })?;
    let offset = entry
        .byte_offset_for(time)
        .ok_or_else(|| {
            AudioError::InvalidState("Cannot seek without a known duration".to_string())
        })?;
    Ok((layout, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Shared;
    use crate::options::PlayerOptions;
    use streamplay_core::{SampleEncoding, StopReason};
    use streamplay_demux::DefaultParserFactory;
    use streamplay_framepool::Next;
    use std::time::Duration;

    struct Bytes {
        data: Vec<u8>,
        position: usize,
        fail_at: Option<usize>,
    }

    impl DataSource for Bytes {
        fn open(&mut self, offset: u64) -> Result<()> {
            self.position = offset as usize;
            Ok(())
        }

        fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
            if let Some(limit) = self.fail_at {
                if self.position >= limit {
                    return Err(AudioError::NetworkError("connection reset".into()));
                }
            }
            let end = self.data.len().min(self.position + buf.len());
            let end = self.fail_at.map(|f| end.min(f)).unwrap_or(end);
            let n = end - self.position;
            buf[..n].copy_from_slice(&self.data[self.position..end]);
            self.position = end;
            Ok(n)
        }

        fn length(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn position(&self) -> u64 {
            self.position as u64
        }

        fn format_hint(&self) -> Option<String> {
            Some("raw".to_string())
        }
    }

    fn shared() -> Arc<Shared> {
        let options = PlayerOptions::default()
            .with_buffer_count(4)
            .with_buffer_size(64)
            .with_read_buffer_size(100)
            .with_wait_interval(Duration::from_millis(10));
        let factory = DefaultParserFactory::new()
            .with_raw_format(StreamFormat::pcm(8_000, 1, 16, SampleEncoding::PcmSigned));
        Arc::new(Shared::new(options, Arc::new(factory)).unwrap())
    }

    fn enqueue(shared: &Shared, id: &str, source: Bytes) -> Arc<QueueEntry> {
        let entry = Arc::new(QueueEntry::new(id.into(), 0, Box::new(source)));
        shared.with_inner(|inner| {
            inner.queue.push(entry.clone());
            if let Some(started) = inner.queue.promote_reading() {
                inner.item_started(&started);
            }
            inner.transition(InternalState::StartingThread).unwrap();
        });
        entry
    }

    fn drain(shared: &Shared, wanted: usize) -> Vec<FrameBuffer<BufferMeta>> {
        let mut buffers = Vec::new();
        for _ in 0..200 {
            if buffers.len() == wanted {
                break;
            }
            let next = shared
                .pool
                .next_filled(shared.pool.epoch(), Duration::from_millis(10));
            if let Next::Buffer(buffer) = next {
                buffers.push(buffer);
            }
        }
        buffers
    }

    #[test]
    fn fills_buffers_in_order_and_marks_fully_read() {
        let shared = shared();
        let data: Vec<u8> = (0..160u32).map(|i| i as u8).collect();
        let entry = enqueue(&shared, "a", Bytes { data: data.clone(), position: 0, fail_at: None });
        let handle = spawn(shared.clone()).unwrap();

        let buffers = drain(&shared, 3);
        let bytes: Vec<u8> = buffers.iter().flat_map(|b| b.data().to_vec()).collect();
        assert_eq!(bytes, data);
        assert_eq!(buffers[0].len(), 64);
        assert_eq!(entry.frames_queued(), 80);
        assert_eq!(shared.inner.lock().state(), InternalState::Playing);

        for _ in 0..100 {
            if entry.is_fully_read() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(entry.is_fully_read());
        assert_eq!(entry.last_frame_queued(), Some(80));

        shared.inner.lock().dispose_requested = true;
        shared.pool.close();
        shared.poke();
        handle.join().unwrap();
    }

    #[test]
    fn failure_of_playing_entry_is_an_error() {
        let shared = shared();
        let data = vec![0u8; 400];
        enqueue(&shared, "a", Bytes { data, position: 0, fail_at: Some(100) });
        let handle = spawn(shared.clone()).unwrap();

        let _held = drain(&shared, 1);
        for _ in 0..200 {
            if shared.inner.lock().machine.is_error() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let inner = shared.inner.lock();
        assert!(inner.machine.is_error());
        assert_eq!(inner.machine.stop_reason(), StopReason::Error);
        drop(inner);
        handle.join().unwrap();
    }
}
