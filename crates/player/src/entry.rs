// One playable item and its byte/frame accounting

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use streamplay_core::{AudioDataLayout, CancelFlag, DataSource, QueueItemId, StreamFormat};

/// Variable bitrate streams need this many packets before their bitrate estimate is trusted
const BIT_RATE_ESTIMATION_MIN_PACKETS: u64 = 50;

/// Stream layout learned from the parser's format event. Written once per entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct EntryLayout {
    pub layout: AudioDataLayout,
    pub packet_buffer_size: usize,
}

#[derive(Debug, Default)]
struct Accounting {
    processed_packets: u64,
    processed_bytes: u64,
    frames_queued: u64,
    frames_played: u64,
    last_frame_queued: Option<u64>,
    seek_time: f64,
    fully_read: bool,
    source_length: Option<u64>,
    metadata: BTreeMap<u64, Vec<(String, String)>>,
}

/// A queued item. Shared between the queue, the ingest and every buffer carrying its
/// frames; counters sit behind their own lock so producer and consumer do not contend
/// on the engine lock to update them.
pub(crate) struct QueueEntry {
    id: QueueItemId,
    serial: u64,
    source: Mutex<Option<Box<dyn DataSource>>>,
    cancel: CancelFlag,
    layout: OnceCell<EntryLayout>,
    accounting: Mutex<Accounting>,
}

impl QueueEntry {
    pub fn new(id: QueueItemId, serial: u64, mut source: Box<dyn DataSource>) -> Self {
        let cancel = CancelFlag::new();
        source.attach_cancel(cancel.clone());
        Self {
            id,
            serial,
            source: Mutex::new(Some(source)),
            cancel,
            layout: OnceCell::new(),
            accounting: Mutex::new(Accounting::default()),
        }
    }

    pub fn id(&self) -> &QueueItemId {
        &self.id
    }

    /// Enqueue order, unique per player. Ids given by callers need not be.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Borrow the data source for reading. `None` while another reader holds it.
    pub fn take_source(&self) -> Option<Box<dyn DataSource>> {
        self.source.lock().take()
    }

    /// Hand the data source back once reading stops, closing it
    pub fn return_source(&self, mut source: Box<dyn DataSource>) {
        source.close();
        *self.source.lock() = Some(source);
    }

    pub fn close_source(&self) {
        if let Some(source) = self.source.lock().as_mut() {
            source.close();
        }
    }

    pub fn layout(&self) -> Option<&EntryLayout> {
        self.layout.get()
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.layout.get().map(|l| l.layout.format)
    }

    /// Record the parsed layout. Later announcements are ignored; returns false for them.
    pub fn set_layout(&self, layout: AudioDataLayout, packet_buffer_size: usize) -> bool {
        self.layout
            .set(EntryLayout {
                layout,
                packet_buffer_size,
            })
            .is_ok()
    }

    pub fn set_source_length(&self, length: Option<u64>) {
        if length.is_some() {
            self.accounting.lock().source_length = length;
        }
    }

    /// Bytes of audio data, from the container or else from the source length
    pub fn audio_data_byte_count(&self) -> Option<u64> {
        let layout = self.layout.get()?.layout;
        layout.audio_data_byte_count.or_else(|| {
            self.accounting
                .lock()
                .source_length
                .map(|len| len.saturating_sub(layout.audio_data_offset))
        })
    }

    /// Bits per second. Exact for constant-size packets, estimated from the packets
    /// parsed so far otherwise.
    pub fn calculated_bit_rate(&self) -> f64 {
        let Some(format) = self.format() else {
            return 0.0;
        };
        if format.bytes_per_packet > 0 && format.frames_per_packet > 0 {
            return format.bytes_per_packet as f64 * 8.0 * format.sample_rate as f64
                / format.frames_per_packet as f64;
        }

        let acc = self.accounting.lock();
        let packet_duration = format.packet_duration();
        if acc.processed_packets < BIT_RATE_ESTIMATION_MIN_PACKETS || packet_duration <= 0.0 {
            return 0.0;
        }
        acc.processed_bytes as f64 * 8.0 / (acc.processed_packets as f64 * packet_duration)
    }

    /// Seconds. Zero until the format and the audio length are known.
    pub fn duration(&self) -> f64 {
        let Some(bytes) = self.audio_data_byte_count() else {
            return 0.0;
        };
        let bit_rate = self.calculated_bit_rate();
        if bit_rate <= 0.0 {
            return 0.0;
        }
        bytes as f64 * 8.0 / bit_rate
    }

    /// Seconds played, counted from the last seek
    pub fn progress(&self) -> f64 {
        let rate = self.format().map(|f| f.sample_rate).unwrap_or(0);
        let acc = self.accounting.lock();
        if rate == 0 {
            return acc.seek_time;
        }
        acc.seek_time + acc.frames_played as f64 / rate as f64
    }

    /// Offset into the audio data for `time`, aligned down to a whole packet.
    /// Proportional to the duration, so approximate for variable bitrate streams.
    pub fn byte_offset_for(&self, time: f64) -> Option<u64> {
        let format = self.format()?;
        let bytes = self.audio_data_byte_count()?;
        let duration = self.duration();
        if duration <= 0.0 {
            return None;
        }
        let raw = ((time / duration) * bytes as f64).floor().max(0.0) as u64;
        let alignment = format.byte_alignment();
        Some((raw / alignment * alignment).min(bytes))
    }

    pub fn record_parsed(&self, bytes: usize, packets: u64) {
        let mut acc = self.accounting.lock();
        acc.processed_bytes += bytes as u64;
        acc.processed_packets += packets;
    }

    pub fn add_frames_queued(&self, frames: u64) {
        self.accounting.lock().frames_queued += frames;
    }

    /// Never exceeds the frames queued
    pub fn add_frames_played(&self, frames: u64) {
        let mut acc = self.accounting.lock();
        let played = acc.frames_played + frames;
        if played > acc.frames_queued {
            log::warn!(
                "[entry] {} played {} frames but only {} were queued",
                self.id,
                played,
                acc.frames_queued
            );
        }
        acc.frames_played = played.min(acc.frames_queued);
    }

    pub fn frames_queued(&self) -> u64 {
        self.accounting.lock().frames_queued
    }

    #[cfg(test)]
    pub fn frames_played(&self) -> u64 {
        self.accounting.lock().frames_played
    }

    #[cfg(test)]
    pub fn last_frame_queued(&self) -> Option<u64> {
        self.accounting.lock().last_frame_queued
    }

    /// All data read; the frame count is final from here on
    pub fn mark_fully_read(&self) {
        let mut acc = self.accounting.lock();
        acc.fully_read = true;
        acc.last_frame_queued = Some(acc.frames_queued);
    }

    pub fn is_fully_read(&self) -> bool {
        self.accounting.lock().fully_read
    }

    /// Every frame of the item has been read and played
    pub fn is_finished_playing(&self) -> bool {
        let acc = self.accounting.lock();
        match acc.last_frame_queued {
            Some(last) => acc.fully_read && acc.frames_played >= last,
            None => false,
        }
    }

    /// Start over at `seek_time`: frame counters restart, parse statistics are kept
    pub fn reset_for_seek(&self, seek_time: f64) {
        let mut acc = self.accounting.lock();
        acc.frames_queued = 0;
        acc.frames_played = 0;
        acc.last_frame_queued = None;
        acc.fully_read = false;
        acc.seek_time = seek_time;
    }

    pub fn add_metadata(&self, frame: u64, tags: &[(String, String)]) {
        self.accounting
            .lock()
            .metadata
            .entry(frame)
            .or_default()
            .extend(tags.iter().cloned());
    }

    pub fn metadata(&self) -> Vec<(u64, Vec<(String, String)>)> {
        self.accounting
            .lock()
            .metadata
            .iter()
            .map(|(frame, tags)| (*frame, tags.clone()))
            .collect()
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let accounting = self.accounting.lock();
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("cancelled", &self.is_cancelled())
            .field("frames_queued", &accounting.frames_queued)
            .field("frames_played", &accounting.frames_played)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamplay_core::{Result, SampleEncoding};

    struct Bytes(u64);

    impl DataSource for Bytes {
        fn open(&mut self, _offset: u64) -> Result<()> {
            Ok(())
        }

        fn read_into(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn length(&self) -> Option<u64> {
            Some(self.0)
        }

        fn position(&self) -> u64 {
            0
        }
    }

    fn cd_layout(byte_count: Option<u64>) -> AudioDataLayout {
        AudioDataLayout {
            format: StreamFormat::pcm(44_100, 2, 16, SampleEncoding::PcmSigned),
            audio_data_offset: 44,
            audio_data_byte_count: byte_count,
        }
    }

    fn entry() -> QueueEntry {
        QueueEntry::new("a".into(), 1, Box::new(Bytes(44 + 176_400)))
    }

    #[test]
    fn pcm_duration_and_progress() {
        let entry = entry();
        assert_eq!(entry.duration(), 0.0);
        entry.set_layout(cd_layout(Some(1_764_000)), 4);
        assert!((entry.duration() - 10.0).abs() < 1e-9);

        entry.add_frames_queued(44_100);
        entry.add_frames_played(22_050);
        assert!((entry.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn layout_is_write_once() {
        let entry = entry();
        assert!(entry.set_layout(cd_layout(Some(400)), 4));
        assert!(!entry.set_layout(cd_layout(Some(800)), 4));
        assert_eq!(entry.audio_data_byte_count(), Some(400));
    }

    #[test]
    fn unknown_data_size_falls_back_to_source_length() {
        let entry = entry();
        entry.set_layout(cd_layout(None), 4);
        entry.set_source_length(Some(44 + 176_400));
        assert!((entry.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn seek_offset_is_proportional_and_frame_aligned() {
        let entry = entry();
        entry.set_layout(cd_layout(Some(1_764_000)), 4);
        assert_eq!(entry.byte_offset_for(5.0), Some(882_000));
        let offset = entry.byte_offset_for(1.0 / 3.0).unwrap();
        assert_eq!(offset % 4, 0);
        assert!((offset as f64 - 1_764_000.0 / 30.0).abs() <= 4.0);
        assert_eq!(entry.byte_offset_for(10.0), Some(1_764_000));
    }

    #[test]
    fn played_never_exceeds_queued() {
        let entry = entry();
        entry.add_frames_queued(10);
        entry.add_frames_played(25);
        assert_eq!(entry.frames_played(), 10);
    }

    #[test]
    fn finished_only_after_fully_read_and_drained() {
        let entry = entry();
        entry.add_frames_queued(100);
        entry.add_frames_played(100);
        assert!(!entry.is_finished_playing());
        entry.mark_fully_read();
        assert_eq!(entry.last_frame_queued(), Some(100));
        assert!(entry.is_finished_playing());

        entry.reset_for_seek(3.0);
        assert!(!entry.is_finished_playing());
        assert_eq!(entry.frames_queued(), 0);
        assert!((entry.progress() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn variable_bitrate_needs_enough_packets() {
        let entry = entry();
        let format = StreamFormat {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 0,
            bytes_per_frame: 0,
            frames_per_packet: 1152,
            bytes_per_packet: 0,
            encoding: SampleEncoding::Compressed(u32::from_be_bytes(*b".mp3")),
        };
        entry.set_layout(
            AudioDataLayout {
                format,
                audio_data_offset: 0,
                audio_data_byte_count: Some(1_000_000),
            },
            1441,
        );
        entry.record_parsed(4_000, 10);
        assert_eq!(entry.calculated_bit_rate(), 0.0);
        assert_eq!(entry.duration(), 0.0);

        entry.record_parsed(16_000 * 4 - 4_000, 40);
        let expected = 64_000.0 * 8.0 / (50.0 * 1152.0 / 44_100.0);
        assert!((entry.calculated_bit_rate() - expected).abs() < 1e-6);
        assert!(entry.duration() > 0.0);
    }

    #[test]
    fn metadata_is_keyed_by_frame() {
        let entry = entry();
        entry.add_metadata(0, &[("title".into(), "Song".into())]);
        entry.add_metadata(0, &[("artist".into(), "Band".into())]);
        let metadata = entry.metadata();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].1.len(), 2);
    }

    #[test]
    fn source_is_lent_and_returned() {
        let entry = entry();
        let source = entry.take_source().unwrap();
        assert!(entry.take_source().is_none());
        entry.return_source(source);
        assert!(entry.take_source().is_some());
    }
}
