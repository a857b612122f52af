// Bounded pool of fixed-size frame buffers shared by the ingest and playback threads

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use streamplay_core::{AudioError, BufferId, PacketDescription, Result};

/// Occupancy of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Filling,
    Queued,
    Draining,
}

/// A slot's storage while it is checked out of the pool
#[derive(Debug)]
pub struct FrameBuffer<M> {
    id: BufferId,
    capacity: usize,
    max_packets: usize,
    data: Vec<u8>,
    packets: Vec<PacketDescription>,
    frames: u64,
    meta: Option<M>,
}

impl<M> FrameBuffer<M> {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// No more bytes or packet descriptors fit
    pub fn is_full(&self) -> bool {
        self.remaining() == 0 || (self.max_packets > 0 && self.packets.len() >= self.max_packets)
    }

    /// Copy as many whole frames from `bytes` as fit. Returns the number of bytes consumed.
    pub fn append_frames(&mut self, bytes: &[u8], bytes_per_frame: usize) -> usize {
        if bytes_per_frame == 0 {
            return 0;
        }
        let room = self.remaining() / bytes_per_frame * bytes_per_frame;
        let take = room.min(bytes.len() / bytes_per_frame * bytes_per_frame);
        self.data.extend_from_slice(&bytes[..take]);
        self.frames += (take / bytes_per_frame) as u64;
        take
    }

    /// Store one variable-size packet. Returns false if it does not fit; an empty
    /// buffer always accepts a packet, growing past its nominal capacity if needed.
    pub fn push_packet(&mut self, bytes: &[u8], frames: u32) -> bool {
        if !self.data.is_empty() && (bytes.len() > self.remaining() || self.is_full()) {
            return false;
        }
        self.packets.push(PacketDescription {
            start_offset: self.data.len(),
            byte_size: bytes.len(),
            frames,
        });
        self.data.extend_from_slice(bytes);
        self.frames += frames as u64;
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn packets(&self) -> &[PacketDescription] {
        &self.packets
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn meta(&self) -> Option<&M> {
        self.meta.as_ref()
    }

    pub fn set_meta(&mut self, meta: M) {
        self.meta = Some(meta);
    }

    pub fn take_meta(&mut self) -> Option<M> {
        self.meta.take()
    }

    /// Split into id, bytes, packet descriptors, frame count and metadata
    pub fn into_parts(self) -> (BufferId, Vec<u8>, Vec<PacketDescription>, u64, Option<M>) {
        (self.id, self.data, self.packets, self.frames, self.meta)
    }
}

/// Result of waiting for a free slot
#[derive(Debug)]
pub enum Acquire<M> {
    Slot(FrameBuffer<M>),
    /// The pool was interrupted (stop, seek, dispose); re-check request flags
    Interrupted,
    /// Nothing became free within the wait interval
    TimedOut,
    Closed,
}

/// Result of waiting for a filled slot
#[derive(Debug)]
pub enum Next<M> {
    Buffer(FrameBuffer<M>),
    Interrupted,
    TimedOut,
    Closed,
}

struct Slot {
    status: SlotStatus,
    lease: u64,
    storage: Option<(Vec<u8>, Vec<PacketDescription>)>,
}

struct PoolState<M> {
    slots: Vec<Slot>,
    ready: VecDeque<FrameBuffer<M>>,
    cursor: usize,
    next_lease: u64,
    free: usize,
    epoch: u64,
    closed: bool,
}

impl<M> PoolState<M> {
    fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.status, SlotStatus::Queued | SlotStatus::Draining))
            .count()
    }

    fn slot_for(&mut self, id: BufferId) -> Result<&mut Slot> {
        match self.slots.get_mut(id.slot) {
            Some(slot) if slot.lease == id.lease => Ok(slot),
            _ => Err(AudioError::ResourceError(format!(
                "Unknown buffer returned to pool: slot {} lease {}",
                id.slot, id.lease
            ))),
        }
    }

    fn mark_free(&mut self, index: usize, data: Vec<u8>, packets: Vec<PacketDescription>) {
        let slot = &mut self.slots[index];
        let mut data = data;
        let mut packets = packets;
        data.clear();
        packets.clear();
        slot.storage = Some((data, packets));
        slot.status = SlotStatus::Free;
        self.free += 1;
    }
}

/// Fixed number of fixed-size buffers handed out round-robin.
///
/// Every slot is in exactly one of free, filling (held by the producer), queued
/// (waiting for the consumer) or draining (held by the sink). The pool is the only
/// flow control between producer and consumer: `acquire_free_slot` blocks while every
/// slot is busy.
pub struct FrameBufferPool<M> {
    state: Mutex<PoolState<M>>,
    slot_free: Condvar,
    slot_ready: Condvar,
    buffer_size: usize,
    max_packets: usize,
}

impl<M> FrameBufferPool<M> {
    pub fn new(buffer_count: usize, buffer_size: usize, max_packets: usize) -> Result<Self> {
        if buffer_count == 0 || buffer_size == 0 {
            return Err(AudioError::InvalidState(
                "Frame buffer pool needs at least one non-empty buffer".to_string(),
            ));
        }

        let slots = (0..buffer_count)
            .map(|_| Slot {
                status: SlotStatus::Free,
                lease: 0,
                storage: Some((Vec::with_capacity(buffer_size), Vec::with_capacity(max_packets))),
            })
            .collect();

        log::debug!("[pool] allocated {} buffers of {} bytes", buffer_count, buffer_size);

        Ok(Self {
            state: Mutex::new(PoolState {
                slots,
                ready: VecDeque::with_capacity(buffer_count),
                cursor: 0,
                next_lease: 1,
                free: buffer_count,
                epoch: 0,
                closed: false,
            }),
            slot_free: Condvar::new(),
            slot_ready: Condvar::new(),
            buffer_size,
            max_packets,
        })
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Current interruption epoch. Capture it before checking request flags and pass
    /// it to the blocking calls so that a request made in between is not missed.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Wake every blocked producer and consumer
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        drop(state);
        self.slot_free.notify_all();
        self.slot_ready.notify_all();
    }

    /// Next free slot in round-robin order, waiting up to `timeout` for one
    pub fn acquire_free_slot(&self, epoch: u64, timeout: Duration) -> Acquire<M> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Acquire::Closed;
            }
            if state.epoch != epoch {
                return Acquire::Interrupted;
            }
            if state.free > 0 {
                break;
            }
            if self.slot_free.wait_for(&mut state, timeout).timed_out() && state.free == 0 {
                return if state.closed {
                    Acquire::Closed
                } else if state.epoch != epoch {
                    Acquire::Interrupted
                } else {
                    Acquire::TimedOut
                };
            }
        }

        let count = state.slots.len();
        let start = state.cursor;
        let Some(index) = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| state.slots[i].status == SlotStatus::Free)
        else {
            return Acquire::TimedOut;
        };

        let lease = state.next_lease;
        state.next_lease += 1;
        state.cursor = (index + 1) % count;
        state.free -= 1;

        let buffer_size = self.buffer_size;
        let max_packets = self.max_packets;
        let slot = &mut state.slots[index];
        slot.status = SlotStatus::Filling;
        slot.lease = lease;
        let (data, packets) = slot
            .storage
            .take()
            .unwrap_or_else(|| (Vec::with_capacity(buffer_size), Vec::with_capacity(max_packets)));

        Acquire::Slot(FrameBuffer {
            id: BufferId { slot: index, lease },
            capacity: buffer_size,
            max_packets,
            data,
            packets,
            frames: 0,
            meta: None,
        })
    }

    /// Queue a filled slot for playback. Returns true when this submission took the
    /// pool from nothing in flight to something in flight.
    pub fn submit_filled_slot(&self, buffer: FrameBuffer<M>) -> Result<bool> {
        let mut state = self.state.lock();
        let id = buffer.id;
        let closed = state.closed;
        let slot = state.slot_for(id)?;
        if slot.status != SlotStatus::Filling {
            return Err(AudioError::ResourceError(format!(
                "Buffer {} submitted while {:?}",
                id.slot, slot.status
            )));
        }

        if closed {
            let (_, data, packets, _, _) = buffer.into_parts();
            state.mark_free(id.slot, data, packets);
            drop(state);
            self.slot_free.notify_one();
            return Ok(false);
        }

        let was_empty = state.in_flight() == 0;
        slot_status(&mut state, id.slot, SlotStatus::Queued);
        state.ready.push_back(buffer);
        drop(state);
        self.slot_ready.notify_one();
        Ok(was_empty)
    }

    /// Give back a slot the producer acquired but will not submit
    pub fn release(&self, buffer: FrameBuffer<M>) -> Result<()> {
        let mut state = self.state.lock();
        let id = buffer.id;
        let slot = state.slot_for(id)?;
        if slot.status != SlotStatus::Filling {
            return Err(AudioError::ResourceError(format!(
                "Buffer {} released while {:?}",
                id.slot, slot.status
            )));
        }
        let (_, data, packets, _, _) = buffer.into_parts();
        state.mark_free(id.slot, data, packets);
        drop(state);
        self.slot_free.notify_one();
        Ok(())
    }

    /// Oldest queued buffer, waiting up to `timeout` for one. The slot moves to draining.
    pub fn next_filled(&self, epoch: u64, timeout: Duration) -> Next<M> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Next::Closed;
            }
            if state.epoch != epoch {
                return Next::Interrupted;
            }
            if let Some(buffer) = state.ready.pop_front() {
                slot_status(&mut state, buffer.id.slot, SlotStatus::Draining);
                return Next::Buffer(buffer);
            }
            if self.slot_ready.wait_for(&mut state, timeout).timed_out() && state.ready.is_empty() {
                return if state.closed {
                    Next::Closed
                } else if state.epoch != epoch {
                    Next::Interrupted
                } else {
                    Next::TimedOut
                };
            }
        }
    }

    /// Oldest queued buffer without waiting
    pub fn try_next_filled(&self) -> Option<FrameBuffer<M>> {
        let mut state = self.state.lock();
        let buffer = state.ready.pop_front()?;
        slot_status(&mut state, buffer.id.slot, SlotStatus::Draining);
        Some(buffer)
    }

    /// Return a drained buffer, waking one waiting producer. Returns the number of
    /// slots still in flight.
    pub fn recycle(&self, buffer: FrameBuffer<M>) -> Result<usize> {
        let (id, data, packets, _, _) = buffer.into_parts();
        self.recycle_parts(id, data, packets)
    }

    /// Return a drained buffer given back by the sink as its raw parts
    pub fn recycle_parts(
        &self,
        id: BufferId,
        data: Vec<u8>,
        packets: Vec<PacketDescription>,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let slot = state.slot_for(id)?;
        if slot.status != SlotStatus::Draining {
            return Err(AudioError::ResourceError(format!(
                "Buffer {} recycled while {:?}",
                id.slot, slot.status
            )));
        }
        state.mark_free(id.slot, data, packets);
        let in_flight = state.in_flight();
        drop(state);
        self.slot_free.notify_one();
        Ok(in_flight)
    }

    /// Remove every queued buffer that has not reached the sink yet
    pub fn drain_queued(&self) -> Vec<FrameBuffer<M>> {
        let mut state = self.state.lock();
        let drained: Vec<FrameBuffer<M>> = state.ready.drain(..).collect();
        for buffer in &drained {
            slot_status(&mut state, buffer.id.slot, SlotStatus::Draining);
        }
        drained
    }

    /// Force every slot back to free and clear per-slot metadata. Buffers still held
    /// elsewhere become stale; returning them later fails with a resource error.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.ready.clear();
        let mut lease = state.next_lease;
        for slot in state.slots.iter_mut() {
            if slot.status != SlotStatus::Free {
                slot.status = SlotStatus::Free;
                slot.lease = lease;
                lease += 1;
            }
            if let Some((data, packets)) = slot.storage.as_mut() {
                data.clear();
                packets.clear();
            }
        }
        state.next_lease = lease;
        state.free = state.slots.len();
        state.cursor = 0;
        drop(state);
        self.slot_free.notify_all();
    }

    /// Wake all waiters and refuse further hand-offs
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.slot_free.notify_all();
        self.slot_ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Slots queued for playback or held by the sink
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight()
    }

    pub fn all_free(&self) -> bool {
        let state = self.state.lock();
        state.free == state.slots.len()
    }

    pub fn status(&self, slot: usize) -> Option<SlotStatus> {
        self.state.lock().slots.get(slot).map(|s| s.status)
    }
}

fn slot_status<M>(state: &mut PoolState<M>, index: usize, status: SlotStatus) {
    if let Some(slot) = state.slots.get_mut(index) {
        slot.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(20);

    fn acquire(pool: &FrameBufferPool<u32>) -> FrameBuffer<u32> {
        match pool.acquire_free_slot(pool.epoch(), WAIT) {
            Acquire::Slot(buffer) => buffer,
            other => panic!("expected a slot, got {:?}", other),
        }
    }

    fn next(pool: &FrameBufferPool<u32>) -> FrameBuffer<u32> {
        match pool.next_filled(pool.epoch(), WAIT) {
            Next::Buffer(buffer) => buffer,
            other => panic!("expected a buffer, got {:?}", other),
        }
    }

    #[test]
    fn slots_are_handed_out_round_robin() {
        let pool = FrameBufferPool::<u32>::new(3, 16, 4).unwrap();
        let a = acquire(&pool);
        let b = acquire(&pool);
        assert_eq!((a.id().slot, b.id().slot), (0, 1));
        pool.release(a).unwrap();

        // Cursor continues past the slot that was just freed
        let c = acquire(&pool);
        assert_eq!(c.id().slot, 2);
        let d = acquire(&pool);
        assert_eq!(d.id().slot, 0);
    }

    #[test]
    fn first_submission_reports_crossing() {
        let pool = FrameBufferPool::<u32>::new(2, 16, 4).unwrap();
        let mut a = acquire(&pool);
        a.append_frames(&[1, 2, 3, 4], 4);
        let b = acquire(&pool);
        assert!(pool.submit_filled_slot(a).unwrap());
        assert!(!pool.submit_filled_slot(b).unwrap());
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn filled_buffers_come_out_in_submission_order() {
        let pool = FrameBufferPool::<u32>::new(4, 16, 4).unwrap();
        for tag in 0..3u32 {
            let mut buffer = acquire(&pool);
            buffer.set_meta(tag);
            pool.submit_filled_slot(buffer).unwrap();
        }
        let tags: Vec<u32> = (0..3).map(|_| *next(&pool).meta().unwrap()).collect();
        assert_eq!(tags, vec![0, 1, 2]);
    }

    #[test]
    fn append_frames_keeps_whole_frames() {
        let pool = FrameBufferPool::<u32>::new(1, 10, 4).unwrap();
        let mut buffer = acquire(&pool);
        let consumed = buffer.append_frames(&[0u8; 16], 4);
        assert_eq!(consumed, 8);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.remaining(), 2);
    }

    #[test]
    fn packets_respect_capacity_and_descriptor_limit() {
        let pool = FrameBufferPool::<u32>::new(1, 8, 2).unwrap();
        let mut buffer = acquire(&pool);
        assert!(buffer.push_packet(&[0u8; 3], 1152));
        assert!(!buffer.push_packet(&[0u8; 6], 1152));
        assert!(buffer.push_packet(&[0u8; 2], 1152));
        assert!(buffer.is_full());
        assert_eq!(buffer.packets()[1].start_offset, 3);
        assert_eq!(buffer.frames(), 2304);
    }

    #[test]
    fn oversized_packet_goes_into_empty_buffer() {
        let pool = FrameBufferPool::<u32>::new(1, 4, 2).unwrap();
        let mut buffer = acquire(&pool);
        assert!(buffer.push_packet(&[0u8; 12], 10));
        assert_eq!(buffer.len(), 12);
    }

    #[test]
    fn recycle_rejects_unknown_buffers() {
        let pool = FrameBufferPool::<u32>::new(2, 16, 4).unwrap();
        let a = acquire(&pool);
        let id = a.id();
        pool.submit_filled_slot(a).unwrap();
        let drained = next(&pool);
        pool.recycle(drained).unwrap();

        let stale = pool.recycle_parts(id, Vec::new(), Vec::new());
        assert!(matches!(stale, Err(AudioError::ResourceError(_))));
        assert!(pool.all_free());
    }

    #[test]
    fn blocked_producer_wakes_on_recycle() {
        let pool = Arc::new(FrameBufferPool::<u32>::new(1, 16, 4).unwrap());
        let buffer = acquire(&pool);
        pool.submit_filled_slot(buffer).unwrap();

        let producer = {
            let pool = pool.clone();
            thread::spawn(move || loop {
                match pool.acquire_free_slot(pool.epoch(), Duration::from_millis(500)) {
                    Acquire::Slot(buffer) => return buffer.id().slot,
                    Acquire::TimedOut => continue,
                    other => panic!("unexpected {:?}", other),
                }
            })
        };

        thread::sleep(Duration::from_millis(30));
        let drained = next(&pool);
        pool.recycle(drained).unwrap();
        assert_eq!(producer.join().unwrap(), 0);
    }

    #[test]
    fn interrupt_wakes_blocked_producer() {
        let pool = Arc::new(FrameBufferPool::<u32>::new(1, 16, 4).unwrap());
        let _held = acquire(&pool);
        let epoch = pool.epoch();

        let producer = {
            let pool = pool.clone();
            thread::spawn(move || {
                matches!(
                    pool.acquire_free_slot(epoch, Duration::from_secs(5)),
                    Acquire::Interrupted
                )
            })
        };

        thread::sleep(Duration::from_millis(30));
        pool.interrupt();
        assert!(producer.join().unwrap());
    }

    #[test]
    fn close_wakes_consumer() {
        let pool = Arc::new(FrameBufferPool::<u32>::new(1, 16, 4).unwrap());
        let epoch = pool.epoch();
        let consumer = {
            let pool = pool.clone();
            thread::spawn(move || {
                matches!(pool.next_filled(epoch, Duration::from_secs(5)), Next::Closed)
            })
        };
        thread::sleep(Duration::from_millis(30));
        pool.close();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn reset_frees_everything() {
        let pool = FrameBufferPool::<u32>::new(3, 16, 4).unwrap();
        let a = acquire(&pool);
        let b = acquire(&pool);
        pool.submit_filled_slot(b).unwrap();
        let _draining = next(&pool);
        let c = acquire(&pool);
        pool.submit_filled_slot(c).unwrap();

        pool.reset();
        assert!(pool.all_free());
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.release(a).is_err());
    }

    #[test]
    fn drain_queued_moves_slots_to_draining() {
        let pool = FrameBufferPool::<u32>::new(2, 16, 4).unwrap();
        let a = acquire(&pool);
        pool.submit_filled_slot(a).unwrap();
        let drained = pool.drain_queued();
        assert_eq!(drained.len(), 1);
        assert_eq!(pool.status(0), Some(SlotStatus::Draining));
        for buffer in drained {
            pool.recycle(buffer).unwrap();
        }
        assert!(pool.all_free());
    }
}
