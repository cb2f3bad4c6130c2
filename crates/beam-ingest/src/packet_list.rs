//! Bounded append-only buffer of raw datagrams (producer: reader, consumer:
//! assembler), plus the single-producer/single-consumer ring of such lists.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// One packet's location within a [`PacketList`]'s backing buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketSlice {
    pub offset: usize,
    pub nbytes: usize,
}

/// Append-only buffer of raw datagrams packed back-to-back, with a parallel
/// index of `(offset, nbytes)`. Closes (becomes full) when either the
/// packet-count or byte-count capacity is reached.
pub struct PacketList {
    buf: Vec<u8>,
    index: Vec<PacketSlice>,
    max_packets: usize,
    max_bytes: usize,
}

impl PacketList {
    pub fn new(max_packets: usize, max_bytes: usize) -> Self {
        PacketList {
            buf: Vec::with_capacity(max_bytes),
            index: Vec::with_capacity(max_packets),
            max_packets,
            max_bytes,
        }
    }

    /// Space remaining for payload bytes in the tail region.
    pub fn remaining_bytes(&self) -> usize {
        self.max_bytes.saturating_sub(self.buf.len())
    }

    /// Reserve the tail region to write `nbytes` of payload directly,
    /// returning the destination slice. Caller must then call
    /// [`PacketList::commit`] with the number of bytes actually written.
    pub fn reserve_tail(&mut self, nbytes: usize) -> Option<&mut [u8]> {
        if self.index.len() >= self.max_packets || self.buf.len() + nbytes > self.max_bytes {
            return None;
        }
        let start = self.buf.len();
        self.buf.resize(start + nbytes, 0);
        Some(&mut self.buf[start..])
    }

    /// Record the last-appended packet's length (after writing via
    /// [`PacketList::reserve_tail`]).
    pub fn commit(&mut self, offset: usize, nbytes: usize) {
        self.index.push(PacketSlice { offset, nbytes });
    }

    /// Copy `data` into the tail and record it as one packet in a single
    /// call. Returns `false` (no-op) if the list has no room.
    pub fn push_packet(&mut self, data: &[u8]) -> bool {
        let offset = self.buf.len();
        match self.reserve_tail(data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                self.commit(offset, data.len());
                true
            }
            None => false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.index.len() >= self.max_packets || self.buf.len() >= self.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn packet(&self, i: usize) -> &[u8] {
        let s = self.index[i];
        &self.buf[s.offset..s.offset + s.nbytes]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.index.len()).map(move |i| self.packet(i))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.index.clear();
    }
}

/// Bounded SPSC queue of [`PacketList`]s with end-of-stream signaling.
/// Built on `crossbeam_channel`, matching the teacher's channel-based
/// producer/consumer wiring in `fan_in.rs`/`receiver.rs`.
pub struct UnassembledRingbuf {
    tx: Sender<PacketList>,
    rx: Receiver<PacketList>,
}

impl UnassembledRingbuf {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        UnassembledRingbuf { tx, rx }
    }

    pub fn producer(&self) -> UnassembledProducer {
        UnassembledProducer {
            tx: self.tx.clone(),
        }
    }

    pub fn consumer(&self) -> UnassembledConsumer {
        UnassembledConsumer {
            rx: self.rx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UnassembledProducer {
    tx: Sender<PacketList>,
}

impl UnassembledProducer {
    /// Attempt to enqueue a full list. Returns `false` (caller increments
    /// `packet_dropped`) if the ring is full and `wait` is false.
    pub fn put(&self, list: PacketList, wait: bool) -> bool {
        if wait {
            self.tx.send(list).is_ok()
        } else {
            self.tx.try_send(list).is_ok()
        }
    }

    /// Drop the channel, causing the consumer's next recv to observe
    /// end-of-stream once the queue drains.
    pub fn end_stream(self) {
        drop(self.tx);
    }
}

#[derive(Clone)]
pub struct UnassembledConsumer {
    rx: Receiver<PacketList>,
}

impl UnassembledConsumer {
    /// Blocks until a list is available or the stream has ended and the
    /// queue is empty (returns `None`).
    pub fn get(&self) -> Option<PacketList> {
        self.rx.recv().ok()
    }

    /// Non-blocking variant used by the reader's periodic low-rate flush
    /// check; distinguishes "empty but still live" from "ended".
    pub fn try_get(&self) -> Result<PacketList, TryRecvError> {
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_list_closes_on_packet_count() {
        let mut list = PacketList::new(2, 1024);
        for _ in 0..2 {
            let dst = list.reserve_tail(8).unwrap();
            dst.fill(0xAB);
            let off = list.buf.len() - 8;
            list.commit(off, 8);
        }
        assert!(list.is_full());
        assert!(list.reserve_tail(8).is_none());
    }

    #[test]
    fn packet_list_closes_on_byte_count() {
        let mut list = PacketList::new(100, 16);
        let dst = list.reserve_tail(16).unwrap();
        dst.fill(1);
        list.commit(0, 16);
        assert!(list.is_full());
    }

    #[test]
    fn ringbuf_put_nonblocking_fails_when_full() {
        let rb = UnassembledRingbuf::new(1);
        let producer = rb.producer();
        assert!(producer.put(PacketList::new(4, 64), true));
        assert!(!producer.put(PacketList::new(4, 64), false));
    }

    #[test]
    fn consumer_observes_end_of_stream_after_drain() {
        let rb = UnassembledRingbuf::new(2);
        let producer = rb.producer();
        let consumer = rb.consumer();
        producer.put(PacketList::new(4, 64), true);
        producer.end_stream();
        assert!(consumer.get().is_some());
        assert!(consumer.get().is_none());
    }
}
