//! Per-beam assembler: maintains a small window of open chunks keyed by
//! contiguous `ichunk`, publishes closed chunks downstream and into the
//! telescoping ring buffer. Window-advance/closing mirrors the teacher's
//! `SlotState` contiguous-index tracking in `decoder.rs`.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::chunk::AssembledChunk;
use crate::error::ConstructError;
use crate::packet::Packet;
use crate::ringbuf::TelescopingRingbuf;
use crate::telemetry::{EventSubcounts, EventType};

/// Fixed geometry shared by every chunk an assembler creates.
#[derive(Debug, Clone, Copy)]
pub struct ChunkGeometry {
    pub nupfreq: u16,
    pub nt_per_packet: u16,
    pub fpga_counts_per_sample: u32,
    pub nt_per_assembled_chunk: u32,
    pub nrfifreq: u16,
}

pub struct BeamAssembler {
    beam_id: u16,
    geom: ChunkGeometry,
    window_depth: usize,
    /// Open chunks, strictly increasing `ichunk`, front = oldest.
    window: VecDeque<AssembledChunk>,
    active_min: Option<u64>,
    telescoping: TelescopingRingbuf,
    downstream_tx: Sender<Arc<AssembledChunk>>,
    downstream_rx: Receiver<Arc<AssembledChunk>>,
}

impl BeamAssembler {
    pub fn new(
        beam_id: u16,
        geom: ChunkGeometry,
        window_depth: usize,
        downstream_capacity: usize,
        telescoping_capacities: &[usize],
    ) -> Result<Self, ConstructError> {
        let (tx, rx) = bounded(downstream_capacity);
        Ok(BeamAssembler {
            beam_id,
            geom,
            window_depth: window_depth.max(1),
            window: VecDeque::with_capacity(window_depth),
            active_min: None,
            telescoping: TelescopingRingbuf::new(telescoping_capacities)?,
            downstream_tx: tx,
            downstream_rx: rx,
        })
    }

    fn new_chunk(&self, ichunk: u64) -> AssembledChunk {
        AssembledChunk::new(
            self.beam_id,
            self.geom.nupfreq,
            self.geom.nt_per_packet,
            self.geom.fpga_counts_per_sample,
            self.geom.nt_per_assembled_chunk,
            1,
            ichunk,
            self.geom.nrfifreq,
        )
        .expect("assembler geometry validated at construction")
    }

    /// Deliver one beam-scoped sub-packet. `beam_index` is the packet's
    /// index for this beam (used to read the right scale/offset/data
    /// block).
    pub fn put_unassembled_packet(
        &mut self,
        pkt: &Packet,
        beam_index: usize,
        counts: &mut EventSubcounts,
    ) {
        let isample = pkt.fpga_count / self.geom.fpga_counts_per_sample as u64;
        let ichunk = isample / self.geom.nt_per_assembled_chunk as u64;

        if self.window.is_empty() {
            self.active_min = Some(ichunk);
            self.window.push_back(self.new_chunk(ichunk));
        }

        let active_min = self.active_min.unwrap();

        if ichunk < active_min {
            counts.incr(EventType::AssemblerMiss);
            return;
        }

        if ichunk >= active_min + self.window.len() as u64 {
            // Advance the window: close chunks sliding off the front,
            // create fresh ones for newly-uncovered slots.
            while ichunk >= active_min + self.window.len() as u64 {
                if self.window.len() >= self.window_depth {
                    let closed = self.window.pop_front().unwrap();
                    self.active_min = Some(self.active_min.unwrap() + 1);
                    self.publish(closed, counts);
                }
                let next_ichunk = self.active_min.unwrap() + self.window.len() as u64;
                self.window.push_back(self.new_chunk(next_ichunk));
            }
        }

        let active_min = self.active_min.unwrap();
        let slot = (ichunk - active_min) as usize;
        if self.window[slot].add_packet(pkt, beam_index) {
            counts.incr(EventType::AssemblerHit);
        } else {
            counts.incr(EventType::AssemblerMiss);
        }
    }

    fn publish(&mut self, chunk: AssembledChunk, counts: &mut EventSubcounts) {
        let shared = Arc::new(chunk);
        if self.downstream_tx.try_send(shared.clone()).is_ok() {
            counts.incr(EventType::AssembledChunkQueued);
        } else {
            counts.incr(EventType::AssembledChunkDropped);
        }
        self.telescoping.push(shared);
    }

    /// Flush all still-open chunks (called on stream end).
    pub fn end_stream(&mut self, counts: &mut EventSubcounts) {
        while let Some(chunk) = self.window.pop_front() {
            self.publish(chunk, counts);
        }
        self.active_min = None;
    }

    /// Next closed chunk for downstream consumption, or `None` if the
    /// channel is empty and closed.
    pub fn get_assembled_chunk(&self, wait: bool) -> Option<Arc<AssembledChunk>> {
        if wait {
            self.downstream_rx.recv().ok()
        } else {
            self.downstream_rx.try_recv().ok()
        }
    }

    pub fn telescoping(&self) -> &TelescopingRingbuf {
        &self.telescoping
    }

    pub fn beam_id(&self) -> u16 {
        self.beam_id
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geom
    }

    /// Oldest still-open `ichunk`, i.e. the window's leading edge.
    pub fn active_min(&self) -> Option<u64> {
        self.active_min
    }

    /// A cloned handle to the closed-chunk channel, usable independently of
    /// `get_assembled_chunk` (e.g. to report queue depth without consuming).
    pub fn downstream_receiver(&self) -> Receiver<Arc<AssembledChunk>> {
        self.downstream_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode;

    fn geom() -> ChunkGeometry {
        ChunkGeometry {
            nupfreq: 4,
            nt_per_packet: 16,
            fpga_counts_per_sample: 384,
            nt_per_assembled_chunk: 1024,
            nrfifreq: 0,
        }
    }

    fn packet_for(beam_ids: &[u16], freq_ids: &[u16], t0: u64, nupfreq: u16, ntsamp: u16, fpga_counts_per_sample: u16) -> Vec<u8> {
        let nb = beam_ids.len();
        let nf = freq_ids.len();
        let nu = nupfreq as usize;
        let nt = ntsamp as usize;
        let intensity = vec![42.0f32; nb * nf * nu * nt];
        let weights = vec![1.0f32; nb * nf * nu * nt];
        let mut dst = Vec::new();
        let fpga_count = t0 * fpga_counts_per_sample as u64;
        encode(
            &mut dst,
            1,
            fpga_counts_per_sample,
            fpga_count,
            beam_ids,
            freq_ids,
            nupfreq,
            ntsamp,
            &intensity,
            &weights,
            nf * nu * nt,
            nt,
            0.5,
        );
        dst
    }

    #[test]
    fn s1_full_geometry_closes_one_chunk_per_beam() {
        let mut asm = BeamAssembler::new(77, geom(), 2, 4, &[2, 2]).unwrap();
        let freq_ids: Vec<u16> = (0..1024u16).collect();
        for tblock in 0..(1024 / 16) {
            let raw = packet_for(&[77, 42], &freq_ids, tblock as u64 * 16, 4, 16, 384);
            let pkt = Packet::decode(&raw).unwrap();
            let mut counts = EventSubcounts::new();
            asm.put_unassembled_packet(&pkt, 0, &mut counts);
        }
        asm.end_stream(&mut EventSubcounts::new());
        let ch = asm.get_assembled_chunk(false).expect("one chunk published");
        assert_eq!(ch.ichunk, 0);
        assert_eq!(ch.fpga_begin, 0);
        assert_eq!(ch.fpga_end, 1024 * 384);
    }

    #[test]
    fn s2_skipped_chunk_publishes_with_zero_weight() {
        let mut asm = BeamAssembler::new(77, geom(), 3, 4, &[2, 2]).unwrap();
        let freq_ids: Vec<u16> = (0..1024u16).collect();
        // Fill ichunk=0 fully.
        for tblock in 0..(1024 / 16) {
            let raw = packet_for(&[77], &freq_ids, tblock as u64 * 16, 4, 16, 384);
            let pkt = Packet::decode(&raw).unwrap();
            asm.put_unassembled_packet(&pkt, 0, &mut EventSubcounts::new());
        }
        // Skip ichunk=1 entirely, fill ichunk=2.
        for tblock in 0..(1024 / 16) {
            let t0 = 2 * 1024 + tblock * 16;
            let raw = packet_for(&[77], &freq_ids, t0 as u64, 4, 16, 384);
            let pkt = Packet::decode(&raw).unwrap();
            asm.put_unassembled_packet(&pkt, 0, &mut EventSubcounts::new());
        }
        asm.end_stream(&mut EventSubcounts::new());

        let c0 = asm.get_assembled_chunk(false).unwrap();
        assert_eq!(c0.ichunk, 0);
        let c1 = asm.get_assembled_chunk(false).unwrap();
        assert_eq!(c1.ichunk, 1);
        let nt = c1.nt_per_assembled_chunk as usize;
        let mut intensity = vec![0f32; 1024 * 4 * nt];
        let mut weights = vec![0f32; intensity.len()];
        c1.decode(&mut intensity, &mut weights, nt).unwrap();
        assert!(weights.iter().all(|&w| w == 0.0));
        let c2 = asm.get_assembled_chunk(false).unwrap();
        assert_eq!(c2.ichunk, 2);
    }
}
