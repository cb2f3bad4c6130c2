//! `IntensityStream`: the top-level handle tying the network reader,
//! assembler thread and per-beam state together. Lifecycle follows
//! `intensity_network_stream.cpp`'s `make → start_stream → end_stream →
//! join_threads`, and thread orchestration follows the teacher's
//! `source.rs`/`fan_in.rs::start()` shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::assembler::{BeamAssembler, ChunkGeometry};
use crate::chunk::AssembledChunk;
use crate::config::StreamConfig;
use crate::dispatch::{self, DispatchFlags, Dispatcher, ExpectedGeometry};
use crate::error::ConstructError;
use crate::packet_list::{UnassembledConsumer, UnassembledRingbuf};
use crate::reader::{NetworkReader, ReaderConfig, StopFlag};
use crate::telemetry::{EventCounts, PerHostCounters, NUM_EVENT_TYPES};

/// `(fpga_next, n_ready, capacity, n_elements, fpga_min, fpga_max)`, per
/// spec.md §7's `get_ringbuf_size`.
pub type RingbufSize = (u64, usize, usize, usize, u64, u64);

pub struct IntensityStream {
    beam_ids: Vec<u16>,
    assemblers: Vec<Arc<Mutex<BeamAssembler>>>,
    event_counts: Arc<EventCounts>,
    host_counters: Arc<PerHostCounters>,
    stop: Arc<StopFlag>,
    unassembled_consumer: UnassembledConsumer,
    reader: Option<NetworkReader>,
    local_addr: SocketAddr,
    reader_handle: Option<JoinHandle<()>>,
    dispatch_handle: Option<JoinHandle<Result<()>>>,
    expected: ExpectedGeometry,
    flags: DispatchFlags,
}

impl IntensityStream {
    /// Validate `config`, bind the socket and build per-beam state. Mirrors
    /// `intensity_network_stream::make`: all fallible setup happens here,
    /// before any thread exists.
    pub fn construct(config: &StreamConfig) -> Result<Self, ConstructError> {
        config.validate()?;

        let geom = ChunkGeometry {
            nupfreq: config.nupfreq,
            nt_per_packet: config.nt_per_packet,
            fpga_counts_per_sample: config.fpga_counts_per_sample,
            nt_per_assembled_chunk: config.nt_per_assembled_chunk,
            nrfifreq: 0,
        };

        let mut assemblers = Vec::with_capacity(config.beam_ids.len());
        for &beam_id in &config.beam_ids {
            let asm = BeamAssembler::new(
                beam_id,
                geom,
                2,
                config.assembled_ringbuf_capacity,
                &config.telescoping_ringbuf_capacity,
            )?;
            assemblers.push(Arc::new(Mutex::new(asm)));
        }

        let unassembled = UnassembledRingbuf::new(config.unassembled_ringbuf_capacity);
        let producer = unassembled.producer();
        let consumer = unassembled.consumer();

        let host_counters = Arc::new(PerHostCounters::new());
        let event_counts = Arc::new(EventCounts::new());
        let stop = StopFlag::new();

        let bind_addr: SocketAddr = (config.ip_addr().map_err(|_| ConstructError::BadUdpPort(config.udp_port))?, config.udp_port as u16).into();
        let reader_cfg = ReaderConfig {
            bind_addr,
            socket_bufsize: config.socket_bufsize,
            socket_timeout: Duration::from_micros(config.socket_timeout_usec),
            max_unassembled_packets_per_list: config.max_unassembled_packets_per_list,
            max_unassembled_nbytes_per_list: config.max_unassembled_nbytes_per_list,
            accept_end_of_stream_packets: config.accept_end_of_stream_packets,
        };
        let reader = NetworkReader::new(
            reader_cfg,
            producer,
            host_counters.clone(),
            event_counts.clone(),
            stop.clone(),
        )
        .map_err(|_| ConstructError::BadUdpPort(config.udp_port))?;
        let local_addr = reader
            .local_addr()
            .map_err(|_| ConstructError::BadUdpPort(config.udp_port))?;

        Ok(IntensityStream {
            beam_ids: config.beam_ids.clone(),
            assemblers,
            event_counts,
            host_counters,
            stop,
            unassembled_consumer: consumer,
            reader: Some(reader),
            local_addr,
            reader_handle: None,
            dispatch_handle: None,
            expected: ExpectedGeometry {
                nupfreq: config.nupfreq,
                nt_per_packet: config.nt_per_packet,
                fpga_counts_per_sample: config.fpga_counts_per_sample,
            },
            flags: DispatchFlags {
                throw_on_packet_mismatch: config.throw_exception_on_packet_mismatch,
                throw_on_beam_id_mismatch: config.throw_exception_on_beam_id_mismatch,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the reader and assembler threads. Idempotent: a second call is
    /// a no-op.
    pub fn start_stream(&mut self) {
        if self.reader_handle.is_some() {
            return;
        }
        if let Some(reader) = self.reader.take() {
            self.reader_handle = Some(
                std::thread::Builder::new()
                    .name("network-reader".into())
                    .spawn(move || reader.run())
                    .expect("failed to spawn network-reader thread"),
            );
        }

        let dispatcher = Dispatcher::new(
            self.unassembled_consumer.clone(),
            self.assemblers.clone(),
            self.event_counts.clone(),
            self.expected,
            self.flags,
        );
        self.dispatch_handle = Some(dispatch::spawn(dispatcher));
    }

    /// Request shutdown. Idempotent, safe to call from any thread, and does
    /// not itself block: the reader thread notices on its next socket-read
    /// timeout, and its `run` returning drops the sole producer clone, which
    /// closes the ring and lets the assembler thread drain and exit.
    pub fn end_stream(&mut self) {
        self.stop.request_stop();
    }

    /// Block until both threads have exited. Call after `end_stream`.
    pub fn join_threads(&mut self) -> Result<()> {
        if let Some(h) = self.reader_handle.take() {
            h.join().map_err(|_| anyhow::anyhow!("network-reader thread panicked"))?;
        }
        if let Some(h) = self.dispatch_handle.take() {
            h.join().map_err(|_| anyhow::anyhow!("assembler thread panicked"))??;
        }
        Ok(())
    }

    fn find(&self, beam_id: u16) -> Option<&Arc<Mutex<BeamAssembler>>> {
        self.beam_ids
            .iter()
            .position(|&b| b == beam_id)
            .map(|i| &self.assemblers[i])
    }

    pub fn get_assembled_chunk(&self, beam_id: u16, wait: bool) -> Option<Arc<AssembledChunk>> {
        self.find(beam_id)?.lock().unwrap().get_assembled_chunk(wait)
    }

    pub fn get_event_counts(&self) -> [u64; NUM_EVENT_TYPES] {
        self.event_counts.snapshot()
    }

    pub fn get_perhost_packets(&self) -> HashMap<SocketAddr, u64> {
        self.host_counters.snapshot()
    }

    pub fn get_ringbuf_size(&self, beam_id: u16) -> Option<RingbufSize> {
        let asm = self.find(beam_id)?.lock().unwrap();
        let geom = asm.geometry();
        let fpga_next = asm
            .active_min()
            .map(|ichunk| ichunk * geom.nt_per_assembled_chunk as u64 * geom.fpga_counts_per_sample as u64)
            .unwrap_or(0);
        let rx = asm.downstream_receiver();
        let n_ready = rx.len();
        let capacity = rx.capacity().unwrap_or(0);

        let tel = asm.telescoping();
        let n_elements: usize = (0..tel.num_levels()).map(|l| tel.level_len(l)).sum();
        let snapshot = tel.snapshot(0, u64::MAX);
        let fpga_min = snapshot.iter().map(|(c, _)| c.fpga_begin).min().unwrap_or(0);
        let fpga_max = snapshot.iter().map(|(c, _)| c.fpga_end).max().unwrap_or(0);

        Some((fpga_next, n_ready, capacity, n_elements, fpga_min, fpga_max))
    }

    pub fn get_ringbuf_snapshot(
        &self,
        beam_ids: &[u16],
        min_fpga: u64,
        max_fpga: u64,
    ) -> HashMap<u16, Vec<(Arc<AssembledChunk>, u32)>> {
        let mut out = HashMap::new();
        for &beam_id in beam_ids {
            if let Some(asm) = self.find(beam_id) {
                let asm = asm.lock().unwrap();
                out.insert(beam_id, asm.telescoping().snapshot(min_fpga, max_fpga));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode;
    use crate::telemetry::EventType;
    use std::net::UdpSocket;

    fn test_config(beam_ids: Vec<u16>, udp_port: u32) -> StreamConfig {
        let mut cfg = StreamConfig::default_example();
        cfg.beam_ids = beam_ids;
        cfg.nupfreq = 2;
        cfg.nt_per_packet = 4;
        cfg.fpga_counts_per_sample = 10;
        cfg.nt_per_assembled_chunk = 8;
        cfg.udp_port = udp_port;
        cfg.ipaddr = "127.0.0.1".into();
        cfg.socket_timeout_usec = 5_000;
        cfg
    }

    fn send_packet(client: &UdpSocket, to: SocketAddr, beam_ids: &[u16], freq_ids: &[u16]) {
        let nb = beam_ids.len();
        let nf = freq_ids.len();
        let intensity = vec![5.0f32; nb * nf * 2 * 4];
        let weights = vec![1.0f32; intensity.len()];
        let mut dst = Vec::new();
        encode(
            &mut dst, 1, 10, 0, beam_ids, freq_ids, 2, 4, &intensity, &weights,
            nf * 2 * 4, 4, 0.5,
        );
        client.send_to(&dst, to).unwrap();
    }

    #[test]
    fn s5_end_of_stream_sentinel_stops_threads() {
        let cfg = test_config(vec![1, 2], 58712);
        let mut stream = IntensityStream::construct(&cfg).unwrap();
        let addr = stream.local_addr();
        stream.start_stream();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let freq_ids: Vec<u16> = (0..1024u16).collect();
        send_packet(&client, addr, &[1, 2], &freq_ids);
        client.send_to(&[0u8; crate::packet::HEADER_NBYTES], addr).unwrap();

        stream.join_threads().unwrap();
        let counts = stream.get_event_counts();
        assert!(counts[EventType::PacketEndOfStream as usize] >= 1);
    }

    #[test]
    fn s6_beam_mismatch_leaves_other_beams_unaffected() {
        let cfg = test_config(vec![1, 2], 58713);
        let mut stream = IntensityStream::construct(&cfg).unwrap();
        let addr = stream.local_addr();
        stream.start_stream();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let freq_ids: Vec<u16> = (0..1024u16).collect();
        send_packet(&client, addr, &[1, 3], &freq_ids);
        client.send_to(&[0u8; crate::packet::HEADER_NBYTES], addr).unwrap();

        stream.join_threads().unwrap();
        let counts = stream.get_event_counts();
        assert_eq!(counts[EventType::BeamIdMismatch as usize], 1);
        assert_eq!(counts[EventType::AssemblerHit as usize], 1);
    }
}
