//! `StreamConfig`: the in-memory constructor-input object of the external
//! interface. TOML-file loading mirrors the teacher's `ProbeConfig::load`
//! (`src/config.rs`) — `#[serde(default = "...")]` per field, `anyhow`
//! context on I/O/parse failure.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConstructError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    pub beam_ids: Vec<u16>,
    #[serde(default = "StreamConfig::default_nupfreq")]
    pub nupfreq: u16,
    #[serde(default = "StreamConfig::default_nt_per_packet")]
    pub nt_per_packet: u16,
    #[serde(default = "StreamConfig::default_fpga_counts_per_sample")]
    pub fpga_counts_per_sample: u32,
    #[serde(default = "StreamConfig::default_nt_per_assembled_chunk")]
    pub nt_per_assembled_chunk: u32,
    #[serde(default)]
    pub stream_id: u32,
    #[serde(default = "StreamConfig::default_udp_port")]
    pub udp_port: u32,
    #[serde(default = "StreamConfig::default_ipaddr")]
    pub ipaddr: String,

    #[serde(default = "StreamConfig::default_assembled_ringbuf_capacity")]
    pub assembled_ringbuf_capacity: usize,
    #[serde(default = "StreamConfig::default_telescoping_ringbuf_capacity")]
    pub telescoping_ringbuf_capacity: Vec<usize>,

    #[serde(default = "StreamConfig::default_socket_bufsize")]
    pub socket_bufsize: usize,
    #[serde(default = "StreamConfig::default_socket_timeout_usec")]
    pub socket_timeout_usec: u64,

    #[serde(default = "StreamConfig::default_max_unassembled_packets_per_list")]
    pub max_unassembled_packets_per_list: usize,
    #[serde(default = "StreamConfig::default_max_unassembled_nbytes_per_list")]
    pub max_unassembled_nbytes_per_list: usize,
    #[serde(default = "StreamConfig::default_unassembled_ringbuf_capacity")]
    pub unassembled_ringbuf_capacity: usize,
    #[serde(default = "StreamConfig::default_unassembled_ringbuf_timeout_usec")]
    pub unassembled_ringbuf_timeout_usec: u64,
    #[serde(default = "StreamConfig::default_stream_cancellation_latency_usec")]
    pub stream_cancellation_latency_usec: u64,

    #[serde(default)]
    pub force_fast_kernels: bool,
    #[serde(default)]
    pub force_reference_kernels: bool,

    #[serde(default = "StreamConfig::default_true")]
    pub accept_end_of_stream_packets: bool,
    #[serde(default = "StreamConfig::default_true")]
    pub emit_warning_on_buffer_drop: bool,
    #[serde(default)]
    pub throw_exception_on_buffer_drop: bool,
    #[serde(default)]
    pub throw_exception_on_packet_mismatch: bool,
    #[serde(default)]
    pub throw_exception_on_beam_id_mismatch: bool,

    /// Ambient: `tracing_subscriber::EnvFilter` directive for the binary
    /// crate's logging setup. Not part of the core stream contract.
    #[serde(default = "StreamConfig::default_log_filter")]
    pub log_filter: String,
}

impl StreamConfig {
    fn default_nupfreq() -> u16 {
        4
    }
    fn default_nt_per_packet() -> u16 {
        16
    }
    fn default_fpga_counts_per_sample() -> u32 {
        384
    }
    fn default_nt_per_assembled_chunk() -> u32 {
        1024
    }
    fn default_udp_port() -> u32 {
        10252
    }
    fn default_ipaddr() -> String {
        "0.0.0.0".into()
    }
    fn default_assembled_ringbuf_capacity() -> usize {
        4
    }
    fn default_telescoping_ringbuf_capacity() -> Vec<usize> {
        vec![4, 4, 4, 4]
    }
    fn default_socket_bufsize() -> usize {
        1 << 20
    }
    fn default_socket_timeout_usec() -> u64 {
        100_000
    }
    fn default_max_unassembled_packets_per_list() -> usize {
        1024
    }
    fn default_max_unassembled_nbytes_per_list() -> usize {
        8 << 20
    }
    fn default_unassembled_ringbuf_capacity() -> usize {
        16
    }
    fn default_unassembled_ringbuf_timeout_usec() -> u64 {
        1_000_000
    }
    fn default_stream_cancellation_latency_usec() -> u64 {
        100_000
    }
    fn default_true() -> bool {
        true
    }
    fn default_log_filter() -> String {
        "info".into()
    }

    /// Minimal example configuration, analogous to `ProbeConfig`'s
    /// `default_example`.
    pub fn default_example() -> Self {
        StreamConfig {
            beam_ids: vec![77, 42],
            nupfreq: Self::default_nupfreq(),
            nt_per_packet: Self::default_nt_per_packet(),
            fpga_counts_per_sample: Self::default_fpga_counts_per_sample(),
            nt_per_assembled_chunk: Self::default_nt_per_assembled_chunk(),
            stream_id: 0,
            udp_port: Self::default_udp_port(),
            ipaddr: Self::default_ipaddr(),
            assembled_ringbuf_capacity: Self::default_assembled_ringbuf_capacity(),
            telescoping_ringbuf_capacity: Self::default_telescoping_ringbuf_capacity(),
            socket_bufsize: Self::default_socket_bufsize(),
            socket_timeout_usec: Self::default_socket_timeout_usec(),
            max_unassembled_packets_per_list: Self::default_max_unassembled_packets_per_list(),
            max_unassembled_nbytes_per_list: Self::default_max_unassembled_nbytes_per_list(),
            unassembled_ringbuf_capacity: Self::default_unassembled_ringbuf_capacity(),
            unassembled_ringbuf_timeout_usec: Self::default_unassembled_ringbuf_timeout_usec(),
            stream_cancellation_latency_usec: Self::default_stream_cancellation_latency_usec(),
            force_fast_kernels: false,
            force_reference_kernels: false,
            accept_end_of_stream_packets: true,
            emit_warning_on_buffer_drop: true,
            throw_exception_on_buffer_drop: false,
            throw_exception_on_packet_mismatch: false,
            throw_exception_on_beam_id_mismatch: false,
            log_filter: Self::default_log_filter(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: StreamConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Validate against the construction-error taxonomy; mirrors the
    /// argument checking at the top of `intensity_network_stream`'s
    /// constructor.
    pub fn validate(&self) -> Result<(), ConstructError> {
        if self.beam_ids.is_empty() {
            return Err(ConstructError::NoBeams);
        }
        const MAX_BEAM_ID: u16 = 65535;
        for (i, &b) in self.beam_ids.iter().enumerate() {
            if b > MAX_BEAM_ID {
                return Err(ConstructError::BadBeamId(b, MAX_BEAM_ID));
            }
            if self.beam_ids[..i].contains(&b) {
                return Err(ConstructError::DuplicateBeamId(b));
            }
        }
        if self.nupfreq == 0 || self.nupfreq > 512 {
            return Err(ConstructError::BadNupfreq(self.nupfreq as u32, 512));
        }
        if !self.nt_per_packet.is_power_of_two()
            || self.nt_per_packet as u32 > self.nt_per_assembled_chunk
        {
            return Err(ConstructError::BadNtPerPacket(
                self.nt_per_packet as u32,
                self.nt_per_assembled_chunk,
            ));
        }
        if self.fpga_counts_per_sample == 0 || self.fpga_counts_per_sample > (1 << 20) {
            return Err(ConstructError::BadFpgaCountsPerSample(
                self.fpga_counts_per_sample,
                1 << 20,
            ));
        }
        if self.stream_id > 9 {
            return Err(ConstructError::BadStreamId(self.stream_id));
        }
        if self.udp_port == 0 || self.udp_port >= 65536 {
            return Err(ConstructError::BadUdpPort(self.udp_port));
        }
        if self.force_fast_kernels && self.force_reference_kernels {
            return Err(ConstructError::ConflictingKernelFlags);
        }
        if self.force_fast_kernels {
            // No SIMD fast kernel is implemented in this build (see
            // DESIGN.md Open Question resolution #3); the flag is accepted
            // in config but always rejected at validation.
            return Err(ConstructError::FastKernelUnavailable);
        }
        if self.assembled_ringbuf_capacity == 0 {
            return Err(ConstructError::BadAssembledRingbufCapacity);
        }
        if self.telescoping_ringbuf_capacity.iter().any(|&n| n < 2) {
            return Err(ConstructError::BadTelescopingCapacity);
        }
        Ok(())
    }

    pub fn ip_addr(&self) -> Result<IpAddr> {
        self.ipaddr
            .parse()
            .with_context(|| format!("invalid ipaddr {:?}", self.ipaddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_example_validates() {
        StreamConfig::default_example().validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_beam_ids() {
        let mut cfg = StreamConfig::default_example();
        cfg.beam_ids = vec![1, 1];
        assert!(matches!(
            cfg.validate(),
            Err(ConstructError::DuplicateBeamId(1))
        ));
    }

    #[test]
    fn rejects_conflicting_kernel_flags() {
        let mut cfg = StreamConfig::default_example();
        cfg.force_fast_kernels = true;
        cfg.force_reference_kernels = true;
        assert!(matches!(
            cfg.validate(),
            Err(ConstructError::ConflictingKernelFlags)
        ));
    }

    #[test]
    fn rejects_sub_two_telescoping_capacity() {
        let mut cfg = StreamConfig::default_example();
        cfg.telescoping_ringbuf_capacity = vec![4, 1];
        assert!(matches!(
            cfg.validate(),
            Err(ConstructError::BadTelescopingCapacity)
        ));
    }
}
