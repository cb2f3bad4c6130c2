//! Error taxonomy: typed, fatal construction errors vs. `anyhow` for
//! internal plumbing. Transient packet errors are never `Result::Err` —
//! they are counted via [`crate::telemetry::EventCounts`] and never raised.

use thiserror::Error;

/// Fatal errors reported at stream construction, before any thread starts.
#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("length-zero beam_id list")]
    NoBeams,

    #[error("bad beam_id {0} (must be in [0, {1}])")]
    BadBeamId(u16, u16),

    #[error("duplicate beam_id {0}")]
    DuplicateBeamId(u16),

    #[error("bad nupfreq {0} (must be in [1, {1}])")]
    BadNupfreq(u32, u32),

    #[error("bad nt_per_packet {0}: must be a power of two <= nt_per_assembled_chunk ({1})")]
    BadNtPerPacket(u32, u32),

    #[error("bad fpga_counts_per_sample {0} (must be in [1, {1}])")]
    BadFpgaCountsPerSample(u32, u32),

    #[error("bad stream_id {0} (must be in [0, 9])")]
    BadStreamId(u32),

    #[error("bad udp_port {0}")]
    BadUdpPort(u32),

    #[error("both force_fast_kernels and force_reference_kernels were set")]
    ConflictingKernelFlags,

    #[error("force_fast_kernels requested but no fast kernel is available in this build")]
    FastKernelUnavailable,

    #[error("assembled_ringbuf_capacity must be > 0")]
    BadAssembledRingbufCapacity,

    #[error("telescoping_ringbuf_capacity entries must all be >= 2")]
    BadTelescopingCapacity,

    #[error("decode stride {0} is shorter than nt_per_assembled_chunk ({1})")]
    StrideTooShort(usize, usize),
}

/// Fatal errors surfaced from assembled-chunk (de)serialization.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("unsupported msgpack version {0} (expected 1 or 2)")]
    BadVersion(u8),

    #[error("msgpack array has {0} elements, expected {1}")]
    BadArrayLen(usize, usize),

    #[error("unknown compression type {0} (expected 0 or 1)")]
    BadCompression(u8),

    #[error("field size mismatch: expected {0} bytes, got {1}")]
    SizeMismatch(usize, usize),

    #[error("bitshuffle/lz4 decompression failed: {0}")]
    DecompressFailed(String),

    #[error("msgpack decode error: {0}")]
    Msgpack(#[from] rmp::decode::ValueReadError),

    #[error("msgpack encode error: {0}")]
    MsgpackWrite(String),
}
