//! `beamcastd run` — foreground ingestion daemon.
//!
//! Binds the configured UDP socket, starts the reader and assembler threads,
//! and logs aggregate event counts on a fixed cadence until end-of-stream or
//! Ctrl-C. Signal handling follows the teacher's `monitor.rs` (a static
//! `AtomicBool` flipped from a raw `libc::signal` handler).

use anyhow::Result;
use beam_ingest::{EventType, IntensityStream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

pub fn run(config: &StreamConfig, stats_interval_secs: u64) -> Result<()> {
    let mut stream = IntensityStream::construct(config)?;
    tracing::info!(addr = %stream.local_addr(), beams = config.beam_ids.len(), "beamcastd listening");

    stream.start_stream();

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    let poll = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    let stats_interval = Duration::from_secs(stats_interval_secs.max(1));

    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(poll);
        waited += poll;
        if waited >= stats_interval {
            waited = Duration::ZERO;
            log_stats(&stream);
        }
    }

    tracing::info!("shutdown requested, draining");
    stream.end_stream();
    stream.join_threads()?;
    log_stats(&stream);
    Ok(())
}

fn log_stats(stream: &IntensityStream) {
    let counts = stream.get_event_counts();
    tracing::info!(
        packets_good = counts[EventType::PacketGood as usize],
        packets_bad = counts[EventType::PacketBad as usize],
        packets_dropped = counts[EventType::PacketDropped as usize],
        beam_id_mismatch = counts[EventType::BeamIdMismatch as usize],
        stream_mismatch = counts[EventType::StreamMismatch as usize],
        chunks_queued = counts[EventType::AssembledChunkQueued as usize],
        chunks_dropped = counts[EventType::AssembledChunkDropped as usize],
        "stats",
    );
}
