pub mod assembler;
pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod packet;
pub mod packet_list;
pub mod reader;
pub mod ringbuf;
pub mod serialize;
pub mod stream;
pub mod telemetry;

pub use assembler::{BeamAssembler, ChunkGeometry};
pub use chunk::AssembledChunk;
pub use config::StreamConfig;
pub use dispatch::{DispatchFlags, Dispatcher, ExpectedGeometry};
pub use error::{ConstructError, SerializeError};
pub use packet::Packet;
pub use packet_list::{PacketList, UnassembledConsumer, UnassembledProducer, UnassembledRingbuf};
pub use reader::{NetworkReader, ReaderConfig, StopFlag};
pub use ringbuf::TelescopingRingbuf;
pub use stream::{IntensityStream, RingbufSize};
pub use telemetry::{EventCounts, EventSubcounts, EventType, PerHostCounters};
