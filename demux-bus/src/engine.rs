use crate::{reader::ByteReader, stream::LogicalStream};

/// Outcome of one [`DemuxEngine::read_frame`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// A payload is ready in the packet.
    Ok,
    EndOfStream,
    Error(String),
}

/// Timing of the packet last read, in stream ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketInfo {
    pub stream_index: usize,
    /// `None` when the container marks the timestamp as unknown.
    pub pts: Option<i64>,
    pub duration: Option<i64>,
}

/// A blocking, pull-based container parser.
///
/// Every method runs on the demuxer's blocking worker. The packet payload is
/// only valid until the next `read_frame`, `unref_packet` or `release_packet`.
pub trait DemuxEngine: Send + 'static {
    type Context: Send;
    type Packet: Send;

    /// `None` when no packet could be allocated.
    fn alloc_packet(&mut self) -> Option<Self::Packet>;

    /// Fails if `input` does not start with a parseable container header.
    fn open(&mut self, input: ByteReader) -> anyhow::Result<Self::Context>;

    fn enumerate_streams(&mut self, ctx: &Self::Context) -> Vec<LogicalStream>;

    fn read_frame(&mut self, ctx: &mut Self::Context, packet: &mut Self::Packet) -> ReadStatus;

    fn packet_payload<'p>(&self, packet: &'p Self::Packet) -> &'p [u8];

    fn packet_info(&self, packet: &Self::Packet) -> PacketInfo;

    /// Drops the payload of the last read; the packet stays reusable.
    fn unref_packet(&mut self, packet: &mut Self::Packet);

    fn release_packet(&mut self, packet: Self::Packet);

    fn close(&mut self, ctx: Self::Context);
}
