/// Buffering limits of a demux or decode pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Byte chunks held between `write` and the engine's pull loop.
    pub byte_channel_capacity: usize,
    /// Output items queued before the producer waits.
    pub readable_high_water_mark: usize,
    /// Writes allowed in flight at once.
    pub writable_high_water_mark: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            byte_channel_capacity: 4,
            readable_high_water_mark: 16,
            writable_high_water_mark: 1,
        }
    }
}

impl PipelineOptions {
    pub fn with_byte_channel_capacity(mut self, capacity: usize) -> Self {
        self.byte_channel_capacity = capacity.max(1);
        self
    }

    pub fn with_readable_high_water_mark(mut self, hwm: usize) -> Self {
        self.readable_high_water_mark = hwm.max(1);
        self
    }

    pub fn with_writable_high_water_mark(mut self, hwm: usize) -> Self {
        self.writable_high_water_mark = hwm.max(1);
        self
    }
}
