/// Live-updatable knobs for the disk engine.
#[derive(Debug, Clone)]
pub struct DiskSettings {
    /// Maximum read throughput in bytes per second. 0 = unlimited.
    pub max_read_rate: u64,
    /// Maximum write throughput in bytes per second. 0 = unlimited.
    pub max_write_rate: u64,
    /// Byte budget of the block cache. 0 = pass-through.
    pub cache_bytes: u64,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            max_read_rate: 0,
            max_write_rate: 0,
            cache_bytes: 32 * 1024 * 1024,
        }
    }
}

impl DiskSettings {
    pub fn with_read_rate(mut self, bytes_per_sec: u64) -> Self {
        self.max_read_rate = bytes_per_sec;
        self
    }

    pub fn with_write_rate(mut self, bytes_per_sec: u64) -> Self {
        self.max_write_rate = bytes_per_sec;
        self
    }

    pub fn with_cache_bytes(mut self, bytes: u64) -> Self {
        self.cache_bytes = bytes;
        self
    }
}
