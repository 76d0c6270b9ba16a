//! Worker pool configuration.

/// Remote stores reject multipart uploads with more parts than this; the
/// chunk size is recomputed upward when a file would exceed it.
pub const MAX_UPLOAD_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of worker tasks (0 = number of CPU cores).
    pub num_workers: usize,
    /// Multipart chunk size for uploads.
    pub chunk_size: bytesize::ByteSize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            chunk_size: bytesize::ByteSize::mib(5),
        }
    }
}

impl PoolConfig {
    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_workers == 1 {
            // batch operations park a worker while their sub-jobs run
            return Err("at least two workers are required".to_string());
        }
        if self.chunk_size.0 < bytesize::ByteSize::mib(1).0 {
            return Err("chunk_size must be at least 1 MiB".to_string());
        }
        Ok(())
    }

    /// The worker count with the 0-means-cores default applied.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(2)
    }
}
