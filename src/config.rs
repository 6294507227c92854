use std::path::PathBuf;

use crate::error::Result;

/// Configuration for the log-archive core.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding WAL partition files (`log.<N>`). Required.
    pub logdir: PathBuf,

    /// Directory holding archive run files. Required.
    pub archdir: PathBuf,

    /// Maximum partition file size in bytes (default: 128MB). Rounded down
    /// to a multiple of `block_size` at open.
    pub partition_size: u64,

    /// Wipe matching files in `logdir`/`archdir` at open (default: false).
    pub reformat: bool,

    /// Physically delete recycled partitions (default: false). When unset,
    /// recycled partitions are only dropped from the in-memory catalog.
    pub delete_old_partitions: bool,

    /// Cap for the mmap-backed run-file cache (default: 20).
    pub max_open_files: usize,

    /// Reader/scanner block granularity and run IO segment size
    /// (default: 1MB).
    pub block_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            logdir: PathBuf::new(),
            archdir: PathBuf::new(),
            partition_size: 128 * 1024 * 1024, // 128MB
            reformat: false,
            delete_old_partitions: false,
            max_open_files: 20,
            block_size: 1024 * 1024, // 1MB
        }
    }
}

impl ArchiveConfig {
    /// Create a new config with the given log and archive directories.
    pub fn new(logdir: impl Into<PathBuf>, archdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
            archdir: archdir.into(),
            ..Default::default()
        }
    }

    /// Set maximum partition size in bytes
    pub fn partition_size(mut self, size: u64) -> Self {
        self.partition_size = size;
        self
    }

    /// Wipe matching files at open
    pub fn reformat(mut self, enabled: bool) -> Self {
        self.reformat = enabled;
        self
    }

    /// Physically delete recycled partitions
    pub fn delete_old_partitions(mut self, enabled: bool) -> Self {
        self.delete_old_partitions = enabled;
        self
    }

    /// Set run-file cache capacity
    pub fn max_open_files(mut self, cap: usize) -> Self {
        self.max_open_files = cap;
        self
    }

    /// Set block size for reader, scanner, and run IO
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Validates required keys and returns the effective partition size,
    /// rounded down to a multiple of the block size.
    pub fn effective_partition_size(&self) -> Result<u64> {
        if self.logdir.as_os_str().is_empty() {
            return errconfig!("logdir must be set");
        }
        if self.archdir.as_os_str().is_empty() {
            return errconfig!("archdir must be set");
        }
        if self.block_size == 0 {
            return errconfig!("block_size must be positive");
        }
        let psize = (self.partition_size / self.block_size as u64) * self.block_size as u64;
        if psize == 0 {
            return errconfig!(
                "partition_size {} smaller than block_size {}",
                self.partition_size,
                self.block_size
            );
        }
        Ok(psize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_default_config() {
        let config = ArchiveConfig::new("/tmp/log", "/tmp/arch");
        assert_eq!(config.partition_size, 128 * 1024 * 1024);
        assert_eq!(config.max_open_files, 20);
        assert!(!config.reformat);
        assert!(!config.delete_old_partitions);
    }

    #[test]
    fn test_config_builder() {
        let config = ArchiveConfig::new("/tmp/log", "/tmp/arch")
            .partition_size(16 * 1024 * 1024)
            .block_size(8192)
            .reformat(true)
            .delete_old_partitions(true)
            .max_open_files(4);

        assert_eq!(config.partition_size, 16 * 1024 * 1024);
        assert_eq!(config.block_size, 8192);
        assert!(config.reformat);
        assert!(config.delete_old_partitions);
        assert_eq!(config.max_open_files, 4);
    }

    #[test]
    fn test_partition_size_rounding() {
        let config = ArchiveConfig::new("/tmp/log", "/tmp/arch")
            .partition_size(10_000)
            .block_size(4096);
        assert_eq!(config.effective_partition_size().unwrap(), 8192);
    }

    #[test]
    fn test_missing_dirs_rejected() {
        let config = ArchiveConfig::default();
        assert!(matches!(
            config.effective_partition_size(),
            Err(Error::BadConfig(_))
        ));
    }
}
