use crate::bits::is_power_of_two;

/// Configuration for preparing a [`TransactionRoot`](crate::TransactionRoot).
#[derive(Debug, Clone)]
pub struct Config {
    /// Arena capacity in bytes. Must be a positive multiple of
    /// `min_alloc_unit`. A multiple of `min_alloc_unit * 512 * 64 * 256`
    /// fills the three-level summary structure exactly; smaller
    /// capacities leave the trailing summary bits permanently
    /// unavailable.
    pub capacity: u64,
    /// Minimum allocation granularity in bytes, a power of two >= 16.
    pub min_alloc_unit: u64,
    /// Entry capacity of the allocation log.
    pub alloc_log_entries: u64,
    /// When the allocation log grows past this many entries, commit
    /// replaces it with a fresh log seeded from a bitmap snapshot.
    pub squeeze_threshold: u64,
    /// Entry capacity of the object log, bounding how many object
    /// cells one transaction may duplicate.
    pub obj_log_entries: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            capacity: 64 * 1024 * 1024,
            min_alloc_unit: 0x1000,
            alloc_log_entries: 1024,
            squeeze_threshold: 768,
            obj_log_entries: 1024,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) {
        assert!(
            is_power_of_two(self.min_alloc_unit) && self.min_alloc_unit >= 16,
            "min_alloc_unit must be a power of two >= 16"
        );
        assert!(
            self.min_alloc_unit <= u32::MAX as u64,
            "min_alloc_unit must fit a log entry"
        );
        assert!(
            self.capacity > 0 && self.capacity % self.min_alloc_unit == 0,
            "capacity must be a positive multiple of min_alloc_unit"
        );
        assert!(
            self.alloc_log_entries > 1 && self.obj_log_entries > 0,
            "log capacities must be non-zero"
        );
        assert!(
            self.squeeze_threshold > 0 && self.squeeze_threshold < self.alloc_log_entries,
            "squeeze_threshold must fall below alloc_log_entries"
        );
    }
}
