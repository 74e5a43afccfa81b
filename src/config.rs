//! Device configuration
//!
//! Every tunable of the device backend lives in one [`DeviceConfig`] record
//! read at construction time. There is no global mutable state.

/// Tunables for [`crate::Device`].
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Total size of the async-copy staging ring, in bytes.
    pub staging_ring_size: u32,
    /// Page granularity of the staging ring block allocator. Must be a
    /// power of two and divide `staging_ring_size` evenly.
    pub staging_page_size: u32,
    /// Minimum size class handed out by the temp buffer pools, in bytes.
    pub temp_buffer_floor: u32,
    /// Soft budget per temp buffer pool; exceeding it evicts the largest
    /// unused buffers before allocating.
    pub temp_pool_budget: u64,
    /// Slot capacity of the object registry (floor 1024).
    pub max_objects: u32,
    /// Run the device worker on its own thread. When false the producer
    /// pumps the worker inline at submit/run boundaries.
    pub enable_worker_thread: bool,
    /// Number of background task workers for copy source fills and
    /// streaming tasks.
    pub task_threads: usize,
    /// Attach debug labels to GPU objects.
    pub enable_debug_labels: bool,
    /// Log per-frame worker timings.
    pub print_timings: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            staging_ring_size: 256 << 20,
            staging_page_size: 4096,
            temp_buffer_floor: 64 << 10,
            temp_pool_budget: 512 << 20,
            max_objects: 128 * 1024,
            enable_worker_thread: true,
            task_threads: 2,
            enable_debug_labels: true,
            print_timings: false,
        }
    }
}

impl DeviceConfig {
    /// Configuration suited to unit tests: tiny pools, inline worker.
    #[must_use]
    pub fn headless_test() -> Self {
        Self {
            staging_ring_size: 1 << 20,
            staging_page_size: 4096,
            temp_buffer_floor: 4 << 10,
            temp_pool_budget: 8 << 20,
            max_objects: 1024,
            enable_worker_thread: false,
            task_threads: 1,
            enable_debug_labels: false,
            print_timings: false,
        }
    }
}
