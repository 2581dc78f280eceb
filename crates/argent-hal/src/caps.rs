/// Subset of driver limits and features the RHI core branches on.
#[derive(Debug, Clone, Copy)]
pub struct DriverCapabilities {
    /// Buffers expose a direct GPU virtual address (`NativeBuffer::gpu_address`).
    pub gpu_addresses: bool,
    /// The driver supports argument-buffer binding (packed resource blobs).
    pub argument_buffers: bool,
    /// Minimum alignment for sub-buffer bindings and scratch allocations.
    pub min_alignment: u64,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            gpu_addresses: true,
            argument_buffers: true,
            min_alignment: 16,
        }
    }
}
