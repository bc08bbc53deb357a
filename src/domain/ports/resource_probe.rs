//! Resource Probe Port
//!
//! Defines how the resource monitor reads process and host usage.

/// Source of process/host resource readings.
///
/// Each reading is independent: one failing metric must not prevent the
/// others from being collected.
pub trait ResourceProbe: Send {
    /// Host-wide CPU usage, 0-100
    fn cpu_percent(&mut self) -> Result<f64, String>;

    /// Host-wide memory usage, 0-100
    fn memory_percent(&mut self) -> Result<f64, String>;

    /// Resident and virtual memory of this process, in bytes
    fn process_memory(&mut self) -> Result<(u64, u64), String>;

    /// Open file descriptors held by this process
    fn open_files(&mut self) -> Result<u64, String>;

    /// Active network sockets on the host
    fn network_connections(&mut self) -> Result<u64, String>;
}
