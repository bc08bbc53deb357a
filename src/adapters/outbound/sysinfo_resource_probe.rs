//! Sysinfo Resource Probe
//!
//! Implements ResourceProbe using the sysinfo crate, plus procfs counts for
//! descriptors and sockets on Linux.

use crate::domain::ports::ResourceProbe;
use sysinfo::{Pid, System};

/// Resource probe backed by `sysinfo`.
///
/// Keeps one `System` between samples so CPU usage is measured as the delta
/// since the previous sample. The first CPU reading is therefore 0.
pub struct SysinfoResourceProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoResourceProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("cannot resolve current pid, process metrics disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoResourceProbe {
    fn cpu_percent(&mut self) -> Result<f64, String> {
        self.system.refresh_cpu();
        Ok(self.system.global_cpu_info().cpu_usage() as f64)
    }

    fn memory_percent(&mut self) -> Result<f64, String> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err("total memory reported as zero".to_string());
        }
        Ok(self.system.used_memory() as f64 / total as f64 * 100.0)
    }

    fn process_memory(&mut self) -> Result<(u64, u64), String> {
        let pid = self.pid.ok_or_else(|| "current pid unknown".to_string())?;
        if !self.system.refresh_process(pid) {
            return Err(format!("process {} not found", pid));
        }
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| format!("process {} not found", pid))?;
        Ok((process.memory(), process.virtual_memory()))
    }

    fn open_files(&mut self) -> Result<u64, String> {
        open_file_count()
    }

    fn network_connections(&mut self) -> Result<u64, String> {
        socket_count()
    }
}

#[cfg(target_os = "linux")]
fn open_file_count() -> Result<u64, String> {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count() as u64)
        .map_err(|e| format!("cannot list /proc/self/fd: {}", e))
}

#[cfg(not(target_os = "linux"))]
fn open_file_count() -> Result<u64, String> {
    Err("open file count unsupported on this platform".to_string())
}

#[cfg(target_os = "linux")]
fn socket_count() -> Result<u64, String> {
    let mut total = 0;
    let mut readable = false;
    for table in ["/proc/net/tcp", "/proc/net/tcp6", "/proc/net/udp", "/proc/net/udp6"] {
        if let Ok(contents) = std::fs::read_to_string(table) {
            readable = true;
            // First line is the column header
            total += contents.lines().skip(1).filter(|l| !l.trim().is_empty()).count() as u64;
        }
    }
    if readable {
        Ok(total)
    } else {
        Err("no readable socket tables under /proc/net".to_string())
    }
}

#[cfg(not(target_os = "linux"))]
fn socket_count() -> Result<u64, String> {
    Err("network connection count unsupported on this platform".to_string())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_memory_percent_in_range() {
        let mut probe = SysinfoResourceProbe::new();
        if let Ok(pct) = probe.memory_percent() {
            assert!((0.0..=100.0).contains(&pct));
        }
    }

    #[test]
    fn test_cpu_percent_non_negative() {
        let mut probe = SysinfoResourceProbe::new();
        let pct = probe.cpu_percent().unwrap();
        assert!(pct >= 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_metrics_on_linux() {
        let mut probe = SysinfoResourceProbe::new();
        let (rss, vms) = probe.process_memory().unwrap();
        assert!(rss > 0);
        assert!(vms >= rss);
        assert!(probe.open_files().unwrap() > 0);
    }
}
