mod sysinfo_resource_probe;

pub use sysinfo_resource_probe::SysinfoResourceProbe;
