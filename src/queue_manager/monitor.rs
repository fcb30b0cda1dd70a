//! Host sampling for the queue manager

use serde::Serialize;
use std::path::Path;
use sysinfo::{Disks, System};

/// One reading of host resources relevant to the queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSample {
    /// Resident memory of this process
    pub process_memory_bytes: u64,
    pub filesystem_free_bytes: u64,
    pub filesystem_used_bytes: u64,
    /// Queue directory sits on tmpfs, so queued bytes are RAM
    pub queue_in_memory: bool,
}

/// Source of host readings
pub trait SystemProbe: Send + Sync {
    fn sample(&self, queue_path: &Path) -> SystemSample;
}

/// sysinfo-backed probe
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl SysinfoProbe {
    pub fn new() -> Self {
        Self
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self, queue_path: &Path) -> SystemSample {
        let mut sample = SystemSample::default();

        if let Ok(pid) = sysinfo::get_current_pid() {
            let mut sys = System::new();
            sys.refresh_process(pid);
            if let Some(process) = sys.process(pid) {
                sample.process_memory_bytes = process.memory();
            }
        }

        // Longest mount point that prefixes the queue path
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| queue_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        if let Some(disk) = disk {
            sample.filesystem_free_bytes = disk.available_space();
            sample.filesystem_used_bytes = disk.total_space().saturating_sub(disk.available_space());
            sample.queue_in_memory = disk.file_system().to_string_lossy() == "tmpfs";
        }

        sample
    }
}
