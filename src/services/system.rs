use std::ffi::OsStr;
use std::path::Path;
use sysinfo::{Disks, Pid, System};

/// Host queries used by the health checks and the instance lock
pub trait SystemProbe: Send + Sync {
    /// Bytes available to unprivileged users on the filesystem holding `path`
    fn available_space(&self, path: &Path) -> Option<u64>;

    fn process_running(&self, name: &str) -> bool;

    fn pid_alive(&self, pid: u32) -> bool;
}

/// `SystemProbe` backed by sysinfo
pub struct SysinfoProbe;

impl SystemProbe for SysinfoProbe {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point that prefixes the path owns it
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }

    fn process_running(&self, name: &str) -> bool {
        let system = System::new_all();
        let name = OsStr::new(name);
        system.processes().values().any(|process| process.name() == name)
    }

    fn pid_alive(&self, pid: u32) -> bool {
        let system = System::new_all();
        system.process(Pid::from_u32(pid)).is_some()
    }
}
