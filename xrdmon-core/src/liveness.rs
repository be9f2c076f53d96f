//! Process liveness checks
//!
//! Answers "is process `pid` running and called `name`?". On Linux the answer
//! comes straight from `/proc/<pid>/comm`; other platforms go through `sysinfo`.

use std::path::PathBuf;

/// Liveness query used by the target registry and the collector sink
pub trait LivenessProbe: Send + Sync {
    /// Whether `pid` is running, optionally also checking its process name
    fn is_alive(&self, pid: u32, name: Option<&str>) -> bool;
}

/// Probe reading the process table of the local host
#[derive(Debug, Clone)]
pub struct ProcProbe {
    proc_root: PathBuf,
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl ProcProbe {
    /// Probe against an alternative procfs mount
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl LivenessProbe for ProcProbe {
    fn is_alive(&self, pid: u32, name: Option<&str>) -> bool {
        match self.process_name(pid) {
            Some(proc_name) => name.map_or(true, |expected| expected == proc_name),
            None => false,
        }
    }
}

impl ProcProbe {
    #[cfg(target_os = "linux")]
    fn process_name(&self, pid: u32) -> Option<String> {
        let comm = self.proc_root.join(pid.to_string()).join("comm");
        std::fs::read_to_string(comm)
            .ok()
            .map(|content| content.trim().to_string())
    }

    #[cfg(not(target_os = "linux"))]
    fn process_name(&self, pid: u32) -> Option<String> {
        let _ = &self.proc_root;
        let mut sys = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(pid);
        if !sys.refresh_process(pid) {
            return None;
        }
        sys.process(pid).map(|process| process.name().to_string())
    }
}

/// Check whether there is a process with `pid` and, if given, `name`
pub fn validate_process(pid: u32, name: Option<&str>) -> bool {
    ProcProbe::default().is_alive(pid, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(validate_process(std::process::id(), None));
    }

    #[test]
    fn test_name_mismatch() {
        assert!(!validate_process(std::process::id(), Some("definitely-not-this-test")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_fake_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("4321")).unwrap();
        std::fs::write(dir.path().join("4321").join("comm"), "xrootd\n").unwrap();

        let probe = ProcProbe::with_root(dir.path());
        assert!(probe.is_alive(4321, Some("xrootd")));
        assert!(probe.is_alive(4321, None));
        assert!(!probe.is_alive(4321, Some("cmsd")));
        assert!(!probe.is_alive(1234, None));
    }
}
