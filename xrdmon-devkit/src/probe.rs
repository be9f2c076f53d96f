/*!
Liveness probe controlled by the test

Processes are declared alive with an optional name and killed at will.
*/

use std::collections::HashMap;
use xrdmon_core::state::{new_state, Shared};
use xrdmon_core::LivenessProbe;

#[derive(Clone, Default)]
pub struct FakeProbe {
    processes: Shared<HashMap<u32, Option<String>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self {
            processes: new_state(HashMap::new()),
        }
    }

    /// Declare `pid` alive under any name
    pub fn spawn(&self, pid: u32) -> &Self {
        self.processes.lock().insert(pid, None);
        self
    }

    /// Declare `pid` alive as `name`
    pub fn spawn_named(&self, pid: u32, name: &str) -> &Self {
        self.processes.lock().insert(pid, Some(name.to_string()));
        self
    }

    pub fn kill(&self, pid: u32) -> &Self {
        self.processes.lock().remove(&pid);
        self
    }

    pub fn kill_all(&self) {
        self.processes.lock().clear();
    }
}

impl LivenessProbe for FakeProbe {
    fn is_alive(&self, pid: u32, name: Option<&str>) -> bool {
        match (self.processes.lock().get(&pid), name) {
            (None, _) => false,
            (Some(Some(actual)), Some(expected)) => actual == expected,
            (Some(_), _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_checked() {
        let probe = FakeProbe::new();
        probe.spawn_named(10, "xrootd").spawn(11);
        assert!(probe.is_alive(10, Some("xrootd")));
        assert!(!probe.is_alive(10, Some("cmsd")));
        assert!(probe.is_alive(10, None));
        assert!(probe.is_alive(11, Some("cmsd")));
        probe.kill(10);
        assert!(!probe.is_alive(10, None));
    }
}
