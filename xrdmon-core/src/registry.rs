//! Target registry
//!
//! Taps the report stream, discovers daemons from their identification keys
//! and tracks them until their process disappears. Every change is returned
//! as a [`TargetEvent`] so the caller can forward it to the pipeline.

use crate::liveness::LivenessProbe;
use crate::report::Report;
use crate::target::{SpaceQuery, Target, TargetId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Change in the set of monitored daemons
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEvent {
    Inserted(Target),
    Removed(Target),
}

impl TargetEvent {
    pub fn target(&self) -> &Target {
        match self {
            TargetEvent::Inserted(target) | TargetEvent::Removed(target) => target,
        }
    }
}

/// Sole owner of the known [`Target`]s
pub struct TargetRegistry {
    probe: Arc<dyn LivenessProbe>,
    targets: BTreeMap<TargetId, Target>,
}

impl TargetRegistry {
    pub fn new(probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            probe,
            targets: BTreeMap::new(),
        }
    }

    /// Classify one report and sweep dead targets
    ///
    /// The report itself is never modified.
    pub fn observe(&mut self, report: &Report) -> Vec<TargetEvent> {
        let mut events = Vec::new();

        if report.contains_key("pgm") {
            match Target::from_report(report) {
                Ok(target) => {
                    if !self.targets.contains_key(target.id()) && target.is_alive(self.probe.as_ref()) {
                        info!("new target: {}", target);
                        self.targets.insert(target.id().clone(), target.clone());
                        events.push(TargetEvent::Inserted(target));
                    }
                }
                Err(e) => warn!("cannot derive target from report: {}", e),
            }
        }

        let probe = self.probe.as_ref();
        let dead: Vec<TargetId> = self
            .targets
            .values()
            .filter(|target| !target.is_alive(probe))
            .map(|target| target.id().clone())
            .collect();
        for id in dead {
            if let Some(target) = self.targets.remove(&id) {
                info!("target gone: {}", target);
                events.push(TargetEvent::Removed(target));
            }
        }

        events
    }

    /// Read-only view of the current targets, in identity order
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.targets.contains_key(target.id())
    }

    /// Refresh stale space caches of all `xrootd` targets
    pub async fn refresh_space(&mut self, query: &SpaceQuery) {
        for target in self.targets.values_mut() {
            if let Err(e) = target.ensure_space(query).await {
                warn!("space query for {} failed: {}", target, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MalformedPolicy;
    use crate::target::Flavour;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct SwitchProbe {
        alive: Mutex<HashSet<u32>>,
    }

    impl SwitchProbe {
        fn set(&self, pid: u32, alive: bool) {
            let mut set = self.alive.lock();
            if alive {
                set.insert(pid);
            } else {
                set.remove(&pid);
            }
        }
    }

    impl LivenessProbe for SwitchProbe {
        fn is_alive(&self, pid: u32, _name: Option<&str>) -> bool {
            self.alive.lock().contains(&pid)
        }
    }

    fn parse(line: &str) -> Report {
        Report::parse(line, MalformedPolicy::FailFast).unwrap()
    }

    const XROOTD: &str = "pgm=xrootd&ins=server1&pid=4321&ver=4.8.1&info.port=1094";

    #[test]
    fn test_insert_once() {
        let probe = Arc::new(SwitchProbe::default());
        probe.set(4321, true);
        let mut registry = TargetRegistry::new(probe.clone());

        let events = registry.observe(&parse(XROOTD));
        assert_eq!(events.len(), 1);
        let TargetEvent::Inserted(target) = &events[0] else {
            panic!("expected insert, got {:?}", events[0]);
        };
        assert_eq!(target.flavour(), Flavour::Xrootd);
        assert_eq!(target.name(), "server1");
        assert_eq!(target.pid(), 4321);
        assert_eq!(target.port(), Some(1094));

        // same identity, newer version
        let again = parse("pgm=xrootd&ins=server1&pid=4321&ver=5.0&info.port=1094");
        assert!(registry.observe(&again).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_report_without_pgm_changes_nothing() {
        let probe = Arc::new(SwitchProbe::default());
        probe.set(4321, true);
        let mut registry = TargetRegistry::new(probe);
        registry.observe(&parse(XROOTD));

        let report = parse("a=1&b=2");
        let before = report.clone();
        assert!(registry.observe(&report).is_empty());
        assert_eq!(report, before);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dead_process_is_not_registered() {
        let probe = Arc::new(SwitchProbe::default());
        let mut registry = TargetRegistry::new(probe);
        assert!(registry.observe(&parse(XROOTD)).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_removed_exactly_once() {
        let probe = Arc::new(SwitchProbe::default());
        probe.set(4321, true);
        let mut registry = TargetRegistry::new(probe.clone());
        registry.observe(&parse(XROOTD));

        probe.set(4321, false);
        let events = registry.observe(&parse("a=1"));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TargetEvent::Removed(t) if t.pid() == 4321));
        assert!(registry.observe(&parse("a=1")).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_flavour_is_ignored() {
        let probe = Arc::new(SwitchProbe::default());
        probe.set(1, true);
        let mut registry = TargetRegistry::new(probe);
        let events = registry.observe(&parse("pgm=frm&ins=x&pid=1&ver=1"));
        assert!(events.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_distinct_ports_are_distinct_targets() {
        let probe = Arc::new(SwitchProbe::default());
        probe.set(7, true);
        let mut registry = TargetRegistry::new(probe);
        registry.observe(&parse("pgm=cmsd&ins=a&pid=7&ver=1&info.port=1"));
        registry.observe(&parse("pgm=cmsd&ins=a&pid=7&ver=1&info.port=2"));
        assert_eq!(registry.len(), 2);
        let first = registry.targets().next().unwrap().clone();
        assert!(registry.contains(&first));
    }
}
