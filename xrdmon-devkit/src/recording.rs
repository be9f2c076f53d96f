/*!
Recording sink

Captures every report, target event and update reaching its node. Clones
share the same record, so a test keeps one clone and hands the other to
the pipeline.
*/

use std::time::Duration;
use xrdmon_core::pipeline::{Flow, Link, LinkError, Update};
use xrdmon_core::state::{new_state, Shared};
use xrdmon_core::{Report, Target};

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Report(Report),
    Inserted(Target),
    Removed(Target),
    Update { elapsed: Duration, targets: Vec<Target> },
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    record: Shared<Vec<Recorded>>,
    forward: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            record: new_state(Vec::new()),
            forward: false,
        }
    }

    /// Forward reports downstream instead of terminating the branch
    pub fn forwarding(mut self) -> Self {
        self.forward = true;
        self
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.record.lock().clone()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.record
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Recorded::Report(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn inserted(&self) -> Vec<Target> {
        self.record
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Recorded::Inserted(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<Target> {
        self.record
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Recorded::Removed(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> usize {
        self.record
            .lock()
            .iter()
            .filter(|entry| matches!(entry, Recorded::Update { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.record.lock().clear();
    }
}

impl Link for RecordingSink {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        self.record.lock().push(Recorded::Report(report.clone()));
        Ok(if self.forward { Flow::Forward(report) } else { Flow::Done })
    }

    fn insert_target(&mut self, target: &Target) -> Result<(), LinkError> {
        self.record.lock().push(Recorded::Inserted(target.clone()));
        Ok(())
    }

    fn remove_target(&mut self, target: &Target) -> Result<(), LinkError> {
        self.record.lock().push(Recorded::Removed(target.clone()));
        Ok(())
    }

    fn summarize(&mut self, update: &Update<'_>) -> Result<Option<Report>, LinkError> {
        self.record.lock().push(Recorded::Update {
            elapsed: update.elapsed,
            targets: update.targets.iter().map(|target| (*target).clone()).collect(),
        });
        Ok(None)
    }

    fn describe(&self) -> String {
        "RecordingSink".to_string()
    }
}
