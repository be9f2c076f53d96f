/*!
Collector stub for tests without a broker

Records every submission so tests can assert on clusters, nodes and
parameter sets. Clones share the same record.
*/

use xrdmon_core::sinks::{Collector, CollectorError};
use xrdmon_core::state::{new_state, Shared};
use xrdmon_core::Report;

#[derive(Debug, Clone, PartialEq)]
pub enum CollectorCall {
    Parameters { cluster: String, node: String, params: Report },
    MonitorHost { cluster: String, node: String },
    AddJob { pid: u32, cluster: String, node: String },
    RemoveJob { pid: u32 },
}

#[derive(Default)]
struct Record {
    calls: Vec<CollectorCall>,
    failing: bool,
}

/// Mock collector recording every call
#[derive(Clone, Default)]
pub struct MockCollector {
    record: Shared<Record>,
}

impl MockCollector {
    pub fn new() -> Self {
        Self {
            record: new_state(Record::default()),
        }
    }

    /// Make `send_parameters` fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.record.lock().failing = failing;
    }

    pub fn calls(&self) -> Vec<CollectorCall> {
        self.record.lock().calls.clone()
    }

    /// Parameter sets submitted under `cluster`, in order
    pub fn parameters_for(&self, cluster: &str) -> Vec<Report> {
        self.record
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                CollectorCall::Parameters { cluster: c, params, .. } if c == cluster => Some(params.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pids currently registered for process monitoring
    pub fn jobs(&self) -> Vec<u32> {
        let mut jobs = Vec::new();
        for call in self.record.lock().calls.iter() {
            match call {
                CollectorCall::AddJob { pid, .. } => jobs.push(*pid),
                CollectorCall::RemoveJob { pid } => jobs.retain(|job| job != pid),
                _ => {}
            }
        }
        jobs
    }

    pub fn clear(&self) {
        self.record.lock().calls.clear();
    }

    fn push(&self, call: CollectorCall) {
        tracing::debug!("[MOCK] collector call {:?}", call);
        self.record.lock().calls.push(call);
    }
}

impl Collector for MockCollector {
    fn send_parameters(&mut self, cluster: &str, node: &str, params: &Report) -> Result<(), CollectorError> {
        if self.record.lock().failing {
            return Err(CollectorError::Publish {
                destination: "mock".to_string(),
                reason: "collector stub set to fail".to_string(),
            });
        }
        self.push(CollectorCall::Parameters {
            cluster: cluster.to_string(),
            node: node.to_string(),
            params: params.clone(),
        });
        Ok(())
    }

    fn monitor_host(&mut self, cluster: &str, node: &str) -> Result<(), CollectorError> {
        self.push(CollectorCall::MonitorHost {
            cluster: cluster.to_string(),
            node: node.to_string(),
        });
        Ok(())
    }

    fn add_job(&mut self, pid: u32, cluster: &str, node: &str) -> Result<(), CollectorError> {
        self.push(CollectorCall::AddJob {
            pid,
            cluster: cluster.to_string(),
            node: node.to_string(),
        });
        Ok(())
    }

    fn remove_job(&mut self, pid: u32) -> Result<(), CollectorError> {
        self.push(CollectorCall::RemoveJob { pid });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrdmon_core::MalformedPolicy;

    #[test]
    fn test_jobs_follow_add_and_remove() {
        let mut collector = MockCollector::new();
        collector.add_job(1, "c", "n").unwrap();
        collector.add_job(2, "c", "n").unwrap();
        collector.remove_job(1).unwrap();
        assert_eq!(collector.jobs(), vec![2]);
    }

    #[test]
    fn test_failing_collector() {
        let mut collector = MockCollector::new();
        let report = Report::parse("a=1", MalformedPolicy::FailFast).unwrap();
        collector.set_failing(true);
        assert!(collector.send_parameters("c", "n", &report).is_err());
        collector.set_failing(false);
        collector.send_parameters("c", "n", &report).unwrap();
        assert_eq!(collector.parameters_for("c"), vec![report]);
        assert!(collector.parameters_for("other").is_empty());
    }
}
