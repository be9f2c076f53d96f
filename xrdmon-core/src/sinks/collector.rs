//! Remote monitoring collector sink
//!
//! Reports are submitted as named parameter sets tagged with a cluster and a
//! node name:
//! - `<group>_xrootd_ApMon_Info`: every report as is
//! - `<group>_<ins>_<pgm>_Services`: storage space of `xrootd` daemons
//! - `<group>_xrootd_SysInfo`: host self-monitoring
//!
//! Daemon processes are registered for process monitoring once and
//! deregistered when their pid is gone.

use super::sysmon::{HostMetrics, ProcessMetrics};
use crate::counter::{PathShares, SharePool};
use crate::liveness::LivenessProbe;
use crate::pipeline::{Flow, Link, LinkError};
use crate::report::{Report, Value};
use crate::state::{new_state, Shared};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Errors raised by a collector
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("invalid collector destination {0:?}, expected host:port")]
    InvalidDestination(String),
    #[error("failed to publish to {destination}: {reason}")]
    Publish { destination: String, reason: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client of a remote monitoring collector
pub trait Collector: Send {
    /// Submit one parameter set
    fn send_parameters(&mut self, cluster: &str, node: &str, params: &Report) -> Result<(), CollectorError>;

    /// Start background monitoring of the local host
    fn monitor_host(&mut self, cluster: &str, node: &str) -> Result<(), CollectorError>;

    /// Start background monitoring of a daemon process
    fn add_job(&mut self, pid: u32, cluster: &str, node: &str) -> Result<(), CollectorError>;

    /// Stop monitoring a daemon process
    fn remove_job(&mut self, pid: u32) -> Result<(), CollectorError>;
}

/// Sink submitting reports to a [`Collector`]
pub struct CollectorSink<C: Collector> {
    collector: C,
    host_group: String,
    hostname: String,
    scale_space: f64,
    probe: Arc<dyn LivenessProbe>,
    shares: Option<PathShares>,
    jobs: BTreeSet<u32>,
}

impl<C: Collector> CollectorSink<C> {
    /// Sink for the cluster group `host_group`; starts host monitoring
    pub fn new(collector: C, host_group: impl Into<String>, probe: Arc<dyn LivenessProbe>) -> Result<Self, CollectorError> {
        Self::with_hostname(collector, host_group, crate::counter::host_identity(), probe)
    }

    pub fn with_hostname(
        mut collector: C,
        host_group: impl Into<String>,
        hostname: impl Into<String>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Self, CollectorError> {
        let host_group = host_group.into();
        let hostname = hostname.into();
        collector.monitor_host(&format!("{}_xrootd_SysInfo", host_group), &hostname)?;
        Ok(Self {
            collector,
            host_group,
            hostname,
            scale_space: 1.0,
            probe,
            shares: None,
            jobs: BTreeSet::new(),
        })
    }

    /// Additional divisor for space figures, on top of kiB -> MiB
    pub fn with_scale_space(mut self, scale_space: f64) -> Self {
        self.scale_space = scale_space;
        self
    }

    /// Also divide space figures by the number of hosts sharing the storage
    pub fn with_share_pool(mut self, pool: SharePool) -> Self {
        self.shares = Some(PathShares::new(pool));
        self
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub fn jobs(&self) -> impl Iterator<Item = u32> + '_ {
        self.jobs.iter().copied()
    }

    fn info_cluster(&self) -> String {
        format!("{}_xrootd_ApMon_Info", self.host_group)
    }

    fn services_cluster(&self, report: &Report) -> Result<String, LinkError> {
        let field = |key: &str| {
            report
                .get(key)
                .map(Value::to_string)
                .ok_or_else(|| LinkError::MissingKey(key.to_string()))
        };
        Ok(format!("{}_{}_{}_Services", self.host_group, field("ins")?, field("pgm")?))
    }

    fn monitor_service(&mut self, report: &Report) -> Result<(), LinkError> {
        let (Some(_), Some(pid)) = (report.get("pgm"), report.get_i64("pid")) else {
            return Ok(());
        };
        if let Ok(pid) = u32::try_from(pid) {
            if !self.jobs.contains(&pid) {
                let cluster = self.services_cluster(report)?;
                self.collector.add_job(pid, &cluster, &self.hostname)?;
                self.jobs.insert(pid);
                info!("collector job monitor for {} added", cluster);
            }
        }

        let probe = self.probe.clone();
        let dead: Vec<u32> = self.jobs.iter().copied().filter(|pid| !probe.is_alive(*pid, None)).collect();
        for pid in dead {
            self.collector.remove_job(pid)?;
            self.jobs.remove(&pid);
            debug!("collector job monitor for pid {} removed", pid);
        }
        Ok(())
    }

    fn share(&mut self, report: &Report) -> usize {
        let Some(shares) = self.shares.as_mut() else {
            return 1;
        };
        let paths = report
            .iter()
            .filter(|(key, _)| key.starts_with("oss.paths.") && key.ends_with(".rp"))
            .map(|(_, path)| path.to_string());
        shares.observe(paths)
    }

    fn report_xrootd_space(&mut self, report: &Report) -> Result<(), LinkError> {
        let Some(count) = report.get_i64("oss.space") else {
            warn!("missing key group 'oss.space.*' in report, skipping storage space report");
            return Ok(());
        };

        let sum = |suffix: &str| -> Result<f64, LinkError> {
            (0..count).try_fold(0.0, |total, index| {
                let key = format!("oss.space.{}.{}", index, suffix);
                report
                    .get_f64(&key)
                    .map(|value| total + value)
                    .ok_or(LinkError::MissingKey(key))
            })
        };
        // reports are in kiB, collectors expect MiB
        let divisor = self.scale_space * 1024.0 * self.share(report) as f64;

        let mut space = Report::new();
        space.insert(
            "xrootd_version",
            report.get("ver").cloned().unwrap_or_else(|| Value::from("")),
        );
        space.insert("space_total", sum("tot")? / divisor);
        space.insert("space_free", sum("free")? / divisor);
        space.insert("space_largestfreechunk", sum("maxf")? / divisor);

        let cluster = self.services_cluster(report)?;
        self.collector.send_parameters(&cluster, &self.hostname, &space)?;
        info!("collector xrootd space report for {} sent", cluster);
        Ok(())
    }
}

impl<C: Collector> Link for CollectorSink<C> {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        self.monitor_service(&report)?;
        if report.get("pgm").and_then(Value::as_str) == Some("xrootd") {
            self.report_xrootd_space(&report)?;
        }
        let cluster = self.info_cluster();
        self.collector.send_parameters(&cluster, &self.hostname, &report)?;
        debug!("collector report for {} sent", cluster);
        Ok(Flow::Done)
    }

    fn describe(&self) -> String {
        format!("CollectorSink(group={}, node={})", self.host_group, self.hostname)
    }
}

/// Message published for every parameter set
#[derive(Debug, Serialize)]
struct ParameterMessage<'a, P: Serialize> {
    cluster: &'a str,
    node: &'a str,
    timestamp: DateTime<Utc>,
    params: &'a P,
}

/// Connection settings of [`MqttCollector`]
#[derive(Debug, Clone)]
pub struct MqttCollectorConfig {
    /// Brokers as `host:port`
    pub destinations: Vec<String>,
    pub topic_prefix: String,
    pub client_id: String,
    /// Period of host and process self-monitoring
    pub monitor_interval: Duration,
}

impl Default for MqttCollectorConfig {
    fn default() -> Self {
        Self {
            destinations: vec!["localhost:1883".to_string()],
            topic_prefix: "xrdmon".to_string(),
            client_id: format!("xrdmon-{}", uuid::Uuid::new_v4()),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    cluster: String,
    node: String,
}

/// Background monitoring targets
#[derive(Debug, Default)]
struct Monitored {
    host: Option<Job>,
    jobs: BTreeMap<u32, Job>,
}

/// Publishes parameter sets as JSON to every configured MQTT broker
pub struct MqttCollector {
    clients: Vec<(String, AsyncClient)>,
    topic_prefix: String,
    monitored: Shared<Monitored>,
    tasks: Vec<JoinHandle<()>>,
}

fn parse_destination(destination: &str) -> Result<(String, u16), CollectorError> {
    let invalid = || CollectorError::InvalidDestination(destination.to_string());
    let (host, port) = destination.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

impl MqttCollector {
    /// Connect to every destination; must run inside a tokio runtime
    pub fn new(config: MqttCollectorConfig) -> Result<Self, CollectorError> {
        let mut clients = Vec::new();
        let mut tasks = Vec::new();

        for (index, destination) in config.destinations.iter().enumerate() {
            let (host, port) = parse_destination(destination)?;
            let mut options = MqttOptions::new(format!("{}-{}", config.client_id, index), host, port);
            options.set_keep_alive(Duration::from_secs(30));
            options.set_clean_session(true);
            let (client, mut eventloop) = AsyncClient::new(options, 100);

            let name = destination.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("connected to collector {}", name),
                        Ok(_) => {}
                        Err(e) => {
                            error!("collector connection error on {}: {}", name, e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }));
            clients.push((destination.clone(), client));
        }

        let mut collector = Self {
            clients,
            topic_prefix: config.topic_prefix,
            monitored: new_state(Monitored::default()),
            tasks,
        };
        let monitor = collector.spawn_monitor(config.monitor_interval);
        collector.tasks.push(monitor);
        Ok(collector)
    }

    fn topic(prefix: &str, cluster: &str, node: &str) -> String {
        format!("{}/{}/{}", prefix, cluster, node)
    }

    fn publish<P: Serialize>(
        clients: &[(String, AsyncClient)],
        prefix: &str,
        cluster: &str,
        node: &str,
        params: &P,
    ) -> Result<(), CollectorError> {
        let message = ParameterMessage {
            cluster,
            node,
            timestamp: Utc::now(),
            params,
        };
        let payload = serde_json::to_vec(&message)?;
        let topic = Self::topic(prefix, cluster, node);

        let mut failure = None;
        for (destination, client) in clients {
            if let Err(e) = client.try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload.clone()) {
                warn!("publish to {} failed: {}", destination, e);
                failure = Some(CollectorError::Publish {
                    destination: destination.clone(),
                    reason: e.to_string(),
                });
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Periodic host and process metrics
    fn spawn_monitor(&self, period: Duration) -> JoinHandle<()> {
        let clients = self.clients.clone();
        let prefix = self.topic_prefix.clone();
        let monitored = self.monitored.clone();

        tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let (host, jobs) = {
                    let monitored = monitored.lock();
                    (monitored.host.clone(), monitored.jobs.clone())
                };

                if let Some(host) = host {
                    let metrics = HostMetrics::collect(&mut sys);
                    if let Err(e) = Self::publish(&clients, &prefix, &host.cluster, &host.node, &metrics) {
                        debug!("host metrics not published: {}", e);
                    }
                }
                for (pid, job) in jobs {
                    let Some(metrics) = ProcessMetrics::collect(&mut sys, pid) else {
                        continue;
                    };
                    if let Err(e) = Self::publish(&clients, &prefix, &job.cluster, &job.node, &metrics) {
                        debug!("process metrics of {} not published: {}", pid, e);
                    }
                }
            }
        })
    }

    /// Pids currently monitored in the background
    pub fn jobs(&self) -> Vec<u32> {
        self.monitored.lock().jobs.keys().copied().collect()
    }
}

impl Collector for MqttCollector {
    fn send_parameters(&mut self, cluster: &str, node: &str, params: &Report) -> Result<(), CollectorError> {
        Self::publish(&self.clients, &self.topic_prefix, cluster, node, params)
    }

    fn monitor_host(&mut self, cluster: &str, node: &str) -> Result<(), CollectorError> {
        self.monitored.lock().host = Some(Job {
            cluster: cluster.to_string(),
            node: node.to_string(),
        });
        Ok(())
    }

    fn add_job(&mut self, pid: u32, cluster: &str, node: &str) -> Result<(), CollectorError> {
        self.monitored.lock().jobs.insert(
            pid,
            Job {
                cluster: cluster.to_string(),
                node: node.to_string(),
            },
        );
        Ok(())
    }

    fn remove_job(&mut self, pid: u32) -> Result<(), CollectorError> {
        self.monitored.lock().jobs.remove(&pid);
        Ok(())
    }
}

impl Drop for MqttCollector {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MalformedPolicy;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Calls {
        params: Vec<(String, String, Report)>,
        host: Option<(String, String)>,
        added: Vec<(u32, String)>,
        removed: Vec<u32>,
    }

    #[derive(Clone, Default)]
    struct Recording(Shared<Calls>);

    impl Collector for Recording {
        fn send_parameters(&mut self, cluster: &str, node: &str, params: &Report) -> Result<(), CollectorError> {
            self.0.lock().params.push((cluster.to_string(), node.to_string(), params.clone()));
            Ok(())
        }

        fn monitor_host(&mut self, cluster: &str, node: &str) -> Result<(), CollectorError> {
            self.0.lock().host = Some((cluster.to_string(), node.to_string()));
            Ok(())
        }

        fn add_job(&mut self, pid: u32, cluster: &str, _node: &str) -> Result<(), CollectorError> {
            self.0.lock().added.push((pid, cluster.to_string()));
            Ok(())
        }

        fn remove_job(&mut self, pid: u32) -> Result<(), CollectorError> {
            self.0.lock().removed.push(pid);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Pids(Mutex<HashSet<u32>>);

    impl LivenessProbe for Pids {
        fn is_alive(&self, pid: u32, _name: Option<&str>) -> bool {
            self.0.lock().contains(&pid)
        }
    }

    fn sink(probe: Arc<Pids>) -> (CollectorSink<Recording>, Recording) {
        let recording = Recording::default();
        let sink = CollectorSink::with_hostname(recording.clone(), "SE", "node.example", probe).unwrap();
        (sink, recording)
    }

    const XROOTD: &str = "pgm=xrootd&ins=server1&pid=4321&ver=4.8.1&oss.space=2\
        &oss.space.0.tot=2048&oss.space.0.free=1024&oss.space.0.maxf=512\
        &oss.space.1.tot=2048&oss.space.1.free=1024&oss.space.1.maxf=512";

    #[test]
    fn test_host_monitoring_registered() {
        let (_sink, recording) = sink(Arc::new(Pids::default()));
        assert_eq!(
            recording.0.lock().host,
            Some(("SE_xrootd_SysInfo".to_string(), "node.example".to_string()))
        );
    }

    #[test]
    fn test_xrootd_report() {
        let probe = Arc::new(Pids::default());
        probe.0.lock().insert(4321);
        let (sink, recording) = sink(probe);
        let mut sink = sink.with_scale_space(2.0);

        let report = Report::parse(XROOTD, MalformedPolicy::FailFast).unwrap();
        assert_eq!(sink.send(report.clone()).unwrap(), Flow::Done);

        let calls = recording.0.lock();
        assert_eq!(calls.added, vec![(4321, "SE_server1_xrootd_Services".to_string())]);
        assert_eq!(calls.params.len(), 2);

        let (cluster, node, space) = &calls.params[0];
        assert_eq!(cluster, "SE_server1_xrootd_Services");
        assert_eq!(node, "node.example");
        assert_eq!(space.get("xrootd_version"), Some(&Value::from("4.8.1")));
        assert_eq!(space.get_f64("space_total"), Some(2.0));
        assert_eq!(space.get_f64("space_free"), Some(1.0));
        assert_eq!(space.get_f64("space_largestfreechunk"), Some(0.5));

        let (cluster, _, forwarded) = &calls.params[1];
        assert_eq!(cluster, "SE_xrootd_ApMon_Info");
        assert_eq!(forwarded, &report);
    }

    #[test]
    fn test_jobs_registered_once_and_removed() {
        let probe = Arc::new(Pids::default());
        probe.0.lock().insert(7);
        let (mut sink, recording) = sink(probe.clone());
        let report = Report::parse("pgm=cmsd&ins=mgr&pid=7", MalformedPolicy::FailFast).unwrap();

        sink.send(report.clone()).unwrap();
        sink.send(report).unwrap();
        assert_eq!(recording.0.lock().added.len(), 1);
        assert_eq!(sink.jobs().collect::<Vec<_>>(), vec![7]);

        probe.0.lock().clear();
        sink.send(Report::parse("a=1", MalformedPolicy::FailFast).unwrap()).unwrap();
        // reports without pgm/pid do not trigger the sweep
        assert!(recording.0.lock().removed.is_empty());
        sink.send(Report::parse("pgm=cmsd&ins=mgr&pid=8", MalformedPolicy::FailFast).unwrap())
            .unwrap();
        assert_eq!(recording.0.lock().removed, vec![7, 8]);
        assert!(sink.jobs().next().is_none());
    }

    #[test]
    fn test_missing_space_group_still_forwards() {
        let (mut sink, recording) = sink(Arc::new(Pids::default()));
        let report = Report::parse("pgm=xrootd&ins=s&pid=1&ver=5", MalformedPolicy::FailFast).unwrap();
        sink.send(report).unwrap();
        let calls = recording.0.lock();
        assert_eq!(calls.params.len(), 1);
        assert_eq!(calls.params[0].0, "SE_xrootd_ApMon_Info");
    }

    #[test]
    fn test_incomplete_space_group_fails() {
        let (mut sink, _) = sink(Arc::new(Pids::default()));
        let report = Report::parse("pgm=xrootd&ins=s&pid=1&ver=5&oss.space=1", MalformedPolicy::FailFast).unwrap();
        assert!(matches!(sink.send(report), Err(LinkError::MissingKey(ref key)) if key == "oss.space.0.tot"));
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(parse_destination("broker:1883").unwrap(), ("broker".to_string(), 1883));
        assert!(parse_destination("broker").is_err());
        assert!(parse_destination(":1883").is_err());
        assert!(parse_destination("broker:x").is_err());
    }

    #[tokio::test]
    async fn test_mqtt_collector_queues_without_broker() {
        let config = MqttCollectorConfig {
            destinations: vec!["127.0.0.1:1".to_string()],
            monitor_interval: Duration::from_secs(3600),
            ..MqttCollectorConfig::default()
        };
        let mut collector = MqttCollector::new(config).unwrap();
        let report = Report::parse("a=1", MalformedPolicy::FailFast).unwrap();
        collector.send_parameters("SE_xrootd_ApMon_Info", "node", &report).unwrap();

        collector.add_job(42, "SE_s_xrootd_Services", "node").unwrap();
        assert_eq!(collector.jobs(), vec![42]);
        collector.remove_job(42).unwrap();
        assert!(collector.jobs().is_empty());
    }
}
