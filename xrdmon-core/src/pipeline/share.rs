//! Scaling of space reports by the number of hosts sharing the storage

use super::{Flow, Link, LinkError};
use crate::counter::{PathShares, SharePool};
use crate::report::{Report, Value};
use regex::Regex;

/// Divide shared space figures by the number of hosts serving the storage
///
/// Storage paths are read from keys matching `path_keys` (`oss.paths.N.rp`),
/// space figures are keys matching `space_keys` (`oss.space.N.{tot,free,maxf}`).
/// The divisor is the largest peer count over the report's paths, at least 1,
/// and is added to the report as `share.hosts`.
pub struct ShareScale {
    shares: PathShares,
    path_keys: Regex,
    space_keys: Regex,
}

impl ShareScale {
    pub const PATH_KEYS: &'static str = r"^oss\.paths\.\d+\.rp$";
    pub const SPACE_KEYS: &'static str = r"^oss\.space\.\d+\.(tot|free|maxf)$";
    pub const HOSTS_KEY: &'static str = "share.hosts";

    /// Scale with the default `oss.*` key layout
    pub fn new(pool: SharePool) -> Result<Self, regex::Error> {
        Self::with_keys(pool, Self::PATH_KEYS, Self::SPACE_KEYS)
    }

    pub fn with_keys(pool: SharePool, path_keys: &str, space_keys: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            shares: PathShares::new(pool),
            path_keys: Regex::new(path_keys)?,
            space_keys: Regex::new(space_keys)?,
        })
    }

    /// Number of hosts serving the paths of `report`
    fn share(&mut self, report: &Report) -> usize {
        let paths: Vec<String> = report
            .iter()
            .filter(|(key, _)| self.path_keys.is_match(key))
            .map(|(_, path)| path.to_string())
            .collect();
        self.shares.observe(paths)
    }
}

impl Link for ShareScale {
    fn send(&mut self, mut report: Report) -> Result<Flow, LinkError> {
        let share = self.share(&report);
        if share > 1 {
            let keys: Vec<String> = report
                .keys()
                .filter(|key| self.space_keys.is_match(key))
                .map(str::to_string)
                .collect();
            for key in keys {
                if let Some(value) = report.get_f64(&key) {
                    report.insert(key, Value::Float(value / share as f64));
                }
            }
        }
        report.insert(Self::HOSTS_KEY, share as i64);
        Ok(Flow::Forward(report))
    }

    fn describe(&self) -> String {
        format!(
            "ShareScale(paths={}, space={}, timeout={:?})",
            self.path_keys.as_str(),
            self.space_keys.as_str(),
            self.shares.pool().timeout()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{marker_path, DEFAULT_TIMEOUT};
    use crate::report::MalformedPolicy;
    use std::time::Duration;

    fn space_report(path: &std::path::Path) -> Report {
        let line = format!(
            "pgm=xrootd&oss.paths=1&oss.paths.0.rp={}&oss.space=1&oss.space.0.tot=1200&oss.space.0.free=600&oss.space.0.maxf=300&oss.space.0.fsn=public",
            path.display()
        );
        Report::parse(&line, MalformedPolicy::FailFast).unwrap()
    }

    fn forwarded(flow: Flow) -> Report {
        match flow {
            Flow::Forward(report) => report,
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_host_is_unscaled() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SharePool::new(DEFAULT_TIMEOUT);
        let mut scale = ShareScale::new(pool.clone()).unwrap();

        let report = forwarded(scale.send(space_report(dir.path())).unwrap());
        assert_eq!(report.get_i64("oss.space.0.tot"), Some(1200));
        assert_eq!(report.get_i64(ShareScale::HOSTS_KEY), Some(1));
        assert_eq!(pool.len(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_scaled_by_peer_markers() {
        let dir = tempfile::tempdir().unwrap();
        // two peers already serve the path
        std::fs::write(marker_path(dir.path(), "peer-1"), "peer-1 1").unwrap();
        std::fs::write(marker_path(dir.path(), "peer-2"), "peer-2 2").unwrap();

        let pool = SharePool::new(Duration::from_millis(400));
        let mut scale = ShareScale::new(pool.clone()).unwrap();
        forwarded(scale.send(space_report(dir.path())).unwrap());

        let mut report = Report::new();
        for _ in 0..100 {
            report = forwarded(scale.send(space_report(dir.path())).unwrap());
            if report.get_i64(ShareScale::HOSTS_KEY) == Some(3) {
                break;
            }
            // keep the foreign markers fresh
            std::fs::write(marker_path(dir.path(), "peer-1"), "peer-1 1").unwrap();
            std::fs::write(marker_path(dir.path(), "peer-2"), "peer-2 2").unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(report.get_i64(ShareScale::HOSTS_KEY), Some(3));
        assert_eq!(report.get_f64("oss.space.0.tot"), Some(400.0));
        assert_eq!(report.get_f64("oss.space.0.free"), Some(200.0));
        assert_eq!(report.get_f64("oss.space.0.maxf"), Some(100.0));
        assert_eq!(report.get("oss.space.0.fsn"), Some(&Value::from("public")));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_without_paths() {
        let pool = SharePool::new(DEFAULT_TIMEOUT);
        let mut scale = ShareScale::new(pool.clone()).unwrap();
        let report = Report::parse("oss.space.0.tot=10", MalformedPolicy::FailFast).unwrap();
        let report = forwarded(scale.send(report).unwrap());
        assert_eq!(report.get_i64("oss.space.0.tot"), Some(10));
        assert_eq!(report.get_i64(ShareScale::HOSTS_KEY), Some(1));
        assert!(pool.is_empty());
    }
}
