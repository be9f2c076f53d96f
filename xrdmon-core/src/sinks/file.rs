//! Plain text sink appending `key=value` blocks to a file

use crate::pipeline::{Flow, Link, LinkError, Update};
use crate::report::Report;
use crate::target::{Flavour, Target};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends one block per report, target change and update
///
/// A block is a sequence of `key=value` lines followed by an empty line.
/// Report blocks are sorted by key.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_block<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> std::io::Result<()>
    where
        K: std::fmt::Display,
        V: std::fmt::Display,
    {
        let mut block = String::new();
        for (key, value) in pairs {
            block.push_str(&format!("{}={}\n", key, value));
        }
        block.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(block.as_bytes())?;
        file.flush()
    }

    fn write_target(&self, change: &str, target: &Target) -> std::io::Result<()> {
        let port = target.port().map(|port| port.to_string()).unwrap_or_default();
        self.write_block([
            ("target", change.to_string()),
            ("name", target.name().to_string()),
            ("flavour", target.flavour().to_string()),
            ("pid", target.pid().to_string()),
            ("port", port),
        ])
    }
}

impl Link for FileSink {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        self.write_block(report.iter())?;
        Ok(Flow::Done)
    }

    fn insert_target(&mut self, target: &Target) -> Result<(), LinkError> {
        Ok(self.write_target("insert", target)?)
    }

    fn remove_target(&mut self, target: &Target) -> Result<(), LinkError> {
        Ok(self.write_target("remove", target)?)
    }

    fn summarize(&mut self, update: &Update<'_>) -> Result<Option<Report>, LinkError> {
        let mut content = vec![("update".to_string(), update.elapsed.as_secs_f64().to_string())];
        for target in update.targets.iter().filter(|t| t.flavour() == Flavour::Xrootd) {
            let name = target.name();
            content.push(("name".to_string(), name.to_string()));
            content.push((format!("{}.space_total", name), target.space_total().to_string()));
            content.push((format!("{}.space_free", name), target.space_free().to_string()));
            content.push((
                format!("{}.space_largestfreechunk", name),
                target.space_largest_free_chunk().to_string(),
            ));
        }
        self.write_block(content)?;
        Ok(None)
    }

    fn describe(&self) -> String {
        format!("FileSink({})", self.path.display())
    }
}
