//! YAML configuration of the agent
//!
//! Handles:
//! - report producer and space query settings
//! - update period and malformed datagram policy
//! - the backend tree fed by the reports

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xrdmon_core::pipeline::TemplateError;
use xrdmon_core::sinks::{CollectorError, Transport};
use xrdmon_core::{MalformedPolicy, PipelineError, SpaceQuery, Value};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("{0} is a sink and cannot have `then` children")]
    SinkWithChildren(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Top level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port of the daemon summary reports
    pub port: u16,
    pub update_interval_secs: u64,
    pub malformed: MalformedPolicy,
    pub source: SourceConfig,
    pub space_query: SpaceQueryConfig,
    pub share: ShareConfig,
    pub backends: Vec<NodeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1094,
            update_interval_secs: 60,
            malformed: MalformedPolicy::default(),
            source: SourceConfig::default(),
            space_query: SpaceQueryConfig::default(),
            share: ShareConfig::default(),
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub program: PathBuf,
    /// `{port}` is replaced by the configured port
    pub args: Vec<String>,
    pub grace_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mpxstats"),
            args: ["-p", "{port}", "-f", "cgi"].iter().map(|s| s.to_string()).collect(),
            grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpaceQueryConfig {
    pub program: PathBuf,
    pub ttl_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SpaceQueryConfig {
    fn default() -> Self {
        let query = SpaceQuery::default();
        Self {
            program: query.program,
            ttl_secs: query.ttl.as_secs(),
            timeout_secs: query.timeout.as_secs(),
        }
    }
}

impl SpaceQueryConfig {
    pub fn to_query(&self) -> SpaceQuery {
        SpaceQuery {
            program: self.program.clone(),
            ttl: Duration::from_secs(self.ttl_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Age after which a peer marker no longer counts
    pub timeout_secs: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            timeout_secs: xrdmon_core::counter::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

/// One node of the backend tree
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Nodes fed by this one
    #[serde(default)]
    pub then: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    KeyFilter {
        allow: Option<String>,
        deny: Option<String>,
    },
    Format {
        template: Option<String>,
    },
    Translate {
        mapping: BTreeMap<String, String>,
        #[serde(default = "default_true")]
        cull_unknown: bool,
    },
    Block {
        /// Block everything when absent
        when: Option<ConditionConfig>,
    },
    ShareScale,
    Log {
        label: Option<String>,
    },
    File {
        path: PathBuf,
    },
    LineProtocol {
        #[serde(default)]
        transport: Transport,
        address: String,
        name: Option<String>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
        #[serde(default)]
        tag_keys: Vec<String>,
        fields: Option<Vec<String>>,
        resolution_secs: Option<f64>,
        #[serde(default)]
        summary: bool,
    },
    Collector {
        group: String,
        #[serde(default)]
        destinations: Vec<String>,
        topic_prefix: Option<String>,
        monitor_interval_secs: Option<u64>,
        #[serde(default = "default_scale")]
        scale_space: f64,
        /// Divide space by the number of hosts sharing the storage paths
        #[serde(default)]
        share: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum ConditionConfig {
    Has { key: String },
    Missing { key: String },
    Equals { key: String, value: Value },
    Matches { key: String, pattern: String },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::KeyFilter { .. } => "key_filter",
            NodeKind::Format { .. } => "format",
            NodeKind::Translate { .. } => "translate",
            NodeKind::Block { .. } => "block",
            NodeKind::ShareScale => "share_scale",
            NodeKind::Log { .. } => "log",
            NodeKind::File { .. } => "file",
            NodeKind::LineProtocol { .. } => "line_protocol",
            NodeKind::Collector { .. } => "collector",
        }
    }

    pub fn is_sink(&self) -> bool {
        matches!(
            self,
            NodeKind::File { .. } | NodeKind::LineProtocol { .. } | NodeKind::Collector { .. }
        )
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn share_timeout(&self) -> Duration {
        Duration::from_secs(self.share.timeout_secs)
    }

    /// Check settings and compile every pattern and template of the backend tree
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_interval_secs == 0 {
            return Err(ConfigError::Invalid("update_interval_secs must be positive".into()));
        }
        if self.share.timeout_secs == 0 {
            return Err(ConfigError::Invalid("share.timeout_secs must be positive".into()));
        }
        if self.source.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("source.program is empty".into()));
        }
        let mut stack: Vec<&NodeConfig> = self.backends.iter().collect();
        while let Some(node) = stack.pop() {
            if node.kind.is_sink() && !node.then.is_empty() {
                return Err(ConfigError::SinkWithChildren(node.kind.name().to_string()));
            }
            crate::backends::check(&node.kind)?;
            stack.extend(node.then.iter());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
port: 2094
update_interval_secs: 30
malformed: skip
source:
  grace_ms: 100
backends:
  - kind: key_filter
    allow: "^oss\\."
    then:
      - kind: line_protocol
        address: "localhost:8094"
        tags: { site: T2_TEST }
        tag_keys: [ins]
  - kind: block
    when: { test: equals, key: pgm, value: cmsd }
    then:
      - kind: file
        path: /tmp/xrdmon.txt
  - kind: collector
    group: T2_TEST
    destinations: ["collector.example.org:1883"]
    share: true
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.port, 1094);
        assert_eq!(config.update_interval(), Duration::from_secs(60));
        assert_eq!(config.malformed, MalformedPolicy::FailFast);
        assert_eq!(config.source.program, PathBuf::from("mpxstats"));
        assert_eq!(config.space_query.ttl_secs, 300);
        assert_eq!(config.share_timeout(), Duration::from_secs(300));
        assert!(config.backends.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.port, 2094);
        assert_eq!(config.malformed, MalformedPolicy::Skip);
        assert_eq!(config.source.grace_ms, 100);
        assert_eq!(config.source.args.len(), 4);
        assert_eq!(config.backends.len(), 3);

        let filter = &config.backends[0];
        assert!(matches!(&filter.kind, NodeKind::KeyFilter { allow: Some(allow), deny: None } if allow == r"^oss\."));
        match &filter.then[0].kind {
            NodeKind::LineProtocol { transport, tags, tag_keys, .. } => {
                assert_eq!(*transport, Transport::Udp);
                assert_eq!(tags.get("site").map(String::as_str), Some("T2_TEST"));
                assert_eq!(tag_keys, &vec!["ins".to_string()]);
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(matches!(
            &config.backends[1].kind,
            NodeKind::Block { when: Some(ConditionConfig::Equals { key, value: Value::Str(value) }) }
                if key == "pgm" && value == "cmsd"
        ));
        assert!(matches!(
            &config.backends[2].kind,
            NodeKind::Collector { share: true, scale_space, .. } if *scale_space == 1.0
        ));
        config.validate().unwrap();
    }

    #[test]
    fn test_sink_with_children_rejected() {
        let config = Config::from_yaml(
            r#"
backends:
  - kind: file
    path: /tmp/out.txt
    then:
      - kind: log
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::SinkWithChildren(name)) if name == "file"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let config = Config::from_yaml(
            r#"
backends:
  - kind: log
    then:
      - kind: key_filter
        deny: "(unclosed"
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Regex { .. })));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            Config::from_yaml("backends:\n  - kind: teleport\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config::from_yaml("update_interval_secs: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
