//! Construction of the pipeline from the configured backend tree

use crate::config::{ConditionConfig, ConfigError, NodeConfig, NodeKind};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use xrdmon_core::pipeline::{
    Condition, FormatTransform, KeyFilter, LogLink, ReportBlock, ShareScale, Translate,
};
use xrdmon_core::sinks::{CollectorSink, FileSink, LineProtocolSink, MqttCollector, MqttCollectorConfig};
use xrdmon_core::{Link, LivenessProbe, NodeId, Pipeline, SharePool};

/// Shared resources handed to the links
#[derive(Clone)]
pub struct BuildContext {
    pub pool: SharePool,
    pub probe: Arc<dyn LivenessProbe>,
}

fn regex(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn key_filter(allow: &Option<String>, deny: &Option<String>) -> Result<KeyFilter, ConfigError> {
    let allow = allow.as_deref().map(regex).transpose()?;
    let deny = deny.as_deref().map(regex).transpose()?;
    Ok(KeyFilter::from_regexes(allow, deny))
}

fn condition(config: &ConditionConfig) -> Result<Condition, ConfigError> {
    Ok(match config {
        ConditionConfig::Has { key } => Condition::Has(key.clone()),
        ConditionConfig::Missing { key } => Condition::Missing(key.clone()),
        ConditionConfig::Equals { key, value } => Condition::Equals {
            key: key.clone(),
            value: value.clone(),
        },
        ConditionConfig::Matches { key, pattern } => Condition::Matches {
            key: key.clone(),
            pattern: regex(pattern)?,
        },
    })
}

fn line_protocol(kind: &NodeKind) -> Result<Option<LineProtocolSink>, ConfigError> {
    let NodeKind::LineProtocol {
        transport,
        address,
        name,
        tags,
        tag_keys,
        fields,
        resolution_secs,
        summary,
    } = kind
    else {
        return Ok(None);
    };
    if address.is_empty() {
        return Err(ConfigError::Invalid("line_protocol.address is empty".into()));
    }
    let resolution = match resolution_secs {
        Some(secs) if !secs.is_finite() || *secs <= 0.0 => {
            return Err(ConfigError::Invalid(format!("line_protocol.resolution_secs {} must be positive", secs)));
        }
        Some(secs) => Duration::from_secs_f64(*secs),
        None => Duration::from_secs(1),
    };
    let mut sink = LineProtocolSink::new(
        *transport,
        address.clone(),
        name.as_deref().unwrap_or(LineProtocolSink::DEFAULT_NAME),
    )?
    .with_tags(tags.clone())
    .with_tag_keys(tag_keys.iter().cloned())
    .with_resolution(resolution)
    .with_summary(*summary);
    if let Some(fields) = fields {
        sink = sink.with_fields(fields.iter().cloned());
    }
    Ok(Some(sink))
}

/// Validate a node without connecting anything
pub fn check(kind: &NodeKind) -> Result<(), ConfigError> {
    match kind {
        NodeKind::KeyFilter { allow, deny } => {
            key_filter(allow, deny)?;
        }
        NodeKind::Format { template: Some(template) } => {
            FormatTransform::new(template)?;
        }
        NodeKind::Block { when: Some(when) } => {
            condition(when)?;
        }
        NodeKind::LineProtocol { .. } => {
            line_protocol(kind)?;
        }
        NodeKind::Collector { group, scale_space, .. } => {
            if group.is_empty() {
                return Err(ConfigError::Invalid("collector.group is empty".into()));
            }
            if !scale_space.is_finite() || *scale_space <= 0.0 {
                return Err(ConfigError::Invalid(format!("collector.scale_space {} must be positive", scale_space)));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Instantiate the link of one node
///
/// Collectors connect in the background, so this must run inside the runtime.
pub fn build_link(kind: &NodeKind, ctx: &BuildContext) -> Result<Box<dyn Link>, ConfigError> {
    check(kind)?;
    let link: Box<dyn Link> = match kind {
        NodeKind::KeyFilter { allow, deny } => Box::new(key_filter(allow, deny)?),
        NodeKind::Format { template } => match template {
            Some(template) => Box::new(FormatTransform::new(template)?),
            None => Box::new(FormatTransform::default()),
        },
        NodeKind::Translate { mapping, cull_unknown } => Box::new(Translate::new(mapping.clone(), *cull_unknown)),
        NodeKind::Block { when } => match when {
            Some(when) => Box::new(ReportBlock::when(condition(when)?)),
            None => Box::new(ReportBlock::default()),
        },
        NodeKind::ShareScale => Box::new(ShareScale::new(ctx.pool.clone()).map_err(|source| ConfigError::Regex {
            pattern: ShareScale::PATH_KEYS.to_string(),
            source,
        })?),
        NodeKind::Log { label } => Box::new(LogLink::new(label.clone().unwrap_or_else(|| "reports".to_string()))),
        NodeKind::File { path } => Box::new(FileSink::new(path.clone())),
        NodeKind::LineProtocol { .. } => match line_protocol(kind)? {
            Some(sink) => Box::new(sink),
            None => return Err(ConfigError::Invalid("line_protocol node without settings".into())),
        },
        NodeKind::Collector {
            group,
            destinations,
            topic_prefix,
            monitor_interval_secs,
            scale_space,
            share,
        } => {
            let mut config = MqttCollectorConfig::default();
            if !destinations.is_empty() {
                config.destinations = destinations.clone();
            }
            if let Some(prefix) = topic_prefix {
                config.topic_prefix = prefix.clone();
            }
            if let Some(secs) = monitor_interval_secs {
                config.monitor_interval = Duration::from_secs((*secs).max(1));
            }
            let collector = MqttCollector::new(config)?;
            let mut sink = CollectorSink::new(collector, group.clone(), ctx.probe.clone())?.with_scale_space(*scale_space);
            if *share {
                sink = sink.with_share_pool(ctx.pool.clone());
            }
            Box::new(sink)
        }
    };
    Ok(link)
}

fn attach_all(
    pipeline: &mut Pipeline,
    parent: NodeId,
    nodes: &[NodeConfig],
    ctx: &BuildContext,
) -> Result<(), ConfigError> {
    for node in nodes {
        let link = build_link(&node.kind, ctx)?;
        let id = pipeline.attach_boxed(parent, link)?;
        attach_all(pipeline, id, &node.then, ctx)?;
    }
    Ok(())
}

/// Build the pipeline tree below the root
pub fn build_pipeline(nodes: &[NodeConfig], ctx: &BuildContext) -> Result<Pipeline, ConfigError> {
    let mut pipeline = Pipeline::new();
    let root = pipeline.root();
    attach_all(&mut pipeline, root, nodes, ctx)?;
    info!("pipeline built with {} nodes", pipeline.len().saturating_sub(1));
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use xrdmon_core::{MalformedPolicy, ProcProbe, Report};

    fn context() -> BuildContext {
        BuildContext {
            pool: SharePool::default(),
            probe: Arc::new(ProcProbe::default()),
        }
    }

    #[test]
    fn test_build_tree() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let config = Config::from_yaml(&format!(
            r#"
backends:
  - kind: key_filter
    allow: "^[ab]$"
    then:
      - kind: file
        path: {}
  - kind: log
"#,
            out.display()
        ))
        .unwrap();
        config.validate().unwrap();

        let mut pipeline = build_pipeline(&config.backends, &context()).unwrap();
        assert_eq!(pipeline.len(), 4);
        let description = pipeline.describe();
        assert!(description.contains("FileSink"));

        let report = Report::parse("a=1&b=2&c=3", MalformedPolicy::FailFast).unwrap();
        pipeline.push(report);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "a=1\nb=2\n\n");
    }

    #[test]
    fn test_key_filter_patterns_reported_one_by_one() {
        let filter = key_filter(&None, &Some("^c$".to_string())).unwrap();
        assert_eq!(filter.describe(), r#"KeyFilter(allow=None, deny=Some("^c$"))"#);

        let err = key_filter(&Some("^a".to_string()), &Some("(".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::Regex { ref pattern, .. } if pattern == "("));
    }

    #[test]
    fn test_block_without_condition_blocks_everything() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let config = Config::from_yaml(&format!(
            "backends:\n  - kind: block\n    then:\n      - kind: file\n        path: {}\n",
            out.display()
        ))
        .unwrap();
        let mut pipeline = build_pipeline(&config.backends, &context()).unwrap();
        pipeline.push(Report::parse("a=1", MalformedPolicy::FailFast).unwrap());
        assert!(!out.exists());
    }

    #[test]
    fn test_translate_and_format() {
        let config = Config::from_yaml(
            r#"
backends:
  - kind: translate
    mapping: { a: alpha }
    then:
      - kind: format
        template: "%(ins)s.%(thiskey)s"
"#,
        )
        .unwrap();
        let pipeline = build_pipeline(&config.backends, &context()).unwrap();
        assert_eq!(pipeline.len(), 3);
    }

    #[test]
    fn test_line_protocol_resolution_checked() {
        let kind = NodeKind::LineProtocol {
            transport: Default::default(),
            address: "localhost:8094".into(),
            name: None,
            tags: Default::default(),
            tag_keys: Vec::new(),
            fields: None,
            resolution_secs: Some(0.0),
            summary: false,
        };
        assert!(matches!(check(&kind), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_template_rejected() {
        let kind = NodeKind::Format {
            template: Some("%(ins".into()),
        };
        assert!(matches!(check(&kind), Err(ConfigError::Template(_))));
    }
}
