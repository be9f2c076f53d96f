//! Rewriting and filtering links

use super::template::{Template, TemplateError};
use super::{Flow, Link, LinkError};
use crate::report::{Report, Value};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{info, warn};

/// Keep keys matching `allow` and not matching `deny`
///
/// Patterns are unanchored searches. Without any pattern all keys pass.
#[derive(Debug)]
pub struct KeyFilter {
    allow: Option<Regex>,
    deny: Option<Regex>,
    /// Decisions per key name; reports reuse the same keys
    decisions: HashMap<String, bool>,
}

impl KeyFilter {
    pub fn new(allow: Option<&str>, deny: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self::from_regexes(
            allow.map(Regex::new).transpose()?,
            deny.map(Regex::new).transpose()?,
        ))
    }

    /// Filter over already compiled patterns
    pub fn from_regexes(allow: Option<Regex>, deny: Option<Regex>) -> Self {
        Self {
            allow,
            deny,
            decisions: HashMap::new(),
        }
    }

    /// Whether `key` survives the filter
    pub fn keeps(&mut self, key: &str) -> bool {
        if let Some(keep) = self.decisions.get(key) {
            return *keep;
        }
        let keep = self.allow.as_ref().map_or(true, |allow| allow.is_match(key))
            && !self.deny.as_ref().map_or(false, |deny| deny.is_match(key));
        self.decisions.insert(key.to_string(), keep);
        keep
    }
}

impl Link for KeyFilter {
    fn send(&mut self, mut report: Report) -> Result<Flow, LinkError> {
        if self.allow.is_some() || self.deny.is_some() {
            report.retain(|key, _| self.keeps(key));
        }
        Ok(Flow::Forward(report))
    }

    fn describe(&self) -> String {
        format!(
            "KeyFilter(allow={:?}, deny={:?})",
            self.allow.as_ref().map(Regex::as_str),
            self.deny.as_ref().map(Regex::as_str)
        )
    }
}

/// Rename every key through a template
///
/// `%(thiskey)s` is the key being renamed, any other field is looked up in
/// the report.
pub struct FormatTransform {
    template: Template,
    /// Rendered names already reported as collisions
    collisions: HashSet<String>,
}

impl FormatTransform {
    pub const DEFAULT_TEMPLATE: &'static str = "%(ins)s.%(pgm)s.%(thiskey)s";

    pub fn new(template: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            template: Template::parse(template)?,
            collisions: HashSet::new(),
        })
    }

    /// Rendered names that more than one key has mapped to so far
    pub fn collisions(&self) -> impl Iterator<Item = &str> {
        self.collisions.iter().map(String::as_str)
    }
}

impl Default for FormatTransform {
    fn default() -> Self {
        Self {
            template: Template::rename_default(),
            collisions: HashSet::new(),
        }
    }
}

impl Link for FormatTransform {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        if self.template.is_identity() {
            return Ok(Flow::Forward(report));
        }
        let mut renamed = Report::new();
        for (key, value) in report.iter() {
            let name = self.template.render(&report, Some(key))?;
            if renamed.insert(name.clone(), value.clone()).is_some() && self.collisions.insert(name.clone()) {
                warn!("{} renames several keys to {:?}, {:?} wins", self.describe(), name, key);
            }
        }
        Ok(Flow::Forward(renamed))
    }

    fn describe(&self) -> String {
        format!("FormatTransform({:?})", self.template.as_str())
    }
}

/// Rename keys through an explicit mapping
pub struct Translate {
    mapping: HashMap<String, String>,
    cull_unknown: bool,
}

impl Translate {
    pub fn new<K, V>(mapping: impl IntoIterator<Item = (K, V)>, cull_unknown: bool) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            mapping: mapping
                .into_iter()
                .map(|(old, new)| (old.into(), new.into()))
                .collect(),
            cull_unknown,
        }
    }
}

impl Link for Translate {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        let mut translated = Report::new();
        for (key, value) in report {
            match self.mapping.get(&key) {
                Some(new_key) => {
                    translated.insert(new_key.clone(), value);
                }
                None if !self.cull_unknown => {
                    translated.insert(key, value);
                }
                None => {}
            }
        }
        Ok(Flow::Forward(translated))
    }

    fn describe(&self) -> String {
        format!(
            "Translate({} keys, cull_unknown={})",
            self.mapping.len(),
            self.cull_unknown
        )
    }
}

/// Declarative report predicate
#[derive(Debug, Clone)]
pub enum Condition {
    Has(String),
    Missing(String),
    Equals { key: String, value: Value },
    Matches { key: String, pattern: Regex },
}

impl Condition {
    pub fn holds(&self, report: &Report) -> bool {
        match self {
            Condition::Has(key) => report.contains_key(key),
            Condition::Missing(key) => !report.contains_key(key),
            Condition::Equals { key, value } => report.get(key).map_or(false, |actual| {
                match (actual.as_f64(), value.as_f64()) {
                    (Some(actual), Some(expected)) => actual == expected,
                    _ => actual.to_string() == value.to_string(),
                }
            }),
            Condition::Matches { key, pattern } => report
                .get(key)
                .map_or(false, |actual| pattern.is_match(&actual.to_string())),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Has(key) => write!(f, "has {}", key),
            Condition::Missing(key) => write!(f, "missing {}", key),
            Condition::Equals { key, value } => write!(f, "{} == {}", key, value),
            Condition::Matches { key, pattern } => write!(f, "{} =~ {}", key, pattern.as_str()),
        }
    }
}

enum Predicate {
    Closure(Box<dyn Fn(&Report) -> bool + Send>),
    Condition(Condition),
}

/// Drop reports for which the predicate holds
pub struct ReportBlock {
    predicate: Predicate,
}

impl ReportBlock {
    pub fn new(block: impl Fn(&Report) -> bool + Send + 'static) -> Self {
        Self {
            predicate: Predicate::Closure(Box::new(block)),
        }
    }

    pub fn when(condition: Condition) -> Self {
        Self {
            predicate: Predicate::Condition(condition),
        }
    }

    pub fn blocks(&self, report: &Report) -> bool {
        match &self.predicate {
            Predicate::Closure(block) => block(report),
            Predicate::Condition(condition) => condition.holds(report),
        }
    }
}

impl Default for ReportBlock {
    /// Blocks everything
    fn default() -> Self {
        Self::new(|_| true)
    }
}

impl Link for ReportBlock {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        if self.blocks(&report) {
            return Ok(Flow::Drop);
        }
        Ok(Flow::Forward(report))
    }

    fn describe(&self) -> String {
        match &self.predicate {
            Predicate::Closure(_) => "ReportBlock(<closure>)".to_string(),
            Predicate::Condition(condition) => format!("ReportBlock({})", condition),
        }
    }
}

/// Log every report and pass it on unchanged
pub struct LogLink {
    label: String,
}

impl LogLink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Link for LogLink {
    fn send(&mut self, report: Report) -> Result<Flow, LinkError> {
        let fields: Vec<String> = report.iter().map(|(key, value)| format!("{}={}", key, value)).collect();
        info!(label = %self.label, "report: {}", fields.join("&"));
        Ok(Flow::Forward(report))
    }

    fn describe(&self) -> String {
        format!("LogLink({})", self.label)
    }
}
